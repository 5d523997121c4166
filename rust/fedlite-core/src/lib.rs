#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Fedlite core
//!
//! I/O free building blocks for a federated learning device client. Each
//! round of federated learning, a device trains a model locally and
//! contributes its update to a server side aggregate. This crate provides
//! the primitives that keep the raw update private while it travels:
//!
//! - **Pairwise masking**: the client half of a secure aggregation
//!   protocol. Clients agree on pairwise secrets, share their own secrets
//!   with a threshold secret sharing scheme and add masks that cancel out
//!   in the aggregate, even when some clients drop out. See [`secagg`].
//! - **Differential privacy**: adaptive norm clipping, analytic Gaussian
//!   mechanism calibration and Laplace noise. See [`privacy::dp`].
//! - **SignDS**: privacy budgeted sparsification of an update into a set
//!   of dimension indices and a randomized sign bit. See
//!   [`privacy::signds`].
//! - **Upload compression**: sparse quantized update diffs. See
//!   [`compress`].
//!
//! Network communication, the round state machine and the model runtime
//! seams live in the `fedlite-sdk` crate.

pub mod common;
pub mod compress;
pub mod crypto;
pub mod mask;
pub mod privacy;
pub mod secagg;
pub mod shamir;

pub use self::common::{
    CompressType,
    ConfigError,
    EncryptLevel,
    FeatureMap,
    ResponseCode,
    RoundStatus,
    ServerMode,
};

/// Identifier of a client taking part in a federated learning task.
pub type FlId = String;
