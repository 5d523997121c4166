//! Mask derivation and masking of model updates.
//!
//! # Masks
//! A mask is a pseudorandom float vector with the same length as the flattened update. Masks are
//! expanded from 32 byte [`MaskSeed`]s with the `ChaCha20` stream cipher, so anyone holding the
//! seed can regenerate the exact same mask.
//!
//! Every mask value is a multiple of `2^-16` in `[-1, 1)`. Adding and subtracting such values is
//! exact in `f32` as long as the magnitudes stay below `2^8`, which lets the masks of different
//! clients cancel out exactly in the aggregate.
//!
//! ```
//! # use fedlite_core::{crypto::ByteObject, mask::MaskSeed};
//! let seed = MaskSeed::generate();
//! let mask = seed.derive_mask(4);
//! assert_eq!(mask, seed.derive_mask(4));
//! assert!(mask.iter().all(|v| (-1.0..1.0).contains(v)));
//! ```
//!
//! # Pairwise masks
//! Two clients derive a common [`MaskSeed`] from the secret they agreed on and the current
//! iteration, see [`pairwise_seed`]. The client with the smaller identifier adds the resulting
//! mask and the other one subtracts it ([`PairSign`]), so the pair cancels when both updates are
//! summed.
//!
//! # Masking
//! [`mask_weight`] scales a feature by the declared training set size and adds the matching
//! slice of the combined [`FeatureMask`].

pub(crate) mod masking;
pub(crate) mod seed;

pub use self::{
    masking::{mask_weight, pairwise_seed, unmask, FeatureMask, MaskError, PairSign},
    seed::{MaskSeed, MASK_RESOLUTION},
};
