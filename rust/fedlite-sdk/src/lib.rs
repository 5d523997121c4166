#![cfg_attr(docsrs, feature(doc_cfg))]
//! This crate provides the building blocks of a device taking part in
//! privacy-preserving federated learning.
//!
//! Each round, a device asks the coordinator to join the round, trains its
//! local model, uploads its update and downloads the aggregated model. The
//! update is protected according to the privacy mode the coordinator plans
//! for the round:
//!
//! - **pairwise masking**: the device takes part in a secure aggregation
//!   protocol with the other devices of the round
//! - **differential privacy**: the update is clipped and noised
//! - **SignDS**: only a random selection of dimensions and a sign bit are
//!   uploaded
//!
//! # Running a device
//!
//! The round protocol is executed by a [`StateMachine`]. It needs:
//!
//! - the settings of the task and the local privacy settings, see
//!   [`settings`]
//! - a client to talk with the coordinator. This can be any type that
//!   implements the [`FlClient`] trait, for instance the
//!   [`client::Client`]
//! - the local model. This can be any type that implements the
//!   [`Trainer`] trait, for instance a [`runtime::LocalModel`]
//! - a notifier that the state machine can use to send notifications.
//!   This can be any type that implements the [`Notify`] trait, for
//!   instance the channel based [`Notifier`]
//!
//! The state machine only makes progress when it is driven. [`run_task`]
//! drives it through the rounds of the task:
//!
//! ```rust,ignore
//! use fedlite_sdk::{client::Client, run_task, settings::Settings, Notifier, StateMachine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::new("fedlite.toml")?;
//!     let http = fedlite_sdk::client::http_client(&settings.api)?;
//!     let client = Client::new(http, &settings.api.base_url)?;
//!     let (notifier, mut events) = Notifier::new(16);
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{:?}", event);
//!         }
//!     });
//!
//!     let backoff = settings.task.wait_backoff();
//!     let state_machine =
//!         StateMachine::new(settings.task, settings.privacy, client, my_model(), notifier)?;
//!     let (_, outcome) = run_task(state_machine, backoff).await;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

mod agent;
pub mod client;
pub mod message;
pub mod runtime;
pub mod settings;

mod state_machine;
pub use state_machine::{
    InitError,
    Round,
    RoundFailure,
    SerializableState,
    SharedState,
    StateMachine,
    TransitionOutcome,
};

mod traits;
pub use self::{
    agent::{run_round, run_task, Event, Notifier, StopHandle, TaskOutcome},
    traits::{FlClient, Notify, Trainer},
};
