//! The round state machine.
//!
//! A round goes through the phases `StartJob`, `MaskSetup`, `Train`, `Upload`,
//! `Unmask`, `Download` and `Evaluate`, and ends in `Done` or `Failed`. Each
//! call to [`StateMachine::transition`] tries to make a small step of
//! progress:
//!
//! - when the coordinator is busy, the state machine is returned unchanged as
//!   [`TransitionOutcome::Pending`] and the same request is retried on the
//!   next transition;
//! - when the coordinator restarts the round, the state machine goes back to
//!   `StartJob` and [`Round::next_request_time`] tells when to go on;
//! - when the round fails, the state machine ends in `Failed` with a
//!   [`RoundFailure`].
//!
//! Multi-request phases keep track of the requests that already succeeded, so
//! that waiting never re-sends them.

// Important the macro_use modules must be declared first for the
// macro to be used in the other modules
#[macro_use]
mod phase;
mod io;
mod phases;
#[allow(clippy::module_inception)]
mod state_machine;


// It is useful to re-export everything within this module because
// there are lot of interdependencies between all the sub-modules
#[cfg(test)]
use self::io::MockIO;
use self::{
    io::{boxed_io, IO},
    phase::{IntoPhase, Phase, PhaseIo, Progress, State, Step},
    phases::{Done, Download, Evaluate, Failed, MaskSetup, StartJob, Train, Unmask, Upload},
};

pub(crate) use self::phase::now_ms;
pub use self::{
    phase::{Round, RoundFailure, SerializableState, SharedState},
    state_machine::{InitError, StateMachine, TransitionOutcome},
};
