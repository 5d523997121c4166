use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state_machine::{
    phase::RoundFailure,
    IntoPhase,
    Phase,
    PhaseIo,
    StartJob,
    State,
    Step,
    TransitionOutcome,
    IO,
};

/// The terminal phase of a failed round.
#[derive(Serialize, Deserialize, Debug)]
pub struct Failed {
    pub failure: RoundFailure,
}

impl IntoPhase<Failed> for State<Failed> {
    fn into_phase(self, mut io: PhaseIo) -> Phase<Failed> {
        io.notify_failed();
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<Failed> {
    async fn step(self) -> TransitionOutcome {
        TransitionOutcome::Pending(self.into())
    }
}

impl Phase<Failed> {
    /// Re-enter the same iteration from the start.
    pub(crate) fn retry(mut self) -> Phase<StartJob> {
        info!("retrying iteration {}", self.state.shared.round.iteration);
        self.state.shared.round.next_request_time = None;
        State::new(self.state.shared, Box::new(StartJob)).into_phase(self.io)
    }
}
