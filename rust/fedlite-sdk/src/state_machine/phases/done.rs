use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::state_machine::{
    IntoPhase,
    Phase,
    PhaseIo,
    StartJob,
    State,
    Step,
    TransitionOutcome,
    IO,
};

/// The terminal phase of a completed round.
#[derive(Serialize, Deserialize, Debug)]
pub struct Done {
    pub iteration: u64,
}

impl IntoPhase<Done> for State<Done> {
    fn into_phase(self, mut io: PhaseIo) -> Phase<Done> {
        io.notify_done(self.private.iteration);
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<Done> {
    async fn step(self) -> TransitionOutcome {
        TransitionOutcome::Pending(self.into())
    }
}

impl Phase<Done> {
    /// Start the next iteration.
    pub(crate) fn next_round(mut self) -> Phase<StartJob> {
        let round = &mut self.state.shared.round;
        round.iteration = self.state.private.iteration + 1;
        round.next_request_time = None;
        info!("starting iteration {}", round.iteration);
        State::new(self.state.shared, Box::new(StartJob)).into_phase(self.io)
    }
}
