use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use fedlite_core::ServerMode;

use crate::{
    runtime::ModelTarget,
    state_machine::{
        phase::{RoundContext, RoundFailure},
        Done,
        IntoPhase,
        Phase,
        PhaseIo,
        State,
        Step,
        TransitionOutcome,
        IO,
    },
};

/// The phase in which the device evaluates the aggregated model.
#[derive(Serialize, Deserialize, Debug)]
pub struct Evaluate {
    pub context: RoundContext,
}

impl Evaluate {
    pub fn new(context: RoundContext) -> Self {
        Self { context }
    }
}

impl IntoPhase<Evaluate> for State<Evaluate> {
    fn into_phase(self, io: PhaseIo) -> Phase<Evaluate> {
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<Evaluate> {
    async fn step(mut self) -> TransitionOutcome {
        // the inference model is the one the device serves under hybrid training
        let target = match self.state.private.context.plan.server_mode {
            ServerMode::HybridTraining => ModelTarget::Infer,
            ServerMode::FederatedLearning => ModelTarget::Train,
        };
        let accuracy = match self.io.evaluate(target) {
            Ok(accuracy) if accuracy.is_nan() => {
                warn!("the accuracy is NaN");
                let failure = RoundFailure::local("the accuracy is NaN");
                return TransitionOutcome::Complete(self.into_failed(failure).into());
            }
            Ok(accuracy) => accuracy,
            Err(e) => {
                let failure = RoundFailure::local(format!("failed to evaluate the model: {}", e));
                return TransitionOutcome::Complete(self.into_failed(failure).into());
            }
        };
        info!(
            "the accuracy of iteration {} is {}",
            self.state.shared.round.iteration, accuracy
        );
        self.succeeded();
        TransitionOutcome::Complete(self.into_done().into())
    }
}

impl Phase<Evaluate> {
    fn into_done(self) -> Phase<Done> {
        let iteration = self.state.shared.round.iteration;
        State::new(self.state.shared, Box::new(Done { iteration })).into_phase(self.io)
    }
}
