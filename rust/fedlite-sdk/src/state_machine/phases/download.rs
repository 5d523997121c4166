use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use fedlite_core::ServerMode;

use crate::{
    message::{RequestGetModel, RequestGetResult},
    runtime::ModelTarget,
    state_machine::{
        phase::{now_ms, NotReady, RoundContext, RoundFailure},
        Done,
        Evaluate,
        IntoPhase,
        Phase,
        PhaseIo,
        Progress,
        State,
        Step,
        TransitionOutcome,
        IO,
    },
};

/// The phase in which the device downloads the aggregated model.
#[derive(Serialize, Deserialize, Debug)]
pub struct Download {
    pub context: RoundContext,
    /// Whether the coordinator reported the aggregation as done
    pub result_ready: bool,
}

impl Download {
    pub fn new(context: RoundContext) -> Self {
        Self {
            context,
            result_ready: false,
        }
    }
}

impl IntoPhase<Download> for State<Download> {
    fn into_phase(self, io: PhaseIo) -> Phase<Download> {
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<Download> {
    async fn step(mut self) -> TransitionOutcome {
        self = try_progress!(self.poll_result().await);

        let req = RequestGetModel {
            fl_name: self.state.shared.task.fl_name.clone(),
            iteration: self.state.shared.round.iteration,
            timestamp: now_ms(),
        };
        debug!("downloading the aggregated model");
        let reply = self.io.get_model(req).await;
        let response = match self.accept("getModel", reply, NotReady::Wait) {
            Ok(response) => response,
            Err(interrupt) => return self.interrupt(interrupt).into_outcome(),
        };
        info!(
            "downloaded {} features of iteration {}",
            response.feature_map.len(),
            response.iteration
        );

        let mut targets = vec![ModelTarget::Train];
        if self.state.private.context.plan.server_mode == ServerMode::HybridTraining {
            targets.push(ModelTarget::Infer);
        }
        for target in targets {
            if let Err(e) = self.io.update_features(target, &response.feature_map) {
                let failure = RoundFailure::local(format!("failed to update the model: {}", e));
                return TransitionOutcome::Complete(self.into_failed(failure).into());
            }
        }

        self.succeeded();
        if self.state.shared.task.evaluate {
            TransitionOutcome::Complete(self.into_evaluate().into())
        } else {
            TransitionOutcome::Complete(self.into_done().into())
        }
    }
}

impl Phase<Download> {
    /// Wait until the coordinator aggregated the round, if enabled.
    pub(crate) async fn poll_result(mut self) -> Progress<Download> {
        if !self.state.shared.task.poll_result || self.state.private.result_ready {
            debug!("not polling the result, continuing");
            return Progress::Continue(self);
        }
        let req = RequestGetResult {
            fl_name: self.state.shared.task.fl_name.clone(),
            iteration: self.state.shared.round.iteration,
            timestamp: now_ms(),
        };
        debug!("polling the result of the round");
        let reply = self.io.get_result(req).await;
        match self.accept("getResult", reply, NotReady::Wait) {
            Ok(_) => {
                info!("the round is aggregated");
                self.state.private.result_ready = true;
                Progress::Updated(self.into())
            }
            Err(interrupt) => self.interrupt(interrupt),
        }
    }

    fn into_evaluate(self) -> Phase<Evaluate> {
        let Download { context, .. } = *self.state.private;
        State::new(self.state.shared, Box::new(Evaluate::new(context))).into_phase(self.io)
    }

    fn into_done(self) -> Phase<Done> {
        let iteration = self.state.shared.round.iteration;
        State::new(self.state.shared, Box::new(Done { iteration })).into_phase(self.io)
    }
}
