use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use fedlite_core::{mask::FeatureMask, privacy::dp::update_norm, EncryptLevel, FeatureMap};

use crate::{
    runtime::ModelTarget,
    state_machine::{
        phase::{RoundContext, RoundFailure},
        IntoPhase,
        Phase,
        PhaseIo,
        State,
        Step,
        TransitionOutcome,
        Upload,
        IO,
    },
};

/// The phase in which the device trains the model locally.
#[derive(Serialize, Deserialize, Debug)]
pub struct Train {
    pub context: RoundContext,
    pub mask: Option<FeatureMask>,
}

impl Train {
    pub fn new(context: RoundContext, mask: Option<FeatureMask>) -> Self {
        Self { context, mask }
    }
}

impl IntoPhase<Train> for State<Train> {
    fn into_phase(self, mut io: PhaseIo) -> Phase<Train> {
        io.notify_train();
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<Train> {
    async fn step(mut self) -> TransitionOutcome {
        match self.train() {
            Ok((pre, post)) => {
                self.succeeded();
                TransitionOutcome::Complete(self.into_upload(pre, post).into())
            }
            Err(failure) => TransitionOutcome::Complete(self.into_failed(failure).into()),
        }
    }
}

impl Phase<Train> {
    /// Train the model and return the snapshots of the round features before
    /// and after training.
    fn train(&mut self) -> Result<(FeatureMap, FeatureMap), RoundFailure> {
        let names = &self.state.private.context.feature_names;
        let plan = &self.state.private.context.plan;
        let learning_rate = if plan.learning_rate > 0.0 {
            plan.learning_rate
        } else {
            self.state.shared.task.learning_rate
        };

        let pre = self
            .io
            .features(ModelTarget::Train, names)
            .map_err(RoundFailure::local)?;
        self.io.backup().map_err(RoundFailure::local)?;

        info!(
            "training for {} epochs with a learning rate of {}",
            plan.epochs, learning_rate
        );
        let loss = self
            .io
            .train(plan.epochs, learning_rate)
            .map_err(RoundFailure::local)?;
        if !loss.is_finite() {
            warn!("the loss is {}, restoring the weights", loss);
            if let Err(e) = self.io.restore() {
                error!("failed to restore the weights: {}", e);
            }
            return Err(RoundFailure::local(format!("the loss is {}", loss)));
        }
        info!("trained the model, the loss is {}", loss);

        let post = self
            .io
            .features(ModelTarget::Train, names)
            .map_err(RoundFailure::local)?;

        if plan.privacy.level() == EncryptLevel::DpEncrypt {
            let norm = update_norm(&pre, &post, names);
            let iteration = self.state.shared.round.iteration;
            let bound = self.state.shared.dp_clip.observe(f64::from(norm), iteration);
            debug!("the update norm is {}, the clip bound {}", norm, bound);
        }
        Ok((pre, post))
    }

    fn into_upload(self, pre: FeatureMap, post: FeatureMap) -> Phase<Upload> {
        let Train { context, mask } = *self.state.private;
        State::new(
            self.state.shared,
            Box::new(Upload::new(context, mask, pre, post)),
        )
        .into_phase(self.io)
    }
}
