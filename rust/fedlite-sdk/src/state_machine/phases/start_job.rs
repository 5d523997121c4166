use std::convert::TryFrom;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fedlite_core::{
    compress::check_sparse_rate,
    secagg::CipherSession,
    CompressType,
    EncryptLevel,
    ServerMode,
};

use crate::{
    message::{IdentityProof, Plan, PrivacyParams, Reply, RequestFlJob, ResponseFlJob},
    runtime::ModelTarget,
    state_machine::{
        phase::{now_ms, NotReady, RoundContext, RoundFailure},
        IntoPhase,
        MaskSetup,
        Phase,
        PhaseIo,
        State,
        Step,
        TransitionOutcome,
        IO,
    },
};

/// The phase in which the device asks to join the round and receives its plan.
#[derive(Serialize, Deserialize, Debug)]
pub struct StartJob;

impl IntoPhase<StartJob> for State<StartJob> {
    fn into_phase(self, io: PhaseIo) -> Phase<StartJob> {
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<StartJob> {
    async fn step(mut self) -> TransitionOutcome {
        info!("asking to join round {}", self.state.shared.round.iteration);
        let request = self.request();
        let reply = self.io.start_fl_job(request).await;
        if let Ok(Reply::Message(response)) = &reply {
            self.state.shared.round.iteration = response.iteration;
            if let Some(plan) = &response.fl_plan_config {
                self.state.shared.round.iterations = plan.iterations;
            }
        }

        let response = match self.accept("startFLJob", reply, NotReady::Restart) {
            Ok(response) => response,
            Err(interrupt) => return self.interrupt(interrupt).into_outcome(),
        };
        if !response.is_selected {
            info!("the device was not selected for this round");
            let at = response.next_req_time;
            let code = response.retcode;
            return TransitionOutcome::Complete(self.into_restart(at, code).into());
        }

        match self.join(response) {
            Ok(context) => {
                self.succeeded();
                let iteration = self.state.shared.round.iteration;
                info!("joined round {}", iteration);
                self.io.notify_new_round(iteration);
                TransitionOutcome::Complete(self.into_mask_setup(context).into())
            }
            Err(failure) => TransitionOutcome::Complete(self.into_failed(failure).into()),
        }
    }
}

impl Phase<StartJob> {
    fn request(&self) -> RequestFlJob {
        let task = &self.state.shared.task;
        let iteration = self.state.shared.round.iteration;
        let timestamp = now_ms();
        let identity_proof = self.state.shared.identity.as_ref().map(|keys| {
            debug!("signing the identity proof");
            IdentityProof {
                public_key: keys.public,
                signature: keys.prove(&task.fl_id, timestamp, iteration),
            }
        });
        RequestFlJob {
            fl_name: task.fl_name.clone(),
            fl_id: task.fl_id.clone(),
            iteration,
            data_size: task.train_data_size,
            timestamp,
            identity_proof,
        }
    }

    /// Apply the accepted job to the device.
    fn join(&mut self, response: ResponseFlJob) -> Result<RoundContext, RoundFailure> {
        let shared = &mut self.state.shared;
        let mut fl_plan = response
            .fl_plan_config
            .ok_or_else(|| RoundFailure::local("the job carries no plan"))?;
        if fl_plan.encrypt_type.is_empty() {
            fl_plan.encrypt_type = shared.task.encrypt_level.to_string();
        }
        let default_server_mode = fl_plan.server_mode.is_empty();
        shared.privacy.complete(&mut fl_plan);
        let mut plan = Plan::try_from(fl_plan).map_err(|e| {
            warn!("invalid plan: {}", e);
            RoundFailure::local(e)
        })?;
        if default_server_mode {
            plan.server_mode = shared.task.server_mode;
        }
        if plan.privacy.level() != shared.task.encrypt_level {
            info!(
                "the coordinator runs the round with {} instead of {}",
                plan.privacy.level(),
                shared.task.encrypt_level
            );
        }
        shared.round.iterations = plan.iterations;

        if !response.feature_map.is_empty() {
            debug!("applying {} global features", response.feature_map.len());
            self.io
                .update_features(ModelTarget::Train, &response.feature_map)
                .map_err(RoundFailure::local)?;
            if plan.server_mode == ServerMode::HybridTraining {
                self.io
                    .update_features(ModelTarget::Infer, &response.feature_map)
                    .map_err(RoundFailure::local)?;
            }
        }

        let weights = self
            .io
            .features(ModelTarget::Train, &response.update_feature_names)
            .map_err(RoundFailure::local)?;
        let mut feature_names = response.update_feature_names;
        if feature_names.is_empty() {
            feature_names = weights.keys().cloned().collect();
        }
        let feature_size = feature_names
            .iter()
            .map(|name| weights.get(name).map(Vec::len))
            .sum::<Option<usize>>()
            .ok_or_else(|| RoundFailure::local("the model misses features of the round"))?;
        debug!(
            "{} features of {} values are updated",
            feature_names.len(),
            feature_size
        );

        let mut compress_type: CompressType = response
            .upload_compress_type
            .parse()
            .map_err(RoundFailure::local)?;
        let mut sparse_rate = response.upload_sparse_rate;
        if compress_type == CompressType::DiffSparseQuant {
            if plan.privacy.level() == EncryptLevel::NotEncrypt {
                sparse_rate = check_sparse_rate(sparse_rate).map_err(RoundFailure::local)?;
            } else {
                warn!("compression is only applied without encryption, ignoring it");
                compress_type = CompressType::NoCompress;
            }
        }

        let shared = &mut self.state.shared;
        let session = match &plan.privacy {
            PrivacyParams::PwEncrypt(params) => {
                let config = params.config(feature_size).map_err(RoundFailure::local)?;
                let session = CipherSession::new(
                    shared.task.fl_id.clone(),
                    shared.round.iteration,
                    config,
                )
                .map_err(RoundFailure::local)?;
                Some(session)
            }
            PrivacyParams::DpEncrypt(params) => {
                shared.dp_clip.set_factor(params.norm_clip_factor);
                None
            }
            _ => None,
        };

        Ok(RoundContext {
            plan,
            feature_names,
            feature_size,
            compress_type,
            sparse_rate,
            unsupervised_eval: response.unsupervised_eval_flg,
            session,
        })
    }

    fn into_mask_setup(self, context: RoundContext) -> Phase<MaskSetup> {
        State::new(self.state.shared, Box::new(MaskSetup::new(context))).into_phase(self.io)
    }
}
