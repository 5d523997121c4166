use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fedlite_core::{
    compress::compress,
    crypto::secure_prng,
    mask::{mask_weight, FeatureMask},
    privacy::{
        dp::{add_laplace_noise, calculate_sigma, gaussian_mechanism},
        flatten_update,
        signds,
    },
    CompressType,
    FeatureMap,
};

use crate::{
    message::{PrivacyParams, RequestUpdateModel, UploadPayload},
    state_machine::{
        phase::{now_ms, NotReady, RoundContext, RoundFailure},
        IntoPhase,
        Phase,
        PhaseIo,
        Progress,
        State,
        Step,
        TransitionOutcome,
        Unmask,
        IO,
    },
};

/// The phase in which the device uploads its update.
#[derive(Serialize, Deserialize, Debug)]
pub struct Upload {
    pub context: RoundContext,
    pub mask: Option<FeatureMask>,
    /// The round features before training
    pub pre: FeatureMap,
    /// The round features after training
    pub post: FeatureMap,
    /// The upload request, kept until the coordinator accepted it
    pub message: Option<RequestUpdateModel>,
}

impl Upload {
    pub fn new(
        context: RoundContext,
        mask: Option<FeatureMask>,
        pre: FeatureMap,
        post: FeatureMap,
    ) -> Self {
        Self {
            context,
            mask,
            pre,
            post,
            message: None,
        }
    }

    fn has_composed_message(&self) -> bool {
        self.message.is_some()
    }
}

impl IntoPhase<Upload> for State<Upload> {
    fn into_phase(self, mut io: PhaseIo) -> Phase<Upload> {
        io.notify_upload();
        Phase::<_>::new(self, io)
    }
}

#[async_trait]
impl Step for Phase<Upload> {
    async fn step(mut self) -> TransitionOutcome {
        self = try_progress!(self.compose_message());

        // UNWRAP_SAFE: the message is set in `self.compose_message()`
        let message = self.state.private.message.clone().unwrap();
        info!("uploading the update");
        let reply = self.io.update_model(message).await;
        match self.accept("updateModel", reply, NotReady::Restart) {
            Ok(_) => {
                info!("the coordinator accepted the update");
                self.succeeded();
                TransitionOutcome::Complete(self.into_unmask().into())
            }
            Err(interrupt) => self.interrupt(interrupt).into_outcome(),
        }
    }
}

/// Scale the named features by the size of the training set.
fn scale(features: &FeatureMap, names: &[String], train_data_size: u32) -> FeatureMap {
    let factor = train_data_size as f32;
    names
        .iter()
        .filter_map(|name| {
            features
                .get(name)
                .map(|values| (name.clone(), values.iter().map(|v| v * factor).collect()))
        })
        .collect()
}

/// The share of each class among the predicted classes.
fn class_histogram(classes: &[i32]) -> Vec<f32> {
    let num_classes = classes.iter().copied().max().unwrap_or(-1) + 1;
    let mut histogram = vec![0.0_f32; num_classes.max(0) as usize];
    let mut counted = 0_usize;
    for class in classes {
        if let Some(count) = histogram.get_mut(*class as usize).filter(|_| *class >= 0) {
            *count += 1.0;
            counted += 1;
        }
    }
    if counted > 0 {
        histogram.iter_mut().for_each(|count| *count /= counted as f32);
    }
    histogram
}

impl Phase<Upload> {
    pub(crate) fn compose_message(mut self) -> Progress<Upload> {
        if self.state.private.has_composed_message() {
            debug!("already composed the update message, continuing");
            return Progress::Continue(self);
        }
        let payload = match self.payload() {
            Ok(payload) => payload,
            Err(failure) => return self.fail(failure),
        };
        let unsupervised_eval_items = if self.state.private.context.unsupervised_eval {
            match self.unsupervised_eval_items() {
                Ok(items) => Some(items),
                Err(failure) => return self.fail(failure),
            }
        } else {
            None
        };

        let shared = &self.state.shared;
        self.state.private.message = Some(RequestUpdateModel {
            fl_name: shared.task.fl_name.clone(),
            fl_id: shared.task.fl_id.clone(),
            iteration: shared.round.iteration,
            timestamp: now_ms(),
            payload,
            unsupervised_eval_items,
        });
        Progress::Continue(self)
    }

    /// The update in the form the privacy mode of the round requires.
    fn payload(&self) -> Result<UploadPayload, RoundFailure> {
        let Upload {
            context,
            mask,
            pre,
            post,
            ..
        } = &*self.state.private;
        let shared = &self.state.shared;
        let names = &context.feature_names;
        let train_data_size = shared.task.train_data_size;

        match &context.plan.privacy {
            PrivacyParams::NotEncrypt => {
                if context.compress_type == CompressType::DiffSparseQuant {
                    debug!("compressing the update at rate {}", context.sparse_rate);
                    compress(
                        pre,
                        post,
                        names,
                        context.sparse_rate,
                        shared.round.iteration,
                    )
                    .map(UploadPayload::Compressed)
                    .map_err(RoundFailure::local)
                } else {
                    Ok(UploadPayload::Dense(scale(post, names, train_data_size)))
                }
            }
            PrivacyParams::PwEncrypt(_) => {
                let mask = mask
                    .as_ref()
                    .ok_or_else(|| RoundFailure::local("the pairwise mask is missing"))?;
                let mut offset = 0;
                let mut masked = FeatureMap::new();
                for name in names {
                    let values = post.get(name).ok_or_else(|| {
                        RoundFailure::local(format!("the feature {} is missing", name))
                    })?;
                    let weights = mask_weight(train_data_size, values, mask, offset)
                        .map_err(RoundFailure::local)?;
                    offset += values.len();
                    masked.insert(name.clone(), weights);
                }
                Ok(UploadPayload::Dense(masked))
            }
            PrivacyParams::DpEncrypt(params) => {
                let clip = shared
                    .dp_clip
                    .bound()
                    .unwrap_or(shared.privacy.dp_norm_clip);
                let sigma =
                    calculate_sigma(params.eps, params.delta, clip).map_err(RoundFailure::local)?;
                debug!("noising the update with sigma {} and clip {}", sigma, clip);
                let noised = gaussian_mechanism(pre, post, names, clip, sigma, &mut secure_prng())
                    .map_err(RoundFailure::local)?;
                Ok(UploadPayload::Dense(scale(&noised, names, train_data_size)))
            }
            PrivacyParams::SignDs(config) => {
                let mut rng = secure_prng();
                let sign: bool = rng.gen();
                let update = flatten_update(pre, post, names);
                let selection = signds::select(&update, config, &shared.magnitude, sign, &mut rng);
                debug!(
                    "selected {} of {} dimensions",
                    selection.indices.len(),
                    update.len()
                );
                Ok(UploadPayload::SignDs {
                    sign,
                    b_hat: selection.b_hat,
                    indices: selection.indices.into_iter().map(|i| i as u64).collect(),
                })
            }
        }
    }

    /// The noised class distribution of the inference results.
    fn unsupervised_eval_items(&mut self) -> Result<Vec<f32>, RoundFailure> {
        let classes = self.io.infer().map_err(RoundFailure::local)?;
        if classes.is_empty() {
            warn!("inference returned no results");
        }
        let histogram = class_histogram(&classes);
        Ok(add_laplace_noise(
            &histogram,
            self.state.shared.privacy.laplace_eps,
            &mut secure_prng(),
        ))
    }

    fn into_unmask(self) -> Phase<Unmask> {
        let Upload { context, .. } = *self.state.private;
        State::new(self.state.shared, Box::new(Unmask::new(context))).into_phase(self.io)
    }
}
