use std::{collections::HashMap, convert::TryFrom, path::PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use fedlite_core::{FeatureMap, ResponseCode};

use super::{ModelRuntime, ModelTarget, ModelVariant, RunType, VariantError};
use crate::Trainer;

type BoxedError = Box<dyn ::std::error::Error + Send + Sync + 'static>;

/// Error raised by a [`LocalModel`].
#[derive(Debug, Error)]
pub enum LocalModelError {
    #[error("model runtime failed: {0}")]
    Runtime(#[source] BoxedError),
    #[error(transparent)]
    Variant(#[from] VariantError),
    #[error("the train dataset is empty")]
    EmptyTrainSet,
    #[error("the train dataset is too large: {0} samples")]
    TrainSetTooLarge(usize),
    #[error("the model has no feature `{0}`")]
    MissingFeature(String),
    #[error("no inference model is loaded")]
    NoInferModel,
}

impl LocalModelError {
    fn runtime<E>(error: E) -> Self
    where
        E: ::std::error::Error + Send + Sync + 'static,
    {
        Self::Runtime(Box::new(error))
    }

    /// The response code a round reports for this error.
    pub fn code(&self) -> ResponseCode {
        match self {
            Self::EmptyTrainSet
            | Self::TrainSetTooLarge(_)
            | Self::MissingFeature(_)
            | Self::NoInferModel => ResponseCode::RequestError,
            Self::Runtime(_) | Self::Variant(_) => ResponseCode::SystemError,
        }
    }
}

/// The local models of a device.
///
/// It holds the runtime of the trained model and, under `HYBRID_TRAINING`, the runtime of a
/// separate inference model.
pub struct LocalModel<R> {
    train: R,
    infer: Option<R>,
    variant: Box<dyn ModelVariant>,
}

impl<R> LocalModel<R>
where
    R: ModelRuntime,
{
    pub fn new(train: R, infer: Option<R>, variant: Box<dyn ModelVariant>) -> Self {
        Self {
            train,
            infer,
            variant,
        }
    }

    /// Loads the datasets and returns the size of the train dataset.
    ///
    /// # Errors
    /// Fails if a dataset can't be loaded or the train dataset is empty.
    pub fn set_input(
        &mut self,
        files: &HashMap<RunType, Vec<PathBuf>>,
    ) -> Result<u32, LocalModelError> {
        let sizes = self.variant.init_datasets(files)?;
        let size = sizes.get(&RunType::Train).copied().unwrap_or(0);
        if size == 0 {
            return Err(LocalModelError::EmptyTrainSet);
        }
        info!("train dataset of {} samples", size);
        u32::try_from(size).map_err(|_| LocalModelError::TrainSetTooLarge(size))
    }

    fn runtime(&self, target: ModelTarget) -> Result<&R, LocalModelError> {
        match target {
            ModelTarget::Train => Ok(&self.train),
            ModelTarget::Infer => self.infer.as_ref().ok_or(LocalModelError::NoInferModel),
        }
    }

    fn runtime_mut(&mut self, target: ModelTarget) -> Result<&mut R, LocalModelError> {
        match target {
            ModelTarget::Train => Ok(&mut self.train),
            ModelTarget::Infer => self.infer.as_mut().ok_or(LocalModelError::NoInferModel),
        }
    }

    fn run(
        &mut self,
        target: ModelTarget,
        run_type: RunType,
        epochs: u32,
    ) -> Result<(), LocalModelError> {
        let mut callbacks = self.variant.init_callbacks(run_type);
        let runtime = self.runtime_mut(target)?;
        runtime
            .enable_train(run_type == RunType::Train)
            .map_err(LocalModelError::runtime)?;
        runtime
            .run(run_type, epochs, &mut callbacks)
            .map_err(LocalModelError::runtime)
    }
}

impl<R> Trainer for LocalModel<R>
where
    R: ModelRuntime,
{
    type Error = LocalModelError;

    fn train(&mut self, epochs: u32, learning_rate: f32) -> Result<f32, Self::Error> {
        self.train
            .set_learning_rate(learning_rate)
            .map_err(LocalModelError::runtime)?;
        self.run(ModelTarget::Train, RunType::Train, epochs)?;
        let loss = self.train.upload_loss();
        debug!("trained {} epochs, loss {}", epochs, loss);
        Ok(loss)
    }

    fn evaluate(&mut self, target: ModelTarget) -> Result<f32, Self::Error> {
        self.run(target, RunType::Eval, 1)?;
        Ok(self.variant.eval_accuracy())
    }

    fn infer(&mut self) -> Result<Vec<i32>, Self::Error> {
        let target = if self.infer.is_some() {
            ModelTarget::Infer
        } else {
            ModelTarget::Train
        };
        self.run(target, RunType::Infer, 1)?;
        Ok(self.variant.infer_result())
    }

    fn features(&self, target: ModelTarget, names: &[String]) -> Result<FeatureMap, Self::Error> {
        let runtime = self.runtime(target)?;
        let names = if names.is_empty() {
            runtime.feature_names()
        } else {
            names.to_vec()
        };
        names
            .into_iter()
            .map(|name| match runtime.feature(&name) {
                Some(values) => Ok((name, values)),
                None => Err(LocalModelError::MissingFeature(name)),
            })
            .collect()
    }

    fn update_features(
        &mut self,
        target: ModelTarget,
        features: &FeatureMap,
    ) -> Result<(), Self::Error> {
        self.runtime_mut(target)?
            .update_features(features)
            .map_err(LocalModelError::runtime)
    }

    fn backup(&mut self) -> Result<(), Self::Error> {
        self.train.backup().map_err(LocalModelError::runtime)
    }

    fn restore(&mut self) -> Result<(), Self::Error> {
        self.train.restore_backup().map_err(LocalModelError::runtime)
    }
}
