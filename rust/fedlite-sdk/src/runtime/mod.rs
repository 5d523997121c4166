//! Seams to the model runtime.
//!
//! A device trains with an external engine. The engine primitives are abstracted by
//! [`ModelRuntime`], while everything that depends on the model itself (datasets, the callbacks
//! collecting metrics, how accuracy and inference results are read) is provided by a
//! [`ModelVariant`]. [`LocalModel`] composes both into the [`Trainer`] the state machine drives.
//!
//! [`Trainer`]: crate::Trainer

mod local;
pub mod metrics;
mod registry;

pub use self::{
    local::{LocalModel, LocalModelError},
    registry::{VariantFactory, VariantRegistry},
};

use std::{collections::HashMap, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fedlite_core::FeatureMap;

/// The kind of run of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunType {
    Train,
    Eval,
    Infer,
}

/// The model an operation applies to.
///
/// Under `HYBRID_TRAINING` the device keeps an inference model next to the trained one, otherwise
/// both targets designate the same model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelTarget {
    Train,
    Infer,
}

/// The outputs of one step of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutputs {
    /// The loss of the step, for training steps.
    pub loss: Option<f32>,
    /// The scores of the batch, `num_classes` values per sample.
    pub scores: Vec<f32>,
    /// The labels of the batch, if the dataset is labelled.
    pub labels: Vec<i32>,
    pub num_classes: usize,
}

/// Hooks invoked by the runtime during a run.
pub trait Callback: Send {
    fn begin(&mut self) {}
    fn epoch_begin(&mut self, _epoch: u32) {}
    fn step_end(&mut self, _outputs: &StepOutputs) {}
    fn epoch_end(&mut self, _epoch: u32) {}
    fn end(&mut self) {}
}

/// The primitives of a model engine.
pub trait ModelRuntime: Send {
    type Error: ::std::error::Error + Send + Sync + 'static;

    /// Switch between training and evaluation mode.
    fn enable_train(&mut self, train: bool) -> Result<(), Self::Error>;

    fn set_learning_rate(&mut self, learning_rate: f32) -> Result<(), Self::Error>;

    /// Run the model over the dataset of `run_type` for `epochs` epochs.
    fn run(
        &mut self,
        run_type: RunType,
        epochs: u32,
        callbacks: &mut [Box<dyn Callback>],
    ) -> Result<(), Self::Error>;

    /// The loss of the last training run.
    fn upload_loss(&self) -> f32;

    fn feature_names(&self) -> Vec<String>;

    fn feature(&self, name: &str) -> Option<Vec<f32>>;

    fn update_features(&mut self, features: &FeatureMap) -> Result<(), Self::Error>;

    /// Save the current weights.
    fn backup(&mut self) -> Result<(), Self::Error>;

    /// Restore the weights saved by the last backup.
    fn restore_backup(&mut self) -> Result<(), Self::Error>;
}

/// Error raised by a model variant.
#[derive(Debug, Error)]
pub enum VariantError {
    #[error("unknown model variant `{0}`")]
    Unknown(String),
    #[error("failed to load dataset: {0}")]
    Dataset(String),
}

/// The model specific part of local training.
pub trait ModelVariant: Send {
    /// Load the datasets and return the number of samples of each.
    fn init_datasets(
        &mut self,
        files: &HashMap<RunType, Vec<PathBuf>>,
    ) -> Result<HashMap<RunType, usize>, VariantError>;

    /// The callbacks of a run. They feed [`eval_accuracy`] and [`infer_result`].
    ///
    /// [`eval_accuracy`]: ModelVariant::eval_accuracy
    /// [`infer_result`]: ModelVariant::infer_result
    fn init_callbacks(&mut self, run_type: RunType) -> Vec<Box<dyn Callback>>;

    /// The accuracy of the last evaluation run.
    fn eval_accuracy(&self) -> f32;

    /// The predicted classes of the last inference run.
    fn infer_result(&self) -> Vec<i32>;
}
