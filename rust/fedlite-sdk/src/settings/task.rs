use std::{convert::TryFrom, time::Duration};

use serde::{Deserialize, Serialize};
use validator::Validate;

use fedlite_core::{ConfigError, EncryptLevel, FlId, ServerMode};

#[derive(Debug, Clone, PartialEq, Validate, Serialize, Deserialize)]
/// Settings of the federated learning task a device takes part in.
pub struct TaskSettings {
    /// The identifier of the device in the task.
    #[validate(length(min = 1))]
    pub fl_id: String,
    /// The name of the task, which is also the name of the model variant.
    #[validate(length(min = 1))]
    pub fl_name: String,
    /// The number of samples of the local training set.
    #[validate(range(min = 1))]
    pub train_data_size: u32,
    /// The local learning rate, used when the plan doesn't set one.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Whether the downloaded model is evaluated at the end of a round.
    #[serde(default = "default_true")]
    pub evaluate: bool,
    /// Whether `/getResult` is polled before the model is downloaded.
    #[serde(default)]
    pub poll_result: bool,
    /// Whether requests to join a round carry a signature of the device.
    #[serde(default)]
    pub proof_of_identity: bool,
    #[serde(default)]
    pub server_mode: ServerMode,
    /// The privacy mode expected by the device. The plan of the coordinator has the last word.
    #[serde(default)]
    pub encrypt_level: EncryptLevel,
    /// How long to wait before joining again after the coordinator reported it isn't ready.
    #[serde(default = "default_not_ready_delay_ms")]
    pub not_ready_delay_ms: u64,
    /// How long to wait before a request is repeated after the coordinator answered "not ready".
    #[serde(default = "default_wait_backoff_ms")]
    pub wait_backoff_ms: u64,
}

fn default_learning_rate() -> f32 {
    0.01
}

fn default_true() -> bool {
    true
}

fn default_not_ready_delay_ms() -> u64 {
    5_000
}

fn default_wait_backoff_ms() -> u64 {
    1_000
}

impl TaskSettings {
    pub fn new(fl_id: impl Into<FlId>, fl_name: impl Into<String>, train_data_size: u32) -> Self {
        Self {
            fl_id: fl_id.into(),
            fl_name: fl_name.into(),
            train_data_size,
            learning_rate: default_learning_rate(),
            evaluate: true,
            poll_result: false,
            proof_of_identity: false,
            server_mode: ServerMode::default(),
            encrypt_level: EncryptLevel::default(),
            not_ready_delay_ms: default_not_ready_delay_ms(),
            wait_backoff_ms: default_wait_backoff_ms(),
        }
    }

    /// # Errors
    /// Fails if the identifier is empty.
    pub fn set_fl_id(&mut self, fl_id: impl Into<FlId>) -> Result<(), ConfigError> {
        let fl_id = fl_id.into();
        if fl_id.is_empty() {
            return Err(ConfigError::Missing("fl_id"));
        }
        self.fl_id = fl_id;
        Ok(())
    }

    /// # Errors
    /// Fails if the name isn't one of `FEDERATED_LEARNING` or `HYBRID_TRAINING`.
    pub fn set_server_mode(&mut self, server_mode: &str) -> Result<(), ConfigError> {
        self.server_mode = server_mode.parse()?;
        Ok(())
    }

    /// # Errors
    /// Fails if the name isn't a known privacy mode.
    pub fn set_encrypt_level(&mut self, encrypt_level: &str) -> Result<(), ConfigError> {
        self.encrypt_level = encrypt_level.parse()?;
        Ok(())
    }

    /// # Errors
    /// Fails if the size isn't positive or doesn't fit in 32 bits.
    pub fn set_train_data_size(&mut self, size: i64) -> Result<(), ConfigError> {
        self.train_data_size = u32::try_from(size)
            .ok()
            .filter(|size| *size > 0)
            .ok_or_else(|| ConfigError::OutOfRange {
                name: "train_data_size",
                reason: format!("{} is not a positive 32 bit size", size),
            })?;
        Ok(())
    }

    pub fn not_ready_delay(&self) -> Duration {
        Duration::from_millis(self.not_ready_delay_ms)
    }

    pub fn wait_backoff(&self) -> Duration {
        Duration::from_millis(self.wait_backoff_ms)
    }
}
