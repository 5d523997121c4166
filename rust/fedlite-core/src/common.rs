//! Data model shared by the client components.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Named mapping from a tensor name to its flat weight values.
///
/// The map is ordered so that every client walks the features in the same
/// order when it flattens them.
pub type FeatureMap = BTreeMap<String, Vec<f32>>;

/// Error raised when a parameter is missing or has an invalid value.
///
/// Configuration errors are reported before any network or cryptographic
/// work happens, and are never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required parameter `{0}`")]
    Missing(&'static str),
    #[error("invalid value {value:?} for parameter `{name}`")]
    InvalidValue { name: &'static str, value: String },
    #[error("parameter `{name}` is out of range: {reason}")]
    OutOfRange { name: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid<V: fmt::Display>(name: &'static str, value: V) -> Self {
        Self::InvalidValue {
            name,
            value: value.to_string(),
        }
    }

    pub(crate) fn out_of_range<R: Into<String>>(name: &'static str, reason: R) -> Self {
        Self::OutOfRange {
            name,
            reason: reason.into(),
        }
    }
}

/// The privacy mode negotiated for a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptLevel {
    /// The update is uploaded as is.
    NotEncrypt,
    /// The update is hidden behind pairwise masks.
    PwEncrypt,
    /// The update is clipped and noised with the Gaussian mechanism.
    DpEncrypt,
    /// The update is replaced by a SignDS selection.
    #[serde(rename = "SIGNDS")]
    SignDs,
}

impl Default for EncryptLevel {
    fn default() -> Self {
        Self::NotEncrypt
    }
}

impl FromStr for EncryptLevel {
    type Err = ConfigError;

    /// Parses an encryption level name. The empty string selects
    /// [`EncryptLevel::NotEncrypt`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "NOT_ENCRYPT" => Ok(Self::NotEncrypt),
            "PW_ENCRYPT" => Ok(Self::PwEncrypt),
            "DP_ENCRYPT" => Ok(Self::DpEncrypt),
            "SIGNDS" => Ok(Self::SignDs),
            other => Err(ConfigError::invalid("encrypt_level", other)),
        }
    }
}

impl fmt::Display for EncryptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotEncrypt => "NOT_ENCRYPT",
            Self::PwEncrypt => "PW_ENCRYPT",
            Self::DpEncrypt => "DP_ENCRYPT",
            Self::SignDs => "SIGNDS",
        };
        f.write_str(name)
    }
}

/// How the server uses the model trained on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMode {
    FederatedLearning,
    /// The device keeps a separate inference model next to the trained one.
    HybridTraining,
}

impl Default for ServerMode {
    fn default() -> Self {
        Self::FederatedLearning
    }
}

impl FromStr for ServerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FEDERATED_LEARNING" => Ok(Self::FederatedLearning),
            "HYBRID_TRAINING" => Ok(Self::HybridTraining),
            other => Err(ConfigError::invalid("server_mode", other)),
        }
    }
}

/// Compression applied to the uploaded update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressType {
    NoCompress,
    DiffSparseQuant,
}

impl Default for CompressType {
    fn default() -> Self {
        Self::NoCompress
    }
}

impl FromStr for CompressType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "NO_COMPRESS" => Ok(Self::NoCompress),
            "DIFF_SPARSE_QUANT" => Ok(Self::DiffSparseQuant),
            other => Err(ConfigError::invalid("upload_compress_type", other)),
        }
    }
}

/// Result code carried by every server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum ResponseCode {
    Succeed,
    SucNotReady,
    RepeatRequest,
    SucNotMatch,
    OutOfTime,
    NotSelected,
    RequestError,
    SystemError,
    Other(u16),
}

impl From<u16> for ResponseCode {
    fn from(code: u16) -> Self {
        match code {
            200 => Self::Succeed,
            201 => Self::SucNotReady,
            202 => Self::RepeatRequest,
            204 => Self::SucNotMatch,
            300 => Self::OutOfTime,
            301 => Self::NotSelected,
            400 => Self::RequestError,
            500 => Self::SystemError,
            other => Self::Other(other),
        }
    }
}

impl From<ResponseCode> for u16 {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Succeed => 200,
            ResponseCode::SucNotReady => 201,
            ResponseCode::RepeatRequest => 202,
            ResponseCode::SucNotMatch => 204,
            ResponseCode::OutOfTime => 300,
            ResponseCode::NotSelected => 301,
            ResponseCode::RequestError => 400,
            ResponseCode::SystemError => 500,
            ResponseCode::Other(other) => other,
        }
    }
}

impl ResponseCode {
    /// Maps the code to the status of the phase that received it.
    ///
    /// Phases with their own rules (for instance "not ready" meaning
    /// restart) override this mapping.
    pub fn status(self) -> RoundStatus {
        match self {
            Self::Succeed => RoundStatus::Success,
            Self::SucNotReady => RoundStatus::Wait,
            Self::OutOfTime => RoundStatus::Restart,
            _ => RoundStatus::Failed,
        }
    }
}

impl Default for ResponseCode {
    fn default() -> Self {
        Self::Succeed
    }
}

/// Outcome of a single phase of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    /// The phase completed.
    Success,
    /// The server is busy, the same phase must be retried later.
    Wait,
    /// The round is abandoned and restarts from the beginning.
    Restart,
    /// The iteration failed.
    Failed,
}

impl Default for RoundStatus {
    fn default() -> Self {
        Self::Success
    }
}
