use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use fedlite_core::{
    privacy::{dp, signds::SignDsConfig},
    secagg::PwConfig,
    shamir::PrimeModulus,
    ConfigError,
    EncryptLevel,
    ServerMode,
};

/// The plan of a round, as sent by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlPlan {
    pub fl_name: String,
    /// Number of rounds of the task.
    pub iterations: u64,
    pub epochs: u32,
    pub batch_size: u32,
    pub lr: f32,
    pub server_mode: String,
    /// Name of the privacy mode, empty for none.
    pub encrypt_type: String,
    pub pw_params: Option<WirePwParams>,
    pub dp_params: Option<WireDpParams>,
    pub ds_params: Option<WireSignDsParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WirePwParams {
    /// Minimum number of shares to recover a secret.
    pub t: i32,
    /// Big endian bytes of the prime modulus.
    pub prime: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireDpParams {
    pub dp_eps: f64,
    pub dp_delta: f64,
    /// Factor of the adaptive clip bound.
    pub dp_norm_clip: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireSignDsParams {
    pub sign_k: f32,
    pub sign_eps: f64,
    pub sign_thr_ratio: f64,
    pub sign_global_lr: f32,
    pub sign_dim_out: i32,
}

/// A validated round plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub fl_name: String,
    pub iterations: u64,
    pub epochs: u32,
    pub batch_size: u32,
    pub learning_rate: f32,
    pub server_mode: ServerMode,
    pub privacy: PrivacyParams,
}

/// The privacy mode of a round and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrivacyParams {
    NotEncrypt,
    PwEncrypt(PwParams),
    DpEncrypt(DpParams),
    SignDs(SignDsConfig),
}

impl PrivacyParams {
    pub fn level(&self) -> EncryptLevel {
        match self {
            Self::NotEncrypt => EncryptLevel::NotEncrypt,
            Self::PwEncrypt(_) => EncryptLevel::PwEncrypt,
            Self::DpEncrypt(_) => EncryptLevel::DpEncrypt,
            Self::SignDs(_) => EncryptLevel::SignDs,
        }
    }
}

/// Pairwise masking parameters. The feature size is only known once the job started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwParams {
    pub threshold: i32,
    pub prime: Vec<u8>,
}

impl PwParams {
    /// Completes the parameters with the feature size of the round.
    pub fn config(&self, feature_size: usize) -> Result<PwConfig, ConfigError> {
        PwConfig::new(self.threshold, &self.prime, feature_size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpParams {
    pub eps: f64,
    pub delta: f64,
    pub norm_clip_factor: f64,
}

impl TryFrom<FlPlan> for Plan {
    type Error = ConfigError;

    fn try_from(plan: FlPlan) -> Result<Self, Self::Error> {
        let level: EncryptLevel = plan.encrypt_type.parse()?;
        let privacy = match level {
            EncryptLevel::NotEncrypt => PrivacyParams::NotEncrypt,
            EncryptLevel::PwEncrypt => {
                let params = plan.pw_params.ok_or(ConfigError::Missing("pw_params"))?;
                // fail early, the feature size is checked when the mask is set up
                PrimeModulus::from_be_bytes(&params.prime)?;
                if params.t <= 0 {
                    return Err(ConfigError::OutOfRange {
                        name: "min_secret_num",
                        reason: format!("threshold must be positive, got {}", params.t),
                    });
                }
                PrivacyParams::PwEncrypt(PwParams {
                    threshold: params.t,
                    prime: params.prime,
                })
            }
            EncryptLevel::DpEncrypt => {
                let params = plan.dp_params.ok_or(ConfigError::Missing("dp_params"))?;
                dp::calibrate(params.dp_eps, params.dp_delta)?;
                if !(params.dp_norm_clip > 0.0 && params.dp_norm_clip.is_finite()) {
                    return Err(ConfigError::OutOfRange {
                        name: "dp_norm_clip",
                        reason: format!("{} is not positive", params.dp_norm_clip),
                    });
                }
                PrivacyParams::DpEncrypt(DpParams {
                    eps: params.dp_eps,
                    delta: params.dp_delta,
                    norm_clip_factor: params.dp_norm_clip,
                })
            }
            EncryptLevel::SignDs => {
                let params = plan.ds_params.ok_or(ConfigError::Missing("ds_params"))?;
                PrivacyParams::SignDs(SignDsConfig::new(
                    params.sign_k,
                    params.sign_eps,
                    params.sign_thr_ratio,
                    params.sign_global_lr,
                    params.sign_dim_out,
                )?)
            }
        };
        let server_mode = if plan.server_mode.is_empty() {
            ServerMode::default()
        } else {
            plan.server_mode.parse()?
        };
        Ok(Self {
            fl_name: plan.fl_name,
            iterations: plan.iterations,
            epochs: plan.epochs,
            batch_size: plan.batch_size,
            learning_rate: plan.lr,
            server_mode,
            privacy,
        })
    }
}
