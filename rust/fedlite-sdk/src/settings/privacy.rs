use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use fedlite_core::{
    privacy::{
        dp::{self, LaplaceNoise},
        signds::{MagnitudeReference, SignDsConfig},
    },
    ConfigError,
};

use crate::message::{FlPlan, WireDpParams, WireSignDsParams};

#[derive(Debug, Clone, PartialEq, Validate, Serialize, Deserialize)]
#[validate(schema(function = "validate_privacy"))]
#[serde(default)]
/// Local privacy parameters.
///
/// The plan sent by the coordinator overrides them. They fill in the parameter blocks a plan
/// leaves out.
pub struct PrivacySettings {
    /// Factor of the adaptive clip bound.
    pub dp_norm_clip_factor: f64,
    /// The clip bound used until the norm of an update has been observed.
    pub dp_norm_clip: f64,
    pub dp_eps: f64,
    pub dp_delta: f64,

    pub sign_k: f32,
    pub sign_eps: f64,
    pub sign_thr_ratio: f64,
    pub sign_global_lr: f32,
    pub sign_dim_out: i32,
    /// The initial reference magnitude of SignDS.
    pub r_est: f32,
    pub range_reached: bool,

    /// The privacy budget of the unsupervised evaluation items.
    pub laplace_eps: f32,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            dp_norm_clip_factor: 1.0,
            dp_norm_clip: 0.05,
            dp_eps: 100.0,
            dp_delta: 0.01,
            sign_k: 0.01,
            sign_eps: 100.0,
            sign_thr_ratio: 0.6,
            sign_global_lr: 1.0,
            sign_dim_out: 0,
            r_est: fedlite_core::privacy::signds::DEFAULT_R_EST,
            range_reached: false,
            laplace_eps: 230_260.0,
        }
    }
}

impl PrivacySettings {
    /// Fills in the DP and SignDS parameter blocks missing from a plan.
    pub fn complete(&self, plan: &mut FlPlan) {
        if plan.dp_params.is_none() {
            plan.dp_params = Some(WireDpParams {
                dp_eps: self.dp_eps,
                dp_delta: self.dp_delta,
                dp_norm_clip: self.dp_norm_clip_factor,
            });
        }
        if plan.ds_params.is_none() {
            plan.ds_params = Some(WireSignDsParams {
                sign_k: self.sign_k,
                sign_eps: self.sign_eps,
                sign_thr_ratio: self.sign_thr_ratio,
                sign_global_lr: self.sign_global_lr,
                sign_dim_out: self.sign_dim_out,
            });
        }
    }

    /// # Errors
    /// Fails if the SignDS parameters are out of range.
    pub fn signds_config(&self) -> Result<SignDsConfig, ConfigError> {
        SignDsConfig::new(
            self.sign_k,
            self.sign_eps,
            self.sign_thr_ratio,
            self.sign_global_lr,
            self.sign_dim_out,
        )
    }

    /// # Errors
    /// Fails if `r_est` is not in `[0, 1)`.
    pub fn magnitude_reference(&self) -> Result<MagnitudeReference, ConfigError> {
        let mut reference = MagnitudeReference::default();
        reference.set_r_est(self.r_est)?;
        reference.set_range_reached(self.range_reached);
        Ok(reference)
    }
}

fn validate_privacy(s: &PrivacySettings) -> Result<(), ValidationError> {
    let positive = |v: f64| v.is_finite() && v > 0.0;
    if !positive(s.dp_norm_clip_factor) || !positive(s.dp_norm_clip) {
        return Err(ValidationError::new("invalid dp clip settings"));
    }
    if dp::calibrate(s.dp_eps, s.dp_delta).is_err() {
        return Err(ValidationError::new("invalid dp budget"));
    }
    if s.signds_config().is_err() {
        return Err(ValidationError::new("invalid signds settings"));
    }
    if !(0.0..1.0).contains(&s.r_est) {
        return Err(ValidationError::new("r_est must be in [0, 1)"));
    }
    if LaplaceNoise::new(s.laplace_eps).is_err() {
        return Err(ValidationError::new("invalid laplace budget"));
    }
    Ok(())
}
