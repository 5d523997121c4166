//! Differential privacy calibration.
//!
//! # Analytic Gaussian mechanism
//! The smallest noise scale that makes the Gaussian mechanism `(eps, delta)`-differentially
//! private for a query of L2 sensitivity `clip` is found by solving for `s` in
//!
//! ```no_rust
//! B+(s) = Φ(√(eps·s)) − e^eps·Φ(−√(eps·(s+2)))    if delta > B+(0)
//! B−(s) = Φ(−√(eps·s)) − e^eps·Φ(−√(eps·(s+2)))   if delta < B+(0)
//! ```
//!
//! and setting `sigma = α·clip/√(2·eps)` with `α = √(1 + s/2) ∓ √(s/2)`.
//!
//! `Φ` is computed from a Riemann sum approximation of the error function with
//! [`ERF_SEGMENTS`] segments, and the root is found by exponential bracket expansion followed by
//! bisection.

use std::f64::consts::PI;

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{common::ConfigError, privacy::flatten_update, FeatureMap};

/// Number of segments of the error function approximation.
pub const ERF_SEGMENTS: u32 = 10_000;
/// Absolute tolerance on `delta` at which the bisection stops.
pub const DELTA_TOLERANCE: f64 = 1e-6;
/// Maximum number of bisection steps.
pub const MAX_BISECTIONS: u32 = 1_000;
/// Maximum number of doublings of the search bracket.
const MAX_EXPANSIONS: u32 = 64;
/// Upper bound of the Laplace privacy budget.
pub const LAPLACE_EPS_UPPER: f32 = 500_000.0;
/// Number of redraws of a zero uniform sample before a Laplace draw gives up.
const LAPLACE_MAX_REDRAWS: u32 = 100;

/// The error function, approximated by a trapezoidal Riemann sum over [`ERF_SEGMENTS`] segments.
pub fn erf(x: f64) -> f64 {
    let n = ERF_SEGMENTS;
    let dx = x / n as f64;
    let inner: f64 = (1..n).map(|i| 2.0 * (-(dx * i as f64).powi(2)).exp()).sum();
    let sum = 1.0 + inner + (-(dx * n as f64).powi(2)).exp();
    sum * dx / PI.sqrt()
}

/// The CDF of the standard normal distribution.
pub fn phi(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / 2_f64.sqrt()))
}

pub fn b_positive(eps: f64, s: f64) -> f64 {
    phi((eps * s).sqrt()) - eps.exp() * phi(-(eps * (s + 2.0)).sqrt())
}

pub fn b_negative(eps: f64, s: f64) -> f64 {
    phi(-(eps * s).sqrt()) - eps.exp() * phi(-(eps * (s + 2.0)).sqrt())
}

/// Which side of `B+(0)` the target delta lies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    Positive,
    Negative,
    /// The target delta is exactly `B+(0)`, no search is needed.
    Boundary,
}

/// The solution of the calibration equation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub branch: Branch,
    pub s: f64,
    pub alpha: f64,
}

/// Solves the calibration equation of the analytic Gaussian mechanism.
///
/// # Errors
/// Fails if `eps` isn't positive or `delta` isn't in `(0, 1)`.
pub fn calibrate(eps: f64, delta: f64) -> Result<Calibration, ConfigError> {
    if !(eps.is_finite() && eps > 0.0) {
        return Err(ConfigError::out_of_range(
            "dp_eps",
            format!("{} is not positive", eps),
        ));
    }
    if !(delta > 0.0 && delta < 1.0) {
        return Err(ConfigError::out_of_range(
            "dp_delta",
            format!("{} is not in (0, 1)", delta),
        ));
    }

    let delta_zero = b_positive(eps, 0.0);
    let calibration = if delta > delta_zero {
        let s = search_root(|s| b_positive(eps, s), delta, Monotonicity::Increasing);
        Calibration {
            branch: Branch::Positive,
            s,
            alpha: (1.0 + s / 2.0).sqrt() - (s / 2.0).sqrt(),
        }
    } else if delta < delta_zero {
        let s = search_root(|s| b_negative(eps, s), delta, Monotonicity::Decreasing);
        Calibration {
            branch: Branch::Negative,
            s,
            alpha: (1.0 + s / 2.0).sqrt() + (s / 2.0).sqrt(),
        }
    } else {
        info!("target delta equals delta zero");
        Calibration {
            branch: Branch::Boundary,
            s: 0.0,
            alpha: 1.0,
        }
    };
    debug!("calibrated the gaussian mechanism: {:?}", calibration);
    Ok(calibration)
}

/// Computes the noise standard deviation of the Gaussian mechanism.
///
/// # Errors
/// Fails if `eps` or `delta` are out of range or if `norm_clip` is negative.
pub fn calculate_sigma(eps: f64, delta: f64, norm_clip: f64) -> Result<f64, ConfigError> {
    if !(norm_clip.is_finite() && norm_clip >= 0.0) {
        return Err(ConfigError::out_of_range(
            "dp_norm_clip",
            format!("{} is negative", norm_clip),
        ));
    }
    let calibration = calibrate(eps, delta)?;
    Ok(calibration.alpha * norm_clip / (2.0 * eps).sqrt())
}

#[derive(Clone, Copy)]
enum Monotonicity {
    Increasing,
    Decreasing,
}

/// Finds `s >= 0` with `target - tolerance <= f(s) <= target`.
fn search_root<F>(f: F, target: f64, monotonicity: Monotonicity) -> f64
where
    F: Fn(f64) -> f64,
{
    // `below(v)` holds when `v` lies on the side of the target that `f(0)` lies on
    let below = |value: f64| match monotonicity {
        Monotonicity::Increasing => value <= target,
        Monotonicity::Decreasing => value > target,
    };

    let mut s_inf = 0.0;
    let mut s_sup = 1.0;
    let mut expansions = 0;
    while below(f(s_sup)) {
        if expansions == MAX_EXPANSIONS {
            warn!("bracket expansion didn't reach the target delta {}", target);
            break;
        }
        s_inf = s_sup;
        s_sup *= 2.0;
        expansions += 1;
    }

    let mut s_mid = s_inf + (s_sup - s_inf) / 2.0;
    for _ in 0..=MAX_BISECTIONS {
        let value = f(s_mid);
        if value <= target {
            if target - value <= DELTA_TOLERANCE {
                return s_mid;
            }
            match monotonicity {
                Monotonicity::Increasing => s_inf = s_mid,
                Monotonicity::Decreasing => s_sup = s_mid,
            }
        } else {
            match monotonicity {
                Monotonicity::Increasing => s_sup = s_mid,
                Monotonicity::Decreasing => s_inf = s_mid,
            }
        }
        s_mid = s_inf + (s_sup - s_inf) / 2.0;
    }
    warn!("bisection stopped after {} steps", MAX_BISECTIONS);
    s_mid
}

/// The L2 norm of the update of the named features.
pub fn update_norm(pre: &FeatureMap, post: &FeatureMap, names: &[String]) -> f32 {
    flatten_update(pre, post, names)
        .iter()
        .map(|v| v * v)
        .sum::<f32>()
        .sqrt()
}

/// The adaptive clip bound of a task.
///
/// The first observation sets the bound to `factor × norm`. Later observations only lower it, so
/// the bound never increases during a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveClip {
    factor: f64,
    bound: Option<f64>,
}

impl AdaptiveClip {
    pub fn new(factor: f64) -> Self {
        Self {
            factor,
            bound: None,
        }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn set_factor(&mut self, factor: f64) {
        self.factor = factor;
    }

    /// The current bound, if any update has been observed yet.
    pub fn bound(&self) -> Option<f64> {
        self.bound
    }

    /// Observes the norm of the update trained in `iteration` and returns the new bound.
    ///
    /// Iteration 1 always resets the bound, since it starts a new task on the server.
    pub fn observe(&mut self, norm: f64, iteration: u64) -> f64 {
        let candidate = self.factor * norm;
        let bound = match self.bound {
            Some(bound) if iteration != 1 => {
                if candidate < bound {
                    info!("lowering the clip bound from {} to {}", bound, candidate);
                    candidate
                } else {
                    bound
                }
            }
            _ => candidate,
        };
        self.bound = Some(bound);
        bound
    }
}

/// Clips the update of the named features and adds Gaussian noise to it.
///
/// The update is scaled by `min(1, clip / ‖update‖)`, then noise from `N(0, sigma²)` is added to
/// each value. The result holds the privatized weights `pre + update` of the named features and
/// the unchanged weights of the other features of `post`.
///
/// # Errors
/// Fails if `sigma` is negative or not finite.
pub fn gaussian_mechanism(
    pre: &FeatureMap,
    post: &FeatureMap,
    names: &[String],
    clip: f64,
    sigma: f64,
    rng: &mut ChaCha20Rng,
) -> Result<FeatureMap, ConfigError> {
    let invalid_sigma = || ConfigError::out_of_range("dp_sigma", format!("{} is invalid", sigma));
    if !(sigma.is_finite() && sigma >= 0.0) {
        return Err(invalid_sigma());
    }
    let normal = Normal::new(0.0, sigma).map_err(|_| invalid_sigma())?;
    let norm = f64::from(update_norm(pre, post, names));
    let scale = if norm > clip { clip / norm } else { 1.0 };
    debug!("clipping the update of norm {} with factor {}", norm, scale);

    let mut noised = post.clone();
    for name in names {
        let (before, after) = match (pre.get(name), post.get(name)) {
            (Some(before), Some(after)) if before.len() == after.len() => (before, after),
            _ => continue,
        };
        let values = after
            .iter()
            .zip(before)
            .map(|(a, b)| {
                let update = f64::from(a - b) * scale + normal.sample(rng);
                (f64::from(*b) + update) as f32
            })
            .collect();
        noised.insert(name.clone(), values);
    }
    Ok(noised)
}

/// A Laplace noise source with unit sensitivity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaplaceNoise {
    beta: f32,
}

impl LaplaceNoise {
    /// # Errors
    /// Fails if `eps` is not in `(0, 500000]`.
    pub fn new(eps: f32) -> Result<Self, ConfigError> {
        if !(eps > 0.0 && eps <= LAPLACE_EPS_UPPER) {
            return Err(ConfigError::out_of_range(
                "laplace_eps",
                format!("{} is not in (0, {}]", eps, LAPLACE_EPS_UPPER),
            ));
        }
        Ok(Self { beta: 1.0 / eps })
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    /// Draws one sample by inverse CDF sampling.
    pub fn sample(&self, rng: &mut ChaCha20Rng) -> f32 {
        let u1: f32 = rng.gen();
        let mut u2: f32 = rng.gen();
        let mut redraws = 0;
        while u2 == 0.0 {
            if redraws == LAPLACE_MAX_REDRAWS {
                return 0.0;
            }
            u2 = rng.gen();
            redraws += 1;
        }
        let beta = f64::from(self.beta);
        if u1 <= 0.5 {
            (-beta * (1.0 - f64::from(u2)).ln()) as f32
        } else {
            (beta * f64::from(u2).ln()) as f32
        }
    }
}

/// Adds Laplace noise of budget `eps` to each value.
///
/// An out of range budget or empty input leaves the data unchanged.
pub fn add_laplace_noise(data: &[f32], eps: f32, rng: &mut ChaCha20Rng) -> Vec<f32> {
    if data.is_empty() {
        warn!("the input data of laplace is empty");
        return Vec::new();
    }
    let noise = match LaplaceNoise::new(eps) {
        Ok(noise) => noise,
        Err(err) => {
            error!("{}", err);
            return data.to_vec();
        }
    };
    debug!("laplace eps is {}", eps);
    data.iter().map(|v| v + noise.sample(rng)).collect()
}
