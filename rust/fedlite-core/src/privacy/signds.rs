//! The SignDS selector.
//!
//! Instead of the dense update, a client under SignDS uploads a set of `h` dimension indices and
//! one bit. The `h` dimensions mix dimensions drawn from the top-k set (the `k` largest update
//! values in the direction of a random sign) and dimensions drawn from the rest. How many come
//! from the top-k set is drawn with an exponential mechanism: outcomes with at least `thr` top-k
//! dimensions are weighted `e^eps`, the others `1`. The bit tells the server whether the mean
//! top-k magnitude is below a reference magnitude, and goes through randomized response.
//!
//! The combinatorial counts are evaluated in `f64` and may overflow for large output dimensions.
//! The search for the output dimension treats an undefined expectation as the end of the search.

use rand::Rng;
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::common::ConfigError;

/// Privacy budget of the randomized response on the magnitude bit.
pub const RANDOM_RESPONSE_EPS: f64 = 5.0;
/// Factor applied to the reference magnitude, up before the range is reached and down after.
const MAGNITUDE_MULTIPLE: f32 = 2.0;
/// Default reference magnitude.
pub const DEFAULT_R_EST: f32 = 1e-5;

/// The number of combinations of `n` things taken `k` at a time, `0` if `k` is out of range.
pub fn comb(n: f64, k: f64) -> f64 {
    if !(k <= n && n >= 0.0 && k >= 0.0) {
        return 0.0;
    }
    let m = n + 1.0;
    let terms = k.min(n - k) as i64;
    (1..=terms).fold(1.0, |res, i| res * (m - i as f64) / i as f64)
}

/// The number of output sets of size `output_dim` with exactly `num_inter` top-k dimensions.
pub fn count_combs(num_inter: i64, topk_dim: i64, input_dim: i64, output_dim: i64) -> f64 {
    comb(topk_dim as f64, num_inter as f64)
        * comb((input_dim - topk_dim) as f64, (output_dim - num_inter) as f64)
}

/// The distribution of the number of top-k dimensions in the output set, for threshold `thr`.
///
/// Returns an empty distribution if no output set exists.
pub fn calc_pmf(thr: i64, topk_dim: i64, input_dim: i64, output_dim: i64, eps: f64) -> Vec<f64> {
    let weight = eps.exp();
    let pmf: Vec<f64> = (0..=output_dim)
        .map(|v| {
            let count = count_combs(v, topk_dim, input_dim, output_dim);
            if v < thr {
                count
            } else {
                count * weight
            }
        })
        .collect();
    let sum: f64 = pmf.iter().sum();
    if sum == 0.0 {
        error!("the probability mass function is zero");
        return Vec::new();
    }
    pmf.into_iter().map(|p| p / sum).collect()
}

/// The expected number of top-k dimensions in the output set.
pub fn calc_expectation(pmf: &[f64]) -> f64 {
    pmf.iter().enumerate().map(|(i, p)| i as f64 * p).sum()
}

/// The threshold in `[1, output_dim]` that maximizes the expected number of top-k dimensions.
///
/// The search stops at the first threshold that doesn't improve the expectation.
pub fn calc_opt_thr(topk_dim: i64, input_dim: i64, output_dim: i64, eps: f64) -> i64 {
    let mut opt_expect = 0.0;
    let mut opt_t = 0;
    for t in 1..=output_dim {
        let expect = calc_expectation(&calc_pmf(t, topk_dim, input_dim, output_dim, eps));
        if expect > opt_expect {
            opt_expect = expect;
            opt_t = t;
        } else {
            break;
        }
    }
    opt_t.max(1)
}

/// The largest output dimension whose expected ratio of top-k dimensions is at least
/// `thr_ratio`.
pub fn find_opt_output_dim(thr_ratio: f64, topk_dim: i64, input_dim: i64, eps: f64) -> i64 {
    let mut output_dim = 1;
    loop {
        let thr = calc_opt_thr(topk_dim, input_dim, output_dim, eps);
        let ratio = calc_expectation(&calc_pmf(thr, topk_dim, input_dim, output_dim, eps))
            / output_dim as f64;
        if ratio.is_nan() || ratio < thr_ratio {
            break;
        }
        output_dim += 1;
    }
    (output_dim - 1).max(1)
}

/// Draws the number of top-k dimensions of the output set by inverse CDF sampling.
pub fn count_inters(
    thr_dim: i64,
    denominator: f64,
    topk_dim: i64,
    input_dim: i64,
    output_dim: i64,
    eps: f64,
    rng: &mut ChaCha20Rng,
) -> i64 {
    let random_prob: f64 = rng.gen();
    let weight = eps.exp();
    let mut num_inter = 0;
    let mut prob = count_combs(num_inter, topk_dim, input_dim, output_dim) / denominator;
    while prob < random_prob && num_inter < output_dim {
        num_inter += 1;
        let count = count_combs(num_inter, topk_dim, input_dim, output_dim);
        prob += if num_inter < thr_dim {
            count / denominator
        } else {
            weight * count / denominator
        };
    }
    num_inter
}

/// Picks `count` distinct elements of `pool` uniformly at random.
///
/// The picks are swapped to the end of `pool`, last pick first.
///
/// Returns `None` if `pool` has fewer than `count` elements.
pub fn random_select(
    pool: &mut [usize],
    count: usize,
    rng: &mut ChaCha20Rng,
) -> Option<Vec<usize>> {
    if pool.len() < count {
        error!(
            "cannot select {} indices out of {}",
            count,
            pool.len()
        );
        return None;
    }
    let len = pool.len();
    let mut picked = Vec::with_capacity(count);
    for i in (len - count + 1..=len).rev() {
        let random_index = rng.gen_range(0..i);
        pool.swap(random_index, i - 1);
        picked.push(pool[i - 1]);
    }
    Some(picked)
}

/// Indices of `data` sorted by value, descending if `sign` is set and ascending otherwise.
///
/// The sort is stable.
pub fn sort_indices(data: &[f32], sign: bool) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..data.len()).collect();
    indices.sort_by(|&l, &r| {
        let ordering = data[l]
            .partial_cmp(&data[r])
            .unwrap_or(std::cmp::Ordering::Equal);
        if sign {
            ordering.reverse()
        } else {
            ordering
        }
    });
    indices
}

/// Keeps `input` with probability `e^eps / (1 + e^eps)` and flips it otherwise.
pub fn random_response(input: bool, eps: f64, rng: &mut ChaCha20Rng) -> bool {
    let probability: f64 = rng.gen();
    let threshold = eps.exp() / (1.0 + eps.exp());
    if probability < threshold {
        input
    } else {
        !input
    }
}

/// Compares the mean top-k magnitude against the reference and randomizes the answer.
pub fn mag_rr(
    data: &[f32],
    sorted_indices: &[usize],
    topk_dim: usize,
    reference: &MagnitudeReference,
    eps: f64,
    rng: &mut ChaCha20Rng,
) -> bool {
    let sum: f32 = sorted_indices[..topk_dim].iter().map(|&i| data[i]).sum();
    let r_client = (sum / topk_dim as f32).abs();
    let r_est = reference.r_est();
    let b_client = if reference.range_reached() {
        r_client < r_est / MAGNITUDE_MULTIPLE
    } else {
        r_client < MAGNITUDE_MULTIPLE * r_est
    };
    debug!("actual magnitude {}, actual bit {}", r_client, b_client);
    random_response(b_client, eps, rng)
}

/// The SignDS parameters of a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignDsConfig {
    /// Fraction of the dimensions in the top-k set.
    pub k: f32,
    pub eps: f64,
    /// Minimum expected ratio of top-k dimensions in the output set.
    pub thr_ratio: f64,
    pub global_lr: f32,
    /// Fixed output dimension, `0` to search for it.
    pub dim_out: usize,
}

impl SignDsConfig {
    /// # Errors
    /// Fails if a parameter is out of range.
    pub fn new(
        k: f32,
        eps: f64,
        thr_ratio: f64,
        global_lr: f32,
        dim_out: i32,
    ) -> Result<Self, ConfigError> {
        if !(k > 0.0 && k <= 1.0) {
            return Err(ConfigError::out_of_range(
                "sign_k",
                format!("{} is not in (0, 1]", k),
            ));
        }
        if !(eps.is_finite() && eps > 0.0) {
            return Err(ConfigError::out_of_range(
                "sign_eps",
                format!("{} is not positive", eps),
            ));
        }
        if !(thr_ratio > 0.0 && thr_ratio <= 1.0) {
            return Err(ConfigError::out_of_range(
                "sign_thr_ratio",
                format!("{} is not in (0, 1]", thr_ratio),
            ));
        }
        if !(global_lr.is_finite() && global_lr > 0.0) {
            return Err(ConfigError::out_of_range(
                "sign_global_lr",
                format!("{} is not positive", global_lr),
            ));
        }
        if dim_out < 0 {
            return Err(ConfigError::out_of_range(
                "sign_dim_out",
                format!("{} is negative", dim_out),
            ));
        }
        Ok(Self {
            k,
            eps,
            thr_ratio,
            global_lr,
            dim_out: dim_out as usize,
        })
    }
}

/// The reference magnitude the top-k mean is compared against.
///
/// It only changes through its setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnitudeReference {
    r_est: f32,
    range_reached: bool,
}

impl Default for MagnitudeReference {
    fn default() -> Self {
        Self {
            r_est: DEFAULT_R_EST,
            range_reached: false,
        }
    }
}

impl MagnitudeReference {
    pub fn r_est(&self) -> f32 {
        self.r_est
    }

    pub fn range_reached(&self) -> bool {
        self.range_reached
    }

    /// Sets the reference magnitude.
    ///
    /// Values outside of `[0, 1)` are replaced by `1`.
    pub fn set_r_est(&mut self, r_est: f32) -> Result<(), ConfigError> {
        if (0.0..1.0).contains(&r_est) {
            self.r_est = r_est;
            Ok(())
        } else {
            warn!("r_est {} is not in [0, 1), using 1", r_est);
            self.r_est = 1.0;
            Err(ConfigError::out_of_range(
                "r_est",
                format!("{} is not in [0, 1)", r_est),
            ))
        }
    }

    pub fn set_range_reached(&mut self, range_reached: bool) {
        self.range_reached = range_reached;
    }
}

/// The output of the SignDS selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignDsSelection {
    /// The randomized magnitude bit.
    pub b_hat: bool,
    /// The selected dimensions, ascending.
    pub indices: Vec<usize>,
}

impl SignDsSelection {
    /// The selection returned for degenerate inputs.
    pub fn degenerate() -> Self {
        Self {
            b_hat: true,
            indices: Vec::new(),
        }
    }
}

/// Runs the SignDS selector on a flattened update.
///
/// `sign` is the random direction of the round: the top-k set holds the largest update values if
/// set and the smallest otherwise.
pub fn select(
    update: &[f32],
    config: &SignDsConfig,
    reference: &MagnitudeReference,
    sign: bool,
    rng: &mut ChaCha20Rng,
) -> SignDsSelection {
    let input_dim = update.len() as i64;
    let topk_dim = (config.k as f64 * input_dim as f64) as i64;
    let output_dim = if config.dim_out == 0 {
        find_opt_output_dim(config.thr_ratio, topk_dim, input_dim, config.eps)
    } else {
        config.dim_out as i64
    };
    let thr_dim = calc_opt_thr(topk_dim, input_dim, output_dim, config.eps);

    let less: f64 = (0..thr_dim)
        .map(|i| count_combs(i, topk_dim, input_dim, output_dim))
        .sum();
    let more: f64 = (thr_dim..=output_dim)
        .map(|i| count_combs(i, topk_dim, input_dim, output_dim))
        .sum();
    let denominator = less + config.eps.exp() * more;
    if denominator == 0.0 {
        error!("the denominator of the selection is zero");
        return SignDsSelection::degenerate();
    }

    let num_inter = count_inters(
        thr_dim,
        denominator,
        topk_dim,
        input_dim,
        output_dim,
        config.eps,
        rng,
    );
    info!("selecting {} top-k dimensions out of {}", num_inter, output_dim);
    if topk_dim < num_inter || output_dim <= 0 || output_dim > input_dim {
        error!(
            "invalid selection: topk_dim {}, num_inter {}, output_dim {}",
            topk_dim, num_inter, output_dim
        );
        return SignDsSelection::degenerate();
    }
    let topk_dim = topk_dim as usize;
    let num_inter = num_inter as usize;
    let num_outer = output_dim as usize - num_inter;

    let mut sorted = sort_indices(update, sign);
    let b_hat = mag_rr(
        update,
        &sorted,
        topk_dim,
        reference,
        RANDOM_RESPONSE_EPS,
        rng,
    );

    let (topk, rest) = sorted.split_at_mut(topk_dim);
    let mut indices = match (
        random_select(topk, num_inter, rng),
        random_select(rest, num_outer, rng),
    ) {
        (Some(mut inner), Some(outer)) => {
            inner.extend(outer);
            inner
        }
        _ => return SignDsSelection::degenerate(),
    };
    indices.sort_unstable();
    debug!("selected {} dimensions", indices.len());
    SignDsSelection { b_hat, indices }
}
