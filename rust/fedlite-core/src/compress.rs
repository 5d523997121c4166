//! Compression of the uploaded update.
//!
//! Under `DIFF_SPARSE_QUANT` a client uploads the diff `post - pre` of its weights, sparsified and
//! quantized:
//!
//! - each coordinate of the flattened diff is kept with probability `sparse_rate`. The decision
//!   comes from a `ChaCha20` stream seeded with the iteration, so the server regenerates the kept
//!   positions and only the kept values travel.
//! - the kept values of a feature are quantized to 8 bits between their minimum and maximum.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{common::ConfigError, FeatureMap};

/// Number of bits of a quantized value.
pub const QUANT_BITS: u32 = 8;
const QUANT_LEVELS: f32 = ((1 << QUANT_BITS) - 1) as f32;
const QUANT_OFFSET: f32 = (1 << (QUANT_BITS - 1)) as f32;
const QUANT_EPS: f32 = 1e-10;

/// A compressed feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedFeature {
    pub name: String,
    /// Length of the uncompressed feature.
    pub len: usize,
    pub min_val: f32,
    pub max_val: f32,
    /// The quantized kept values.
    pub data: Vec<i8>,
}

/// A compressed update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedUpdate {
    pub iteration: u64,
    pub sparse_rate: f32,
    pub features: Vec<CompressedFeature>,
}

/// Validates a sparse rate negotiated with the server.
pub fn check_sparse_rate(sparse_rate: f32) -> Result<f32, ConfigError> {
    if sparse_rate > 0.0 && sparse_rate <= 1.0 {
        Ok(sparse_rate)
    } else {
        Err(ConfigError::out_of_range(
            "upload_sparse_rate",
            format!("{} is not in (0, 1]", sparse_rate),
        ))
    }
}

/// The stream that decides which coordinates are kept.
fn sparse_stream(iteration: u64) -> ChaCha20Rng {
    let mut seed = [0_u8; 32];
    seed[..8].copy_from_slice(&iteration.to_le_bytes());
    ChaCha20Rng::from_seed(seed)
}

/// Quantizes values to 8 bits between their minimum and maximum.
pub fn quantize(values: &[f32]) -> (f32, f32, Vec<i8>) {
    if values.is_empty() {
        return (0.0, 0.0, Vec::new());
    }
    let (min_val, max_val) = values
        .iter()
        .fold((f32::MAX, f32::MIN), |(min, max), v| (min.min(*v), max.max(*v)));
    let scale = (max_val - min_val) / QUANT_LEVELS + QUANT_EPS;
    let data = values
        .iter()
        .map(|v| ((v - min_val) / scale - QUANT_OFFSET).round() as i8)
        .collect();
    (min_val, max_val, data)
}

/// Inverts [`quantize`], up to half a quantization step.
pub fn dequantize(min_val: f32, max_val: f32, data: &[i8]) -> Vec<f32> {
    let scale = (max_val - min_val) / QUANT_LEVELS + QUANT_EPS;
    data.iter()
        .map(|q| (f32::from(*q) + QUANT_OFFSET) * scale + min_val)
        .collect()
}

/// Compresses the diff of the named features.
///
/// # Errors
/// Fails if the sparse rate is not in `(0, 1]`.
pub fn compress(
    pre: &FeatureMap,
    post: &FeatureMap,
    names: &[String],
    sparse_rate: f32,
    iteration: u64,
) -> Result<CompressedUpdate, ConfigError> {
    let sparse_rate = check_sparse_rate(sparse_rate)?;
    let mut stream = sparse_stream(iteration);
    let mut features = Vec::with_capacity(names.len());
    let mut kept_total = 0;
    for name in names {
        let (before, after) = match (pre.get(name), post.get(name)) {
            (Some(before), Some(after)) if before.len() == after.len() => (before, after),
            _ => {
                warn!("feature {} can't be compressed, skipping it", name);
                continue;
            }
        };
        let kept: Vec<f32> = after
            .iter()
            .zip(before)
            .filter(|_| stream.gen::<f32>() < sparse_rate)
            .map(|(a, b)| a - b)
            .collect();
        kept_total += kept.len();
        let (min_val, max_val, data) = quantize(&kept);
        features.push(CompressedFeature {
            name: name.clone(),
            len: after.len(),
            min_val,
            max_val,
            data,
        });
    }
    debug!("kept {} values of the update", kept_total);
    Ok(CompressedUpdate {
        iteration,
        sparse_rate,
        features,
    })
}

/// Restores the diff from a compressed update. Coordinates that were dropped are zero.
pub fn decompress(update: &CompressedUpdate) -> FeatureMap {
    let mut stream = sparse_stream(update.iteration);
    update
        .features
        .iter()
        .map(|feature| {
            let mut kept = dequantize(feature.min_val, feature.max_val, &feature.data).into_iter();
            let diff = (0..feature.len)
                .map(|_| {
                    if stream.gen::<f32>() < update.sparse_rate {
                        kept.next().unwrap_or(0.0)
                    } else {
                        0.0
                    }
                })
                .collect();
            (feature.name.clone(), diff)
        })
        .collect()
}
