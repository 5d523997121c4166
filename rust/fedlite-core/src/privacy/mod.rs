//! Privacy mechanisms applied to a trained update before it leaves the device.
//!
//! - [`dp`]: adaptive norm clipping, calibration of the analytic Gaussian mechanism and Laplace
//!   noise.
//! - [`signds`]: the SignDS selector, which replaces the dense update by a privacy budgeted set
//!   of dimension indices and a randomized sign bit.
//!
//! Both operate on immutable snapshots of the weights taken before and after training. The
//! update of a feature is the element-wise difference `post - pre`.

pub mod dp;
pub mod signds;

use tracing::warn;

use crate::FeatureMap;

/// Concatenates the updates of the named features, in the order of `names`.
///
/// Features missing from either snapshot, or whose snapshots differ in length, are skipped with a
/// warning.
pub fn flatten_update(pre: &FeatureMap, post: &FeatureMap, names: &[String]) -> Vec<f32> {
    let mut update = Vec::new();
    for name in names {
        match (pre.get(name), post.get(name)) {
            (Some(before), Some(after)) if before.len() == after.len() => {
                update.extend(after.iter().zip(before).map(|(a, b)| a - b));
            }
            (Some(before), Some(after)) => warn!(
                "feature {} changed length during training: {} != {}",
                name,
                before.len(),
                after.len()
            ),
            _ => warn!("feature {} is missing from the weight snapshots", name),
        }
    }
    update
}
