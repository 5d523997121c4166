//! Metrics model variants can report.

use std::sync::{Arc, Mutex};

use tracing::{error, warn};

use super::{Callback, StepOutputs};

fn is_probability(value: f32) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// The area under the ROC curve of a binary classifier.
///
/// `labels` are the true classes, `1.0` for positive samples and `0.0` for negative ones, and
/// `predictions` the scores of the positive class. The curve has one point per distinct score,
/// and its area is computed with the trapezoidal rule. A single class dataset has an area of `0`.
///
/// Returns `None` if the inputs differ in length, are empty or hold values outside of `[0, 1]`.
pub fn auc(labels: &[f32], predictions: &[f32]) -> Option<f32> {
    if labels.len() != predictions.len() || labels.is_empty() {
        error!(
            "{} labels for {} predictions",
            labels.len(),
            predictions.len()
        );
        return None;
    }
    if let Some(i) =
        (0..labels.len()).find(|&i| !is_probability(labels[i]) || !is_probability(predictions[i]))
    {
        error!(
            "invalid value at {}: label {}, prediction {}",
            i, labels[i], predictions[i]
        );
        return None;
    }

    // descending scores, ties keep the reverse input order
    let mut order: Vec<usize> = (0..labels.len()).rev().collect();
    order.sort_by(|&a, &b| {
        predictions[b]
            .partial_cmp(&predictions[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // cumulated true and false positives at each distinct threshold
    let mut tps = vec![0.0_f32];
    let mut fps = vec![0.0_f32];
    let mut positives = 0.0;
    for (rank, &i) in order.iter().enumerate() {
        positives += labels[i];
        let last = rank + 1 == order.len();
        if last || predictions[order[rank + 1]] != predictions[i] {
            tps.push(positives);
            fps.push((rank + 1) as f32 - positives);
        }
    }

    // UNWRAP_SAFE: the inputs are not empty, so there is a point past the origin
    let total_tps = *tps.last().unwrap();
    let total_fps = *fps.last().unwrap();
    if total_tps <= 0.0 || total_fps <= 0.0 {
        warn!("the labels hold a single class");
        return Some(0.0);
    }
    let tpr: Vec<f32> = tps.iter().map(|tp| tp / total_tps).collect();
    let fpr: Vec<f32> = fps.iter().map(|fp| fp / total_fps).collect();
    let area = tpr
        .windows(2)
        .zip(fpr.windows(2))
        .map(|(y, x)| (x[1] - x[0]) * (y[0] + y[1]))
        .sum::<f32>()
        / 2.0;
    Some(if area.is_nan() { 0.0 } else { area })
}

/// A callback collecting the labels and positive class scores of a run.
///
/// It is cheap to clone, clones share the collected samples.
#[derive(Debug, Clone, Default)]
pub struct AucCallback {
    samples: Arc<Mutex<(Vec<f32>, Vec<f32>)>>,
}

impl AucCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// The AUC of the samples collected so far.
    pub fn auc(&self) -> Option<f32> {
        let samples = self.samples.lock().ok()?;
        auc(&samples.0, &samples.1)
    }
}

impl Callback for AucCallback {
    fn begin(&mut self) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.0.clear();
            samples.1.clear();
        }
    }

    fn step_end(&mut self, outputs: &StepOutputs) {
        let num_classes = outputs.num_classes;
        if num_classes < 2 || outputs.scores.len() != outputs.labels.len() * num_classes {
            warn!("the outputs of the step aren't binary classification outputs");
            return;
        }
        if let Ok(mut samples) = self.samples.lock() {
            for (label, scores) in outputs
                .labels
                .iter()
                .zip(outputs.scores.chunks(num_classes))
            {
                samples.0.push(*label as f32);
                samples.1.push(scores[num_classes - 1]);
            }
        }
    }
}
