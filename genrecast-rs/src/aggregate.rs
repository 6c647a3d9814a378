//! Batch inference and soft voting over the windows of one clip.

use crate::classifier::GenreClassifier;
use crate::error::{GenreError, Result};
use crate::features::FeatureTensor;
use ndarray::{Array1, Array4, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreScore {
    pub label: String,
    pub confidence: f32,
}

/// Labels with confidences, best first.
pub type GenreResult = Vec<GenreScore>;

/// Soft-voted output of one clip.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub windows: usize,
    /// Mean probability per class, in model output order.
    pub probabilities: Array1<f32>,
}

/// Stack per-window tensors into `(windows, bins, frames, 1)`.
pub fn stack(tensors: &[FeatureTensor]) -> Result<Array4<f32>> {
    let first = tensors
        .first()
        .ok_or_else(|| GenreError::Inference("no feature tensors to classify".into()))?;
    let (bins, frames, ch) = first.shape();
    let mut batch = Array4::<f32>::zeros((tensors.len(), bins, frames, ch));
    for (i, t) in tensors.iter().enumerate() {
        if t.shape() != (bins, frames, ch) {
            return Err(GenreError::Inference(format!(
                "tensor {} has shape {:?}, expected {:?}",
                i,
                t.shape(),
                (bins, frames, ch)
            )));
        }
        batch.index_axis_mut(Axis(0), i).assign(&t.view());
    }
    Ok(batch)
}

/// Column-wise mean of a `(windows, classes)` probability matrix.
pub fn soft_vote(probs: ArrayView2<'_, f32>) -> Result<Array1<f32>> {
    probs
        .mean_axis(Axis(0))
        .ok_or_else(|| GenreError::Inference("no window predictions to average".into()))
}

/// Pair probabilities with labels by index, sort by confidence descending
/// (stable, so ties keep class order) and keep at most `top_k`. A `top_k`
/// above the class count is clamped.
pub fn rank(probs: ArrayView1<'_, f32>, labels: &[String], top_k: usize) -> Result<GenreResult> {
    if probs.len() != labels.len() {
        return Err(GenreError::Inference(format!(
            "model produced {} classes but {} labels are configured",
            probs.len(),
            labels.len()
        )));
    }
    let mut scored: Vec<GenreScore> = labels
        .iter()
        .zip(probs.iter())
        .map(|(label, &confidence)| GenreScore {
            label: label.clone(),
            confidence,
        })
        .collect();
    scored.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    scored.truncate(top_k.min(labels.len()));
    Ok(scored)
}

/// One forward pass over all windows, then soft voting.
pub fn aggregate(model: &dyn GenreClassifier, tensors: &[FeatureTensor]) -> Result<Aggregate> {
    let batch = stack(tensors)?;
    let probs = model.predict_batch(batch.view())?;
    if probs.nrows() != tensors.len() {
        return Err(GenreError::Inference(format!(
            "model returned {} rows for {} windows",
            probs.nrows(),
            tensors.len()
        )));
    }
    log::debug!(
        "{} produced {:?} probabilities for batch {:?}",
        model.model_name(),
        probs.dim(),
        batch.dim()
    );
    Ok(Aggregate {
        windows: tensors.len(),
        probabilities: soft_vote(probs.view())?,
    })
}

pub fn predict(
    model: &dyn GenreClassifier,
    tensors: &[FeatureTensor],
    labels: &[String],
    top_k: usize,
) -> Result<GenreResult> {
    let agg = aggregate(model, tensors)?;
    rank(agg.probabilities.view(), labels, top_k)
}
