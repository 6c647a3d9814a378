//! Classifier backends.
//!
//! A backend maps a batch of feature tensors `(windows, bins, frames, 1)` to a
//! probability matrix `(windows, classes)`. Backends are loaded once and only
//! read afterwards, so every implementation must be `Send + Sync`.

use crate::config::ModelOutput;
use crate::error::{GenreError, Result};
use ndarray::{Array2, ArrayView4, Axis};

pub trait GenreClassifier: Send + Sync {
    fn predict_batch(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>>;
    fn num_classes(&self) -> usize;
    fn model_name(&self) -> &str;
}

impl GenreClassifier for Box<dyn GenreClassifier> {
    fn predict_batch(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        (**self).predict_batch(batch)
    }
    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }
    fn model_name(&self) -> &str {
        (**self).model_name()
    }
}

/// Deterministic stand-in model: splits the frequency axis into one band per
/// class and softmaxes the mean band levels. Same input, same output.
#[derive(Debug, Clone)]
pub struct DummyClassifier {
    classes: usize,
    name: String,
}

impl DummyClassifier {
    pub fn new(classes: usize) -> Self {
        Self {
            classes: classes.max(1),
            name: "dummy-genre".into(),
        }
    }
}

impl GenreClassifier for DummyClassifier {
    fn predict_batch(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let (n, bins, _, _) = batch.dim();
        if bins == 0 {
            return Err(GenreError::Inference("empty frequency axis".into()));
        }
        let mut out = Array2::<f32>::zeros((n, self.classes));
        for (w, tensor) in batch.axis_iter(Axis(0)).enumerate() {
            let mut scores = vec![0.0f32; self.classes];
            for (c, score) in scores.iter_mut().enumerate() {
                let lo = c * bins / self.classes;
                let hi = ((c + 1) * bins / self.classes).max(lo + 1).min(bins);
                let band = tensor.slice(ndarray::s![lo..hi, .., ..]);
                *score = band.mean().unwrap_or(0.0) / 10.0;
            }
            for (c, p) in softmax(&scores).into_iter().enumerate() {
                out[[w, c]] = p;
            }
        }
        Ok(out)
    }
    fn num_classes(&self) -> usize {
        self.classes
    }
    fn model_name(&self) -> &str {
        &self.name
    }
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        vec![1.0 / logits.len().max(1) as f32; logits.len()]
    }
}

/// Bring raw model output onto the probability scale. The decision is made
/// once per model, so every row of a batch is treated alike.
pub fn to_probabilities(mut out: Array2<f32>, kind: ModelOutput) -> Array2<f32> {
    if kind == ModelOutput::Logits {
        for mut row in out.rows_mut() {
            let soft = softmax(&row.to_vec());
            for (dst, src) in row.iter_mut().zip(soft) {
                *dst = src;
            }
        }
    }
    out
}

#[cfg(feature = "tract")]
mod tract_backend {
    use super::{to_probabilities, GenreClassifier};
    use crate::config::ModelOutput;
    use crate::error::{GenreError, Result};
    use ndarray::{Array2, ArrayView4};
    use std::path::Path;
    use tract_onnx::prelude::*;

    /// ONNX classifier executed by tract. Running a plan only needs `&self`,
    /// so concurrent requests share one loaded model without locking.
    pub struct TractClassifier {
        model: SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>,
        classes: usize,
        output: ModelOutput,
        name: String,
    }

    impl TractClassifier {
        pub fn from_path(
            path: &Path,
            classes: usize,
            output: ModelOutput,
            name: impl Into<String>,
        ) -> Result<Self> {
            if !path.is_file() {
                return Err(GenreError::ModelLoad(format!(
                    "model file not found: {}",
                    path.display()
                )));
            }
            let model = tract_onnx::onnx()
                .model_for_path(path)
                .map_err(|e| GenreError::ModelLoad(e.to_string()))?
                .into_optimized()
                .map_err(|e| GenreError::ModelLoad(e.to_string()))?
                .into_runnable()
                .map_err(|e| GenreError::ModelLoad(e.to_string()))?;
            log::info!("loaded ONNX classifier from {}", path.display());
            Ok(Self {
                model,
                classes,
                output,
                name: name.into(),
            })
        }
    }

    impl GenreClassifier for TractClassifier {
        fn predict_batch(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
            let shape = batch.shape().to_vec();
            let contiguous = batch.as_standard_layout();
            let data = contiguous
                .as_slice()
                .ok_or_else(|| GenreError::Inference("batch is not contiguous".into()))?;
            let input = Tensor::from_shape(&shape, data)
                .map_err(|e| GenreError::Inference(e.to_string()))?;
            let outputs = self
                .model
                .run(tvec!(input.into()))
                .map_err(|e| GenreError::Inference(e.to_string()))?;
            let out = outputs
                .first()
                .ok_or_else(|| GenreError::Inference("model produced no output".into()))?;
            let view = out
                .to_array_view::<f32>()
                .map_err(|e| GenreError::Inference(e.to_string()))?;
            let values: Vec<f32> = view.iter().cloned().collect();
            let rows = shape[0];
            if rows == 0 || values.len() != rows * self.classes {
                return Err(GenreError::Inference(format!(
                    "model output has {} values, expected {} x {}",
                    values.len(),
                    rows,
                    self.classes
                )));
            }
            let probs = Array2::from_shape_vec((rows, self.classes), values)
                .map_err(|e| GenreError::Inference(e.to_string()))?;
            Ok(to_probabilities(probs, self.output))
        }
        fn num_classes(&self) -> usize {
            self.classes
        }
        fn model_name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(feature = "tract")]
pub use tract_backend::TractClassifier;
