//! Service and feature configuration.
//!
//! A `ServiceConfig` is built once (from a preset, a JSON file, or both plus a
//! model manifest), validated, and then shared read-only by every request.
//! The same value drives training-time data preparation and inference, so the
//! window length, STFT geometry and pad/trim target cannot drift between them.

use crate::error::{GenreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// GTZAN genres in the alphabetical order the reference models were trained on.
pub const GTZAN_GENRES: &[&str] = &[
    "blues",
    "classical",
    "country",
    "disco",
    "hiphop",
    "jazz",
    "metal",
    "pop",
    "reggae",
    "rock",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Mel,
    Mfcc,
    Chroma,
}

impl FeatureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureKind::Mel => "mel",
            FeatureKind::Mfcc => "mfcc",
            FeatureKind::Chroma => "chroma",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub sample_rate: u32,
    pub window_seconds: f32,
    /// Fraction of a window shared with the next one, in `[0, 1)`.
    pub overlap_ratio: f32,
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub n_mfcc: usize,
    pub n_chroma: usize,
    pub feature: FeatureKind,
    /// Peak-normalize the waveform before windowing.
    pub normalize_audio: bool,
    /// Z-score each feature tensor before pad/trim.
    pub normalize_per_feature: bool,
    pub target_frame_width: usize,
    pub label_order: Vec<String>,
    pub max_top_k: usize,
    pub max_input_bytes: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::gtzan_5s()
    }
}

impl ServiceConfig {
    /// 5 second windows, 128 mel bins, 216 frames.
    pub fn gtzan_5s() -> Self {
        Self {
            sample_rate: 22_050,
            window_seconds: 5.0,
            overlap_ratio: 0.0,
            n_fft: 2048,
            hop_length: 512,
            n_mels: 128,
            n_mfcc: 13,
            n_chroma: 12,
            feature: FeatureKind::Mel,
            normalize_audio: false,
            normalize_per_feature: false,
            target_frame_width: 216,
            label_order: GTZAN_GENRES.iter().map(|s| s.to_string()).collect(),
            max_top_k: 10,
            max_input_bytes: 32 * 1024 * 1024,
        }
    }

    /// 10 second windows, 431 frames.
    pub fn gtzan_10s() -> Self {
        Self {
            window_seconds: 10.0,
            target_frame_width: 431,
            ..Self::gtzan_5s()
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GenreError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let cfg: ServiceConfig = serde_json::from_str(&text)
            .map_err(|e| GenreError::Config(format!("{}: {}", path.display(), e)))?;
        cfg.validate()?;
        log::debug!("loaded service config from {}", path.display());
        Ok(cfg)
    }

    pub fn window_samples(&self) -> usize {
        (self.sample_rate as f64 * self.window_seconds as f64).round() as usize
    }

    pub fn hop_samples(&self) -> usize {
        (self.window_samples() as f64 * (1.0 - self.overlap_ratio as f64)).round() as usize
    }

    /// Frame count of a centered STFT over one full window.
    pub fn expected_frames(&self) -> usize {
        1 + self.window_samples() / self.hop_length.max(1)
    }

    /// Row count of the feature tensor for the configured feature kind.
    pub fn frequency_bins(&self) -> usize {
        match self.feature {
            FeatureKind::Mel => self.n_mels,
            FeatureKind::Mfcc => self.n_mfcc,
            FeatureKind::Chroma => self.n_chroma,
        }
    }

    pub fn validate(&self) -> Result<()> {
        fn bad(msg: String) -> Result<()> {
            Err(GenreError::Config(msg))
        }
        if self.sample_rate == 0 {
            return bad("sample_rate must be > 0".into());
        }
        if !(self.window_seconds.is_finite() && self.window_seconds > 0.0) {
            return bad(format!("window_seconds must be > 0, got {}", self.window_seconds));
        }
        if !(0.0..1.0).contains(&self.overlap_ratio) {
            return bad(format!("overlap_ratio must be in [0, 1), got {}", self.overlap_ratio));
        }
        if self.n_fft == 0 || self.hop_length == 0 {
            return bad("n_fft and hop_length must be > 0".into());
        }
        if self.n_mels == 0 {
            return bad("n_mels must be > 0".into());
        }
        if self.n_mfcc == 0 || self.n_mfcc > self.n_mels {
            return bad(format!("n_mfcc must be in 1..={}, got {}", self.n_mels, self.n_mfcc));
        }
        if self.n_chroma == 0 {
            return bad("n_chroma must be > 0".into());
        }
        if self.target_frame_width == 0 {
            return bad("target_frame_width must be > 0".into());
        }
        if self.window_samples() < self.n_fft {
            return bad(format!(
                "window of {} samples is shorter than n_fft {}",
                self.window_samples(),
                self.n_fft
            ));
        }
        if self.hop_samples() == 0 {
            return bad("overlap_ratio leaves a zero-sample hop".into());
        }
        if self.label_order.is_empty() {
            return bad("label_order must not be empty".into());
        }
        let mut seen = HashSet::new();
        for label in &self.label_order {
            if label.trim().is_empty() || !seen.insert(label.as_str()) {
                return bad(format!("label_order has an empty or duplicate label {:?}", label));
            }
        }
        if self.max_top_k == 0 {
            return bad("max_top_k must be >= 1".into());
        }
        Ok(())
    }

    /// Apply the properties shipped with a model artifact. The manifest's label
    /// order and target width win over whatever the config carried.
    pub fn with_manifest(mut self, manifest: &ModelManifest) -> Result<Self> {
        if self.label_order != manifest.labels {
            log::info!(
                "using label order from model manifest {:?} ({} labels)",
                manifest.name,
                manifest.labels.len()
            );
        }
        self.label_order = manifest.labels.clone();
        self.target_frame_width = manifest.target_frames;
        if let Some(secs) = manifest.window_seconds {
            self.window_seconds = secs;
        }
        if let Some(kind) = manifest.feature {
            self.feature = kind;
        }
        self.validate()?;
        Ok(self)
    }
}

/// Metadata shipped alongside a model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    #[serde(default = "unknown_version")]
    pub version: String,
    /// Output-layer class order the model was trained against.
    pub labels: Vec<String>,
    pub target_frames: usize,
    #[serde(default)]
    pub window_seconds: Option<f32>,
    #[serde(default)]
    pub feature: Option<FeatureKind>,
    /// Whether the model ends in a softmax or emits raw logits.
    #[serde(default)]
    pub output: ModelOutput,
}

/// What the final layer of a model emits. Applies to every row of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelOutput {
    #[default]
    Probabilities,
    Logits,
}

fn unknown_version() -> String {
    "unknown".into()
}

impl ModelManifest {
    /// `<model>.json` beside the model, falling back to `manifest.json` in the
    /// same directory.
    pub fn locate(model_path: &Path) -> Option<PathBuf> {
        let sibling = model_path.with_extension("json");
        if sibling.is_file() && sibling != model_path {
            return Some(sibling);
        }
        let shared = model_path.parent()?.join("manifest.json");
        shared.is_file().then_some(shared)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GenreError::ModelLoad(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        let manifest: ModelManifest = serde_json::from_str(&text).map_err(|e| {
            GenreError::ModelLoad(format!("bad manifest {}: {}", path.display(), e))
        })?;
        if manifest.labels.is_empty() || manifest.target_frames == 0 {
            return Err(GenreError::ModelLoad(format!(
                "manifest {} needs labels and target_frames",
                path.display()
            )));
        }
        Ok(manifest)
    }

    pub fn for_model(model_path: &Path) -> Result<Self> {
        let path = Self::locate(model_path).ok_or_else(|| {
            GenreError::ModelLoad(format!(
                "no manifest found for {} (expected {} or manifest.json)",
                model_path.display(),
                model_path.with_extension("json").display()
            ))
        })?;
        Self::from_json_file(&path)
    }
}
