//! Genre classification for short music clips.
//!
//! Audio is decoded to mono PCM, cut into fixed windows, turned into
//! fixed-width log-mel (or MFCC / chroma) tensors, classified in one batch and
//! soft-voted into a ranked genre list. [`GenreService`] wires the stages
//! together; [`dataset`] prepares training data with the same stages.

pub mod aggregate;
pub mod audio;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod error;
pub mod features;
pub mod recommend;
pub mod service;
pub mod window;

pub use aggregate::{GenreResult, GenreScore};
pub use audio::{AudioClip, AudioLoader, AudioSource};
pub use classifier::{DummyClassifier, GenreClassifier};
#[cfg(feature = "tract")]
pub use classifier::TractClassifier;
pub use config::{FeatureKind, ModelManifest, ModelOutput, ServiceConfig, GTZAN_GENRES};
pub use error::{GenreError, Result};
pub use features::{FeatureExtractor, FeatureTensor};
pub use recommend::{LastFmClient, Recommendation, RecommendationSource};
pub use service::{ClipAnalysis, GenreService, ServiceInfo};
pub use window::{Window, Windower};

use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const SUPPORTED_EXTS: &[&str] = &[".wav", ".mp3", ".flac", ".ogg", ".m4a", ".aac"];

/// Expand files and directories (recursively) into supported audio files.
pub fn expand_audio_files(inputs: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for p in inputs {
        if p.is_file() {
            if is_supported(&p) {
                out.push(p);
            } else {
                log::warn!("skipping unsupported file {}", p.display());
            }
        } else if p.is_dir() {
            let mut found = Vec::new();
            for entry in WalkDir::new(&p) {
                let e = entry.map_err(|e| GenreError::Io(e.into()))?;
                if e.file_type().is_file() && is_supported(e.path()) {
                    found.push(e.path().to_path_buf());
                }
            }
            found.sort();
            out.extend(found);
        } else {
            return Err(GenreError::InputNotFound(p));
        }
    }
    Ok(out)
}

pub fn is_supported(p: &Path) -> bool {
    p.extension()
        .and_then(|s| s.to_str())
        .map(|ext| {
            let ext = format!(".{}", ext).to_lowercase();
            SUPPORTED_EXTS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
