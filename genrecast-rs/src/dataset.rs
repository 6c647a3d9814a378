//! Training-set preparation.
//!
//! Walks `raw/<genre>/...`, splits each genre's songs into train/val/test
//! with a seeded shuffle, and writes one feature record per window using the
//! same loader, windower and extractor the service uses at inference time.

use crate::audio::{AudioLoader, AudioSource};
use crate::config::ServiceConfig;
use crate::error::{GenreError, Result};
use crate::features::FeatureExtractor;
use crate::window::{Window, Windower};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Full-length test songs, kept for clip-level evaluation.
pub const UNPROCESSED_DIR: &str = "test_unprocessed";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplitRatios {
    pub train: f32,
    pub val: f32,
    pub test: f32,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.8,
            val: 0.1,
            test: 0.1,
        }
    }
}

impl SplitRatios {
    pub fn validate(&self) -> Result<()> {
        let parts = [self.train, self.val, self.test];
        if parts.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(GenreError::Invalid(format!("negative split ratio in {:?}", self)));
        }
        let sum: f32 = parts.iter().sum();
        if (sum - 1.0).abs() > 1e-3 {
            return Err(GenreError::Invalid(format!(
                "split ratios must sum to 1, got {}",
                sum
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Val => "val",
            Split::Test => "test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PrepareOptions {
    pub ratios: SplitRatios,
    pub seed: u64,
    /// Also write every window as a 16-bit WAV next to its feature record.
    pub write_windows: bool,
}

impl Default for PrepareOptions {
    fn default() -> Self {
        Self {
            ratios: SplitRatios::default(),
            seed: 42,
            write_windows: false,
        }
    }
}

/// One window's features, as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub genre: String,
    /// Index of `genre` in `labels.json`.
    pub label: usize,
    pub split: Split,
    pub source: String,
    pub window: usize,
    pub start_secs: f32,
    pub shape: [usize; 3],
    /// Row-major `(bins, frames, 1)` values.
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataEntry {
    filename: String,
    genre: String,
    split: Split,
    source: String,
    window: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatasetSummary {
    pub labels: Vec<String>,
    pub songs: usize,
    pub skipped: usize,
    pub windows: usize,
    pub per_split: BTreeMap<Split, usize>,
    /// Test songs copied untouched to `test_unprocessed/<genre>/`.
    pub unprocessed: usize,
}

/// Genre name -> audio files, from the immediate subdirectories of `raw`.
pub fn discover_genres(raw: &Path) -> Result<BTreeMap<String, Vec<PathBuf>>> {
    if !raw.is_dir() {
        return Err(GenreError::InputNotFound(raw.to_path_buf()));
    }
    let mut genres = BTreeMap::new();
    for entry in fs::read_dir(raw)? {
        let dir = entry?.path();
        if !dir.is_dir() {
            continue;
        }
        let Some(name) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let mut songs = Vec::new();
        for e in WalkDir::new(&dir) {
            let e = e.map_err(|e| GenreError::Io(e.into()))?;
            if e.file_type().is_file() && crate::is_supported(e.path()) {
                songs.push(e.path().to_path_buf());
            }
        }
        songs.sort();
        if songs.is_empty() {
            log::warn!("genre directory {} has no audio files", dir.display());
            continue;
        }
        genres.insert(name, songs);
    }
    Ok(genres)
}

/// Shuffle and cut into train/val/test. Train and val sizes are floored,
/// test takes the rest.
pub fn split_songs(mut songs: Vec<PathBuf>, ratios: &SplitRatios, rng: &mut StdRng) -> [Vec<PathBuf>; 3] {
    songs.shuffle(rng);
    let n = songs.len();
    let n_train = floor_count(n, ratios.train).min(n);
    let n_val = floor_count(n, ratios.val).min(n - n_train);
    let test = songs.split_off(n_train + n_val);
    let val = songs.split_off(n_train);
    [songs, val, test]
}

// the small bias keeps 10 * 0.7 at 7 despite f32 ratios
fn floor_count(n: usize, ratio: f32) -> usize {
    (n as f64 * ratio as f64 + 1e-4).floor() as usize
}

pub fn prepare_dataset(
    raw: &Path,
    out: &Path,
    cfg: &ServiceConfig,
    opts: &PrepareOptions,
) -> Result<DatasetSummary> {
    cfg.validate()?;
    opts.ratios.validate()?;
    let genres = discover_genres(raw)?;
    if genres.is_empty() {
        return Err(GenreError::Invalid(format!(
            "no genre directories with audio under {}",
            raw.display()
        )));
    }
    let labels: Vec<String> = genres.keys().cloned().collect();
    log::info!("preparing {} genres from {}", labels.len(), raw.display());

    let loader = AudioLoader::new(cfg.sample_rate);
    let windower = Windower::from_config(cfg)?;
    let extractor = FeatureExtractor::new(cfg)?;
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let mut summary = DatasetSummary {
        labels: labels.clone(),
        ..Default::default()
    };
    let mut metadata = Vec::new();

    for (label, (genre, songs)) in genres.into_iter().enumerate() {
        let parts = split_songs(songs, &opts.ratios, &mut rng);
        for (split, paths) in Split::ALL.into_iter().zip(parts) {
            let dir = out.join(split.as_str()).join(&genre);
            fs::create_dir_all(&dir)?;
            let unprocessed_dir = out.join(UNPROCESSED_DIR).join(&genre);
            if split == Split::Test {
                fs::create_dir_all(&unprocessed_dir)?;
            }
            for path in paths {
                if split == Split::Test {
                    if let Some(name) = path.file_name() {
                        fs::copy(&path, unprocessed_dir.join(name))?;
                        summary.unprocessed += 1;
                    }
                }
                let mut clip = match loader.load(AudioSource::Path(path.clone())) {
                    Ok(c) => c,
                    Err(e) if e.is_bad_input() => {
                        log::warn!("skipping {}: {}", path.display(), e);
                        summary.skipped += 1;
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                if cfg.normalize_audio {
                    clip.peak_normalize();
                }
                let windows: Vec<Window<'_>> = match windower.slice(&clip) {
                    Ok(w) => w.collect(),
                    Err(e) => {
                        log::warn!("skipping {}: {}", path.display(), e);
                        summary.skipped += 1;
                        continue;
                    }
                };
                let tensors = extractor.extract_all(&windows)?;
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("clip")
                    .to_string();
                for (window, tensor) in windows.iter().zip(tensors) {
                    let filename = format!("{}_win{}.json", stem, window.index);
                    let (bins, frames, ch) = tensor.shape();
                    let record = FeatureRecord {
                        genre: genre.clone(),
                        label,
                        split,
                        source: path.display().to_string(),
                        window: window.index,
                        start_secs: window.start_secs(),
                        shape: [bins, frames, ch],
                        data: tensor.view().iter().copied().collect(),
                    };
                    write_json(&dir.join(&filename), &record)?;
                    if opts.write_windows {
                        write_wav(
                            &dir.join(format!("{}_win{}.wav", stem, window.index)),
                            window.samples,
                            cfg.sample_rate,
                        )?;
                    }
                    metadata.push(MetadataEntry {
                        filename,
                        genre: genre.clone(),
                        split,
                        source: record.source,
                        window: window.index,
                    });
                    summary.windows += 1;
                    *summary.per_split.entry(split).or_insert(0) += 1;
                }
                summary.songs += 1;
            }
        }
        log::info!("{}: done ({} windows so far)", genre, summary.windows);
    }

    write_json(&out.join("labels.json"), &labels)?;
    write_json(&out.join("metadata.json"), &metadata)?;
    let mut feature_cfg = cfg.clone();
    feature_cfg.label_order = labels;
    write_json(&out.join("feature_config.json"), &feature_cfg)?;
    Ok(summary)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)
        .map_err(|e| GenreError::Invalid(format!("cannot serialize {}: {}", path.display(), e)))?;
    fs::write(path, text)?;
    Ok(())
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_err = |e: hound::Error| GenreError::Invalid(format!("{}: {}", path.display(), e));
    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_err)?;
    for &s in samples {
        writer
            .write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
            .map_err(wav_err)?;
    }
    writer.finalize().map_err(wav_err)?;
    Ok(())
}
