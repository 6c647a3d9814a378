//! Window -> feature tensor.
//!
//! Every window goes through the same steps: centered STFT power spectrum,
//! projection (mel / MFCC / chroma), optional z-score, then pad or trim on
//! the trailing time edge to the model's frame width, then a trailing channel
//! axis. Training-time preparation and inference both call into this module
//! with the same `ServiceConfig`.

use crate::config::{FeatureKind, ServiceConfig};
use crate::error::{GenreError, Result};
use crate::window::Window;
use ndarray::{s, Array2, Array3, ArrayView3, Axis};
use ndarray_stats::QuantileExt;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Dynamic range kept below the peak when converting to decibels.
pub const TOP_DB: f32 = 80.0;
const AMIN: f32 = 1e-10;
const ZSCORE_MIN_STD: f32 = 1e-6;

/// `(frequency_bins, time_frames, 1)` tensor for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTensor(Array3<f32>);

impl FeatureTensor {
    pub fn shape(&self) -> (usize, usize, usize) {
        self.0.dim()
    }

    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.0.view()
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.0
    }
}

enum Projection {
    Mel { basis: Array2<f32> },
    Mfcc { mel: Array2<f32>, dct: Array2<f32> },
    Chroma { basis: Array2<f32> },
}

pub struct FeatureExtractor {
    n_fft: usize,
    hop_length: usize,
    normalize: bool,
    target_frames: usize,
    window: Vec<f32>,
    projection: Projection,
    fft: Arc<dyn Fft<f32>>,
}

impl FeatureExtractor {
    pub fn new(cfg: &ServiceConfig) -> Result<Self> {
        if cfg.n_fft == 0 || cfg.hop_length == 0 || cfg.target_frame_width == 0 {
            return Err(GenreError::Config(
                "n_fft, hop_length and target_frame_width must be > 0".into(),
            ));
        }
        let sr = cfg.sample_rate as f32;
        let projection = match cfg.feature {
            FeatureKind::Mel => Projection::Mel {
                basis: mel_filterbank(sr, cfg.n_fft, cfg.n_mels, 0.0, sr / 2.0),
            },
            FeatureKind::Mfcc => Projection::Mfcc {
                mel: mel_filterbank(sr, cfg.n_fft, cfg.n_mels, 0.0, sr / 2.0),
                dct: dct_ortho_basis(cfg.n_mfcc, cfg.n_mels),
            },
            FeatureKind::Chroma => Projection::Chroma {
                basis: chroma_filterbank(sr, cfg.n_fft, cfg.n_chroma),
            },
        };
        let mut planner = FftPlanner::new();
        Ok(Self {
            n_fft: cfg.n_fft,
            hop_length: cfg.hop_length,
            normalize: cfg.normalize_per_feature,
            target_frames: cfg.target_frame_width,
            window: hann_window(cfg.n_fft),
            projection,
            fft: planner.plan_fft_forward(cfg.n_fft),
        })
    }

    pub fn target_frames(&self) -> usize {
        self.target_frames
    }

    pub fn extract(&self, window: &Window<'_>) -> Result<FeatureTensor> {
        self.extract_samples(window.samples)
    }

    /// Extract every window in parallel. Output order follows input order.
    pub fn extract_all(&self, windows: &[Window<'_>]) -> Result<Vec<FeatureTensor>> {
        windows.par_iter().map(|w| self.extract(w)).collect()
    }

    pub fn extract_samples(&self, samples: &[f32]) -> Result<FeatureTensor> {
        let raw = self.features(samples)?;
        let fitted = fit_frames(raw, self.target_frames);
        Ok(FeatureTensor(fitted.insert_axis(Axis(2))))
    }

    /// Feature matrix before the width is fixed: `(bins, computed_frames)`.
    pub fn features(&self, samples: &[f32]) -> Result<Array2<f32>> {
        let power = self.power_spectrogram(samples)?;
        let mut feat = match &self.projection {
            Projection::Mel { basis } => power_to_db(&basis.dot(&power), None),
            Projection::Mfcc { mel, dct } => dct.dot(&power_to_db(&mel.dot(&power), Some(1.0))),
            Projection::Chroma { basis } => normalize_frames(basis.dot(&power)),
        };
        if self.normalize {
            zscore(&mut feat);
        }
        Ok(feat)
    }

    /// Centered, zero-padded STFT power spectrum: `(n_fft / 2 + 1, frames)`.
    pub fn power_spectrogram(&self, samples: &[f32]) -> Result<Array2<f32>> {
        if samples.len() < self.n_fft {
            return Err(GenreError::FeatureExtraction(format!(
                "window of {} samples is shorter than n_fft {}",
                samples.len(),
                self.n_fft
            )));
        }
        if let Some(pos) = samples.iter().position(|s| !s.is_finite()) {
            return Err(GenreError::FeatureExtraction(format!(
                "non-finite sample at offset {}",
                pos
            )));
        }
        let pad = self.n_fft / 2;
        let frames = 1 + samples.len() / self.hop_length;
        let bins = self.n_fft / 2 + 1;
        let mut spec = Array2::<f32>::zeros((bins, frames));
        let mut buf = vec![Complex { re: 0.0, im: 0.0 }; self.n_fft];
        let mut scratch = vec![Complex { re: 0.0, im: 0.0 }; self.fft.get_inplace_scratch_len()];
        for t in 0..frames {
            let offset = t * self.hop_length;
            for (i, (slot, w)) in buf.iter_mut().zip(self.window.iter()).enumerate() {
                // position in the unpadded signal
                let p = (offset + i).checked_sub(pad);
                let s = p.and_then(|p| samples.get(p)).copied().unwrap_or(0.0);
                *slot = Complex { re: s * w, im: 0.0 };
            }
            self.fft.process_with_scratch(&mut buf, &mut scratch);
            for (b, c) in buf[..bins].iter().enumerate() {
                spec[[b, t]] = c.norm_sqr();
            }
        }
        Ok(spec)
    }
}

/// Zero-pad or truncate the time axis to exactly `target` columns. Both
/// operate on the trailing edge so the earliest frames are always kept.
pub fn fit_frames(feat: Array2<f32>, target: usize) -> Array2<f32> {
    let (rows, cols) = feat.dim();
    if cols == target {
        feat
    } else if cols > target {
        feat.slice(s![.., ..target]).to_owned()
    } else {
        let mut out = Array2::<f32>::zeros((rows, target));
        out.slice_mut(s![.., ..cols]).assign(&feat);
        out
    }
}

/// Power to decibels. With `reference == None` the peak of `power` is the
/// reference, so the loudest cell maps to 0 dB. Values are floored at
/// `TOP_DB` below the maximum.
pub fn power_to_db(power: &Array2<f32>, reference: Option<f32>) -> Array2<f32> {
    let ref_power = match reference {
        Some(r) => r,
        None => *power.max_skipnan(),
    };
    let ref_db = 10.0 * ref_power.max(AMIN).log10();
    let mut db = power.mapv(|p| 10.0 * p.max(AMIN).log10() - ref_db);
    let peak = *db.max_skipnan();
    if peak.is_finite() {
        let floor = peak - TOP_DB;
        db.mapv_inplace(|v| v.max(floor));
    }
    db
}

/// Subtract the mean and divide by the standard deviation, floored at
/// `ZSCORE_MIN_STD` so the scale stays continuous for near-constant input.
pub fn zscore(feat: &mut Array2<f32>) {
    let mean = feat.mean().unwrap_or(0.0);
    let std = feat.std(0.0).max(ZSCORE_MIN_STD);
    feat.mapv_inplace(|v| (v - mean) / std);
}

/// Scale each frame so its largest magnitude is 1.
fn normalize_frames(mut feat: Array2<f32>) -> Array2<f32> {
    for mut col in feat.columns_mut() {
        let peak = col.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        if peak > f32::MIN_POSITIVE {
            col.mapv_inplace(|v| v / peak);
        }
    }
    feat
}

/// Periodic Hann window.
pub fn hann_window(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / len as f32).cos())
        .collect()
}

pub fn hz_to_mel(hz: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if hz >= MIN_LOG_HZ {
        min_log_mel + (hz / MIN_LOG_HZ).ln() / logstep
    } else {
        hz / F_SP
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    let min_log_mel = MIN_LOG_HZ / F_SP;
    let logstep = 6.4f64.ln() / 27.0;
    if mel >= min_log_mel {
        MIN_LOG_HZ * (logstep * (mel - min_log_mel)).exp()
    } else {
        F_SP * mel
    }
}

/// Band edges (Hz) of an `n_mels` triangular filterbank: `n_mels + 2` points.
pub fn mel_band_edges(n_mels: usize, fmin: f32, fmax: f32) -> Vec<f64> {
    let mel_min = hz_to_mel(fmin as f64);
    let mel_max = hz_to_mel(fmax as f64);
    (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + i as f64 * (mel_max - mel_min) / (n_mels + 1) as f64))
        .collect()
}

/// Slaney-scale, area-normalized triangular filters: `(n_mels, n_fft / 2 + 1)`.
pub fn mel_filterbank(sr: f32, n_fft: usize, n_mels: usize, fmin: f32, fmax: f32) -> Array2<f32> {
    let bins = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..bins)
        .map(|k| k as f64 * sr as f64 / n_fft as f64)
        .collect();
    let edges = mel_band_edges(n_mels, fmin, fmax);
    let mut fb = Array2::<f32>::zeros((n_mels, bins));
    for m in 0..n_mels {
        let (lo, centre, hi) = (edges[m], edges[m + 1], edges[m + 2]);
        let enorm = 2.0 / (hi - lo);
        for (k, &f) in fft_freqs.iter().enumerate() {
            let lower = (f - lo) / (centre - lo);
            let upper = (hi - f) / (hi - centre);
            let w = lower.min(upper).max(0.0);
            fb[[m, k]] = (w * enorm) as f32;
        }
    }
    fb
}

/// Orthonormal DCT-II rows: `(n_out, n_in)`.
pub fn dct_ortho_basis(n_out: usize, n_in: usize) -> Array2<f32> {
    let n = n_in as f64;
    Array2::from_shape_fn((n_out, n_in), |(k, i)| {
        let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
        (scale * (std::f64::consts::PI / n * (i as f64 + 0.5) * k as f64).cos()) as f32
    })
}

/// STFT chroma filterbank (A440 tuning, C-based): `(n_chroma, n_fft / 2 + 1)`.
pub fn chroma_filterbank(sr: f32, n_fft: usize, n_chroma: usize) -> Array2<f32> {
    const CENTRE_OCTAVE: f64 = 5.0;
    const OCTAVE_WIDTH: f64 = 2.0;
    let nc = n_chroma as f64;
    let a440_base = 440.0 / 16.0;
    // one entry per FFT bin over the full spectrum; bin 0 gets a placeholder
    let mut frqbins: Vec<f64> = (1..n_fft)
        .map(|k| nc * ((k as f64 * sr as f64 / n_fft as f64) / a440_base).log2())
        .collect();
    let first = frqbins.first().copied().unwrap_or(0.0) - 1.5 * nc;
    frqbins.insert(0, first);
    let mut widths: Vec<f64> = frqbins.windows(2).map(|w| (w[1] - w[0]).max(1.0)).collect();
    widths.push(1.0);

    let bins = n_fft / 2 + 1;
    let half = (nc / 2.0).round();
    let mut wts = Array2::<f64>::zeros((n_chroma, bins));
    for j in 0..bins {
        for c in 0..n_chroma {
            let d = (frqbins[j] - c as f64 + half + 10.0 * nc).rem_euclid(nc) - half;
            wts[[c, j]] = (-0.5 * (2.0 * d / widths[j]).powi(2)).exp();
        }
        let norm = wts.column(j).iter().map(|v| v * v).sum::<f64>().sqrt();
        let octave = (-0.5 * ((frqbins[j] / nc - CENTRE_OCTAVE) / OCTAVE_WIDTH).powi(2)).exp();
        for c in 0..n_chroma {
            let v = if norm > 0.0 { wts[[c, j]] / norm } else { 0.0 };
            wts[[c, j]] = v * octave;
        }
    }
    // rotate so row 0 is C rather than A
    let shift = 3 * (n_chroma / 12);
    Array2::from_shape_fn((n_chroma, bins), |(c, j)| wts[[(c + shift) % n_chroma, j]] as f32)
}
