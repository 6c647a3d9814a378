//! Fixed-length windowing of a clip.
//!
//! Windows start at `0, hop, 2*hop, ...` while a full window fits; the tail
//! that does not fill a window is dropped, never padded. Slicing borrows the
//! clip and keeps no state between calls.

use crate::audio::AudioClip;
use crate::config::ServiceConfig;
use crate::error::{GenreError, Result};

/// One contiguous slice of a clip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window<'a> {
    pub index: usize,
    /// Offset of the first sample in the clip.
    pub start: usize,
    pub samples: &'a [f32],
    pub sample_rate: u32,
}

impl Window<'_> {
    pub fn start_secs(&self) -> f32 {
        self.start as f32 / self.sample_rate as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Windower {
    window_samples: usize,
    hop_samples: usize,
}

impl Windower {
    pub fn new(sample_rate: u32, window_seconds: f32, overlap_ratio: f32) -> Result<Self> {
        if !(window_seconds.is_finite() && window_seconds > 0.0) {
            return Err(GenreError::Config(format!(
                "window_seconds must be > 0, got {}",
                window_seconds
            )));
        }
        if !(0.0..1.0).contains(&overlap_ratio) {
            return Err(GenreError::Config(format!(
                "overlap_ratio must be in [0, 1), got {}",
                overlap_ratio
            )));
        }
        let window_samples = (sample_rate as f64 * window_seconds as f64).round() as usize;
        let hop_samples = (window_samples as f64 * (1.0 - overlap_ratio as f64)).round() as usize;
        if window_samples == 0 || hop_samples == 0 {
            return Err(GenreError::Config(
                "window or hop rounds to zero samples".into(),
            ));
        }
        Ok(Self {
            window_samples,
            hop_samples,
        })
    }

    pub fn from_config(cfg: &ServiceConfig) -> Result<Self> {
        Self::new(cfg.sample_rate, cfg.window_seconds, cfg.overlap_ratio)
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    pub fn hop_samples(&self) -> usize {
        self.hop_samples
    }

    /// Number of full windows that fit in `len` samples.
    pub fn count(&self, len: usize) -> usize {
        if len < self.window_samples {
            0
        } else {
            (len - self.window_samples) / self.hop_samples + 1
        }
    }

    /// Slice a clip. Fails with `InsufficientAudio` when not even one window fits.
    pub fn slice<'a>(&self, clip: &'a AudioClip) -> Result<Windows<'a>> {
        if clip.len() < self.window_samples {
            return Err(GenreError::InsufficientAudio {
                samples: clip.len(),
                required: self.window_samples,
            });
        }
        Ok(Windows {
            samples: &clip.samples,
            sample_rate: clip.sample_rate,
            window_samples: self.window_samples,
            hop_samples: self.hop_samples,
            next: 0,
            total: self.count(clip.len()),
        })
    }
}

/// Lazy iterator over the windows of one clip.
#[derive(Debug, Clone)]
pub struct Windows<'a> {
    samples: &'a [f32],
    sample_rate: u32,
    window_samples: usize,
    hop_samples: usize,
    next: usize,
    total: usize,
}

impl<'a> Iterator for Windows<'a> {
    type Item = Window<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.total {
            return None;
        }
        let start = self.next * self.hop_samples;
        let window = Window {
            index: self.next,
            start,
            samples: &self.samples[start..start + self.window_samples],
            sample_rate: self.sample_rate,
        };
        self.next += 1;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.total - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Windows<'_> {}

impl std::iter::FusedIterator for Windows<'_> {}
