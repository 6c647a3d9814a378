//! Audio loading: decode common containers to mono f32 PCM at the service
//! sample rate.
//!
//! Streams are spooled to a uniquely named temporary file before decoding.
//! The spool is owned by a guard that removes the file when it goes out of
//! scope, whichever way `load` returns.

use crate::error::{GenreError, Result};
use rubato::{FftFixedIn, Resampler};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tempfile::NamedTempFile;

/// Where the audio for one request comes from.
pub enum AudioSource {
    Path(PathBuf),
    Stream(Box<dyn Read + Send>),
}

impl AudioSource {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        AudioSource::Stream(Box::new(Cursor::new(bytes)))
    }
}

impl From<PathBuf> for AudioSource {
    fn from(p: PathBuf) -> Self {
        AudioSource::Path(p)
    }
}

impl From<&Path> for AudioSource {
    fn from(p: &Path) -> Self {
        AudioSource::Path(p.to_path_buf())
    }
}

impl From<Vec<u8>> for AudioSource {
    fn from(bytes: Vec<u8>) -> Self {
        AudioSource::from_bytes(bytes)
    }
}

impl std::fmt::Debug for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
            AudioSource::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Decoded mono waveform. Amplitudes are left as decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Channel count of the source before downmixing.
    pub source_channels: usize,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            source_channels: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    pub fn peak_normalize(&mut self) {
        peak_normalize(&mut self.samples);
    }
}

pub struct AudioLoader {
    sample_rate: u32,
    spool_dir: Option<PathBuf>,
    max_input_bytes: u64,
}

impl AudioLoader {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            spool_dir: None,
            max_input_bytes: u64::MAX,
        }
    }

    /// Directory for stream spool files (defaults to the system temp dir).
    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spool_dir = Some(dir.into());
        self
    }

    pub fn with_max_input_bytes(mut self, limit: u64) -> Self {
        self.max_input_bytes = limit;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn load(&self, source: AudioSource) -> Result<AudioClip> {
        match source {
            AudioSource::Path(path) => {
                if !path.exists() {
                    return Err(GenreError::InputNotFound(path));
                }
                decode_file(&path, self.sample_rate)
            }
            AudioSource::Stream(reader) => {
                let spool = Spool::create(reader, self.spool_dir.as_deref(), self.max_input_bytes)?;
                decode_file(spool.path(), self.sample_rate)
            }
        }
    }
}

/// Temporary copy of a streamed input, removed on drop.
struct Spool {
    file: Option<NamedTempFile>,
}

impl Spool {
    fn create(mut reader: Box<dyn Read + Send>, dir: Option<&Path>, limit: u64) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("genrecast_").suffix(".audio");
        let file = match dir {
            Some(d) => builder.tempfile_in(d)?,
            None => builder.tempfile()?,
        };
        // guard owns the file from here on, so early returns still clean up
        let mut spool = Spool { file: Some(file) };
        let written = match spool.file.as_mut() {
            Some(f) => std::io::copy(
                &mut reader.by_ref().take(limit.saturating_add(1)),
                f.as_file_mut(),
            )?,
            None => 0,
        };
        if written == 0 {
            return Err(GenreError::AudioDecode("empty audio input".into()));
        }
        if written > limit {
            return Err(GenreError::Invalid(format!(
                "audio input exceeds {} bytes",
                limit
            )));
        }
        log::debug!("spooled {} bytes to {}", written, spool.path().display());
        Ok(spool)
    }

    fn path(&self) -> &Path {
        self.file
            .as_ref()
            .map(|f| f.path())
            .unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let path = file.path().to_path_buf();
            if let Err(e) = file.close() {
                log::warn!("failed to remove spool file {}: {}", path.display(), e);
            }
        }
    }
}

/// Decode a file to mono PCM, resampled to `target_sr`.
pub fn decode_file(path: &Path, target_sr: u32) -> Result<AudioClip> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| GenreError::AudioDecode(format!("unrecognized container: {}", e)))?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .cloned()
        .ok_or_else(|| GenreError::AudioDecode("no audio track".into()))?;
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| GenreError::AudioDecode(format!("unsupported codec: {}", e)))?;

    let mut pcm: Vec<f32> = Vec::new();
    let mut src_sr = track.codec_params.sample_rate.unwrap_or(target_sr);
    let mut channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(1);
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(GenreError::AudioDecode(e.to_string())),
        };
        if packet.track_id() != track.id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                src_sr = spec.rate;
                channels = spec.channels.count().max(1);
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                pcm.extend(
                    buf.samples()
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32),
                );
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                log::debug!("skipping undecodable packet: {}", msg);
                continue;
            }
            Err(e) => return Err(GenreError::AudioDecode(e.to_string())),
        }
    }
    if pcm.is_empty() {
        return Err(GenreError::AudioDecode("no audio samples decoded".into()));
    }
    log::debug!(
        "decoded {} frames at {} Hz ({} ch) from {}",
        pcm.len(),
        src_sr,
        channels,
        path.display()
    );
    let samples = resample(&pcm, src_sr, target_sr)?;
    Ok(AudioClip {
        samples,
        sample_rate: target_sr,
        source_channels: channels,
    })
}

const RESAMPLE_CHUNK: usize = 1024;

/// Band-limited FFT resampling of mono PCM. The filter delay is trimmed so the
/// output lines up with the input and holds `round(len * dst / src)` samples.
pub fn resample(input: &[f32], src_sr: u32, dst_sr: u32) -> Result<Vec<f32>> {
    if src_sr == dst_sr || input.is_empty() {
        return Ok(input.to_vec());
    }
    let mut resampler =
        FftFixedIn::<f32>::new(src_sr as usize, dst_sr as usize, RESAMPLE_CHUNK, 2, 1).map_err(
            |e| GenreError::AudioDecode(format!("resampler {src_sr} -> {dst_sr} Hz: {e}")),
        )?;
    let expected = (input.len() as f64 * dst_sr as f64 / src_sr as f64).round() as usize;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);
    let mut pos = 0;
    // zero-pad past the end until the delayed tail has been flushed
    while out.len() < expected + delay {
        let need = resampler.input_frames_next();
        let end = (pos + need).min(input.len());
        let mut chunk = vec![0.0f32; need];
        chunk[..end - pos].copy_from_slice(&input[pos..end]);
        pos = end;
        let block = vec![chunk];
        let frames = resampler
            .process(&block, None)
            .map_err(|e| GenreError::AudioDecode(format!("resampling failed: {e}")))?;
        out.extend_from_slice(&frames[0]);
    }
    Ok(out[delay..delay + expected].to_vec())
}

/// Scale so the largest absolute sample is 1.0. Silence is left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 0.0 {
        for s in samples.iter_mut() {
            *s /= peak;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, sr: u32, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: sr,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut w = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            let v = ((i as f32 * 0.05).sin() * 8000.0) as i16;
            for _ in 0..channels {
                w.write_sample(v).unwrap();
            }
        }
        w.finalize().unwrap();
    }

    #[test]
    fn decodes_stereo_wav_to_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 22_050, 2, 4410);
        let clip = AudioLoader::new(22_050).load(path.into()).unwrap();
        assert_eq!(clip.sample_rate, 22_050);
        assert_eq!(clip.source_channels, 2);
        assert_eq!(clip.len(), 4410);
        assert!((clip.duration_secs() - 0.2).abs() < 1e-4);
    }

    #[test]
    fn resamples_to_target_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("44k.wav");
        write_wav(&path, 44_100, 1, 44_100);
        let clip = AudioLoader::new(22_050).load(path.into()).unwrap();
        assert_eq!(clip.sample_rate, 22_050);
        assert_eq!(clip.len(), 22_050);
    }

    #[test]
    fn missing_path_is_input_not_found() {
        let err = AudioLoader::new(22_050)
            .load(PathBuf::from("/definitely/not/here.wav").into())
            .unwrap_err();
        assert!(matches!(err, GenreError::InputNotFound(_)));
    }

    #[test]
    fn garbage_stream_fails_and_leaves_no_spool() {
        let spool = tempfile::tempdir().unwrap();
        let loader = AudioLoader::new(22_050).with_spool_dir(spool.path());
        let err = loader
            .load(AudioSource::from_bytes(b"definitely not audio".to_vec()))
            .unwrap_err();
        assert!(matches!(err, GenreError::AudioDecode(_)), "{err}");
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_and_oversized_streams_are_rejected() {
        let spool = tempfile::tempdir().unwrap();
        let loader = AudioLoader::new(22_050)
            .with_spool_dir(spool.path())
            .with_max_input_bytes(8);
        assert!(matches!(
            loader.load(AudioSource::from_bytes(Vec::new())),
            Err(GenreError::AudioDecode(_))
        ));
        assert!(matches!(
            loader.load(AudioSource::from_bytes(vec![0u8; 64])),
            Err(GenreError::Invalid(_))
        ));
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }

    fn sine(freq: f32, sr: u32, n: usize) -> Vec<f32> {
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / sr as f32).sin())
            .collect()
    }

    fn rms(s: &[f32]) -> f32 {
        (s.iter().map(|v| v * v).sum::<f32>() / s.len() as f32).sqrt()
    }

    #[test]
    fn resample_lengths_follow_the_rate_ratio() {
        let input = sine(440.0, 48_000, 48_000);
        assert_eq!(resample(&input, 48_000, 22_050).unwrap().len(), 22_050);
        assert_eq!(resample(&input[..1000], 44_100, 22_050).unwrap().len(), 500);
        assert_eq!(resample(&input, 48_000, 48_000).unwrap(), input);
        assert!(resample(&[], 44_100, 22_050).unwrap().is_empty());
    }

    #[test]
    fn tone_above_target_nyquist_is_removed() {
        // 15 kHz cannot exist at 22.05 kHz; without a low-pass it folds to 7.05 kHz
        let input = sine(15_000.0, 44_100, 44_100);
        let out = resample(&input, 44_100, 22_050).unwrap();
        let middle = &out[2_000..out.len() - 2_000];
        assert!(rms(middle) < 0.05, "aliased energy {}", rms(middle));
    }

    #[test]
    fn in_band_tone_keeps_its_level() {
        let input = sine(1_000.0, 44_100, 44_100);
        let out = resample(&input, 44_100, 22_050).unwrap();
        let middle = &out[2_000..out.len() - 2_000];
        assert!((rms(middle) - std::f32::consts::FRAC_1_SQRT_2).abs() < 0.02);
    }

    #[test]
    fn peak_normalize_scales_and_keeps_silence() {
        let mut s = vec![0.25, -0.5, 0.1];
        peak_normalize(&mut s);
        assert_eq!(s, vec![0.5, -1.0, 0.2]);
        let mut silent = vec![0.0; 4];
        peak_normalize(&mut silent);
        assert_eq!(silent, vec![0.0; 4]);
    }
}
