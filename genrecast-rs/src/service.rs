//! Composition root: loader, windower, extractor and classifier wired
//! together behind `predict_genres` and `get_recommendations`.
//!
//! The service holds no per-request state. Every stage is either immutable
//! after construction or creates its own scratch data, so one instance can be
//! shared across threads.

use crate::aggregate::{self, Aggregate, GenreResult, GenreScore};
use crate::audio::{AudioLoader, AudioSource};
use crate::classifier::GenreClassifier;
use crate::config::ServiceConfig;
use crate::error::{GenreError, Result};
use crate::features::FeatureExtractor;
use crate::recommend::{Recommendation, RecommendationSource};
use crate::window::{Window, Windower};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Per-clip view of the pipeline output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClipAnalysis {
    pub windows: usize,
    pub duration_secs: f32,
    /// Averaged probability of every class, in label order.
    pub probabilities: Vec<GenreScore>,
    pub top: GenreScore,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInfo {
    pub model: String,
    pub model_version: String,
    pub labels: Vec<String>,
    pub num_classes: usize,
    pub sample_rate: u32,
    pub window_seconds: f32,
    pub overlap_ratio: f32,
    pub feature: String,
    pub n_mels: usize,
    pub n_mfcc: usize,
    pub n_fft: usize,
    pub hop_length: usize,
    pub target_frames: usize,
    pub max_top_k: usize,
    pub max_input_bytes: u64,
    pub recommendations: bool,
}

pub struct GenreService {
    config: Arc<ServiceConfig>,
    loader: AudioLoader,
    windower: Windower,
    extractor: FeatureExtractor,
    classifier: Box<dyn GenreClassifier>,
    recommender: Option<Box<dyn RecommendationSource>>,
    model_version: String,
}

impl GenreService {
    /// Validate `config` and check that the classifier's output width matches
    /// the configured label order.
    pub fn new<C>(config: ServiceConfig, classifier: C) -> Result<Self>
    where
        C: GenreClassifier + 'static,
    {
        config.validate()?;
        if classifier.num_classes() != config.label_order.len() {
            return Err(GenreError::ModelLoad(format!(
                "{} has {} outputs but {} labels are configured",
                classifier.model_name(),
                classifier.num_classes(),
                config.label_order.len()
            )));
        }
        let loader = AudioLoader::new(config.sample_rate).with_max_input_bytes(config.max_input_bytes);
        let windower = Windower::from_config(&config)?;
        let extractor = FeatureExtractor::new(&config)?;
        log::debug!(
            "service ready: model={} window={} samples hop={} feature={}",
            classifier.model_name(),
            windower.window_samples(),
            windower.hop_samples(),
            config.feature.as_str()
        );
        Ok(Self {
            config: Arc::new(config),
            loader,
            windower,
            extractor,
            classifier: Box::new(classifier),
            recommender: None,
            model_version: "unknown".into(),
        })
    }

    /// Load an ONNX model and its manifest. The manifest's labels and target
    /// width override `config`.
    #[cfg(feature = "tract")]
    pub fn from_model(model_path: &std::path::Path, config: ServiceConfig) -> Result<Self> {
        let manifest = crate::config::ModelManifest::for_model(model_path)?;
        let config = config.with_manifest(&manifest)?;
        let classifier = crate::classifier::TractClassifier::from_path(
            model_path,
            manifest.labels.len(),
            manifest.output,
            manifest.name.clone(),
        )?;
        Ok(Self::new(config, classifier)?.with_model_version(manifest.version))
    }

    pub fn with_recommender<R>(mut self, source: R) -> Self
    where
        R: RecommendationSource + 'static,
    {
        self.recommender = Some(Box::new(source));
        self
    }

    pub fn with_spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.loader = self.loader.with_spool_dir(dir);
        self
    }

    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = version.into();
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn labels(&self) -> &[String] {
        &self.config.label_order
    }

    /// Top `top_k` genres for one clip, best first.
    pub fn predict_genres(&self, source: impl Into<AudioSource>, top_k: usize) -> Result<GenreResult> {
        self.check_top_k(top_k)?;
        self.run(source.into())
            .and_then(|agg| aggregate::rank(agg.probabilities.view(), self.labels(), top_k))
            .map_err(GenreError::at_service_boundary)
    }

    /// Full probability vector plus window and duration counts.
    pub fn analyze(&self, source: impl Into<AudioSource>) -> Result<ClipAnalysis> {
        self.analyze_inner(source.into())
            .map_err(GenreError::at_service_boundary)
    }

    /// Tracks for the clip's top-1 genre. The lookup key is always this
    /// service's own prediction.
    pub fn get_recommendations(
        &self,
        source: impl Into<AudioSource>,
        num_recommendations: usize,
    ) -> Result<Vec<Recommendation>> {
        if num_recommendations == 0 {
            return Err(GenreError::Invalid(
                "num_recommendations must be >= 1".into(),
            ));
        }
        let recommender = self.recommender.as_ref().ok_or_else(|| {
            GenreError::Recommendation("no recommendation source configured".into())
        })?;
        let top = self.predict_genres(source, 1)?;
        let genre = top
            .into_iter()
            .next()
            .ok_or_else(|| GenreError::Inference("empty prediction".into()))?
            .label;
        log::info!("fetching {} recommendations for {}", num_recommendations, genre);
        let mut recs = recommender.top_tracks(&genre, num_recommendations)?;
        recs.truncate(num_recommendations);
        for (i, rec) in recs.iter_mut().enumerate() {
            rec.genre = genre.clone();
            rec.rank = i + 1;
        }
        Ok(recs)
    }

    pub fn info(&self) -> ServiceInfo {
        let cfg = &self.config;
        ServiceInfo {
            model: self.classifier.model_name().to_string(),
            model_version: self.model_version.clone(),
            labels: cfg.label_order.clone(),
            num_classes: self.classifier.num_classes(),
            sample_rate: cfg.sample_rate,
            window_seconds: cfg.window_seconds,
            overlap_ratio: cfg.overlap_ratio,
            feature: cfg.feature.as_str().to_string(),
            n_mels: cfg.n_mels,
            n_mfcc: cfg.n_mfcc,
            n_fft: cfg.n_fft,
            hop_length: cfg.hop_length,
            target_frames: self.extractor.target_frames(),
            max_top_k: cfg.max_top_k,
            max_input_bytes: cfg.max_input_bytes,
            recommendations: self.recommender.is_some(),
        }
    }

    fn check_top_k(&self, top_k: usize) -> Result<()> {
        if top_k == 0 || top_k > self.config.max_top_k {
            return Err(GenreError::Invalid(format!(
                "top_k must be in 1..={}, got {}",
                self.config.max_top_k, top_k
            )));
        }
        Ok(())
    }

    fn analyze_inner(&self, source: AudioSource) -> Result<ClipAnalysis> {
        let (agg, duration_secs) = self.run_with_duration(source)?;
        let probabilities: Vec<GenreScore> = self
            .labels()
            .iter()
            .zip(agg.probabilities.iter())
            .map(|(label, &confidence)| GenreScore {
                label: label.clone(),
                confidence,
            })
            .collect();
        let top = aggregate::rank(agg.probabilities.view(), self.labels(), 1)?
            .into_iter()
            .next()
            .ok_or_else(|| GenreError::Inference("empty prediction".into()))?;
        Ok(ClipAnalysis {
            windows: agg.windows,
            duration_secs,
            probabilities,
            top,
        })
    }

    fn run(&self, source: AudioSource) -> Result<Aggregate> {
        self.run_with_duration(source).map(|(agg, _)| agg)
    }

    fn run_with_duration(&self, source: AudioSource) -> Result<(Aggregate, f32)> {
        let mut clip = self.loader.load(source)?;
        if self.config.normalize_audio {
            clip.peak_normalize();
        }
        let windows: Vec<Window<'_>> = self.windower.slice(&clip)?.collect();
        let tensors = self.extractor.extract_all(&windows)?;
        log::debug!(
            "{:.2}s clip -> {} windows -> {} tensors of {:?}",
            clip.duration_secs(),
            windows.len(),
            tensors.len(),
            tensors.first().map(|t| t.shape())
        );
        let agg = aggregate::aggregate(&*self.classifier, &tensors)?;
        Ok((agg, clip.duration_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::DummyClassifier;
    use std::io::Cursor;
    use std::sync::Mutex;

    fn tone_wav(secs: f32, sr: u32) -> Vec<u8> {
        tone_wav_samples((secs * sr as f32) as usize, sr)
    }

    fn tone_wav_samples(n: usize, sr: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: sr,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for i in 0..n {
                let t = i as f32 / sr as f32;
                let v = (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.3
                    + (2.0 * std::f32::consts::PI * 1250.0 * t).sin() * 0.1;
                w.write_sample((v * i16::MAX as f32) as i16).unwrap();
            }
            w.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn service() -> GenreService {
        let cfg = ServiceConfig::default();
        let clf = DummyClassifier::new(cfg.label_order.len());
        GenreService::new(cfg, clf).unwrap()
    }

    struct Recorder {
        asked: Mutex<Vec<String>>,
    }

    impl RecommendationSource for Arc<Recorder> {
        fn top_tracks(&self, genre: &str, limit: usize) -> Result<Vec<Recommendation>> {
            self.asked.lock().unwrap().push(genre.to_string());
            Ok((0..limit + 2)
                .map(|i| Recommendation {
                    title: format!("track {i}"),
                    artist: "someone".into(),
                    genre: "whatever the source says".into(),
                    rank: 99,
                    image_url: None,
                })
                .collect())
        }
    }

    #[test]
    fn fifteen_second_clip_end_to_end() {
        let svc = service();
        let wav = tone_wav(15.0, 22_050);
        let analysis = svc.analyze(wav.clone()).unwrap();
        assert_eq!(analysis.windows, 3);
        assert!((analysis.duration_secs - 15.0).abs() < 1e-3);
        assert_eq!(analysis.probabilities.len(), 10);
        let total: f32 = analysis.probabilities.iter().map(|s| s.confidence).sum();
        assert!((total - 1.0).abs() < 1e-4);

        let top2 = svc.predict_genres(wav, 2).unwrap();
        assert_eq!(top2.len(), 2);
        assert!(top2[0].confidence >= top2[1].confidence);
        assert!(top2.iter().all(|s| svc.labels().contains(&s.label)));
        assert_eq!(top2[0], analysis.top);
    }

    #[test]
    fn prediction_is_idempotent() {
        let svc = service();
        let wav = tone_wav(10.0, 22_050);
        let a = svc.predict_genres(wav.clone(), 5).unwrap();
        let b = svc.predict_genres(wav, 5).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn spool_files_removed_on_success_and_failure() {
        let spool = tempfile::tempdir().unwrap();
        let svc = service().with_spool_dir(spool.path());
        svc.predict_genres(tone_wav(5.0, 22_050), 3).unwrap();
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);

        let err = svc.predict_genres(b"definitely not audio".to_vec(), 3).unwrap_err();
        assert!(matches!(err, GenreError::AudioProcessing(_)));
        assert!(err.is_bad_input());
        assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
    }

    #[test]
    fn short_clip_propagates_distinctly() {
        let svc = service();
        let err = svc.predict_genres(tone_wav(4.0, 22_050), 1).unwrap_err();
        assert!(matches!(err, GenreError::InsufficientAudio { .. }), "{err}");
    }

    #[test]
    fn one_sample_short_of_a_window_is_insufficient() {
        let svc = service();
        let required = svc.config().window_samples();
        assert_eq!(required, 110_250);

        let err = svc
            .predict_genres(tone_wav_samples(required - 1, 22_050), 1)
            .unwrap_err();
        match err {
            GenreError::InsufficientAudio { samples, required: r } => {
                assert_eq!(samples, 110_249);
                assert_eq!(r, 110_250);
            }
            other => panic!("expected InsufficientAudio, got {other}"),
        }

        let analysis = svc.analyze(tone_wav_samples(required, 22_050)).unwrap();
        assert_eq!(analysis.windows, 1);
        assert_eq!(svc.predict_genres(tone_wav_samples(required, 22_050), 1).unwrap().len(), 1);
    }

    #[test]
    fn missing_path_propagates_distinctly() {
        let err = service()
            .predict_genres(PathBuf::from("/no/such/clip.wav"), 1)
            .unwrap_err();
        assert!(matches!(err, GenreError::InputNotFound(_)));
    }

    #[test]
    fn top_k_bounds_are_validated() {
        let svc = service();
        let wav = tone_wav(5.0, 22_050);
        assert!(matches!(svc.predict_genres(wav.clone(), 0), Err(GenreError::Invalid(_))));
        assert!(matches!(svc.predict_genres(wav.clone(), 11), Err(GenreError::Invalid(_))));
        assert_eq!(svc.predict_genres(wav, 10).unwrap().len(), 10);
    }

    #[test]
    fn label_count_must_match_model() {
        let cfg = ServiceConfig::default();
        let err = GenreService::new(cfg, DummyClassifier::new(4)).err().unwrap();
        assert!(matches!(err, GenreError::ModelLoad(_)));
    }

    #[test]
    fn recommendations_keyed_by_own_top_genre() {
        let recorder = Arc::new(Recorder {
            asked: Mutex::new(Vec::new()),
        });
        let svc = service().with_recommender(recorder.clone());
        let wav = tone_wav(5.0, 22_050);
        let top = svc.predict_genres(wav.clone(), 1).unwrap();

        let recs = svc.get_recommendations(wav, 3).unwrap();
        assert_eq!(recs.len(), 3);
        assert_eq!(recorder.asked.lock().unwrap().as_slice(), &[top[0].label.clone()]);
        assert!(recs.iter().all(|r| r.genre == top[0].label));
        assert_eq!(recs.iter().map(|r| r.rank).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn recommendations_need_a_source_and_a_count() {
        let wav = tone_wav(5.0, 22_050);
        assert!(matches!(
            service().get_recommendations(wav.clone(), 3),
            Err(GenreError::Recommendation(_))
        ));
        assert!(matches!(
            service().get_recommendations(wav, 0),
            Err(GenreError::Invalid(_))
        ));
    }

    #[test]
    fn info_reports_model_and_geometry() {
        let info = service().info();
        assert_eq!(info.model, "dummy-genre");
        assert_eq!(info.num_classes, 10);
        assert_eq!(info.target_frames, 216);
        assert_eq!(info.max_top_k, 10);
        assert_eq!(info.feature, "mel");
        assert!(!info.recommendations);
    }

    #[test]
    fn service_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GenreService>();
    }
}
