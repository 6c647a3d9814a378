use genrecast::{
    AudioLoader, AudioSource, DummyClassifier, FeatureExtractor, GenreError, GenreService,
    ServiceConfig, Windower,
};
use std::path::Path;

fn write_clip(path: &Path, secs: f32, sr: u32) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: sr,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut w = hound::WavWriter::create(path, spec).expect("create wav");
    for i in 0..(secs * sr as f32) as usize {
        let t = i as f32 / sr as f32;
        // chirp-ish mix so windows differ
        let v = (2.0 * std::f32::consts::PI * (220.0 + 40.0 * t) * t).sin() * 0.3
            + (2.0 * std::f32::consts::PI * 3000.0 * t).sin() * 0.05;
        w.write_sample((v * i16::MAX as f32) as i16).expect("write");
    }
    w.finalize().expect("finalize");
}

fn dummy_service() -> GenreService {
    let cfg = ServiceConfig::default();
    let clf = DummyClassifier::new(cfg.label_order.len());
    GenreService::new(cfg, clf).expect("service")
}

#[test]
fn stages_compose_for_fifteen_seconds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.wav");
    write_clip(&path, 15.0, 22_050);

    let cfg = ServiceConfig::default();
    let clip = AudioLoader::new(cfg.sample_rate)
        .load(AudioSource::Path(path.clone()))
        .expect("load");
    let windower = Windower::from_config(&cfg).unwrap();
    let windows: Vec<_> = windower.slice(&clip).unwrap().collect();
    assert_eq!(windows.len(), 3);

    let extractor = FeatureExtractor::new(&cfg).unwrap();
    let tensors = extractor.extract_all(&windows).unwrap();
    assert_eq!(tensors.len(), 3);
    for t in &tensors {
        assert_eq!(t.shape(), (128, cfg.target_frame_width, 1));
    }
    let sequential: Vec<_> = windows.iter().map(|w| extractor.extract(w).unwrap()).collect();
    assert_eq!(tensors, sequential);

    let result = dummy_service().predict_genres(path, 2).expect("predict");
    assert_eq!(result.len(), 2);
    assert!(result[0].confidence >= result[1].confidence);
    assert!(result
        .iter()
        .all(|s| cfg.label_order.contains(&s.label) && (0.0..=1.0).contains(&s.confidence)));
}

#[test]
fn path_and_stream_inputs_agree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.wav");
    write_clip(&path, 6.0, 44_100);
    let bytes = std::fs::read(&path).unwrap();

    let spool = tempfile::tempdir().unwrap();
    let service = dummy_service().with_spool_dir(spool.path());
    let from_path = service.predict_genres(path.as_path(), 4).unwrap();
    let from_stream = service.predict_genres(bytes, 4).unwrap();
    assert_eq!(from_path, from_stream);
    assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
}

#[test]
fn concurrent_requests_share_one_service() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.wav");
    write_clip(&path, 5.0, 22_050);
    let service = dummy_service();
    let expected = service.predict_genres(path.as_path(), 3).unwrap();

    let (service, path) = (&service, path.as_path());
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(move || service.predict_genres(path, 3).unwrap()))
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), expected);
        }
    });
}

#[test]
fn ten_second_preset_uses_its_own_width() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.wav");
    write_clip(&path, 21.0, 22_050);
    let cfg = ServiceConfig::gtzan_10s();
    let clf = DummyClassifier::new(cfg.label_order.len());
    let service = GenreService::new(cfg, clf).unwrap();
    let analysis = service.analyze(path.as_path()).unwrap();
    assert_eq!(analysis.windows, 2);
    assert_eq!(service.info().target_frames, 431);
}

#[test]
fn undecodable_input_is_wrapped_with_cause() {
    let err = dummy_service()
        .predict_genres(b"\x00\x01\x02 not a container".to_vec(), 1)
        .unwrap_err();
    assert!(matches!(err, GenreError::AudioProcessing(_)));
    assert!(matches!(err.root_cause(), GenreError::AudioDecode(_)));
    assert!(err.is_bad_input());
}
