use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;

fn write_clip(path: &Path, secs: f32) {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 22_050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut w = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..(secs * 22_050.0) as usize {
        let v = ((i as f32 * 0.07).sin() * 9000.0) as i16;
        w.write_sample(v).unwrap();
        w.write_sample(v / 2).unwrap();
    }
    w.finalize().unwrap();
}

fn genrecast() -> Command {
    Command::cargo_bin("genrecast").unwrap()
}

#[test]
fn predict_prints_json_for_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    write_clip(&dir.path().join("one.wav"), 5.5);
    write_clip(&dir.path().join("two.wav"), 10.0);
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let out = genrecast()
        .args(["--backend", "dummy", "predict", "--top-k", "2", "--json"])
        .arg(dir.path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
    let files = parsed.as_array().unwrap();
    assert_eq!(files.len(), 2);
    for f in files {
        assert_eq!(f["genres"].as_array().unwrap().len(), 2);
    }
}

#[test]
fn predict_table_goes_to_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("clip.wav");
    write_clip(&clip, 5.0);
    genrecast()
        .arg("predict")
        .arg(&clip)
        .assert()
        .success()
        .stderr(predicate::str::contains("Predictions"))
        .stdout(predicate::str::contains("\"label\""));
}

#[test]
fn short_clip_fails() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("short.wav");
    write_clip(&clip, 2.0);
    genrecast()
        .arg("predict")
        .arg(&clip)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Insufficient audio"));
}

#[test]
fn invalid_top_k_fails() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("clip.wav");
    write_clip(&clip, 5.0);
    genrecast()
        .args(["predict", "--top-k", "0"])
        .arg(&clip)
        .assert()
        .failure()
        .stderr(predicate::str::contains("top_k"));
}

#[test]
fn info_reports_dummy_model() {
    genrecast()
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("dummy-genre"))
        .stdout(predicate::str::contains("\"target_frames\": 216"));
}

#[test]
fn config_file_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join("cfg.json");
    std::fs::write(&cfg, r#"{"window_seconds": 10.0, "target_frame_width": 431}"#).unwrap();
    genrecast()
        .arg("--config")
        .arg(&cfg)
        .arg("info")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"target_frames\": 431"));
}

#[test]
fn bad_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = dir.path().join("cfg.json");
    std::fs::write(&cfg, r#"{"window_seconds": 0.0}"#).unwrap();
    genrecast()
        .arg("--config")
        .arg(&cfg)
        .arg("info")
        .assert()
        .failure()
        .stderr(predicate::str::contains("window_seconds"));
}

#[test]
fn prepare_writes_labels() {
    let raw = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    for genre in ["metal", "pop"] {
        let d = raw.path().join(genre);
        std::fs::create_dir_all(&d).unwrap();
        write_clip(&d.join("a.wav"), 5.2);
    }
    genrecast()
        .arg("prepare")
        .arg(raw.path())
        .arg(out.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"windows\": 2"));
    let labels = std::fs::read_to_string(out.path().join("labels.json")).unwrap();
    assert_eq!(labels, r#"["metal","pop"]"#);
}
