use std::path::Path;

use anyhow::Result;
use tempfile::tempdir;

use courtcam::record::avi::probe;
use courtcam::record::AppendOutcome;
use courtcam::{
    BackendKind, Camera, CameraConfig, FrameSource, Labels, RecordingSettings, RuntimeSettings,
};

fn device_camera(name: &str, video_dir: &Path, descriptor: &str) -> Result<Camera> {
    let runtime = RuntimeSettings {
        recording: RecordingSettings {
            video_dir: video_dir.to_path_buf(),
            ..RecordingSettings::default()
        },
        ..RuntimeSettings::default()
    };
    let config = CameraConfig::new(name, BackendKind::LocalDevice, descriptor);
    Camera::from_config(&config, &runtime)
}

#[test]
fn recorded_session_matches_acquired_frames() -> Result<()> {
    let dir = tempdir()?;
    let mut camera = device_camera("Court 1", dir.path(), "stub://court?width=600&height=400")?;
    camera.initialize()?;
    camera.set_labels(Labels::new("Red", "Blue"));

    camera.start_recording();
    assert!(camera.is_recording());
    for _ in 0..2 {
        let frame = camera.acquire()?;
        assert_eq!(camera.record(&frame), AppendOutcome::Recorded);
    }

    let saved = camera.stop_recording().expect("session saved");
    assert!(!camera.is_recording());
    assert!(camera.stop_recording().is_none());

    let file_name = saved
        .file_name()
        .and_then(|n| n.to_str())
        .expect("utf-8 file name");
    assert!(file_name.starts_with("Court1_Red-vs-Blue_"), "{}", file_name);
    assert!(file_name.ends_with(".avi"));

    let info = probe(&saved)?;
    assert_eq!((info.width, info.height), (600, 400));
    assert_eq!(info.frame_count, 2);
    assert_eq!(info.codec, "image/jpeg");
    assert!((info.fps - 18.0).abs() < 1e-6);

    // not recording: frames are ignored
    let frame = camera.acquire()?;
    assert_eq!(camera.record(&frame), AppendOutcome::Idle);
    assert_eq!(camera.stats().frames_recorded, 2);
    Ok(())
}

#[test]
fn close_finalizes_recording_and_resets_labels() -> Result<()> {
    let dir = tempdir()?;
    let mut camera = device_camera("side", dir.path(), "stub://side?width=64&height=48")?;
    camera.initialize()?;
    camera.set_labels(Labels::new("Lions", "Tigers"));
    let handle = camera.handle();

    camera.start_recording();
    let frame = camera.acquire()?;
    camera.record(&frame);

    camera.close();
    camera.close();
    assert!(!camera.is_recording());
    assert_eq!(handle.labels(), Labels::default());

    let saved = handle
        .last_saved_recording()
        .expect("close saves the running session");
    assert_eq!(probe(&saved)?.frame_count, 1);
    Ok(())
}

#[test]
fn recording_without_frames_writes_nothing() -> Result<()> {
    let dir = tempdir()?;
    let mut camera = device_camera("empty", dir.path(), "stub://empty?width=32&height=32")?;
    camera.initialize()?;

    camera.start_recording();
    assert!(camera.stop_recording().is_none());
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    camera.close();
    Ok(())
}

#[test]
fn each_session_gets_its_own_file() -> Result<()> {
    let dir = tempdir()?;
    let mut camera = device_camera("multi", dir.path(), "stub://multi?width=32&height=24")?;
    camera.initialize()?;

    camera.set_labels(Labels::new("A", "B"));
    camera.start_recording();
    let frame = camera.acquire()?;
    camera.record(&frame);
    let first = camera.stop_recording().expect("first session");

    camera.set_labels(Labels::new("C", "D"));
    camera.start_recording();
    for _ in 0..3 {
        let frame = camera.acquire()?;
        camera.record(&frame);
    }
    let second = camera.stop_recording().expect("second session");

    assert_ne!(first, second);
    assert_eq!(probe(&first)?.frame_count, 1);
    assert_eq!(probe(&second)?.frame_count, 3);
    assert_eq!(camera.handle().last_saved_recording(), Some(second));
    Ok(())
}

#[test]
fn repeated_sessions_with_unchanged_labels_never_overwrite() -> Result<()> {
    let dir = tempdir()?;
    let mut camera = device_camera("rapid", dir.path(), "stub://rapid?width=32&height=24")?;
    camera.initialize()?;
    camera.set_labels(Labels::new("Home", "Away"));

    let mut saved = Vec::new();
    for frames in [4, 2, 1] {
        camera.start_recording();
        for _ in 0..frames {
            let frame = camera.acquire()?;
            camera.record(&frame);
        }
        saved.push(camera.stop_recording().expect("session saved"));
    }

    let counts = saved
        .iter()
        .map(|path| probe(path).map(|info| info.frame_count))
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(counts, vec![4, 2, 1]);
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 3);
    Ok(())
}
