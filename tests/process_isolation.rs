use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use tempfile::tempdir;

use courtcam::ingest::stream::{ProcessIsolatedStreamSource, StreamConfig};
use courtcam::record::avi::probe;
use courtcam::{
    AcquisitionLoop, BackendKind, Camera, CameraConfig, FrameSource, RecordingSettings,
    RuntimeSettings, SourceError, StreamSettings,
};

fn worker_program() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_courtcam_worker"))
}

fn runtime(reply_timeout: Option<Duration>, max_restarts: u32) -> RuntimeSettings {
    RuntimeSettings {
        stream: StreamSettings {
            reply_timeout,
            max_restarts,
            worker_program: Some(worker_program()),
            ..StreamSettings::default()
        },
        ..RuntimeSettings::default()
    }
}

fn stream_camera(url: &str, runtime: &RuntimeSettings) -> Result<Camera> {
    let config = CameraConfig::new("rtsp-cam", BackendKind::ProcessIsolatedStream, url);
    Camera::from_config(&config, runtime)
}

#[test]
fn isolated_stream_frames_are_normalized() -> Result<()> {
    let mut camera = stream_camera(
        "stub://rtsp?width=1280&height=720&fps=200",
        &runtime(None, 3),
    )?;
    camera.initialize()?;
    for _ in 0..3 {
        let frame = camera.acquire()?;
        assert_eq!(frame.dimensions(), (600, 337));
    }
    camera.close();
    camera.close();
    assert!(!camera.is_initialized());
    Ok(())
}

#[test]
fn crashed_worker_is_reported_then_restarted() -> Result<()> {
    let mut camera = stream_camera(
        "stub://rtsp?width=64&height=48&fps=200&crash_after=2",
        &runtime(None, 3),
    )?;
    camera.initialize()?;
    camera.acquire()?;

    match camera.acquire() {
        Err(SourceError::Hung { .. }) => {}
        other => panic!("expected hung worker, got {:?}", other.map(|f| f.seq)),
    }
    assert!(camera.acquire().is_ok());
    assert_eq!(camera.stats().worker_restarts, 1);
    Ok(())
}

#[test]
fn stalled_worker_times_out_when_bounded() -> Result<()> {
    let mut camera = stream_camera(
        "stub://rtsp?width=32&height=32&fps=200&stall_after=1",
        &runtime(Some(Duration::from_millis(300)), 0),
    )?;
    camera.initialize()?;

    let started = Instant::now();
    assert!(matches!(camera.acquire(), Err(SourceError::Hung { .. })));
    assert!(started.elapsed() < Duration::from_secs(5));

    // restart budget of zero: the source stays down but keeps answering
    assert!(matches!(camera.acquire(), Err(SourceError::Hung { .. })));
    camera.close();
    Ok(())
}

#[test]
fn unopenable_stream_is_unavailable() -> Result<()> {
    let mut camera = stream_camera("stub://dead?fail_open=true", &runtime(None, 3))?;
    assert!(matches!(
        camera.initialize(),
        Err(SourceError::Unavailable { .. })
    ));
    assert!(!camera.is_initialized());
    camera.close();
    Ok(())
}

#[test]
fn close_ends_the_worker_process() -> Result<()> {
    let mut config = StreamConfig::new("stub://rtsp?width=16&height=16&fps=200");
    config.program = worker_program();
    let mut source = ProcessIsolatedStreamSource::new(config);
    source.open()?;
    let image = source.request_frame()?;
    assert_eq!(image.dimensions(), (16, 16));
    assert_eq!(source.frames_received(), 1);

    source.close();
    assert!(!source.is_running());
    source.close();
    Ok(())
}

fn crashing_source(restart_reset_after: u64) -> Result<ProcessIsolatedStreamSource> {
    let mut config = StreamConfig::new("stub://rtsp?width=16&height=16&fps=200&crash_after=2");
    config.program = worker_program();
    config.max_restarts = 1;
    config.restart_reset_after = restart_reset_after;
    let mut source = ProcessIsolatedStreamSource::new(config);
    source.open()?;
    Ok(source)
}

fn expect_hung(source: &mut ProcessIsolatedStreamSource) {
    match source.request_frame() {
        Err(SourceError::Hung { .. }) => {}
        other => panic!("expected hung worker, got {:?}", other.map(|i| i.dimensions())),
    }
}

#[test]
fn healthy_run_refills_restart_budget() -> Result<()> {
    let mut source = crashing_source(2)?;
    for _ in 0..3 {
        source.request_frame()?;
        source.request_frame()?;
        expect_hung(&mut source);
    }
    // every crash followed two good frames, so each restart was allowed
    source.request_frame()?;
    assert_eq!(source.restarts(), 3);
    assert_eq!(source.frames_received(), 7);
    source.close();
    Ok(())
}

#[test]
fn restart_budget_stays_spent_without_refill() -> Result<()> {
    let mut source = crashing_source(0)?;
    source.request_frame()?;
    source.request_frame()?;
    expect_hung(&mut source);

    source.request_frame()?;
    source.request_frame()?;
    expect_hung(&mut source);
    assert_eq!(source.restarts_remaining(), 0);

    expect_hung(&mut source);
    assert_eq!(source.restarts(), 1);
    source.close();
    Ok(())
}

#[test]
fn slow_decoder_does_not_hold_back_other_cameras() -> Result<()> {
    let dir = tempdir()?;

    let mut slow = stream_camera(
        "stub://slow?width=64&height=48&decode_delay_ms=1500",
        &runtime(None, 3),
    )?;
    slow.initialize()?;
    let slow_handle = slow.handle();

    let device_runtime = RuntimeSettings {
        recording: RecordingSettings {
            video_dir: dir.path().to_path_buf(),
            ..RecordingSettings::default()
        },
        ..RuntimeSettings::default()
    };
    let mut config = CameraConfig::new(
        "fast",
        BackendKind::LocalDevice,
        "stub://fast?width=160&height=120&fps=50",
    );
    config.width = 160;
    let mut fast = Camera::from_config(&config, &device_runtime)?;
    fast.initialize()?;
    fast.start_recording();
    let fast_handle = fast.handle();

    let slow_loop = AcquisitionLoop::spawn(slow)?;
    let fast_loop = AcquisitionLoop::spawn(fast)?;
    std::thread::sleep(Duration::from_millis(1200));

    let saved = fast_handle.stop_recording().expect("fast camera recorded");
    let fast_stats = fast_handle.stats();
    assert!(fast_stats.frames_recorded >= 10, "{:?}", fast_stats);
    assert!(slow_handle.stats().frames_acquired <= 2);

    let info = probe(&saved)?;
    assert_eq!(u64::from(info.frame_count), fast_stats.frames_recorded);
    assert_eq!((info.width, info.height), (160, 120));

    fast_loop.shutdown()?;
    slow_loop.shutdown()?;
    Ok(())
}
