//! courtcamd - court camera acquisition daemon
//!
//! This daemon:
//! 1. Loads the camera list and settings (`COURTCAM_CONFIG` + `COURTCAM_*`)
//! 2. Initializes every enabled camera; unavailable cameras are skipped
//! 3. Runs one acquisition loop per camera
//! 4. Optionally records all cameras until shutdown
//! 5. Logs per-camera health every few seconds

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use courtcam::{AcquisitionLoop, Camera, CameraHandle, CourtcamConfig, FrameSource, Labels};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "courtcamd", about = "Acquire and record court cameras")]
struct Args {
    /// Start recording every camera right away
    #[arg(long)]
    record: bool,

    /// Home-side label used in recording file names
    #[arg(long, value_name = "LABEL")]
    home: Option<String>,

    /// Away-side label used in recording file names
    #[arg(long, value_name = "LABEL")]
    away: Option<String>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long, value_name = "SECS")]
    seconds: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = CourtcamConfig::load()?;
    let labels = Labels::new(
        args.home.clone().unwrap_or_else(|| config.labels.home.clone()),
        args.away.clone().unwrap_or_else(|| config.labels.away.clone()),
    );

    let mut loops = Vec::new();
    let mut handles: Vec<CameraHandle> = Vec::new();
    for camera_cfg in config.enabled_cameras() {
        let mut camera = match Camera::from_config(camera_cfg, &config.runtime) {
            Ok(camera) => camera,
            Err(err) => {
                log::error!("camera {} misconfigured: {:#}", camera_cfg.name, err);
                continue;
            }
        };
        if let Err(err) = camera.initialize() {
            log::error!("camera {} skipped: {}", camera_cfg.name, err);
            continue;
        }
        camera.set_labels(labels.clone());
        if args.record {
            camera.start_recording();
        }
        handles.push(camera.handle());
        loops.push(AcquisitionLoop::spawn(camera)?);
    }

    if loops.is_empty() {
        return Err(anyhow!("no camera could be initialized"));
    }
    log::info!(
        "courtcamd running with {} camera(s), recordings go to {}",
        loops.len(),
        config.runtime.recording.video_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    let deadline = args.seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        let wait = match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(HEALTH_LOG_INTERVAL),
            None => HEALTH_LOG_INTERVAL,
        };
        match rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping cameras...");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        log_health(&handles);
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::info!("run time elapsed, stopping cameras...");
            break;
        }
    }

    for handle in &handles {
        if let Some(path) = handle.stop_recording() {
            log::info!("camera {} saved {}", handle.name(), path.display());
        }
    }
    for acquisition in loops {
        let name = acquisition.name().to_string();
        if let Err(err) = acquisition.shutdown() {
            log::error!("camera {} did not shut down cleanly: {:#}", name, err);
        }
    }
    Ok(())
}

fn log_health(handles: &[CameraHandle]) {
    for handle in handles {
        let stats = handle.stats();
        log::info!(
            "camera {} initialized={} recording={} frames={} failures={} recorded={} dropped={} restarts={}",
            handle.name(),
            handle.is_initialized(),
            handle.is_recording(),
            stats.frames_acquired,
            stats.acquire_failures,
            stats.frames_recorded,
            stats.frames_dropped,
            stats.worker_restarts
        );
        if let Some(err) = handle.last_recording_error() {
            log::warn!("camera {} last recording error: {}", handle.name(), err);
        }
    }
}
