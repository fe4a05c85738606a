use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::stream::{DEFAULT_MAX_RESTARTS, DEFAULT_RESTART_RESET_AFTER};
use crate::record::{
    Labels, RecordingSettings, DEFAULT_JPEG_QUALITY, DEFAULT_RECORD_FPS, DEFAULT_VIDEO_DIR,
};
use crate::frame::MAX_TARGET_WIDTH;
use crate::source::{BackendKind, CameraConfig, RuntimeSettings, StreamSettings};

const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CAMERA_NAME: &str = "court";
const DEFAULT_CAMERA_SOURCE: &str = "stub://court?fps=18";

pub const CONFIG_ENV: &str = "COURTCAM_CONFIG";

#[derive(Debug, Deserialize, Default)]
struct CourtcamConfigFile {
    video_dir: Option<PathBuf>,
    recording: Option<RecordingConfigFile>,
    labels: Option<LabelsConfigFile>,
    push: Option<PushConfigFile>,
    stream: Option<StreamConfigFile>,
    cameras: Option<Vec<CameraConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    fps: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct LabelsConfigFile {
    home: Option<String>,
    away: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PushConfigFile {
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    reply_timeout_ms: Option<u64>,
    max_restarts: Option<u32>,
    restart_reset_frames: Option<u64>,
    worker_program: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CourtcamConfig {
    pub runtime: RuntimeSettings,
    /// Labels applied to every camera at startup.
    pub labels: Labels,
    pub cameras: Vec<CameraConfig>,
}

impl CourtcamConfig {
    /// Read `$COURTCAM_CONFIG` (TOML, or JSON for `.json` files) if set, fill
    /// defaults, apply `COURTCAM_*` overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|camera| camera.enabled)
    }

    fn from_file(file: CourtcamConfigFile) -> Result<Self> {
        let recording = RecordingSettings {
            video_dir: file
                .video_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VIDEO_DIR)),
            fps: file
                .recording
                .as_ref()
                .and_then(|recording| recording.fps)
                .unwrap_or(DEFAULT_RECORD_FPS),
            jpeg_quality: file
                .recording
                .as_ref()
                .and_then(|recording| recording.jpeg_quality)
                .unwrap_or(DEFAULT_JPEG_QUALITY),
        };
        let push_timeout = Duration::from_secs(
            file.push
                .and_then(|push| push.timeout_secs)
                .unwrap_or(DEFAULT_PUSH_TIMEOUT_SECS),
        );
        let stream = StreamSettings {
            reply_timeout: file
                .stream
                .as_ref()
                .and_then(|stream| stream.reply_timeout_ms)
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            max_restarts: file
                .stream
                .as_ref()
                .and_then(|stream| stream.max_restarts)
                .unwrap_or(DEFAULT_MAX_RESTARTS),
            restart_reset_frames: file
                .stream
                .as_ref()
                .and_then(|stream| stream.restart_reset_frames)
                .unwrap_or(DEFAULT_RESTART_RESET_AFTER),
            worker_program: file.stream.and_then(|stream| stream.worker_program),
        };
        let defaults = Labels::default();
        let labels = match file.labels {
            Some(labels) => Labels::new(
                labels.home.unwrap_or(defaults.home),
                labels.away.unwrap_or(defaults.away),
            ),
            None => defaults,
        };
        let cameras = file.cameras.unwrap_or_else(|| {
            vec![CameraConfig::new(
                DEFAULT_CAMERA_NAME,
                BackendKind::LocalDevice,
                DEFAULT_CAMERA_SOURCE,
            )]
        });
        Ok(Self {
            runtime: RuntimeSettings {
                recording,
                push_timeout,
                stream,
            },
            labels,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("COURTCAM_VIDEO_DIR") {
            if !dir.trim().is_empty() {
                self.runtime.recording.video_dir = PathBuf::from(dir);
            }
        }
        if let Ok(fps) = std::env::var("COURTCAM_RECORD_FPS") {
            self.runtime.recording.fps = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("COURTCAM_RECORD_FPS must be an integer frame rate"))?;
        }
        if let Ok(timeout) = std::env::var("COURTCAM_PUSH_TIMEOUT_SECS") {
            let seconds: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("COURTCAM_PUSH_TIMEOUT_SECS must be an integer number of seconds")
            })?;
            self.runtime.push_timeout = Duration::from_secs(seconds);
        }
        if let Ok(timeout) = std::env::var("COURTCAM_STREAM_REPLY_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("COURTCAM_STREAM_REPLY_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            // 0 restores the blocking default
            self.runtime.stream.reply_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Ok(program) = std::env::var("COURTCAM_STREAM_WORKER") {
            if !program.trim().is_empty() {
                self.runtime.stream.worker_program = Some(PathBuf::from(program));
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let recording = &self.runtime.recording;
        if recording.fps == 0 {
            return Err(anyhow!("recording fps must be greater than zero"));
        }
        if !(1..=100).contains(&recording.jpeg_quality) {
            return Err(anyhow!("recording jpeg_quality must be between 1 and 100"));
        }
        if self.runtime.push_timeout.is_zero() {
            return Err(anyhow!("push timeout must be greater than zero"));
        }

        let mut names = HashSet::new();
        for camera in &mut self.cameras {
            camera.name = camera.name.trim().to_string();
            camera.source = camera.source.trim().to_string();
            if camera.name.is_empty() {
                return Err(anyhow!("camera name must not be empty"));
            }
            if !names.insert(camera.name.clone()) {
                return Err(anyhow!("duplicate camera name '{}'", camera.name));
            }
            if camera.source.is_empty() {
                return Err(anyhow!("camera '{}' has no source", camera.name));
            }
            if camera.width == 0 || camera.width > MAX_TARGET_WIDTH {
                return Err(anyhow!(
                    "camera '{}' width must be between 1 and {}",
                    camera.name,
                    MAX_TARGET_WIDTH
                ));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CourtcamConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let cfg = if is_json {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
