//! Recording of acquired frames.
//!
//! `RecordingController` is the per-camera recording state: whether recording
//! is on, the labels that go into the file name, and the current `Recorder`.
//! A session starts when recording is turned on and the next frame arrives,
//! and ends when recording is turned off. Recording errors never stop
//! acquisition: a mismatched frame is skipped, anything else aborts the session
//! and is kept as the last recording error.

pub mod avi;
mod recorder;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::RecordError;
pub use recorder::Recorder;

pub const DEFAULT_VIDEO_DIR: &str = "videos";
pub const DEFAULT_RECORD_FPS: u32 = 18;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const RECORDING_EXTENSION: &str = "avi";

/// Where and how recordings are written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub video_dir: PathBuf,
    pub fps: u32,
    pub jpeg_quality: u8,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from(DEFAULT_VIDEO_DIR),
            fps: DEFAULT_RECORD_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// The two-sided descriptor embedded in recording file names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Labels {
    pub home: String,
    pub away: String,
}

impl Labels {
    pub fn new(home: impl Into<String>, away: impl Into<String>) -> Self {
        Self {
            home: home.into(),
            away: away.into(),
        }
    }
}

impl Default for Labels {
    fn default() -> Self {
        Self::new("None", "None")
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-vs-{}", self.home, self.away)
    }
}

/// `{camera}_{home}-vs-{away}_{YYYY-mm-dd_HHMMSS}.avi`, with spaces removed
/// from the camera name.
pub fn recording_filename(camera: &str, labels: &Labels, at: DateTime<Local>) -> String {
    let camera: String = camera.chars().filter(|c| !c.is_whitespace()).collect();
    format!(
        "{}_{}_{}.{}",
        camera,
        labels,
        at.format("%Y-%m-%d_%H%M%S"),
        RECORDING_EXTENSION
    )
}

/// Outcome of feeding one frame to the controller.
#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Recording is off; the frame was ignored.
    Idle,
    Recorded,
    /// The frame did not match the session's dimensions and was skipped.
    Skipped,
    /// The session hit an error and was ended.
    Aborted,
}

pub struct RecordingController {
    camera: String,
    settings: RecordingSettings,
    labels: Labels,
    active: bool,
    recorder: Option<Recorder>,
    frames_recorded: u64,
    frames_skipped: u64,
    sessions: u64,
    last_saved: Option<PathBuf>,
    last_error: Option<String>,
}

impl RecordingController {
    pub fn new(camera: impl Into<String>, settings: RecordingSettings) -> Self {
        Self {
            camera: camera.into(),
            settings,
            labels: Labels::default(),
            active: false,
            recorder: None,
            frames_recorded: 0,
            frames_skipped: 0,
            sessions: 0,
            last_saved: None,
            last_error: None,
        }
    }

    pub fn settings(&self) -> &RecordingSettings {
        &self.settings
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    /// Takes effect for the next session; a running session keeps its file name.
    pub fn set_labels(&mut self, labels: Labels) {
        self.labels = labels;
    }

    pub fn reset_labels(&mut self) {
        self.labels = Labels::default();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Turn recording on. The file is created by the next appended frame.
    pub fn start(&mut self) {
        if !self.active {
            self.active = true;
            self.last_error = None;
            log::info!(
                "Camera[{}]: recording started ({})",
                self.camera,
                self.labels
            );
        }
    }

    /// Turn recording off and release the current recorder, if any.
    ///
    /// Returns the saved file. Calling it again, or when nothing was recorded,
    /// is a no-op.
    pub fn stop(&mut self) -> Option<PathBuf> {
        self.active = false;
        let mut recorder = self.recorder.take()?;
        match recorder.release() {
            Ok(path) => {
                self.last_saved = path.clone();
                path
            }
            Err(err) => {
                log::error!("Camera[{}]: failed to finalize recording: {}", self.camera, err);
                self.last_error = Some(err.to_string());
                None
            }
        }
    }

    /// Append a frame if recording is on.
    ///
    /// Must be called from the acquisition context that owns this controller.
    pub fn append(&mut self, image: &RgbImage) -> AppendOutcome {
        if !self.active {
            return AppendOutcome::Idle;
        }
        if self.recorder.is_none() {
            let path = self
                .settings
                .video_dir
                .join(recording_filename(&self.camera, &self.labels, Local::now()));
            self.sessions += 1;
            self.recorder = Some(Recorder::new(path, &self.settings));
        }
        let Some(recorder) = self.recorder.as_mut() else {
            return AppendOutcome::Idle;
        };

        match recorder.append(image) {
            Ok(()) => {
                self.frames_recorded += 1;
                AppendOutcome::Recorded
            }
            Err(err @ RecordError::DimensionMismatch { .. }) => {
                self.frames_skipped += 1;
                log::warn!("Camera[{}]: skipping frame: {}", self.camera, err);
                AppendOutcome::Skipped
            }
            Err(err) => {
                self.abort(err);
                AppendOutcome::Aborted
            }
        }
    }

    fn abort(&mut self, err: RecordError) {
        log::error!("Camera[{}]: recording aborted: {}", self.camera, err);
        self.active = false;
        if let Some(mut recorder) = self.recorder.take() {
            if let Err(release_err) = recorder.release() {
                log::warn!(
                    "Camera[{}]: could not finalize aborted recording: {}",
                    self.camera,
                    release_err
                );
            }
        }
        self.last_error = Some(err.to_string());
    }

    /// Path of the file currently being written, once it exists.
    pub fn current_path(&self) -> Option<PathBuf> {
        self.recorder
            .as_ref()
            .filter(|r| r.dimensions().is_some())
            .map(|r| r.path().to_path_buf())
    }

    pub fn last_saved(&self) -> Option<&PathBuf> {
        self.last_saved.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn frames_recorded(&self) -> u64 {
        self.frames_recorded
    }

    pub fn frames_skipped(&self) -> u64 {
        self.frames_skipped
    }

    pub fn sessions(&self) -> u64 {
        self.sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn controller(dir: &std::path::Path) -> RecordingController {
        RecordingController::new(
            "Court 1",
            RecordingSettings {
                video_dir: dir.to_path_buf(),
                ..RecordingSettings::default()
            },
        )
    }

    #[test]
    fn filename_embeds_camera_labels_and_time() -> Result<()> {
        let at = Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .ok_or_else(|| anyhow::anyhow!("ambiguous local time"))?;
        assert_eq!(
            recording_filename("Court 1", &Labels::new("Red", "Blue"), at),
            "Court1_Red-vs-Blue_2024-03-09_140507.avi"
        );
        assert_eq!(Labels::default().to_string(), "None-vs-None");
        Ok(())
    }

    #[test]
    fn frames_are_ignored_until_started() -> Result<()> {
        let dir = tempdir()?;
        let mut recording = controller(dir.path());
        assert_eq!(recording.append(&RgbImage::new(10, 10)), AppendOutcome::Idle);
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn session_lifecycle_produces_one_file() -> Result<()> {
        let dir = tempdir()?;
        let mut recording = controller(dir.path());
        recording.set_labels(Labels::new("A", "B"));
        recording.start();
        assert_eq!(recording.append(&RgbImage::new(60, 40)), AppendOutcome::Recorded);
        assert_eq!(recording.append(&RgbImage::new(60, 40)), AppendOutcome::Recorded);

        let saved = recording.stop().expect("saved path");
        let name = saved.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        assert!(name.starts_with("Court1_A-vs-B_"), "{}", name);
        assert_eq!(avi::probe(&saved)?.frame_count, 2);

        assert!(recording.stop().is_none());
        assert!(!recording.is_active());
        assert_eq!(recording.last_saved(), Some(&saved));
        Ok(())
    }

    #[test]
    fn back_to_back_sessions_with_same_labels_keep_both_files() -> Result<()> {
        let dir = tempdir()?;
        let mut recording = controller(dir.path());
        recording.set_labels(Labels::new("A", "B"));

        recording.start();
        for _ in 0..5 {
            recording.append(&RgbImage::new(32, 24));
        }
        let first = recording.stop().expect("first session");

        recording.start();
        recording.append(&RgbImage::new(32, 24));
        let second = recording.stop().expect("second session");

        assert_ne!(first, second);
        assert_eq!(avi::probe(&first)?.frame_count, 5);
        assert_eq!(avi::probe(&second)?.frame_count, 1);
        Ok(())
    }

    #[test]
    fn mismatched_frames_are_skipped() -> Result<()> {
        let dir = tempdir()?;
        let mut recording = controller(dir.path());
        recording.start();
        recording.append(&RgbImage::new(60, 40));
        assert_eq!(recording.append(&RgbImage::new(30, 20)), AppendOutcome::Skipped);
        assert!(recording.is_active());
        assert_eq!(recording.frames_skipped(), 1);
        Ok(())
    }

    #[test]
    fn unwritable_directory_aborts_session() -> Result<()> {
        let dir = tempdir()?;
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x")?;
        let mut recording = RecordingController::new(
            "cam",
            RecordingSettings {
                video_dir: blocker.join("videos"),
                ..RecordingSettings::default()
            },
        );
        recording.start();
        assert_eq!(recording.append(&RgbImage::new(8, 8)), AppendOutcome::Aborted);
        assert!(!recording.is_active());
        assert!(recording.last_error().is_some());
        Ok(())
    }
}
