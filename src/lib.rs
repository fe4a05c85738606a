//! courtcam: camera acquisition and recording for court-side scoring.
//!
//! One `FrameSource` abstraction over three transports:
//!
//! - a locally attached capture device, read synchronously;
//! - a pull stream (RTSP, HTTP MJPEG) decoded in an isolated worker process;
//! - a push stream fed by a remote publisher, where only the freshest frame
//!   is kept.
//!
//! Frames are resized to a target width and optionally mirrored before they
//! are published. An `AcquisitionLoop` per camera keeps pulling frames and
//! feeds them to the camera's recording session (Motion-JPEG AVI) while
//! recording is on. UI and scoring code read the last frame through a
//! `CameraHandle` at any time without touching the loop.
//!
//! # Module Structure
//!
//! - `frame`: `Frame`, the shared `LatestFrame` cell, normalization
//! - `source`: `FrameSource`, `Camera`, backend selection
//! - `ingest`: the three backends plus synthetic `stub://` frames
//! - `record`: recording sessions and the AVI writer
//! - `acquisition`: the per-camera acquisition loop
//! - `config`: file + environment configuration

pub mod acquisition;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod record;
pub mod source;

pub use acquisition::AcquisitionLoop;
pub use config::CourtcamConfig;
pub use error::{RecordError, SourceError};
pub use frame::{normalize, Frame, LatestFrame, DEFAULT_TARGET_WIDTH, MAX_TARGET_WIDTH};
pub use record::{Labels, Recorder, RecordingController, RecordingSettings};
pub use source::{
    BackendKind, Camera, CameraBackend, CameraConfig, CameraHandle, CameraStats, FrameSource,
    RuntimeSettings, StreamSettings,
};
