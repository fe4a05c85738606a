//! Error taxonomy surfaced by frame sources and recorders.
//!
//! Backends and plumbing use `anyhow` internally; failures are mapped into
//! these types at the `Camera` / `Recorder` boundary so callers can match on
//! the condition instead of parsing messages.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of a frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The backend could not be opened (bad device index, unreachable address).
    /// The camera stays uninitialized.
    #[error("source {name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    /// A push subscriber waited longer than its bound for a frame.
    /// The source remains usable.
    #[error("timeout after {timeout:?} while reading from subscriber {address}")]
    Timeout { address: String, timeout: Duration },

    /// The isolated decoder process died or stopped answering.
    #[error("stream worker for {address} is not responding: {reason}")]
    Hung { address: String, reason: String },

    #[error("source {0} is not initialized")]
    NotInitialized(String),

    #[error("source {0} has been closed")]
    Closed(String),

    /// The backend produced an error while reading or decoding a frame.
    #[error("failed to acquire frame from {name}: {reason}")]
    Acquire { name: String, reason: String },
}

impl SourceError {
    pub(crate) fn unavailable(name: &str, err: &anyhow::Error) -> Self {
        Self::Unavailable {
            name: name.to_string(),
            reason: format!("{:#}", err),
        }
    }

    pub(crate) fn acquire(name: &str, err: &anyhow::Error) -> Self {
        Self::Acquire {
            name: name.to_string(),
            reason: format!("{:#}", err),
        }
    }

    /// Whether the acquisition loop should keep going after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Hung { .. } | Self::Acquire { .. }
        )
    }
}

/// Failures of a recording session.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("recording io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    /// The recorder's dimensions are fixed by its first frame.
    #[error("frame is {actual_width}x{actual_height}, recording is locked to {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    /// The muxing pipeline failed to start, accept a frame or finalize.
    #[error("recording pipeline error: {0}")]
    Pipeline(String),

    #[error("recorder has already been released")]
    Released,
}

impl RecordError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
