//! Camera frame sources.
//!
//! `FrameSource` is the contract the acquisition loop and outside consumers
//! rely on. `Camera` implements it over a closed set of backends selected by
//! `BackendKind`:
//!
//! - `local-device`: `LocalDeviceSource`, synchronous reads.
//! - `process-isolated-stream`: `ProcessIsolatedStreamSource`, decoder in a
//!   worker process.
//! - `push-subscriber`: `PushSubscriberSource`, latest-wins background receiver.
//!
//! Every acquired frame is resized to the camera's target width, mirrored if
//! configured, and published to a `LatestFrame` cell that other threads read
//! through a `CameraHandle`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;
use crate::frame::{normalize, Frame, LatestFrame, DEFAULT_TARGET_WIDTH};
use crate::ingest::push::DEFAULT_PUSH_TIMEOUT;
use crate::ingest::stream::{
    default_worker_program, DEFAULT_MAX_RESTARTS, DEFAULT_RESTART_RESET_AFTER,
};
use crate::ingest::{
    DeviceConfig, DeviceSpec, LocalDeviceSource, ProcessIsolatedStreamSource, PushConfig,
    PushEndpoint, PushSubscriberSource, StreamConfig,
};
use crate::record::{AppendOutcome, Labels, RecordingController, RecordingSettings};

/// Capability contract shared by all camera backends.
pub trait FrameSource: Send {
    fn name(&self) -> &str;

    /// Open the backend and perform one warm-up acquisition. No-op when
    /// already initialized.
    fn initialize(&mut self) -> Result<(), SourceError>;

    /// Block until the freshest frame is available, normalize it and store it
    /// as the last frame.
    fn acquire(&mut self) -> Result<Arc<Frame>, SourceError>;

    fn last_frame(&self) -> Option<Arc<Frame>>;

    /// Feed a frame to the recording session, if recording is on.
    fn record(&mut self, frame: &Frame) -> AppendOutcome;

    fn start_recording(&mut self);

    /// Idempotent. Returns the saved file when a session ended.
    fn stop_recording(&mut self) -> Option<PathBuf>;

    /// Stop recording and release the backend. Idempotent, never fails.
    fn close(&mut self);

    fn is_initialized(&self) -> bool;

    fn is_recording(&self) -> bool;
}

/// Backend selector used by configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[serde(alias = "usb", alias = "USBCamera")]
    LocalDevice,
    #[serde(alias = "rtsp", alias = "RTSPCamera")]
    ProcessIsolatedStream,
    #[serde(alias = "pubsub", alias = "PubSubImageZMQCamera")]
    PushSubscriber,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalDevice => "local-device",
            Self::ProcessIsolatedStream => "process-isolated-stream",
            Self::PushSubscriber => "push-subscriber",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "local-device" | "usb" | "USBCamera" => Ok(Self::LocalDevice),
            "process-isolated-stream" | "rtsp" | "RTSPCamera" => Ok(Self::ProcessIsolatedStream),
            "push-subscriber" | "pubsub" | "PubSubImageZMQCamera" => Ok(Self::PushSubscriber),
            other => Err(anyhow!("unknown camera backend '{}'", other)),
        }
    }
}

/// One configured camera.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub name: String,
    pub kind: BackendKind,
    /// Device index, stream URL, or publisher address, depending on `kind`.
    pub source: String,
    #[serde(default)]
    pub flip: bool,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Overrides the settle time of local devices.
    #[serde(default)]
    pub warmup_ms: Option<u64>,
}

fn default_width() -> u32 {
    DEFAULT_TARGET_WIDTH
}

fn default_enabled() -> bool {
    true
}

impl CameraConfig {
    pub fn new(name: impl Into<String>, kind: BackendKind, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            source: source.into(),
            flip: false,
            width: DEFAULT_TARGET_WIDTH,
            enabled: true,
            warmup_ms: None,
        }
    }
}

/// Process-isolated stream settings shared by all stream cameras.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamSettings {
    /// `None` blocks on the worker forever.
    pub reply_timeout: Option<Duration>,
    pub max_restarts: u32,
    /// Frames in a row after which a restarted worker's budget refills.
    pub restart_reset_frames: u64,
    /// `None` resolves `courtcam_worker` at spawn time.
    pub worker_program: Option<PathBuf>,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reply_timeout: None,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_reset_frames: DEFAULT_RESTART_RESET_AFTER,
            worker_program: None,
        }
    }
}

/// Settings shared by every camera in a process.
#[derive(Clone, Debug, PartialEq)]
pub struct RuntimeSettings {
    pub recording: RecordingSettings,
    pub push_timeout: Duration,
    pub stream: StreamSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            recording: RecordingSettings::default(),
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            stream: StreamSettings::default(),
        }
    }
}

/// The concrete transport behind a camera.
pub enum CameraBackend {
    LocalDevice(LocalDeviceSource),
    ProcessIsolated(ProcessIsolatedStreamSource),
    PushSubscriber(PushSubscriberSource),
}

impl CameraBackend {
    pub fn from_config(config: &CameraConfig, runtime: &RuntimeSettings) -> Result<Self> {
        let backend = match config.kind {
            BackendKind::LocalDevice => Self::LocalDevice(LocalDeviceSource::new(DeviceConfig {
                spec: DeviceSpec::parse(&config.source)?,
                warmup: config.warmup_ms.map(Duration::from_millis),
            })),
            BackendKind::ProcessIsolatedStream => {
                let url = config.source.trim();
                if url.is_empty() {
                    return Err(anyhow!("camera {} has an empty stream url", config.name));
                }
                let mut stream = StreamConfig::new(url);
                stream.program = runtime
                    .stream
                    .worker_program
                    .clone()
                    .unwrap_or_else(default_worker_program);
                stream.reply_timeout = runtime.stream.reply_timeout;
                stream.max_restarts = runtime.stream.max_restarts;
                stream.restart_reset_after = runtime.stream.restart_reset_frames;
                Self::ProcessIsolated(ProcessIsolatedStreamSource::new(stream))
            }
            BackendKind::PushSubscriber => {
                let mut push = PushConfig::new(PushEndpoint::parse(&config.source)?);
                push.timeout = runtime.push_timeout;
                Self::PushSubscriber(PushSubscriberSource::new(push))
            }
        };
        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::LocalDevice(_) => BackendKind::LocalDevice,
            Self::ProcessIsolated(_) => BackendKind::ProcessIsolatedStream,
            Self::PushSubscriber(_) => BackendKind::PushSubscriber,
        }
    }

    fn open(&mut self) -> Result<()> {
        match self {
            Self::LocalDevice(source) => source.open(),
            Self::ProcessIsolated(source) => source.open(),
            Self::PushSubscriber(source) => source.open(),
        }
    }

    fn warmup(&self) -> Duration {
        match self {
            Self::LocalDevice(source) => source.warmup(),
            Self::ProcessIsolated(_) | Self::PushSubscriber(_) => Duration::ZERO,
        }
    }

    fn grab(&mut self, name: &str) -> Result<RgbImage, SourceError> {
        match self {
            Self::LocalDevice(source) => source
                .grab()
                .map_err(|err| SourceError::acquire(name, &err)),
            Self::ProcessIsolated(source) => source.request_frame(),
            Self::PushSubscriber(source) => source.grab(),
        }
    }

    fn release(&mut self) {
        match self {
            Self::LocalDevice(source) => source.release(),
            Self::ProcessIsolated(source) => source.close(),
            Self::PushSubscriber(source) => source.close(),
        }
    }

    fn frames_dropped(&self) -> u64 {
        match self {
            Self::PushSubscriber(source) => source.stats().frames_dropped,
            _ => 0,
        }
    }

    fn worker_restarts(&self) -> u64 {
        match self {
            Self::ProcessIsolated(source) => u64::from(source.restarts()),
            _ => 0,
        }
    }
}

/// Counters of one camera.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CameraStats {
    pub frames_acquired: u64,
    pub acquire_failures: u64,
    pub frames_recorded: u64,
    pub frames_skipped: u64,
    pub frames_dropped: u64,
    pub worker_restarts: u64,
}

struct CameraShared {
    name: String,
    latest: LatestFrame,
    recording: Mutex<RecordingController>,
    initialized: AtomicBool,
    frames_acquired: AtomicU64,
    acquire_failures: AtomicU64,
    frames_dropped: AtomicU64,
    worker_restarts: AtomicU64,
}

impl CameraShared {
    fn recording(&self) -> MutexGuard<'_, RecordingController> {
        match self.recording.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// A named camera over one backend.
pub struct Camera {
    kind: BackendKind,
    source: String,
    flip: bool,
    target_width: u32,
    backend: CameraBackend,
    initialized: bool,
    closed: bool,
    shared: Arc<CameraShared>,
}

impl Camera {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        backend: CameraBackend,
        flip: bool,
        target_width: u32,
        recording: RecordingSettings,
    ) -> Self {
        let name = name.into();
        Self {
            kind: backend.kind(),
            source: source.into(),
            flip,
            target_width: target_width.max(1),
            backend,
            initialized: false,
            closed: false,
            shared: Arc::new(CameraShared {
                recording: Mutex::new(RecordingController::new(name.clone(), recording)),
                name,
                latest: LatestFrame::new(),
                initialized: AtomicBool::new(false),
                frames_acquired: AtomicU64::new(0),
                acquire_failures: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
                worker_restarts: AtomicU64::new(0),
            }),
        }
    }

    /// Build the camera and its backend from configuration. Nothing is opened yet.
    pub fn from_config(config: &CameraConfig, runtime: &RuntimeSettings) -> Result<Self> {
        let backend = CameraBackend::from_config(config, runtime)?;
        Ok(Self::new(
            config.name.clone(),
            config.source.clone(),
            backend,
            config.flip,
            config.width,
            runtime.recording.clone(),
        ))
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn flip(&self) -> bool {
        self.flip
    }

    pub fn target_width(&self) -> u32 {
        self.target_width
    }

    pub fn backend(&self) -> &CameraBackend {
        &self.backend
    }

    /// Cross-thread handle for reading frames and controlling recording.
    pub fn handle(&self) -> CameraHandle {
        CameraHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn set_labels(&mut self, labels: Labels) {
        self.shared.recording().set_labels(labels);
    }

    pub fn stats(&self) -> CameraStats {
        self.handle().stats()
    }

    fn acquire_normalized(&mut self) -> Result<Arc<Frame>, SourceError> {
        let grabbed = self.backend.grab(&self.shared.name);
        self.shared
            .frames_dropped
            .store(self.backend.frames_dropped(), Ordering::Relaxed);
        self.shared
            .worker_restarts
            .store(self.backend.worker_restarts(), Ordering::Relaxed);

        let image = match grabbed {
            Ok(image) => image,
            Err(err) => {
                self.shared.acquire_failures.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        let image = normalize(image, self.target_width, self.flip);
        let seq = self.shared.frames_acquired.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Arc::new(Frame::new(image, seq));
        self.shared.latest.store(frame.clone());
        Ok(frame)
    }
}

impl FrameSource for Camera {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn initialize(&mut self) -> Result<(), SourceError> {
        if self.initialized {
            return Ok(());
        }
        let name = self.shared.name.clone();
        self.backend
            .open()
            .map_err(|err| SourceError::unavailable(&name, &err))?;

        let warmup = self.backend.warmup();
        if !warmup.is_zero() {
            log::info!("Camera[{}]: letting the device settle for {:?}", name, warmup);
            std::thread::sleep(warmup);
        }

        if let Err(err) = self.acquire_normalized() {
            self.backend.release();
            return Err(SourceError::Unavailable {
                name,
                reason: format!("warm-up acquisition failed: {}", err),
            });
        }

        self.initialized = true;
        self.closed = false;
        self.shared.initialized.store(true, Ordering::SeqCst);
        log::info!(
            "Camera[{}]: initialized ({} {}, width={}, flip={})",
            name,
            self.kind,
            self.source,
            self.target_width,
            self.flip
        );
        Ok(())
    }

    fn acquire(&mut self) -> Result<Arc<Frame>, SourceError> {
        if !self.initialized {
            let name = self.shared.name.clone();
            return Err(if self.closed {
                SourceError::Closed(name)
            } else {
                SourceError::NotInitialized(name)
            });
        }
        self.acquire_normalized()
    }

    fn last_frame(&self) -> Option<Arc<Frame>> {
        self.shared.latest.snapshot()
    }

    fn record(&mut self, frame: &Frame) -> AppendOutcome {
        self.shared.recording().append(&frame.image)
    }

    fn start_recording(&mut self) {
        self.shared.recording().start();
    }

    fn stop_recording(&mut self) -> Option<PathBuf> {
        self.shared.recording().stop()
    }

    fn close(&mut self) {
        self.stop_recording();
        self.backend.release();
        self.shared.recording().reset_labels();
        if self.initialized {
            log::info!("Camera[{}]: closed", self.shared.name);
        }
        self.initialized = false;
        self.closed = true;
        self.shared.initialized.store(false, Ordering::SeqCst);
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_recording(&self) -> bool {
        self.shared.recording().is_active()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
    }
}

/// Cloneable view of a camera for threads that do not own it.
///
/// Frame reads are snapshots: a reader holds an `Arc<Frame>` that later
/// acquisitions never modify. Recording toggles take effect at the owning
/// loop's next frame.
#[derive(Clone)]
pub struct CameraHandle {
    shared: Arc<CameraShared>,
}

impl CameraHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn last_frame(&self) -> Option<Arc<Frame>> {
        self.shared.latest.snapshot()
    }

    /// Bumped on every stored frame; cheap change detection for renderers.
    pub fn frame_version(&self) -> u64 {
        self.shared.latest.version()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn start_recording(&self) {
        self.shared.recording().start();
    }

    pub fn stop_recording(&self) -> Option<PathBuf> {
        self.shared.recording().stop()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording().is_active()
    }

    pub fn set_labels(&self, labels: Labels) {
        self.shared.recording().set_labels(labels);
    }

    pub fn labels(&self) -> Labels {
        self.shared.recording().labels().clone()
    }

    pub fn last_recording_error(&self) -> Option<String> {
        self.shared.recording().last_error().map(str::to_string)
    }

    pub fn last_saved_recording(&self) -> Option<PathBuf> {
        self.shared.recording().last_saved().cloned()
    }

    pub fn stats(&self) -> CameraStats {
        let recording = self.shared.recording();
        CameraStats {
            frames_acquired: self.shared.frames_acquired.load(Ordering::Relaxed),
            acquire_failures: self.shared.acquire_failures.load(Ordering::Relaxed),
            frames_recorded: recording.frames_recorded(),
            frames_skipped: recording.frames_skipped(),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            worker_restarts: self.shared.worker_restarts.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraHandle")
            .field("name", &self.shared.name)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::synthetic::render;
    use image::imageops;
    use tempfile::tempdir;

    fn synthetic_camera(source: &str, flip: bool, dir: &std::path::Path) -> Result<Camera> {
        let mut config = CameraConfig::new("Court 1", BackendKind::LocalDevice, source);
        config.flip = flip;
        let runtime = RuntimeSettings {
            recording: RecordingSettings {
                video_dir: dir.to_path_buf(),
                ..RecordingSettings::default()
            },
            ..RuntimeSettings::default()
        };
        Camera::from_config(&config, &runtime)
    }

    #[test]
    fn backend_kind_accepts_legacy_names() -> Result<()> {
        assert_eq!("USBCamera".parse::<BackendKind>()?, BackendKind::LocalDevice);
        assert_eq!("rtsp".parse::<BackendKind>()?, BackendKind::ProcessIsolatedStream);
        assert_eq!(
            "PubSubImageZMQCamera".parse::<BackendKind>()?,
            BackendKind::PushSubscriber
        );
        assert_eq!(
            "push-subscriber".parse::<BackendKind>()?,
            BackendKind::PushSubscriber
        );
        assert!("FileCamera".parse::<BackendKind>().is_err());
        Ok(())
    }

    #[test]
    fn acquire_before_initialize_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let mut camera = synthetic_camera("stub://court", false, dir.path())?;
        assert!(matches!(
            camera.acquire(),
            Err(SourceError::NotInitialized(_))
        ));
        Ok(())
    }

    #[test]
    fn initialize_warms_up_and_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let mut camera = synthetic_camera("stub://court?width=1280&height=720", false, dir.path())?;
        camera.initialize()?;
        let warm = camera.last_frame().expect("warm-up frame");
        assert_eq!(warm.dimensions(), (600, 337));

        camera.initialize()?;
        assert_eq!(camera.stats().frames_acquired, 1);
        Ok(())
    }

    #[test]
    fn flip_mirrors_the_normalized_frame() -> Result<()> {
        let dir = tempdir()?;
        let mut plain = synthetic_camera("stub://court?width=800&height=600", false, dir.path())?;
        let mut mirrored = synthetic_camera("stub://court?width=800&height=600", true, dir.path())?;
        plain.initialize()?;
        mirrored.initialize()?;

        let a = plain.acquire()?;
        let b = mirrored.acquire()?;
        assert_eq!(a.seq, b.seq);
        assert_eq!(imageops::flip_horizontal(&a.image), b.image);
        assert_eq!(
            a.image,
            normalize(render(800, 600, a.seq), DEFAULT_TARGET_WIDTH, false)
        );
        Ok(())
    }

    #[test]
    fn unavailable_backend_keeps_camera_uninitialized() -> Result<()> {
        let config = CameraConfig::new("pi", BackendKind::PushSubscriber, "127.0.0.1:1");
        let mut camera = Camera::from_config(&config, &RuntimeSettings::default())?;
        assert!(matches!(
            camera.initialize(),
            Err(SourceError::Unavailable { .. })
        ));
        assert!(!camera.is_initialized());
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_resets_labels() -> Result<()> {
        let dir = tempdir()?;
        let mut camera = synthetic_camera("stub://court", false, dir.path())?;
        camera.initialize()?;
        camera.set_labels(Labels::new("Red", "Blue"));
        camera.start_recording();
        let frame = camera.acquire()?;
        assert_eq!(camera.record(&frame), AppendOutcome::Recorded);

        camera.close();
        let handle = camera.handle();
        assert!(!camera.is_initialized());
        assert!(!camera.is_recording());
        assert_eq!(handle.labels(), Labels::default());
        assert!(handle.last_saved_recording().is_some());

        camera.close();
        assert!(!camera.is_initialized());
        assert!(matches!(camera.acquire(), Err(SourceError::Closed(_))));
        Ok(())
    }

    #[test]
    fn camera_can_be_reinitialized_after_close() -> Result<()> {
        let dir = tempdir()?;
        let mut camera = synthetic_camera("stub://court", false, dir.path())?;
        camera.initialize()?;
        camera.close();
        camera.initialize()?;
        assert!(camera.acquire().is_ok());
        Ok(())
    }
}
