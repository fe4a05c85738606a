//! Process-isolated stream source.
//!
//! Pull-style network streams (RTSP and friends) are decoded by a blocking
//! decoder that can stall for seconds or crash outright. The decoder therefore
//! lives in a separate worker process (`courtcam_worker`), and the parent talks
//! to it over the worker's stdin/stdout with a strict request/acknowledge
//! protocol: one outstanding request at a time, no pipelining.
//!
//! Failure containment:
//! - A crashed or hung worker surfaces as `SourceError::Hung`; parent state is
//!   never touched by the decoder.
//! - By default `acquire()` waits for the worker indefinitely. Setting
//!   `reply_timeout` bounds that wait; on expiry the worker is treated as hung.
//! - A lost worker is reaped, and the next `acquire()` respawns it until
//!   `max_restarts` consecutive restarts are used up. After
//!   `restart_reset_after` good frames in a row the budget is full again.

pub mod decoder;
#[cfg(feature = "rtsp-gstreamer")]
mod gstreamer;
#[cfg(feature = "stream-mjpeg")]
mod mjpeg;
pub mod protocol;
pub mod worker;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::SourceError;
use protocol::{read_reply, write_request, Reply, Request};

/// Name of the worker executable, installed next to the host binary.
pub const WORKER_BINARY: &str = "courtcam_worker";
/// Overrides the worker executable path.
pub const WORKER_ENV: &str = "COURTCAM_STREAM_WORKER";

pub const DEFAULT_MAX_RESTARTS: u32 = 3;
pub const DEFAULT_RESTART_RESET_AFTER: u64 = 100;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for a process-isolated stream.
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Stream address handed to the worker (e.g. `rtsp://10.0.0.5:554/stream`).
    pub url: String,
    pub program: PathBuf,
    /// `None` waits for the worker forever.
    pub reply_timeout: Option<Duration>,
    pub max_restarts: u32,
    /// Frames in a row that refill the restart budget. `0` never refills.
    pub restart_reset_after: u64,
    pub shutdown_grace: Duration,
}

impl StreamConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            program: default_worker_program(),
            reply_timeout: None,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_reset_after: DEFAULT_RESTART_RESET_AFTER,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// `$COURTCAM_STREAM_WORKER`, else `courtcam_worker` next to the running executable.
pub fn default_worker_program() -> PathBuf {
    if let Ok(path) = std::env::var(WORKER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    let file_name = format!("{}{}", WORKER_BINARY, std::env::consts::EXE_SUFFIX);
    std::env::current_exe()
        .map(|exe| exe.with_file_name(&file_name))
        .unwrap_or_else(|_| PathBuf::from(file_name))
}

enum WorkerEvent {
    Reply(Reply),
    Exited(String),
}

struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    events: Receiver<WorkerEvent>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerProcess {
    fn spawn(config: &StreamConfig) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .arg("--source")
            .arg(&config.url)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn stream worker {}", config.program.display()))?;

        let stdin = child.stdin.take().context("worker stdin not captured")?;
        let stdout = child.stdout.take().context("worker stdout not captured")?;
        let (tx, events) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name(format!("stream-replies-{}", child.id()))
            .spawn(move || forward_replies(stdout, tx))
            .context("spawn worker reply reader")?;

        log::info!(
            "StreamSource: spawned worker pid={} for {}",
            child.id(),
            config.url
        );
        Ok(Self {
            child,
            stdin: Some(stdin),
            events,
            reader: Some(reader),
        })
    }

    fn send(&mut self, request: Request) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("worker request pipe already closed"))?;
        write_request(stdin, request)
    }

    /// Cooperative shutdown, escalating to kill after `grace`.
    fn shutdown(mut self, grace: Duration) {
        let _ = self.send(Request::Close);
        self.stdin = None;

        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("StreamSource: worker exited ({})", status);
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(None) => {
                    log::warn!(
                        "StreamSource: worker pid={} ignored close for {:?}, killing",
                        self.child.id(),
                        grace
                    );
                    self.kill();
                    break;
                }
                Err(err) => {
                    log::warn!("StreamSource: failed to poll worker: {}", err);
                    self.kill();
                    break;
                }
            }
        }
        self.join_reader();
    }

    /// Reap a worker that is already considered lost.
    fn reap(mut self) {
        self.stdin = None;
        self.kill();
        self.join_reader();
    }

    fn kill(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn forward_replies(mut stdout: ChildStdout, tx: mpsc::Sender<WorkerEvent>) {
    loop {
        let event = match read_reply(&mut stdout) {
            Ok(Some(reply)) => WorkerEvent::Reply(reply),
            Ok(None) => WorkerEvent::Exited("worker closed its output".to_string()),
            Err(err) => WorkerEvent::Exited(format!("{:#}", err)),
        };
        let done = matches!(event, WorkerEvent::Exited(_));
        if tx.send(event).is_err() || done {
            return;
        }
    }
}

/// Parent side of a process-isolated stream.
pub struct ProcessIsolatedStreamSource {
    config: StreamConfig,
    worker: Option<WorkerProcess>,
    /// Restarts since the budget was last refilled.
    restarts: u32,
    total_restarts: u32,
    healthy_streak: u64,
    frames_received: u64,
}

impl ProcessIsolatedStreamSource {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            worker: None,
            restarts: 0,
            total_restarts: 0,
            healthy_streak: 0,
            frames_received: 0,
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Worker restarts over the lifetime of this source.
    pub fn restarts(&self) -> u32 {
        self.total_restarts
    }

    /// Restarts left before a lost worker is no longer replaced.
    pub fn restarts_remaining(&self) -> u32 {
        self.config.max_restarts.saturating_sub(self.restarts)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawn the worker. Does not wait for a frame.
    pub fn open(&mut self) -> Result<()> {
        if self.worker.is_none() {
            self.worker = Some(WorkerProcess::spawn(&self.config)?);
            self.restarts = 0;
            self.healthy_streak = 0;
        }
        Ok(())
    }

    /// One request/reply/acknowledge round trip.
    pub fn request_frame(&mut self) -> Result<RgbImage, SourceError> {
        self.ensure_worker()?;
        let timeout = self.config.reply_timeout;
        let Some(worker) = self.worker.as_mut() else {
            return Err(self.hung("worker not running"));
        };

        if let Err(err) = worker.send(Request::RequestFrame) {
            let reason = match worker.events.try_recv() {
                Ok(WorkerEvent::Reply(Reply::Error(message))) => message,
                Ok(WorkerEvent::Exited(reason)) => reason,
                _ => format!("{:#}", err),
            };
            return Err(self.lose_worker(&reason));
        }

        let event = match timeout {
            Some(timeout) => match worker.events.recv_timeout(timeout) {
                Ok(event) => event,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(self.lose_worker(&format!("no reply within {:?}", timeout)));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(self.lose_worker("reply channel closed"));
                }
            },
            None => match worker.events.recv() {
                Ok(event) => event,
                Err(_) => return Err(self.lose_worker("reply channel closed")),
            },
        };

        match event {
            WorkerEvent::Reply(Reply::Frame(image)) => {
                self.frames_received += 1;
                self.record_healthy_frame();
                self.acknowledge();
                Ok(image)
            }
            WorkerEvent::Reply(Reply::Error(message)) => {
                self.acknowledge();
                Err(SourceError::Acquire {
                    name: self.config.url.clone(),
                    reason: message,
                })
            }
            WorkerEvent::Exited(reason) => Err(self.lose_worker(&reason)),
        }
    }

    pub fn close(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown(self.config.shutdown_grace);
        }
    }

    fn acknowledge(&mut self) {
        let failed = match self.worker.as_mut() {
            Some(worker) => worker.send(Request::Acknowledge).err(),
            None => None,
        };
        if let Some(err) = failed {
            log::warn!("StreamSource: acknowledge failed: {:#}", err);
            let _ = self.lose_worker("acknowledge failed");
        }
    }

    fn ensure_worker(&mut self) -> Result<(), SourceError> {
        if self.worker.is_some() {
            return Ok(());
        }
        if self.restarts >= self.config.max_restarts {
            return Err(self.hung(&format!(
                "worker restart limit ({}) reached",
                self.config.max_restarts
            )));
        }
        self.restarts += 1;
        self.total_restarts += 1;
        log::warn!(
            "StreamSource: restarting worker for {} (attempt {}/{})",
            self.config.url,
            self.restarts,
            self.config.max_restarts
        );
        let worker = WorkerProcess::spawn(&self.config)
            .map_err(|err| self.hung(&format!("{:#}", err)))?;
        self.worker = Some(worker);
        Ok(())
    }

    fn record_healthy_frame(&mut self) {
        self.healthy_streak += 1;
        let threshold = self.config.restart_reset_after;
        if threshold > 0 && self.healthy_streak >= threshold && self.restarts > 0 {
            log::info!(
                "StreamSource: {} healthy for {} frames, restart budget refilled",
                self.config.url,
                self.healthy_streak
            );
            self.restarts = 0;
        }
    }

    fn lose_worker(&mut self, reason: &str) -> SourceError {
        self.healthy_streak = 0;
        log::error!(
            "StreamSource: worker for {} lost: {}",
            self.config.url,
            reason
        );
        if let Some(worker) = self.worker.take() {
            worker.reap();
        }
        self.hung(reason)
    }

    fn hung(&self, reason: &str) -> SourceError {
        SourceError::Hung {
            address: self.config.url.clone(),
            reason: reason.to_string(),
        }
    }
}

impl Drop for ProcessIsolatedStreamSource {
    fn drop(&mut self) {
        self.close();
    }
}
