//! Push subscriber source.
//!
//! A remote publisher pushes frames at its own pace. A background receive
//! worker reads and decodes them and drops each one into a `LatestSlot`,
//! overwriting whatever the consumer has not taken yet. `grab()` waits for the
//! slot with a bounded timeout, so a consumer slower than the publisher only
//! ever sees the freshest frame and never has to catch up.
//!
//! Stopping is cooperative: `close()` raises a flag that the worker checks at
//! the top of every iteration. Socket reads use a short timeout so the flag is
//! observed promptly even when the publisher is silent.

pub mod slot;
pub mod wire;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::SourceError;
use crate::ingest::synthetic::{is_stub, StubParams, SyntheticScene};
pub use slot::LatestSlot;

/// Port used when the descriptor names only a host.
pub const DEFAULT_PUSH_PORT: u16 = 5555;
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const READ_POLL: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const SYNTHETIC_INTERVAL_MS: u64 = 33;

/// Where pushed frames come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushEndpoint {
    Tcp { host: String, port: u16 },
    /// In-process synthetic publisher (`stub://name?interval_ms=N`).
    Synthetic(String),
}

impl PushEndpoint {
    /// Accepts `host:port`, `host,port`, bare `host`, `tcp://host:port` or `stub://...`.
    ///
    /// IPv6 literals take a port only in brackets (`[::1]:6000`) or after a
    /// comma (`::1,6000`). An unbracketed address with several colons is a
    /// bare host on the default port.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let trimmed = descriptor.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("push subscriber descriptor is empty"));
        }
        if is_stub(trimmed) {
            return Ok(Self::Synthetic(trimmed.to_string()));
        }
        let address = trimmed.strip_prefix("tcp://").unwrap_or(trimmed);
        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| anyhow!("unclosed '[' in push descriptor '{}'", descriptor))?;
            match tail.trim() {
                "" => (host, None),
                tail => match tail.strip_prefix([':', ',']) {
                    Some(port) => (host, Some(port)),
                    None => {
                        return Err(anyhow!(
                            "unexpected '{}' in push descriptor '{}'",
                            tail,
                            descriptor
                        ))
                    }
                },
            }
        } else if let Some((host, port)) = address.rsplit_once(',') {
            (host, Some(port))
        } else {
            match address.split_once(':') {
                Some((host, port)) if !port.contains(':') => (host, Some(port)),
                _ => (address, None),
            }
        };
        let port = match port {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| anyhow!("invalid port in push descriptor '{}'", descriptor))?,
            None => DEFAULT_PUSH_PORT,
        };
        let host = host.trim();
        if host.is_empty() {
            return Err(anyhow!("push descriptor '{}' has no host", descriptor));
        }
        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }

    pub fn address(&self) -> String {
        match self {
            Self::Tcp { host, port } if host.contains(':') => {
                format!("tcp://[{}]:{}", host, port)
            }
            Self::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            Self::Synthetic(descriptor) => descriptor.clone(),
        }
    }
}

/// Configuration for a push subscriber.
#[derive(Clone, Debug)]
pub struct PushConfig {
    pub endpoint: PushEndpoint,
    /// Bound on how long `grab()` waits for a pushed frame.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl PushConfig {
    pub fn new(endpoint: PushEndpoint) -> Self {
        Self {
            endpoint,
            timeout: DEFAULT_PUSH_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Default)]
struct SubscriberShared {
    slot: LatestSlot<RgbImage>,
    stop: AtomicBool,
    skipped: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
}

/// Counters for a push subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PushStats {
    pub frames_received: u64,
    /// Frames replaced or skipped before anyone acquired them.
    pub frames_dropped: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
}

pub struct PushSubscriberSource {
    config: PushConfig,
    shared: Arc<SubscriberShared>,
    worker: Option<JoinHandle<()>>,
}

impl PushSubscriberSource {
    pub fn new(config: PushConfig) -> Self {
        Self {
            config,
            shared: Arc::new(SubscriberShared::default()),
            worker: None,
        }
    }

    pub fn address(&self) -> String {
        self.config.endpoint.address()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Connect and start the receive worker.
    pub fn open(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let shared = Arc::new(SubscriberShared::default());
        let worker_shared = shared.clone();
        let address = self.address();

        let worker = match &self.config.endpoint {
            PushEndpoint::Tcp { host, port } => {
                let targets = resolve(host, *port)?;
                let stream = connect_any(&targets, self.config.connect_timeout)?;
                log::info!("PushSubscriber: subscribed to {}", address);
                let connect_timeout = self.config.connect_timeout;
                std::thread::Builder::new()
                    .name(format!("push-{}", address))
                    .spawn(move || {
                        run_tcp_subscriber(worker_shared, targets, stream, connect_timeout)
                    })
                    .context("spawn push subscriber worker")?
            }
            PushEndpoint::Synthetic(descriptor) => {
                let params = StubParams::parse(descriptor)?;
                let interval = Duration::from_millis(
                    params
                        .get::<u64>("interval_ms")?
                        .unwrap_or(SYNTHETIC_INTERVAL_MS),
                );
                log::info!("PushSubscriber: subscribed to {} (synthetic)", address);
                std::thread::Builder::new()
                    .name(format!("push-{}", params.name))
                    .spawn(move || run_synthetic_publisher(worker_shared, params, interval))
                    .context("spawn synthetic publisher")?
            }
        };

        self.shared = shared;
        self.worker = Some(worker);
        Ok(())
    }

    /// Wait for the freshest pushed frame, up to the configured timeout.
    pub fn grab(&mut self) -> Result<RgbImage, SourceError> {
        self.shared
            .slot
            .take_timeout(self.config.timeout)
            .ok_or_else(|| SourceError::Timeout {
                address: self.address(),
                timeout: self.config.timeout,
            })
    }

    pub fn stats(&self) -> PushStats {
        PushStats {
            frames_received: self.shared.slot.published(),
            frames_dropped: self.shared.slot.overwritten()
                + self.shared.skipped.load(Ordering::Relaxed),
            decode_errors: self.shared.decode_errors.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Ask the worker to stop and wait for it to finish its current receive.
    pub fn close(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("PushSubscriber: worker for {} panicked", self.address());
            }
        }
    }
}

impl Drop for PushSubscriberSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let targets: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}:{}", host, port))?
        .collect();
    if targets.is_empty() {
        return Err(anyhow!("{}:{} resolved to no addresses", host, port));
    }
    Ok(targets)
}

fn connect_any(targets: &[SocketAddr], timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for target in targets {
        match TcpStream::connect_timeout(target, timeout) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(READ_POLL))
                    .context("set subscriber read timeout")?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(anyhow::Error::new(err).context(format!("connect to {:?}", targets))),
        None => Err(anyhow!("no addresses to connect to")),
    }
}

fn run_tcp_subscriber(
    shared: Arc<SubscriberShared>,
    targets: Vec<SocketAddr>,
    stream: TcpStream,
    connect_timeout: Duration,
) {
    let mut connection = Some(stream);
    let mut buffer: Vec<u8> = Vec::with_capacity(256 * 1024);
    let mut chunk = vec![0u8; 64 * 1024];

    while !shared.stop.load(Ordering::SeqCst) {
        let Some(stream) = connection.as_mut() else {
            sleep_unless_stopped(&shared.stop, RECONNECT_BACKOFF);
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }
            match connect_any(&targets, connect_timeout) {
                Ok(stream) => {
                    shared.reconnects.fetch_add(1, Ordering::Relaxed);
                    log::info!("PushSubscriber: reconnected to {:?}", targets);
                    connection = Some(stream);
                }
                Err(err) => log::debug!("PushSubscriber: reconnect failed: {:#}", err),
            }
            continue;
        };

        match stream.read(&mut chunk) {
            Ok(0) => {
                log::warn!("PushSubscriber: publisher {:?} closed the stream", targets);
                connection = None;
                buffer.clear();
            }
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if let Err(err) = publish_latest(&shared, &mut buffer) {
                    log::warn!("PushSubscriber: dropping connection: {}", err);
                    connection = None;
                    buffer.clear();
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                log::warn!("PushSubscriber: read failed: {}", err);
                connection = None;
                buffer.clear();
            }
        }
    }
    log::info!("PushSubscriber: receive worker for {:?} stopped", targets);
}

/// Decode only the newest complete message in `buffer`; older ones are skipped.
fn publish_latest(shared: &SubscriberShared, buffer: &mut Vec<u8>) -> std::io::Result<()> {
    let mut newest = None;
    while let Some(message) = wire::take_message(buffer)? {
        if newest.replace(message).is_some() {
            shared.skipped.fetch_add(1, Ordering::Relaxed);
        }
    }
    if let Some(message) = newest {
        match message.decode() {
            Ok(image) => shared.slot.put(image),
            Err(err) => {
                shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("PushSubscriber: {:#}", err);
            }
        }
    }
    Ok(())
}

fn run_synthetic_publisher(shared: Arc<SubscriberShared>, params: StubParams, interval: Duration) {
    let mut scene = SyntheticScene::from_params(&params);
    while !shared.stop.load(Ordering::SeqCst) {
        shared.slot.put(scene.next_image());
        sleep_unless_stopped(&shared.stop, interval);
    }
    log::info!(
        "PushSubscriber: synthetic publisher {} stopped after {} frames",
        params.name,
        scene.frame_count()
    );
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = std::time::Instant::now() + duration;
    while !stop.load(Ordering::SeqCst) {
        let now = std::time::Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(READ_POLL));
    }
}
