//! Worker side of a process-isolated stream.
//!
//! The worker owns the decoder. While idle it keeps grabbing (and discarding)
//! frames so the decoder's internal queue never lags. A `RequestFrame` decodes
//! the current position and replies. After a reply the worker blocks until
//! the parent sends `Acknowledge`, so a parent that stopped reading does not
//! keep the stream busy. `Close` or a closed request pipe releases the stream
//! and ends the loop.

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::sync::mpsc::{self, TryRecvError};
use std::time::Duration;

use super::decoder::StreamDecoder;
use super::protocol::{read_request, write_reply, Reply, Request};

/// Back-off after a failed grab so a broken stream does not spin.
const GRAB_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters reported when the worker exits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub grabbed: u64,
    pub served: u64,
    pub decode_errors: u64,
}

enum Incoming {
    Request(Request),
    Closed,
    Failed(String),
}

/// Serve requests from `requests` until close, writing replies to `replies`.
pub fn run_worker<R, W>(
    mut decoder: Box<dyn StreamDecoder>,
    requests: R,
    mut replies: W,
) -> Result<WorkerSummary>
where
    R: Read + Send + 'static,
    W: Write,
{
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("stream-worker-requests".into())
        .spawn(move || forward_requests(requests, tx))
        .context("spawn request reader")?;

    let mut summary = WorkerSummary::default();
    log::info!("StreamWorker: serving {}", decoder.describe());

    let mut awaiting_ack = false;
    loop {
        let incoming = if awaiting_ack {
            rx.recv().map_err(|_| TryRecvError::Disconnected)
        } else {
            rx.try_recv()
        };
        match incoming {
            Ok(Incoming::Request(Request::RequestFrame)) => {
                let reply = match decoder.retrieve() {
                    Ok(image) => {
                        summary.served += 1;
                        Reply::Frame(image)
                    }
                    Err(err) => {
                        summary.decode_errors += 1;
                        log::warn!("StreamWorker: decode failed: {:#}", err);
                        Reply::Error(format!("{:#}", err))
                    }
                };
                if let Err(err) = write_reply(&mut replies, &reply) {
                    log::warn!("StreamWorker: parent went away: {:#}", err);
                    break;
                }
                awaiting_ack = true;
            }
            Ok(Incoming::Request(Request::Acknowledge)) => awaiting_ack = false,
            Ok(Incoming::Request(Request::Close)) | Ok(Incoming::Closed) => break,
            Ok(Incoming::Failed(reason)) => {
                log::warn!("StreamWorker: request pipe failed: {}", reason);
                break;
            }
            Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => match decoder.grab() {
                Ok(()) => summary.grabbed += 1,
                Err(err) => {
                    log::warn!("StreamWorker: grab failed: {:#}", err);
                    std::thread::sleep(GRAB_ERROR_BACKOFF);
                }
            },
        }
    }

    decoder.release();
    log::info!(
        "StreamWorker: connection closed (grabbed={}, served={}, errors={})",
        summary.grabbed,
        summary.served,
        summary.decode_errors
    );
    Ok(summary)
}

fn forward_requests<R: Read>(mut requests: R, tx: mpsc::Sender<Incoming>) {
    loop {
        let incoming = match read_request(&mut requests) {
            Ok(Some(request)) => Incoming::Request(request),
            Ok(None) => Incoming::Closed,
            Err(err) => Incoming::Failed(format!("{:#}", err)),
        };
        let last = !matches!(
            incoming,
            Incoming::Request(Request::Acknowledge | Request::RequestFrame)
        );
        if tx.send(incoming).is_err() || last {
            return;
        }
    }
}
