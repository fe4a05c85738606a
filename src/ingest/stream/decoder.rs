//! Stream decoders owned by the isolated worker process.
//!
//! A decoder separates cheap `grab()` (advance the stream, discard) from
//! `retrieve()` (decode the current position into RGB). The worker grabs in a
//! tight loop while idle so internal buffers never accumulate stale frames.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::Duration;

use crate::ingest::synthetic::{is_stub, StubParams, SyntheticScene};

pub trait StreamDecoder: Send {
    /// Advance past the next raw unit without decoding it.
    fn grab(&mut self) -> Result<()>;

    /// Decode the freshest frame.
    fn retrieve(&mut self) -> Result<RgbImage>;

    /// Release the stream handle.
    fn release(&mut self);

    fn describe(&self) -> String;
}

/// Open the decoder matching `source`.
///
/// - `stub://...`: synthetic stream
/// - `rtsp://...`: GStreamer (feature `rtsp-gstreamer`)
/// - `http(s)://...`: MJPEG over HTTP (feature `stream-mjpeg`)
pub fn open_decoder(source: &str) -> Result<Box<dyn StreamDecoder>> {
    if is_stub(source) {
        return Ok(Box::new(SyntheticStreamDecoder::new(StubParams::parse(
            source,
        )?)?));
    }
    if source.starts_with("rtsp://") || source.starts_with("rtsps://") {
        return open_rtsp(source);
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        return open_mjpeg(source);
    }
    Err(anyhow!("unsupported stream source '{}'", source))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_rtsp(source: &str) -> Result<Box<dyn StreamDecoder>> {
    Ok(Box::new(super::gstreamer::GstreamerDecoder::open(source)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_rtsp(source: &str) -> Result<Box<dyn StreamDecoder>> {
    Err(anyhow!("{} requires the rtsp-gstreamer feature", source))
}

#[cfg(feature = "stream-mjpeg")]
fn open_mjpeg(source: &str) -> Result<Box<dyn StreamDecoder>> {
    Ok(Box::new(super::mjpeg::MjpegDecoder::open(source)?))
}

#[cfg(not(feature = "stream-mjpeg"))]
fn open_mjpeg(source: &str) -> Result<Box<dyn StreamDecoder>> {
    Err(anyhow!("{} requires the stream-mjpeg feature", source))
}

// ----------------------------------------------------------------------------
// Synthetic stream (stub://) for tests
// ----------------------------------------------------------------------------

/// Synthetic stream.
///
/// Extra stub parameters:
/// - `fps`: pacing of `grab()` (default 30)
/// - `decode_delay_ms`: sleep inside every `retrieve()` (slow decoder)
/// - `stall_after`: after N decoded frames, `retrieve()` never returns
/// - `crash_after`: after N decoded frames, the process exits abruptly
/// - `fail_open`: refuse to open, as an unreachable camera would
pub struct SyntheticStreamDecoder {
    params: StubParams,
    scene: SyntheticScene,
    grab_interval: Duration,
    decode_delay: Duration,
    stall_after: Option<u64>,
    crash_after: Option<u64>,
    decoded: u64,
}

impl SyntheticStreamDecoder {
    pub fn new(params: StubParams) -> Result<Self> {
        if params.get::<bool>("fail_open")?.unwrap_or(false) {
            return Err(anyhow!("synthetic stream {} refused to open", params.name));
        }
        let fps = params.get::<u32>("fps")?.unwrap_or(30).max(1);
        let decode_delay =
            Duration::from_millis(params.get::<u64>("decode_delay_ms")?.unwrap_or(0));
        Ok(Self {
            scene: SyntheticScene::from_params(&params),
            grab_interval: Duration::from_millis(1000 / fps as u64),
            decode_delay,
            stall_after: params.get("stall_after")?,
            crash_after: params.get("crash_after")?,
            decoded: 0,
            params,
        })
    }
}

impl StreamDecoder for SyntheticStreamDecoder {
    fn grab(&mut self) -> Result<()> {
        std::thread::sleep(self.grab_interval);
        let _ = self.scene.next_image();
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RgbImage> {
        if self.stall_after.is_some_and(|limit| self.decoded >= limit) {
            log::warn!("StreamWorker: {} stalling (simulated)", self.params.name);
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        if self.crash_after.is_some_and(|limit| self.decoded >= limit) {
            log::error!("StreamWorker: {} crashing (simulated)", self.params.name);
            std::process::exit(101);
        }
        if !self.decode_delay.is_zero() {
            std::thread::sleep(self.decode_delay);
        }
        self.decoded += 1;
        Ok(self.scene.next_image())
    }

    fn release(&mut self) {
        log::info!(
            "StreamWorker: released {} after {} frames",
            self.params.name,
            self.scene.frame_count()
        );
    }

    fn describe(&self) -> String {
        format!("stub://{} (synthetic)", self.params.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_stream_decodes_configured_size() -> Result<()> {
        let mut decoder = open_decoder("stub://rtsp_cam?width=64&height=48&fps=1000")?;
        decoder.grab()?;
        let image = decoder.retrieve()?;
        assert_eq!(image.dimensions(), (64, 48));
        decoder.release();
        Ok(())
    }

    #[test]
    fn fail_open_is_reported() {
        assert!(open_decoder("stub://dead?fail_open=true").is_err());
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(open_decoder("ftp://camera/stream").is_err());
    }
}
