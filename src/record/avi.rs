//! Motion-JPEG in AVI, muxed and demuxed by GStreamer.
//!
//! Writing: `appsrc (image/jpeg) ! avimux ! filesink`. Frames arrive already
//! JPEG-encoded and are timestamped at `n / fps`. `finish()` sends EOS and
//! waits for the muxer to write its index before the pipeline is torn down.
//!
//! Reading back: `filesrc ! avidemux ! appsink`, counting samples until EOS.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;

use crate::error::RecordError;

/// Upper bound on frames queued inside `appsrc` before `write_jpeg` blocks.
const MAX_QUEUED_BYTES: u64 = 32 * 1024 * 1024;
const FINISH_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BACK_TIMEOUT: Duration = Duration::from_secs(10);

fn pipeline_error(what: &str, err: impl std::fmt::Display) -> RecordError {
    RecordError::Pipeline(format!("{}: {}", what, err))
}

/// Streaming MJPEG/AVI writer with dimensions fixed at creation.
pub struct AviWriter {
    path: PathBuf,
    pipeline: gstreamer::Pipeline,
    appsrc: gstreamer_app::AppSrc,
    width: u32,
    height: u32,
    fps: u32,
    frames: u32,
    stopped: bool,
}

impl AviWriter {
    pub fn create(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self, RecordError> {
        gstreamer::init().map_err(|err| pipeline_error("initialize gstreamer", err))?;
        let fps = fps.max(1);

        let caps = gstreamer::Caps::builder("image/jpeg")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gstreamer::Fraction::new(fps as i32, 1))
            .build();
        let appsrc = gstreamer_app::AppSrc::builder()
            .name("frames")
            .caps(&caps)
            .format(gstreamer::Format::Time)
            .block(true)
            .max_bytes(MAX_QUEUED_BYTES)
            .build();
        let muxer = gstreamer::ElementFactory::make("avimux")
            .build()
            .map_err(|err| pipeline_error("create avimux", err))?;
        let filesink = gstreamer::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .property("async", false)
            .build()
            .map_err(|err| pipeline_error("create filesink", err))?;

        let pipeline = gstreamer::Pipeline::new();
        pipeline
            .add_many([appsrc.upcast_ref(), &muxer, &filesink])
            .map_err(|err| pipeline_error("assemble recording pipeline", err))?;
        gstreamer::Element::link_many([appsrc.upcast_ref(), &muxer, &filesink])
            .map_err(|err| pipeline_error("link recording pipeline", err))?;

        let mut writer = Self {
            path: path.to_path_buf(),
            pipeline,
            appsrc,
            width,
            height,
            fps,
            frames: 0,
            stopped: false,
        };
        if let Err(err) = writer.pipeline.set_state(gstreamer::State::Playing) {
            let reason = writer.bus_error().unwrap_or_else(|| err.to_string());
            writer.stop();
            return Err(RecordError::Pipeline(format!(
                "start recording to {}: {}",
                path.display(),
                reason
            )));
        }
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frames(&self) -> u32 {
        self.frames
    }

    /// Append one JPEG-encoded frame.
    pub fn write_jpeg(&mut self, jpeg: &[u8]) -> Result<(), RecordError> {
        if let Some(reason) = self.bus_error() {
            return Err(RecordError::Pipeline(reason));
        }
        let fps = u64::from(self.fps);
        let start = u64::from(self.frames) * gstreamer::ClockTime::SECOND.nseconds() / fps;
        let end = (u64::from(self.frames) + 1) * gstreamer::ClockTime::SECOND.nseconds() / fps;

        let mut buffer = gstreamer::Buffer::from_slice(jpeg.to_vec());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(gstreamer::ClockTime::from_nseconds(start));
            buffer.set_duration(gstreamer::ClockTime::from_nseconds(end - start));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|flow| pipeline_error("push frame", format!("{:?}", flow)))?;
        self.frames += 1;
        Ok(())
    }

    /// Send EOS, wait for the muxer to finalize the file and stop the pipeline.
    pub fn finish(mut self) -> Result<PathBuf, RecordError> {
        let outcome = self.drain();
        self.stop();
        outcome?;
        Ok(self.path.clone())
    }

    fn drain(&self) -> Result<(), RecordError> {
        self.appsrc
            .end_of_stream()
            .map_err(|flow| pipeline_error("end recording", format!("{:?}", flow)))?;
        let bus = self
            .pipeline
            .bus()
            .ok_or_else(|| RecordError::Pipeline("recording pipeline has no bus".to_string()))?;
        let timeout = gstreamer::ClockTime::from_mseconds(FINISH_TIMEOUT.as_millis() as u64);
        for msg in bus.iter_timed(timeout) {
            use gstreamer::MessageView;
            match msg.view() {
                MessageView::Eos(..) => return Ok(()),
                MessageView::Error(err) => {
                    return Err(pipeline_error(
                        &format!("finalize {}", self.path.display()),
                        err.error(),
                    ))
                }
                _ => {}
            }
        }
        Err(RecordError::Pipeline(format!(
            "timed out finalizing {}",
            self.path.display()
        )))
    }

    /// First pending error message on the bus, if any.
    fn bus_error(&self) -> Option<String> {
        let bus = self.pipeline.bus()?;
        while let Some(msg) = bus.pop() {
            if let gstreamer::MessageView::Error(err) = msg.view() {
                return Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
        }
        None
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!(
                "AviWriter: failed to stop pipeline for {}: {}",
                self.path.display(),
                err
            );
        }
    }
}

impl Drop for AviWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// What `probe` reads back from an AVI file.
#[derive(Clone, Debug, PartialEq)]
pub struct AviInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    pub fps: f64,
    /// Caps name of the video stream, e.g. `image/jpeg`.
    pub codec: String,
    pub file_size: u64,
}

/// Demux an AVI file and report its video stream.
///
/// The frame count is the number of samples `avidemux` delivers before EOS.
pub fn probe(path: &Path) -> Result<AviInfo> {
    gstreamer::init().context("initialize gstreamer")?;
    let file_size = std::fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let filesrc = gstreamer::ElementFactory::make("filesrc")
        .property("location", path.to_string_lossy().to_string())
        .build()
        .context("create filesrc")?;
    let demux = gstreamer::ElementFactory::make("avidemux")
        .build()
        .context("create avidemux")?;
    let appsink = gstreamer_app::AppSink::builder().sync(false).build();

    let pipeline = gstreamer::Pipeline::new();
    pipeline
        .add_many([&filesrc, &demux, appsink.upcast_ref()])
        .context("assemble read-back pipeline")?;
    filesrc.link(&demux).context("link filesrc to avidemux")?;

    let sink_pad = appsink
        .static_pad("sink")
        .context("appsink has no sink pad")?;
    demux.connect_pad_added(move |_, pad| {
        if pad.name().starts_with("video") && !sink_pad.is_linked() {
            if let Err(err) = pad.link(&sink_pad) {
                log::warn!("probe: failed to link {}: {:?}", pad.name(), err);
            }
        }
    });

    pipeline
        .set_state(gstreamer::State::Playing)
        .with_context(|| format!("read {}", path.display()))?;
    let read = read_samples(&pipeline, &appsink);
    let _ = pipeline.set_state(gstreamer::State::Null);
    let (frame_count, caps) = read.with_context(|| format!("read {}", path.display()))?;

    let caps = caps.ok_or_else(|| anyhow!("{} has no video frames", path.display()))?;
    let structure = caps
        .structure(0)
        .context("video caps carry no structure")?;
    let width = structure
        .get::<i32>("width")
        .map_err(|err| anyhow!("caps width: {}", err))?;
    let height = structure
        .get::<i32>("height")
        .map_err(|err| anyhow!("caps height: {}", err))?;
    let fps = structure
        .get::<gstreamer::Fraction>("framerate")
        .map(|rate| f64::from(rate.numer()) / f64::from(rate.denom().max(1)))
        .unwrap_or(0.0);

    Ok(AviInfo {
        width: u32::try_from(width).context("negative width")?,
        height: u32::try_from(height).context("negative height")?,
        frame_count,
        fps,
        codec: structure.name().to_string(),
        file_size,
    })
}

fn read_samples(
    pipeline: &gstreamer::Pipeline,
    appsink: &gstreamer_app::AppSink,
) -> Result<(u32, Option<gstreamer::Caps>)> {
    let deadline = Instant::now() + READ_BACK_TIMEOUT;
    let mut frames = 0u32;
    let mut caps = None;
    loop {
        if let Some(sample) = appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(100)) {
            if caps.is_none() {
                caps = sample.caps().map(|c| c.to_owned());
            }
            frames += 1;
            continue;
        }
        if appsink.is_eos() {
            return Ok((frames, caps));
        }
        if let Some(bus) = pipeline.bus() {
            while let Some(msg) = bus.pop() {
                if let gstreamer::MessageView::Error(err) = msg.view() {
                    return Err(anyhow!("gstreamer error: {}", err.error()));
                }
            }
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("timed out after {} frames", frames));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::jpeg::JpegEncoder;
    use image::{Rgb, RgbImage};
    use tempfile::tempdir;

    fn jpeg(width: u32, height: u32, shade: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([shade, 64, 128]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .encode_image(&image)
            .expect("encode jpeg");
        out
    }

    #[test]
    fn muxed_file_reads_back_through_avidemux() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("clip.avi");
        let mut writer = AviWriter::create(&path, 32, 24, 18)?;
        for shade in [10, 120, 250] {
            writer.write_jpeg(&jpeg(32, 24, shade))?;
        }
        assert_eq!(writer.frames(), 3);
        let path = writer.finish()?;

        let info = probe(&path)?;
        assert_eq!((info.width, info.height), (32, 24));
        assert_eq!(info.frame_count, 3);
        assert!((info.fps - 18.0).abs() < 1e-6, "{}", info.fps);
        assert_eq!(info.codec, "image/jpeg");
        assert_eq!(info.file_size, std::fs::metadata(&path)?.len());
        Ok(())
    }

    #[test]
    fn unwritable_location_fails_at_create() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("missing").join("clip.avi");
        assert!(matches!(
            AviWriter::create(&path, 16, 16, 18),
            Err(RecordError::Pipeline(_))
        ));
        Ok(())
    }

    #[test]
    fn probe_rejects_other_files() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"definitely not a RIFF container")?;
        assert!(probe(&path).is_err());
        Ok(())
    }
}
