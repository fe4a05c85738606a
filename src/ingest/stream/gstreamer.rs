//! RTSP decoding through GStreamer.

use anyhow::{anyhow, Context, Result};
use gstreamer::prelude::*;
use image::RgbImage;
use std::time::Duration;

use super::decoder::StreamDecoder;

const GRAB_TIMEOUT: Duration = Duration::from_millis(200);
const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct GstreamerDecoder {
    url: String,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    latest: Option<gstreamer::Sample>,
}

impl GstreamerDecoder {
    pub(crate) fn open(url: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!("StreamWorker: connected to {}", url);

        Ok(Self {
            url: url.to_string(),
            pipeline,
            appsink,
            latest: None,
        })
    }

    fn poll_bus(&self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("{} reached end of stream", self.url)),
                _ => {}
            }
        }
        Ok(())
    }
}

impl StreamDecoder for GstreamerDecoder {
    fn grab(&mut self) -> Result<()> {
        self.poll_bus()?;
        let timeout = gstreamer::ClockTime::from_mseconds(GRAB_TIMEOUT.as_millis() as u64);
        if let Some(sample) = self.appsink.try_pull_sample(timeout) {
            self.latest = Some(sample);
        }
        Ok(())
    }

    fn retrieve(&mut self) -> Result<RgbImage> {
        self.poll_bus()?;
        let sample = match self.latest.take() {
            Some(sample) => sample,
            None => {
                let timeout =
                    gstreamer::ClockTime::from_mseconds(RETRIEVE_TIMEOUT.as_millis() as u64);
                self.appsink
                    .try_pull_sample(timeout)
                    .ok_or_else(|| anyhow!("RTSP stream stalled"))?
            }
        };
        sample_to_image(&sample)
    }

    fn release(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("StreamWorker: failed to stop pipeline for {}: {}", self.url, err);
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

fn sample_to_image(sample: &gstreamer::Sample) -> Result<RgbImage> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    let pixels = if stride == row_bytes {
        data.get(..row_bytes * height as usize)
            .context("RTSP buffer shorter than frame")?
            .to_vec()
    } else {
        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let start = row * stride;
            pixels.extend_from_slice(
                data.get(start..start + row_bytes)
                    .context("RTSP buffer row is out of bounds")?,
            );
        }
        pixels
    };

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| anyhow!("RTSP buffer does not match {}x{}", width, height))
}
