//! Local capture device source.
//!
//! `LocalDeviceSource` reads frames synchronously from a locally attached
//! camera. There is no internal concurrency: `grab()` blocks the caller until
//! the driver hands over a frame.
//!
//! Devices are addressed by integer index (`/dev/video{index}`, requires the
//! `ingest-v4l2` feature) or by a `stub://` descriptor for synthetic frames
//! (`fps` paces synthetic reads the way a real sensor would).

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::time::Duration;

use super::synthetic::{is_stub, StubParams, SyntheticScene};

/// Settle time after opening a real device before the warm-up read.
pub const DEFAULT_DEVICE_WARMUP: Duration = Duration::from_secs(2);

/// How a local device is addressed.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceSpec {
    Index(u32),
    Synthetic(String),
}

impl DeviceSpec {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let trimmed = descriptor.trim();
        if is_stub(trimmed) {
            return Ok(Self::Synthetic(trimmed.to_string()));
        }
        trimmed
            .parse::<u32>()
            .map(Self::Index)
            .map_err(|_| anyhow!("local device descriptor must be an index, got '{}'", trimmed))
    }
}

/// Configuration for a local device source.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub spec: DeviceSpec,
    /// Overrides the settle time after open. `None` uses the per-backend default.
    pub warmup: Option<Duration>,
}

pub struct LocalDeviceSource {
    config: DeviceConfig,
    backend: Option<DeviceBackend>,
    frames_captured: u64,
}

enum DeviceBackend {
    /// Scene plus optional frame pacing (`fps` stub parameter).
    Synthetic(SyntheticScene, Option<Duration>),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(v4l2::V4l2Device),
}

impl LocalDeviceSource {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            backend: None,
            frames_captured: 0,
        }
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.config.spec
    }

    pub fn open(&mut self) -> Result<()> {
        let backend = match &self.config.spec {
            DeviceSpec::Synthetic(descriptor) => {
                let params = StubParams::parse(descriptor)?;
                log::info!(
                    "LocalDeviceSource: opened {} ({}x{}, synthetic)",
                    descriptor,
                    params.width,
                    params.height
                );
                let pace = params
                    .get::<u32>("fps")?
                    .filter(|fps| *fps > 0)
                    .map(|fps| Duration::from_secs(1) / fps);
                DeviceBackend::Synthetic(SyntheticScene::from_params(&params), pace)
            }
            DeviceSpec::Index(index) => open_indexed(*index)?,
        };
        self.backend = Some(backend);
        Ok(())
    }

    pub fn warmup(&self) -> Duration {
        if let Some(warmup) = self.config.warmup {
            return warmup;
        }
        match self.config.spec {
            DeviceSpec::Synthetic(_) => Duration::ZERO,
            DeviceSpec::Index(_) => DEFAULT_DEVICE_WARMUP,
        }
    }

    /// Blocking read of the next frame at native resolution.
    pub fn grab(&mut self) -> Result<RgbImage> {
        let backend = self
            .backend
            .as_mut()
            .ok_or_else(|| anyhow!("local device not opened"))?;
        let image = match backend {
            DeviceBackend::Synthetic(scene, pace) => {
                if let Some(pace) = pace {
                    std::thread::sleep(*pace);
                }
                scene.next_image()
            }
            #[cfg(feature = "ingest-v4l2")]
            DeviceBackend::V4l2(device) => device.grab()?,
        };
        self.frames_captured += 1;
        Ok(image)
    }

    pub fn release(&mut self) {
        if self.backend.take().is_some() {
            log::info!(
                "LocalDeviceSource: released {:?} after {} frames",
                self.config.spec,
                self.frames_captured
            );
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_indexed(index: u32) -> Result<DeviceBackend> {
    Ok(DeviceBackend::V4l2(v4l2::V4l2Device::open(index)?))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_indexed(index: u32) -> Result<DeviceBackend> {
    Err(anyhow!(
        "capture device {} requires the ingest-v4l2 feature",
        index
    ))
}

// ----------------------------------------------------------------------------
// V4L2 capture via libv4l
// ----------------------------------------------------------------------------

#[cfg(feature = "ingest-v4l2")]
mod v4l2 {
    use anyhow::{anyhow, Context, Result};
    use image::RgbImage;
    use ouroboros::self_referencing;

    use crate::ingest::pixel::{to_rgb_image, PixelFormat};

    const PREFERRED_WIDTH: u32 = 1280;
    const PREFERRED_HEIGHT: u32 = 720;

    pub(super) struct V4l2Device {
        path: String,
        state: DeviceState,
        width: u32,
        height: u32,
        format: PixelFormat,
    }

    #[self_referencing]
    struct DeviceState {
        device: v4l::Device,
        #[borrows(mut device)]
        #[covariant]
        stream: v4l::prelude::MmapStream<'this, v4l::Device>,
    }

    impl V4l2Device {
        pub(super) fn open(index: u32) -> Result<Self> {
            use v4l::buffer::Type;
            use v4l::video::Capture;

            let path = format!("/dev/video{}", index);
            let device = v4l::Device::new(index as usize)
                .with_context(|| format!("open v4l2 device {}", path))?;
            let mut format = device.format().context("read v4l2 format")?;
            format.width = PREFERRED_WIDTH;
            format.height = PREFERRED_HEIGHT;
            format.fourcc = v4l::FourCC::new(b"RGB3");

            let format = match device.set_format(&format) {
                Ok(format) => format,
                Err(err) => {
                    log::warn!("LocalDeviceSource: failed to set RGB3 on {}: {}", path, err);
                    device
                        .format()
                        .context("read v4l2 format after set failure")?
                }
            };
            let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
                anyhow!("{} negotiated unsupported pixel format {}", path, format.fourcc)
            })?;

            let state = DeviceStateBuilder {
                device,
                stream_builder: |device| {
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
                },
            }
            .try_build()?;

            log::info!(
                "LocalDeviceSource: opened {} ({}x{} {:?})",
                path,
                format.width,
                format.height,
                pixel_format
            );
            Ok(Self {
                path,
                state,
                width: format.width,
                height: format.height,
                format: pixel_format,
            })
        }

        pub(super) fn grab(&mut self) -> Result<RgbImage> {
            use v4l::io::traits::CaptureStream;

            let (width, height, format) = (self.width, self.height, self.format);
            let path = &self.path;
            self.state.with_mut(|fields| {
                let (buf, meta) = fields
                    .stream
                    .next()
                    .with_context(|| format!("capture frame from {}", path))?;
                let used = (meta.bytesused as usize).min(buf.len());
                let used = if used == 0 { buf.len() } else { used };
                to_rgb_image(&buf[..used], width, height, format)
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic(descriptor: &str) -> LocalDeviceSource {
        LocalDeviceSource::new(DeviceConfig {
            spec: DeviceSpec::parse(descriptor).expect("descriptor"),
            warmup: None,
        })
    }

    #[test]
    fn parses_index_and_stub_descriptors() -> Result<()> {
        assert_eq!(DeviceSpec::parse(" 2 ")?, DeviceSpec::Index(2));
        assert_eq!(
            DeviceSpec::parse("stub://court")?,
            DeviceSpec::Synthetic("stub://court".to_string())
        );
        assert!(DeviceSpec::parse("/dev/video0").is_err());
        Ok(())
    }

    #[test]
    fn synthetic_device_produces_native_frames() -> Result<()> {
        let mut source = synthetic("stub://court?width=320&height=240");
        source.open()?;
        let image = source.grab()?;
        assert_eq!(image.dimensions(), (320, 240));
        assert_eq!(source.frames_captured(), 1);
        assert_eq!(source.warmup(), Duration::ZERO);
        Ok(())
    }

    #[test]
    fn grab_before_open_fails() {
        let mut source = synthetic("stub://court");
        assert!(source.grab().is_err());
    }

    #[test]
    fn indexed_devices_wait_before_warmup_read() {
        let source = LocalDeviceSource::new(DeviceConfig {
            spec: DeviceSpec::Index(0),
            warmup: None,
        });
        assert_eq!(source.warmup(), DEFAULT_DEVICE_WARMUP);
    }

    #[cfg(not(feature = "ingest-v4l2"))]
    #[test]
    fn indexed_device_without_v4l2_is_unavailable() {
        let mut source = LocalDeviceSource::new(DeviceConfig {
            spec: DeviceSpec::Index(0),
            warmup: None,
        });
        assert!(source.open().is_err());
    }
}
