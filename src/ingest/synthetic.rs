//! Synthetic frames for `stub://` descriptors.
//!
//! Every backend accepts a `stub://name?key=value` descriptor so it can run
//! without hardware or network peers. Query parameters understood here:
//! `width`, `height` (frame size before normalization). Backends read their own
//! extra parameters (delays, failure injection) through `StubParams::get`.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use url::Url;

pub const STUB_SCHEME: &str = "stub";

const DEFAULT_STUB_WIDTH: u32 = 640;
const DEFAULT_STUB_HEIGHT: u32 = 480;

pub fn is_stub(descriptor: &str) -> bool {
    descriptor.starts_with("stub://")
}

/// Parsed `stub://` descriptor.
#[derive(Clone, Debug)]
pub struct StubParams {
    pub name: String,
    pub width: u32,
    pub height: u32,
    url: Url,
}

impl StubParams {
    pub fn parse(descriptor: &str) -> Result<Self> {
        let url = Url::parse(descriptor).with_context(|| format!("parse {}", descriptor))?;
        if url.scheme() != STUB_SCHEME {
            return Err(anyhow!("expected a stub:// descriptor, got {}", descriptor));
        }
        let name = url.host_str().unwrap_or("synthetic").to_string();
        let mut params = Self {
            name,
            width: DEFAULT_STUB_WIDTH,
            height: DEFAULT_STUB_HEIGHT,
            url,
        };
        if let Some(width) = params.get::<u32>("width")? {
            params.width = width;
        }
        if let Some(height) = params.get::<u32>("height")? {
            params.height = height;
        }
        if params.width == 0 || params.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        Ok(params)
    }

    /// Typed lookup of a query parameter.
    pub fn get<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        let Some((_, raw)) = self.url.query_pairs().find(|(k, _)| k == key) else {
            return Ok(None);
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|_| anyhow!("invalid value '{}' for stub parameter {}", raw, key))
    }
}

/// Deterministic moving test pattern.
///
/// Frame `n` is a diagonal gradient shifted by `n`, with a bright marker column
/// near the left edge so mirroring is visible.
#[derive(Debug)]
pub struct SyntheticScene {
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticScene {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_count: 0,
        }
    }

    pub fn from_params(params: &StubParams) -> Self {
        Self::new(params.width, params.height)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn next_image(&mut self) -> RgbImage {
        self.frame_count += 1;
        render(self.width, self.height, self.frame_count)
    }
}

/// Pattern for frame number `n`. Exposed so tests can predict frames.
pub fn render(width: u32, height: u32, n: u64) -> RgbImage {
    let marker = width / 10;
    RgbImage::from_fn(width, height, |x, y| {
        if x == marker {
            return Rgb([255, 255, 255]);
        }
        let base = x as u64 + y as u64 + n;
        Rgb([
            (base % 256) as u8,
            ((base / 2) % 256) as u8,
            ((n * 37) % 256) as u8,
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_size_and_extra_parameters() -> Result<()> {
        let params = StubParams::parse("stub://court1?width=320&height=200&decode_delay_ms=50")?;
        assert_eq!(params.name, "court1");
        assert_eq!((params.width, params.height), (320, 200));
        assert_eq!(params.get::<u64>("decode_delay_ms")?, Some(50));
        assert_eq!(params.get::<u64>("missing")?, None);
        Ok(())
    }

    #[test]
    fn rejects_garbage_parameter_values() {
        let params = StubParams::parse("stub://cam?stall_after=soon").expect("parse");
        assert!(params.get::<u64>("stall_after").is_err());
    }

    #[test]
    fn scene_frames_differ_and_keep_size() {
        let mut scene = SyntheticScene::new(32, 16);
        let a = scene.next_image();
        let b = scene.next_image();
        assert_eq!(a.dimensions(), (32, 16));
        assert_ne!(a, b);
        assert_eq!(scene.frame_count(), 2);
        assert_eq!(b, render(32, 16, 2));
    }
}
