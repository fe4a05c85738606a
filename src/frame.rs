//! Frames and the shared "last frame" cell.
//!
//! - `Frame`: an RGB image plus its per-camera sequence number and capture time.
//! - `LatestFrame`: single-writer / many-reader cell holding the most recently
//!   acquired frame. Readers take an `Arc` snapshot, so a frame can never be
//!   observed half-overwritten.
//! - `normalize`: the resize-to-width then mirror step every backend applies.

use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

/// Default output width, matching what the court UI renders.
pub const DEFAULT_TARGET_WIDTH: u32 = 600;
/// Largest configurable output width (8K).
pub const MAX_TARGET_WIDTH: u32 = 7680;

/// One acquired frame (height x width x 3, RGB).
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic per-camera sequence number, starting at 1.
    pub seq: u64,
    pub captured_at: SystemTime,
}

impl Frame {
    pub fn new(image: RgbImage, seq: u64) -> Self {
        Self {
            image,
            seq,
            captured_at: SystemTime::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Resize to `target_width` preserving aspect ratio, then mirror horizontally
/// if `flip` is set. The order is fixed: resize first, mirror second.
pub fn normalize(image: RgbImage, target_width: u32, flip: bool) -> RgbImage {
    let (width, height) = image.dimensions();
    let resized = if width == target_width || width == 0 || target_width == 0 {
        image
    } else {
        let scaled_height = scaled_height(width, height, target_width);
        imageops::resize(&image, target_width, scaled_height, FilterType::Triangle)
    };
    if flip {
        imageops::flip_horizontal(&resized)
    } else {
        resized
    }
}

/// Height after scaling `width` to `target_width`, truncated, never below 1
/// and saturating at `u32::MAX`.
pub fn scaled_height(width: u32, height: u32, target_width: u32) -> u32 {
    let scaled = u64::from(height) * u64::from(target_width) / u64::from(width.max(1));
    u32::try_from(scaled).unwrap_or(u32::MAX).max(1)
}

/// Most recently acquired frame of one camera.
///
/// Written only by whoever drives `acquire()` (normally the acquisition loop);
/// read at any time by UI or scoring code through `snapshot()`.
#[derive(Debug, Default)]
pub struct LatestFrame {
    slot: RwLock<Option<Arc<Frame>>>,
    version: AtomicU64,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, frame: Arc<Frame>) {
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(frame);
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Copy-on-read handle to the current frame.
    pub fn snapshot(&self) -> Option<Arc<Frame>> {
        let slot = match self.slot.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slot.clone()
    }

    /// Number of stores so far. Lets readers skip redraws when nothing changed.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        let mut slot = match self.slot.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = None;
    }
}
