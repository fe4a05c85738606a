//! Frame acquisition backends.
//!
//! Three transports, each with its own concurrency hazard:
//! - Local capture devices (`device`): synchronous reads in the caller's thread.
//!   Real devices need the `ingest-v4l2` feature.
//! - Pull streams (`stream`): the blocking decoder runs in an isolated worker
//!   process so a stall or crash never reaches the parent.
//! - Push streams (`push`): a background receive worker keeps only the
//!   freshest frame.
//!
//! Every backend also accepts `stub://` descriptors (`synthetic`) for tests and
//! demos without hardware or network peers.
//!
//! Backends hand out native-resolution RGB images. Resizing and mirroring
//! happen once, at the `Camera` boundary.

pub mod device;
#[cfg(any(feature = "ingest-v4l2", test))]
pub(crate) mod pixel;
pub mod push;
pub mod stream;
pub mod synthetic;

pub use device::{DeviceConfig, DeviceSpec, LocalDeviceSource};
pub use push::{PushConfig, PushEndpoint, PushStats, PushSubscriberSource};
pub use stream::{ProcessIsolatedStreamSource, StreamConfig};
