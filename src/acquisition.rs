//! Continuous acquisition driver.
//!
//! An `AcquisitionLoop` owns one `FrameSource` on a dedicated thread. It keeps
//! calling `acquire()`, which publishes each frame as the source's last frame,
//! and feeds the frame to the recording session while recording is on.
//! Consumers never call `acquire()` themselves; they read snapshots through a
//! `CameraHandle`.
//!
//! One loop per camera, so a stalled backend only ever stalls its own loop.
//! Stopping is cooperative: the flag is checked before every acquisition, so a
//! loop blocked inside a backend stops once that call returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::record::AppendOutcome;
use crate::source::FrameSource;

/// Pause after a failed acquisition before trying again.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(250);

const FAILURE_LOG_EVERY: u64 = 20;

pub struct AcquisitionLoop<S: FrameSource + 'static> {
    name: String,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<S>>,
}

impl<S: FrameSource + 'static> AcquisitionLoop<S> {
    /// Move `source` onto its own thread and start acquiring.
    ///
    /// The source should already be initialized; an uninitialized source ends
    /// the loop immediately.
    pub fn spawn(source: S) -> Result<Self> {
        let name = source.name().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let thread_stop = stop.clone();
        let thread_running = running.clone();
        let join = std::thread::Builder::new()
            .name(format!("acquire-{}", name))
            .spawn(move || {
                let source = run_loop(source, &thread_stop);
                thread_running.store(false, Ordering::SeqCst);
                source
            })
            .with_context(|| format!("spawn acquisition thread for {}", name))?;
        Ok(Self {
            name,
            stop,
            running,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the loop has ended on its own or been stopped.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the loop and hand the source back, still open.
    pub fn stop(mut self) -> Result<S> {
        self.stop.store(true, Ordering::SeqCst);
        let join = self
            .join
            .take()
            .ok_or_else(|| anyhow!("acquisition loop {} already stopped", self.name))?;
        join.join()
            .map_err(|_| anyhow!("acquisition thread for {} panicked", self.name))
    }

    /// Stop the loop and close the source.
    pub fn shutdown(self) -> Result<()> {
        let mut source = self.stop()?;
        source.close();
        Ok(())
    }
}

impl<S: FrameSource + 'static> Drop for AcquisitionLoop<S> {
    fn drop(&mut self) {
        // a detached loop still ends at its next iteration and drops the source
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn run_loop<S: FrameSource>(mut source: S, stop: &AtomicBool) -> S {
    let name = source.name().to_string();
    let mut failures = 0u64;
    let mut acquired = 0u64;
    log::info!("AcquisitionLoop[{}]: started", name);

    while !stop.load(Ordering::SeqCst) {
        if !source.is_initialized() {
            log::info!("AcquisitionLoop[{}]: source is not initialized, ending", name);
            break;
        }
        match source.acquire() {
            Ok(frame) => {
                acquired += 1;
                if failures > 0 {
                    log::info!(
                        "AcquisitionLoop[{}]: recovered after {} failed acquisitions",
                        name,
                        failures
                    );
                    failures = 0;
                }
                if source.record(&frame) == AppendOutcome::Aborted {
                    log::warn!("AcquisitionLoop[{}]: recording session aborted", name);
                }
            }
            Err(err) if err.is_transient() => {
                failures += 1;
                if failures == 1 || failures % FAILURE_LOG_EVERY == 0 {
                    log::warn!(
                        "AcquisitionLoop[{}]: acquire failed ({} in a row): {}",
                        name,
                        failures,
                        err
                    );
                }
                sleep_unless_stopped(stop, ERROR_BACKOFF);
            }
            Err(err) => {
                log::info!("AcquisitionLoop[{}]: ending: {}", name, err);
                break;
            }
        }
    }

    log::info!(
        "AcquisitionLoop[{}]: stopped after {} frames",
        name,
        acquired
    );
    source
}

fn sleep_unless_stopped(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BackendKind, Camera, CameraConfig, RuntimeSettings};

    fn camera(source: &str) -> Result<Camera> {
        let config = CameraConfig::new("loop", BackendKind::LocalDevice, source);
        Camera::from_config(&config, &RuntimeSettings::default())
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn loop_keeps_last_frame_fresh() -> Result<()> {
        let mut camera = camera("stub://loop?width=64&height=48")?;
        camera.initialize()?;
        let handle = camera.handle();
        let first = handle.frame_version();

        let acquisition = AcquisitionLoop::spawn(camera)?;
        assert!(wait_for(|| handle.frame_version() > first + 5));
        let camera = acquisition.stop()?;
        assert!(camera.is_initialized());
        assert!(camera.stats().frames_acquired > 5);
        Ok(())
    }

    #[test]
    fn uninitialized_source_ends_loop() -> Result<()> {
        let acquisition = AcquisitionLoop::spawn(camera("stub://loop")?)?;
        assert!(wait_for(|| !acquisition.is_running()));
        let camera = acquisition.stop()?;
        assert_eq!(camera.stats().frames_acquired, 0);
        Ok(())
    }

    #[test]
    fn shutdown_closes_source() -> Result<()> {
        let mut camera = camera("stub://loop?width=16&height=16")?;
        camera.initialize()?;
        let handle = camera.handle();
        AcquisitionLoop::spawn(camera)?.shutdown()?;
        assert!(!handle.is_initialized());
        Ok(())
    }
}
