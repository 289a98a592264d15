//! Acquisition loop.
//!
//! One dedicated thread pulls frames from a `SensorSource` and publishes them
//! into the shared `FrameBuffer`. Sensor failures are absorbed: the loop
//! records them, sleeps a short fixed backoff and tries again. Readers never
//! see these hiccups because the last good frame stays in the buffer.
//!
//! `Stopped -> Running -> Stopped`: `AcquisitionLoop::spawn` starts the thread,
//! `AcquisitionHandle::stop` signals cancellation and joins. The flag is
//! checked before every read and after every backoff, and each read is bounded
//! by the configured timeout, so cancellation lands within one attempt cycle.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{CaptureError, Result};
use crate::frame::FrameBuffer;
use crate::ingest::{SensorConfig, SensorSource};

/// Consecutive failures after which the source is reconnected.
const RECONNECT_AFTER_FAILURES: u32 = 100;

#[derive(Clone, Debug)]
pub struct AcquisitionConfig {
    /// Upper bound on a single sensor read.
    pub timeout: Duration,
    /// Pause after a failed read or connect.
    pub backoff: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            backoff: Duration::from_millis(10),
        }
    }
}

impl AcquisitionConfig {
    pub fn for_sensor(sensor: &SensorConfig) -> Self {
        Self {
            timeout: sensor.default_timeout(),
            ..Self::default()
        }
    }
}

/// Counters shared between the loop and its observers.
#[derive(Debug, Default)]
pub struct AcquisitionStats {
    running: AtomicBool,
    frames_captured: AtomicU64,
    errors: AtomicU64,
    source_healthy: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl AcquisitionStats {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Health reported by the source after its most recent read.
    pub fn source_healthy(&self) -> bool {
        self.source_healthy.load(Ordering::SeqCst)
    }

    /// Most recent sensor failure, kept until the next one.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_error(&self, err: &CaptureError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err.to_string());
    }
}

pub struct AcquisitionLoop;

impl AcquisitionLoop {
    /// Move `source` onto a new thread and start publishing into `buffer`.
    ///
    /// The source is connected on the acquisition thread; a failed connect is
    /// retried like any other sensor failure.
    pub fn spawn<S>(source: S, buffer: Arc<FrameBuffer>, config: AcquisitionConfig) -> Result<AcquisitionHandle>
    where
        S: SensorSource + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(AcquisitionStats::default());
        stats.running.store(true, Ordering::SeqCst);

        let shutdown_thread = shutdown.clone();
        let stats_thread = stats.clone();
        let join = std::thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || {
                let device = source.device().to_string();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    run_loop(source, &buffer, &config, &shutdown_thread, &stats_thread)
                }));
                if outcome.is_err() {
                    log::error!("acquisition loop for {} panicked; sensor released", device);
                }
                stats_thread.running.store(false, Ordering::SeqCst);
            })
            .map_err(|err| {
                stats.running.store(false, Ordering::SeqCst);
                CaptureError::Io(err)
            })?;

        Ok(AcquisitionHandle {
            shutdown,
            stats,
            join: Some(join),
        })
    }
}

fn run_loop<S: SensorSource>(
    mut source: S,
    buffer: &FrameBuffer,
    config: &AcquisitionConfig,
    shutdown: &AtomicBool,
    stats: &AcquisitionStats,
) {
    let mut connected = false;
    let mut consecutive_failures = 0u32;
    let mut warnings = WarnLimiter::new(Duration::from_secs(1));

    log::info!(
        "acquisition started on {} (timeout {:?}, backoff {:?})",
        source.device(),
        config.timeout,
        config.backoff
    );

    while !shutdown.load(Ordering::SeqCst) {
        if !connected {
            match source.connect() {
                Ok(()) => {
                    connected = true;
                    consecutive_failures = 0;
                }
                Err(err) => {
                    stats.record_error(&err);
                    warnings.warn(|| format!("connect {} failed: {}", source.device(), err));
                    std::thread::sleep(config.backoff);
                    continue;
                }
            }
        }

        match source.next_frame(config.timeout) {
            Ok(frame) => {
                stats.source_healthy.store(source.is_healthy(), Ordering::SeqCst);
                buffer.publish(frame);
                stats.frames_captured.fetch_add(1, Ordering::Relaxed);
                consecutive_failures = 0;
            }
            Err(err) => {
                stats.record_error(&err);
                stats.source_healthy.store(source.is_healthy(), Ordering::SeqCst);
                consecutive_failures += 1;
                warnings.warn(|| format!("capture error on {}: {}", source.device(), err));
                // malformed buffers and the like will not clear on their own
                if !err.is_transient() || consecutive_failures >= RECONNECT_AFTER_FAILURES {
                    log::warn!(
                        "{} consecutive capture failures on {} ({}); reconnecting",
                        consecutive_failures,
                        source.device(),
                        err
                    );
                    connected = false;
                    consecutive_failures = 0;
                }
                std::thread::sleep(config.backoff);
            }
        }
    }
    stats.source_healthy.store(false, Ordering::SeqCst);

    log::info!(
        "acquisition stopped on {} ({} frames, {} errors)",
        source.device(),
        stats.frames_captured(),
        stats.errors()
    );
}

/// Collapses bursts of identical warnings into one line per interval.
struct WarnLimiter {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl WarnLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    fn warn(&mut self, message: impl FnOnce() -> String) {
        let due = self.last.map_or(true, |last| last.elapsed() >= self.interval);
        if !due {
            self.suppressed += 1;
            return;
        }
        if self.suppressed > 0 {
            log::warn!("{} ({} similar suppressed)", message(), self.suppressed);
        } else {
            log::warn!("{}", message());
        }
        self.last = Some(Instant::now());
        self.suppressed = 0;
    }
}

/// Running acquisition loop. Dropping the handle stops the loop.
#[derive(Debug)]
pub struct AcquisitionHandle {
    shutdown: Arc<AtomicBool>,
    stats: Arc<AcquisitionStats>,
    join: Option<JoinHandle<()>>,
}

impl AcquisitionHandle {
    pub fn stats(&self) -> &AcquisitionStats {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.stats.is_running()
    }

    /// Signal cancellation and wait for the thread to release the sensor.
    pub fn stop(mut self) -> Result<()> {
        self.signal_and_join()
    }

    fn signal_and_join(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| CaptureError::sensor("acquisition thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        if let Err(err) = self.signal_and_join() {
            log::error!("acquisition shutdown: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    /// Fails every other read; counts drops to prove the sensor is released.
    struct FlakySource {
        reads: u64,
        dropped: Arc<AtomicBool>,
    }

    impl FlakySource {
        fn new(dropped: Arc<AtomicBool>) -> Self {
            Self { reads: 0, dropped }
        }
    }

    impl SensorSource for FlakySource {
        fn device(&self) -> &str {
            "test://flaky"
        }

        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<Frame> {
            self.reads += 1;
            if self.reads % 2 == 0 {
                return Err(CaptureError::sensor("flaky read"));
            }
            Ok(Frame::new(vec![self.reads as u8; 12], 2, 2)?.with_sequence(self.reads))
        }

        fn is_healthy(&self) -> bool {
            self.reads % 2 == 1
        }
    }

    impl Drop for FlakySource {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn failures_are_absorbed_and_frames_keep_flowing() {
        let dropped = Arc::new(AtomicBool::new(false));
        let buffer = Arc::new(FrameBuffer::new());
        let handle = AcquisitionLoop::spawn(
            FlakySource::new(dropped.clone()),
            buffer.clone(),
            AcquisitionConfig {
                timeout: Duration::from_millis(50),
                backoff: Duration::from_millis(1),
            },
        )
        .unwrap();

        assert!(wait_for(|| handle.stats().frames_captured() >= 5));
        assert!(handle.stats().errors() >= 4);
        assert!(handle.is_running());
        assert!(buffer.snapshot().is_some());
        assert_eq!(handle.stats().last_error().as_deref(), Some("sensor unavailable: flaky read"));

        handle.stop().unwrap();
        assert!(dropped.load(Ordering::SeqCst), "sensor must be released on stop");
    }

    /// Every read returns a frame of the wrong size.
    struct MalformedSource {
        connects: Arc<AtomicU64>,
    }

    impl SensorSource for MalformedSource {
        fn device(&self) -> &str {
            "test://malformed"
        }

        fn connect(&mut self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<Frame> {
            Frame::new(vec![0; 5], 2, 2)
        }

        fn is_healthy(&self) -> bool {
            false
        }
    }

    #[test]
    fn non_transient_errors_force_reconnect() {
        let connects = Arc::new(AtomicU64::new(0));
        let handle = AcquisitionLoop::spawn(
            MalformedSource {
                connects: connects.clone(),
            },
            Arc::new(FrameBuffer::new()),
            AcquisitionConfig {
                timeout: Duration::from_millis(50),
                backoff: Duration::from_millis(1),
            },
        )
        .unwrap();

        assert!(wait_for(|| connects.load(Ordering::SeqCst) >= 3));
        assert!(!handle.stats().source_healthy());
        assert!(handle
            .stats()
            .last_error()
            .map_or(false, |msg| msg.starts_with("invalid input")));
        handle.stop().unwrap();
    }

    struct PanickingSource {
        dropped: Arc<AtomicBool>,
    }

    impl SensorSource for PanickingSource {
        fn device(&self) -> &str {
            "test://panic"
        }

        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self, _timeout: Duration) -> Result<Frame> {
            panic!("driver bug");
        }

        fn is_healthy(&self) -> bool {
            false
        }
    }

    impl Drop for PanickingSource {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn panicking_source_is_released() {
        let dropped = Arc::new(AtomicBool::new(false));
        let handle = AcquisitionLoop::spawn(
            PanickingSource {
                dropped: dropped.clone(),
            },
            Arc::new(FrameBuffer::new()),
            AcquisitionConfig::default(),
        )
        .unwrap();

        assert!(wait_for(|| !handle.is_running()));
        assert!(dropped.load(Ordering::SeqCst));
        handle.stop().unwrap();
    }

    #[test]
    fn warn_limiter_suppresses_bursts() {
        let mut limiter = WarnLimiter::new(Duration::from_secs(60));
        let mut rendered = 0;
        for _ in 0..10 {
            limiter.warn(|| {
                rendered += 1;
                "boom".to_string()
            });
        }
        assert_eq!(rendered, 1);
        assert_eq!(limiter.suppressed, 9);
    }
}
