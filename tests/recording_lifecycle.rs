use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use capture_kernel::record::{CopyRemuxer, SyntheticEncoder};
use capture_kernel::{
    CaptureError, EncoderFactory, EncoderHandle, EncoderSpec, RecordingConfig, RecordingController, Remuxer,
};

fn config(dir: &Path) -> RecordingConfig {
    RecordingConfig {
        dir: dir.to_path_buf(),
        width: 64,
        height: 48,
        fps: 50,
        bitrate: 2_000_000,
        settle: Duration::from_millis(5),
    }
}

fn controller(dir: &Path) -> RecordingController {
    RecordingController::new(config(dir), Box::new(SyntheticEncoder::new()), Box::new(CopyRemuxer))
}

struct FailingRemuxer;

impl Remuxer for FailingRemuxer {
    fn remux(&self, _raw: &Path, output: &Path, _fps: u32) -> capture_kernel::Result<()> {
        // leave a partial container behind
        std::fs::write(output, b"partial")?;
        Err(CaptureError::Encoder("ffmpeg exited with 1".to_string()))
    }
}

struct FailingEncoder;

impl EncoderFactory for FailingEncoder {
    fn start(&self, _spec: &EncoderSpec) -> capture_kernel::Result<Box<dyn EncoderHandle>> {
        Err(CaptureError::Encoder("no camera".to_string()))
    }
}

/// Counts finish calls and writes nothing.
struct SilentEncoder {
    finished: Arc<AtomicUsize>,
}

struct SilentHandle {
    finished: Arc<AtomicUsize>,
}

impl EncoderFactory for SilentEncoder {
    fn start(&self, _spec: &EncoderSpec) -> capture_kernel::Result<Box<dyn EncoderHandle>> {
        Ok(Box::new(SilentHandle {
            finished: self.finished.clone(),
        }))
    }
}

impl EncoderHandle for SilentHandle {
    fn finish(self: Box<Self>) -> capture_kernel::Result<()> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Copies the stream after a pause, flagging while it runs.
struct SlowRemuxer {
    busy: Arc<AtomicBool>,
    delay: Duration,
}

impl Remuxer for SlowRemuxer {
    fn remux(&self, raw: &Path, output: &Path, fps: u32) -> capture_kernel::Result<()> {
        self.busy.store(true, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let result = CopyRemuxer.remux(raw, output, fps);
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

/// Synthetic encoder that takes a while to come up.
struct SlowStartEncoder {
    entered: Arc<AtomicBool>,
    delay: Duration,
}

impl EncoderFactory for SlowStartEncoder {
    fn start(&self, spec: &EncoderSpec) -> capture_kernel::Result<Box<dyn EncoderHandle>> {
        self.entered.store(true, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        SyntheticEncoder::new().start(spec)
    }
}

fn wait_for(flag: &AtomicBool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "flag never set");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn start_stop_produces_container_and_removes_raw() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = controller(dir.path());

    let filename = recorder.start(Some("clip"))?;
    assert_eq!(filename, "clip.mp4");
    assert!(dir.path().join("clip.h264").exists());

    let status = recorder.status();
    assert!(status.active);
    assert_eq!(status.filename.as_deref(), Some("clip.mp4"));
    assert_eq!(status.resolution.as_deref(), Some("64x48"));
    assert_eq!(status.bitrate_mbps, Some(2.0));

    std::thread::sleep(Duration::from_millis(40));
    let done = recorder.stop()?;
    assert_eq!(done.filename, "clip.mp4");
    assert_eq!(done.path, dir.path().join("clip.mp4"));
    assert!(done.path.exists());
    assert!(!dir.path().join("clip.h264").exists());
    assert!(done.duration >= Duration::from_millis(40));
    assert!(!recorder.status().active);
    Ok(())
}

#[test]
fn double_start_is_rejected_without_touching_session() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = controller(dir.path());

    recorder.start(Some("first"))?;
    let err = recorder.start(Some("second")).unwrap_err();
    assert!(matches!(err, CaptureError::AlreadyRecording));
    assert_eq!(recorder.status().filename.as_deref(), Some("first.mp4"));
    assert!(!dir.path().join("second.h264").exists());

    recorder.stop()?;
    Ok(())
}

#[test]
fn stop_while_idle_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = controller(dir.path());
    assert!(matches!(recorder.stop(), Err(CaptureError::NotRecording)));

    recorder.start(None)?;
    recorder.stop()?;
    assert!(matches!(recorder.stop(), Err(CaptureError::NotRecording)));
    Ok(())
}

#[test]
fn default_name_uses_timestamp() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = controller(dir.path());
    let filename = recorder.start(None)?;
    assert!(filename.starts_with("video_"));
    assert!(filename.ends_with(".mp4"));
    recorder.stop()?;
    Ok(())
}

#[test]
fn remux_failure_keeps_raw_stream() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingController::new(
        config(dir.path()),
        Box::new(SyntheticEncoder::new()),
        Box::new(FailingRemuxer),
    );

    recorder.start(Some("broken"))?;
    std::thread::sleep(Duration::from_millis(20));
    let err = recorder.stop().unwrap_err();

    let raw = dir.path().join("broken.h264");
    match err {
        CaptureError::RemuxFailed { raw_path, reason } => {
            assert_eq!(raw_path, raw);
            assert!(reason.contains("ffmpeg exited with 1"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(raw.exists(), "raw stream must be retained");
    assert!(!dir.path().join("broken.mp4").exists(), "partial container removed");
    assert!(!recorder.status().active);
    Ok(())
}

#[test]
fn missing_raw_stream_is_reported() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let finished = Arc::new(AtomicUsize::new(0));
    let recorder = RecordingController::new(
        config(dir.path()),
        Box::new(SilentEncoder {
            finished: finished.clone(),
        }),
        Box::new(CopyRemuxer),
    );

    recorder.start(Some("empty"))?;
    let err = recorder.stop().unwrap_err();
    assert!(matches!(err, CaptureError::RemuxFailed { .. }));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn encoder_start_failure_stays_idle() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = RecordingController::new(config(dir.path()), Box::new(FailingEncoder), Box::new(CopyRemuxer));

    let err = recorder.start(Some("nope")).unwrap_err();
    assert!(matches!(err, CaptureError::Encoder(_)));
    assert!(!recorder.status().active);
    assert!(matches!(recorder.stop(), Err(CaptureError::NotRecording)));
    Ok(())
}

#[test]
fn existing_recordings_are_never_overwritten() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("taken.mp4"), b"keep")?;
    let recorder = controller(dir.path());

    let err = recorder.start(Some("taken.mp4")).unwrap_err();
    assert!(matches!(err, CaptureError::InvalidInput(_)));
    assert_eq!(std::fs::read(dir.path().join("taken.mp4"))?, b"keep");

    let err = recorder.start(Some("../escape")).unwrap_err();
    assert!(matches!(err, CaptureError::InvalidInput(_)));
    Ok(())
}

#[test]
fn shutdown_finalizes_active_recording() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = controller(dir.path());
    recorder.start(Some("late"))?;
    recorder.shutdown();
    assert!(!recorder.status().active);
    assert!(dir.path().join("late.mp4").exists());
    Ok(())
}

#[test]
fn dropping_active_controller_releases_encoder() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let finished = Arc::new(AtomicUsize::new(0));
    {
        let recorder = RecordingController::new(
            config(dir.path()),
            Box::new(SilentEncoder {
                finished: finished.clone(),
            }),
            Box::new(CopyRemuxer),
        );
        recorder.start(Some("dropped"))?;
    }
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn concurrent_stops_finalize_once() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let busy = Arc::new(AtomicBool::new(false));
    let recorder = RecordingController::new(
        config(dir.path()),
        Box::new(SyntheticEncoder::new()),
        Box::new(SlowRemuxer {
            busy: busy.clone(),
            delay: Duration::from_millis(300),
        }),
    );
    recorder.start(Some("race"))?;
    std::thread::sleep(Duration::from_millis(20));

    let barrier = Barrier::new(2);
    let results = std::thread::scope(|scope| {
        let stoppers: Vec<_> = (0..2)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    recorder.stop()
                })
            })
            .collect();

        // status answers while the remux is in flight
        wait_for(&busy);
        let started = Instant::now();
        let status = recorder.status();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!status.active);
        assert!(busy.load(Ordering::SeqCst), "remux finished before status was read");

        stoppers
            .into_iter()
            .map(|handle| handle.join().expect("stop panicked"))
            .collect::<Vec<_>>()
    });

    let finished: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let not_recording = results
        .iter()
        .filter(|r| matches!(r, Err(CaptureError::NotRecording)))
        .count();
    assert_eq!(finished.len(), 1);
    assert_eq!(not_recording, 1);
    assert!(finished[0].path.exists());
    assert!(!dir.path().join("race.h264").exists());
    Ok(())
}

#[test]
fn slow_encoder_start_does_not_block_status() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let entered = Arc::new(AtomicBool::new(false));
    let recorder = RecordingController::new(
        config(dir.path()),
        Box::new(SlowStartEncoder {
            entered: entered.clone(),
            delay: Duration::from_millis(300),
        }),
        Box::new(CopyRemuxer),
    );

    std::thread::scope(|scope| -> anyhow::Result<()> {
        let starter = scope.spawn(|| recorder.start(Some("slow")));
        wait_for(&entered);

        let started = Instant::now();
        assert!(!recorder.status().active);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(matches!(recorder.start(Some("other")), Err(CaptureError::AlreadyRecording)));
        assert!(matches!(recorder.stop(), Err(CaptureError::NotRecording)));

        let filename = starter.join().expect("start panicked")?;
        assert_eq!(filename, "slow.mp4");
        Ok(())
    })?;

    assert!(recorder.status().active);
    assert!(!dir.path().join("other.h264").exists());
    recorder.stop()?;
    Ok(())
}

#[test]
fn back_to_back_default_names_do_not_collide() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let recorder = controller(dir.path());

    let first = recorder.start(None)?;
    recorder.stop()?;
    let second = recorder.start(None)?;
    recorder.stop()?;

    assert_ne!(first, second);
    assert!(dir.path().join(&first).exists());
    assert!(dir.path().join(&second).exists());
    Ok(())
}
