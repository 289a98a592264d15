//! Recording lifecycle.
//!
//! `Idle --start--> Starting --> Active --stop--> Idle`
//!
//! While active, an encoder taps the sensor on its own pipeline and writes an
//! H.264 elementary stream to `<dir>/<stem>.h264`. Stopping flushes the
//! encoder, copies the stream into `<dir>/<stem>.mp4` without re-encoding and
//! deletes the raw file. If any of that fails the raw file stays on disk and
//! the caller is told where it is.
//!
//! Transitions hold the controller mutex. Encoder start, flush and remux run
//! outside it, so `status()` stays responsive while a pipeline comes up or a
//! long remux runs. `Starting` reports as idle but refuses a second `start()`.

mod encoder;
mod remux;

pub use encoder::{SyntheticEncoder, UnavailableEncoder};
#[cfg(feature = "encoder-gstreamer")]
pub use encoder::GstreamerEncoder;
#[cfg(feature = "remux-ffmpeg")]
pub use remux::FfmpegRemuxer;
pub use remux::{CopyRemuxer, FfmpegCliRemuxer};

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{CaptureError, Result};

const RAW_EXTENSION: &str = "h264";
const CONTAINER_EXTENSION: &str = "mp4";

// ----------------------------------------------------------------------------
// Seams
// ----------------------------------------------------------------------------

/// What an encoder is asked to produce.
#[derive(Clone, Debug, PartialEq)]
pub struct EncoderSpec {
    pub raw_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Bits per second.
    pub bitrate: u32,
}

/// Opens a continuous encoder writing an H.264 elementary stream.
pub trait EncoderFactory: Send + Sync {
    fn start(&self, spec: &EncoderSpec) -> Result<Box<dyn EncoderHandle>>;
}

/// A running encoder. Dropping it without `finish` must still release the
/// capture hardware.
pub trait EncoderHandle: Send {
    /// Flush, end the stream and close the output file.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Copies an elementary stream into a container.
pub trait Remuxer: Send + Sync {
    fn remux(&self, raw: &Path, output: &Path, fps: u32) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Types
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct RecordingConfig {
    pub dir: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: u32,
    /// Pause between encoder flush and remux.
    pub settle: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("videos"),
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate: 15_000_000,
            settle: Duration::from_millis(300),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecordingStatus {
    pub active: bool,
    pub filename: Option<String>,
    pub elapsed_seconds: Option<f64>,
    pub resolution: Option<String>,
    pub bitrate_mbps: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FinishedRecording {
    pub filename: String,
    pub path: PathBuf,
    pub duration: Duration,
}

struct ActiveSession {
    filename: String,
    raw_path: PathBuf,
    final_path: PathBuf,
    started_at: Instant,
    encoder: Box<dyn EncoderHandle>,
}

enum RecordingState {
    Idle,
    /// Name reserved, encoder still coming up.
    Starting,
    Active(ActiveSession),
}

impl RecordingState {
    fn take(&mut self) -> Option<ActiveSession> {
        if !matches!(self, RecordingState::Active(_)) {
            return None;
        }
        match std::mem::replace(self, RecordingState::Idle) {
            RecordingState::Active(session) => Some(session),
            _ => None,
        }
    }
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

pub struct RecordingController {
    config: RecordingConfig,
    encoders: Box<dyn EncoderFactory>,
    remuxer: Box<dyn Remuxer>,
    state: Mutex<RecordingState>,
}

impl RecordingController {
    pub fn new(config: RecordingConfig, encoders: Box<dyn EncoderFactory>, remuxer: Box<dyn Remuxer>) -> Self {
        Self {
            config,
            encoders,
            remuxer,
            state: Mutex::new(RecordingState::Idle),
        }
    }

    pub fn config(&self) -> &RecordingConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lock(), RecordingState::Active(_))
    }

    /// Start recording. Returns the container filename the recording will
    /// have once stopped.
    ///
    /// The encoder is brought up without holding the state lock, so `status()`
    /// keeps answering while a slow pipeline starts. The name is reserved
    /// first and a concurrent `start()` sees `AlreadyRecording`.
    pub fn start(&self, name: Option<&str>) -> Result<String> {
        let (stem, raw_path, final_path) = {
            let mut state = self.lock();
            if !matches!(*state, RecordingState::Idle) {
                return Err(CaptureError::AlreadyRecording);
            }

            let stem = match name {
                Some(name) => validate_name(name)?,
                None => default_stem(),
            };
            let raw_path = self.config.dir.join(format!("{}.{}", stem, RAW_EXTENSION));
            let final_path = self.config.dir.join(format!("{}.{}", stem, CONTAINER_EXTENSION));
            for path in [&final_path, &raw_path] {
                if path.exists() {
                    return Err(CaptureError::invalid(format!(
                        "recording {} already exists",
                        path.display()
                    )));
                }
            }
            *state = RecordingState::Starting;
            (stem, raw_path, final_path)
        };

        let encoder = self.start_encoder(&raw_path);

        let mut state = self.lock();
        let encoder = match encoder {
            Ok(encoder) => encoder,
            Err(err) => {
                *state = RecordingState::Idle;
                return Err(err);
            }
        };
        let filename = format!("{}.{}", stem, CONTAINER_EXTENSION);
        log::info!(
            "recording started: {} ({}x{} @ {} fps, {:.1} Mbps)",
            raw_path.display(),
            self.config.width,
            self.config.height,
            self.config.fps,
            self.config.bitrate as f64 / 1_000_000.0
        );
        *state = RecordingState::Active(ActiveSession {
            filename: filename.clone(),
            raw_path,
            final_path,
            started_at: Instant::now(),
            encoder,
        });
        Ok(filename)
    }

    fn start_encoder(&self, raw_path: &Path) -> Result<Box<dyn EncoderHandle>> {
        std::fs::create_dir_all(&self.config.dir)?;
        let spec = EncoderSpec {
            raw_path: raw_path.to_path_buf(),
            width: self.config.width,
            height: self.config.height,
            fps: self.config.fps,
            bitrate: self.config.bitrate,
        };
        self.encoders.start(&spec).map_err(|err| match err {
            CaptureError::Encoder(msg) => CaptureError::Encoder(msg),
            other => CaptureError::Encoder(other.to_string()),
        })
    }

    /// Stop recording and produce the container file.
    ///
    /// Only one caller takes the session; a concurrent `stop()`, or one that
    /// lands while the encoder is still starting, gets `NotRecording`.
    pub fn stop(&self) -> Result<FinishedRecording> {
        let session = self.lock().take().ok_or(CaptureError::NotRecording)?;
        self.finish_session(session)
    }

    pub fn status(&self) -> RecordingStatus {
        match &*self.lock() {
            RecordingState::Idle | RecordingState::Starting => RecordingStatus::default(),
            RecordingState::Active(session) => RecordingStatus {
                active: true,
                filename: Some(session.filename.clone()),
                elapsed_seconds: Some(session.started_at.elapsed().as_secs_f64()),
                resolution: Some(format!("{}x{}", self.config.width, self.config.height)),
                bitrate_mbps: Some(self.config.bitrate as f64 / 1_000_000.0),
            },
        }
    }

    /// Stop any active recording, logging the outcome.
    pub fn shutdown(&self) {
        match self.stop() {
            Ok(done) => log::info!("recording finalized on shutdown: {}", done.path.display()),
            Err(CaptureError::NotRecording) => {}
            Err(err) => log::error!("recording cleanup on shutdown: {}", err),
        }
    }

    fn finish_session(&self, session: ActiveSession) -> Result<FinishedRecording> {
        let ActiveSession {
            filename,
            raw_path,
            final_path,
            started_at,
            encoder,
        } = session;
        let duration = started_at.elapsed();

        let failed = |reason: String| {
            log::error!("recording {} not finalized: {}", filename, reason);
            CaptureError::RemuxFailed {
                raw_path: raw_path.clone(),
                reason,
            }
        };

        if let Err(err) = encoder.finish() {
            return Err(failed(format!("encoder flush: {}", err)));
        }
        std::thread::sleep(self.config.settle);

        if !raw_path.exists() {
            return Err(failed("raw stream was not written".to_string()));
        }

        let remuxed = self
            .remuxer
            .remux(&raw_path, &final_path, self.config.fps)
            .and_then(|()| {
                if final_path.exists() {
                    Ok(())
                } else {
                    Err(CaptureError::Encoder("remuxer produced no output".to_string()))
                }
            });
        if let Err(err) = remuxed {
            if final_path.exists() {
                if let Err(rm) = std::fs::remove_file(&final_path) {
                    log::warn!("remove partial {}: {}", final_path.display(), rm);
                }
            }
            return Err(failed(err.to_string()));
        }

        if let Err(err) = std::fs::remove_file(&raw_path) {
            log::warn!("remove raw stream {}: {}", raw_path.display(), err);
        }
        log::info!(
            "recording saved: {} ({:.1}s)",
            final_path.display(),
            duration.as_secs_f64()
        );
        Ok(FinishedRecording {
            filename,
            path: final_path,
            duration,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        if let Some(session) = self.lock().take() {
            log::warn!(
                "recording {} dropped while active; raw stream left at {}",
                session.filename,
                session.raw_path.display()
            );
            if let Err(err) = session.encoder.finish() {
                log::error!("encoder release on drop: {}", err);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Naming
// ----------------------------------------------------------------------------

/// `video_YYYYMMDD_HHMMSS_mmm` in local time.
fn default_stem() -> String {
    chrono::Local::now().format("video_%Y%m%d_%H%M%S_%3f").to_string()
}

/// Strip an optional `.mp4` extension and reject anything that is not a plain
/// file stem.
fn validate_name(name: &str) -> Result<String> {
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

    let stem = name
        .strip_suffix(".mp4")
        .or_else(|| name.strip_suffix(".MP4"))
        .unwrap_or(name);
    if stem.len() > 128 || !re.is_match(stem) {
        return Err(CaptureError::invalid(format!("invalid recording name {:?}", name)));
    }
    Ok(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert_eq!(validate_name("clip").unwrap(), "clip");
        assert_eq!(validate_name("clip_01.mp4").unwrap(), "clip_01");
        assert_eq!(validate_name("a.b-c").unwrap(), "a.b-c");
        for bad in ["", ".mp4", "../escape", "a/b", ".hidden", "-dash", "sp ace", "x\\y"] {
            assert!(validate_name(bad).is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn default_stem_has_timestamp_shape() {
        let stem = default_stem();
        assert!(stem.starts_with("video_"));
        assert_eq!(stem.len(), "video_YYYYMMDD_HHMMSS_mmm".len());
        assert!(validate_name(&stem).is_ok());
    }

    #[test]
    fn idle_status_is_empty() {
        let controller = RecordingController::new(
            RecordingConfig::default(),
            Box::new(SyntheticEncoder::new()),
            Box::new(CopyRemuxer),
        );
        assert_eq!(controller.status(), RecordingStatus::default());
        assert!(matches!(controller.stop(), Err(CaptureError::NotRecording)));
        controller.shutdown();
    }
}
