//! Error taxonomy for the capture core.
//!
//! Acquisition failures (`SensorUnavailable`) are absorbed by the acquisition
//! loop and never reach facade callers. Everything else is returned
//! synchronously and never retried automatically.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// Transient sensor failure (timeout, disconnected device, decode error).
    #[error("sensor unavailable: {0}")]
    SensorUnavailable(String),

    /// Malformed arguments: zero-area frames, bad target sizes, bad parameters.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("already recording")]
    AlreadyRecording,

    #[error("not recording")]
    NotRecording,

    /// The container step failed. The raw elementary stream is kept at `raw_path`.
    #[error("remux failed, raw stream kept at {}: {reason}", raw_path.display())]
    RemuxFailed { raw_path: PathBuf, reason: String },

    /// No frame has been published yet.
    #[error("no frame available")]
    NoFrame,

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl CaptureError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub(crate) fn sensor(msg: impl Into<String>) -> Self {
        Self::SensorUnavailable(msg.into())
    }

    /// True for failures the acquisition loop treats as transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SensorUnavailable(_) | Self::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remux_failure_names_raw_path() {
        let err = CaptureError::RemuxFailed {
            raw_path: PathBuf::from("/tmp/video_1.h264"),
            reason: "ffmpeg exited with 1".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/video_1.h264"));
        assert!(msg.contains("ffmpeg exited with 1"));
    }

    #[test]
    fn only_sensor_errors_are_transient() {
        assert!(CaptureError::sensor("timeout").is_transient());
        assert!(!CaptureError::invalid("zero width").is_transient());
        assert!(!CaptureError::NotRecording.is_transient());
    }
}
