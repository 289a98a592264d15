//! Capture Kernel
//!
//! Live camera acquisition for an on-device object detector.
//!
//! # Architecture
//!
//! One acquisition thread pulls frames from the sensor into a single-slot
//! buffer. Any number of readers take copies of the latest frame and, on
//! demand, run it through a reversible preprocessing pipeline:
//!
//! 1. **Contrast stretch**: per-channel percentile remap to the full range.
//! 2. **Letterbox**: aspect-preserving resize onto a fixed canvas, with the
//!    geometry kept so detections map back onto the original frame.
//! 3. **Normalize**: per-channel mean/std into a channel-major tensor.
//!
//! Recording runs on its own encoder pipeline and never touches the frame
//! buffer; stopping it remuxes the H.264 stream into an MP4 container.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the latest-frame `FrameBuffer`
//! - `ingest`: sensor sources (synthetic, V4L2, GStreamer/libcamera)
//! - `acquisition`: the producer thread
//! - `preprocess`: contrast stretch, letterbox, normalization
//! - `record`: recording state machine, encoders, remuxers
//! - `service`: `CaptureService`, the facade over all of the above
//! - `config`: file + environment configuration

pub mod acquisition;
pub mod config;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod preprocess;
pub mod record;
pub mod service;

pub use acquisition::{AcquisitionConfig, AcquisitionHandle, AcquisitionLoop, AcquisitionStats};
pub use config::CaptureConfig;
pub use error::{CaptureError, Result};
pub use frame::{Frame, FrameBuffer};
pub use ingest::{open_source, PixelFormat, SensorConfig, SensorSource, SyntheticSource};
pub use preprocess::{
    contrast_stretch, denormalize, letterbox, normalize, preprocess, ContrastParams, LetterboxMeta,
    NormalizeParams, PreprocessOptions, Preprocessed, PreprocessedOutput, Tensor,
};
pub use record::{
    EncoderFactory, EncoderHandle, EncoderSpec, FinishedRecording, RecordingConfig, RecordingController,
    RecordingStatus, Remuxer,
};
pub use service::{CaptureService, ServiceStatus};
