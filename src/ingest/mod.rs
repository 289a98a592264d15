//! Sensor sources.
//!
//! A `SensorSource` is one independent tap on the image sensor. The
//! acquisition loop owns one; the recording encoder opens its own pipeline and
//! never shares this handle.
//!
//! Sources are selected from the configured device string:
//! - `stub://<name>`: synthetic frames (tests, development)
//! - `/dev/videoN` or `v4l2:/dev/videoN`: V4L2 capture (feature: sensor-v4l2)
//! - `libcamera` or `gst:<pipeline fragment>`: GStreamer capture (feature: sensor-gstreamer)
//!
//! Every source produces RGB24 `Frame`s and honours the per-call timeout passed
//! to `next_frame`, so a wedged sensor can never block the caller indefinitely.

#[cfg(feature = "sensor-gstreamer")]
mod gst_source;
mod pixel_format;
mod synthetic;
#[cfg(feature = "sensor-v4l2")]
pub mod v4l2;

use std::time::Duration;

use crate::error::{CaptureError, Result};
use crate::frame::Frame;

#[cfg(feature = "sensor-gstreamer")]
pub use gst_source::GstreamerSource;
pub use pixel_format::PixelFormat;
#[cfg(any(feature = "sensor-v4l2", feature = "sensor-gstreamer"))]
pub(crate) use pixel_format::strip_stride;
pub(crate) use pixel_format::to_rgb24;
pub use synthetic::SyntheticSource;
#[cfg(feature = "sensor-v4l2")]
pub use v4l2::V4l2Source;

/// Sensor capture settings shared by all source kinds.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorConfig {
    /// Device selector (see module docs).
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Target frame rate (frames per second).
    pub fps: u32,
    /// Pixel layout delivered by the device; converted to RGB24 on capture.
    pub pixel_format: PixelFormat,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            device: "stub://camera".to_string(),
            width: 1920,
            height: 1080,
            fps: 30,
            pixel_format: PixelFormat::Rgb24,
        }
    }
}

impl SensorConfig {
    /// Nominal time between frames.
    pub fn frame_interval(&self) -> Duration {
        if self.fps == 0 {
            return Duration::from_millis(100);
        }
        Duration::from_micros(1_000_000 / self.fps as u64)
    }

    /// Default read timeout: four frame intervals, never below 500 ms.
    pub fn default_timeout(&self) -> Duration {
        (self.frame_interval() * 4).max(Duration::from_millis(500))
    }
}

/// One tap on the image sensor.
///
/// Implementations release the underlying device on drop.
pub trait SensorSource: Send {
    /// Device identifier for logs.
    fn device(&self) -> &str;

    /// Open the device and start streaming.
    fn connect(&mut self) -> Result<()>;

    /// Block for the next frame, at most `timeout`.
    ///
    /// A timeout is reported as `CaptureError::SensorUnavailable`.
    fn next_frame(&mut self, timeout: Duration) -> Result<Frame>;

    /// False once the device has reported a failure that has not been
    /// cleared by a good frame or a reconnect.
    fn is_healthy(&self) -> bool;
}

impl SensorSource for Box<dyn SensorSource> {
    fn device(&self) -> &str {
        (**self).device()
    }

    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame> {
        (**self).next_frame(timeout)
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}

/// Build the source named by `config.device`. The source is not connected yet.
pub fn open_source(config: &SensorConfig) -> Result<Box<dyn SensorSource>> {
    let device = config.device.as_str();
    if device.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config.clone())));
    }
    if device.starts_with("/dev/video") || device.starts_with("v4l2:") {
        #[cfg(feature = "sensor-v4l2")]
        {
            return Ok(Box::new(V4l2Source::new(config.clone())));
        }
        #[cfg(not(feature = "sensor-v4l2"))]
        {
            return Err(CaptureError::invalid(
                "V4L2 capture requires the sensor-v4l2 feature",
            ));
        }
    }
    if device == "libcamera" || device.starts_with("gst:") {
        #[cfg(feature = "sensor-gstreamer")]
        {
            return Ok(Box::new(GstreamerSource::new(config.clone())?));
        }
        #[cfg(not(feature = "sensor-gstreamer"))]
        {
            return Err(CaptureError::invalid(
                "GStreamer capture requires the sensor-gstreamer feature",
            ));
        }
    }
    Err(CaptureError::invalid(format!(
        "unrecognised sensor device '{}'",
        device
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_has_floor() {
        let cfg = SensorConfig {
            fps: 30,
            ..SensorConfig::default()
        };
        assert_eq!(cfg.default_timeout(), Duration::from_millis(500));

        let slow = SensorConfig {
            fps: 2,
            ..SensorConfig::default()
        };
        assert_eq!(slow.default_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn stub_device_opens_synthetic_source() {
        let cfg = SensorConfig {
            device: "stub://test".to_string(),
            width: 32,
            height: 16,
            ..SensorConfig::default()
        };
        let mut source = open_source(&cfg).unwrap();
        source.connect().unwrap();
        let frame = source.next_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.dimensions(), (32, 16));
        assert_eq!(source.device(), "stub://test");
    }

    #[test]
    fn unknown_device_is_rejected() {
        let cfg = SensorConfig {
            device: "http://camera".to_string(),
            ..SensorConfig::default()
        };
        assert!(matches!(
            open_source(&cfg),
            Err(CaptureError::InvalidInput(_))
        ));
    }
}
