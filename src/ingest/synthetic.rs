//! Synthetic sensor (`stub://` devices).
//!
//! Produces a moving test scene at the configured frame rate, in the
//! configured sensor pixel layout, and converts it to RGB24 the same way the
//! real sources do. An optional failure rate injects transient sensor errors.

use rand::Rng;
use std::time::{Duration, Instant};

use super::pixel_format::{to_rgb24, PixelFormat};
use super::{SensorConfig, SensorSource};
use crate::error::{CaptureError, Result};
use crate::frame::Frame;

pub struct SyntheticSource {
    config: SensorConfig,
    frame_count: u64,
    connected: bool,
    next_due: Option<Instant>,
    failure_rate: f64,
    last_error: Option<String>,
}

impl SyntheticSource {
    pub fn new(config: SensorConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            connected: false,
            next_due: None,
            failure_rate: 0.0,
            last_error: None,
        }
    }

    /// Fail this fraction of reads with `SensorUnavailable`.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Scene pixels in the configured sensor layout.
    ///
    /// A horizontal gradient kept inside 40..=200 (so contrast stretching has
    /// something to do) with a bright square sweeping left to right.
    fn generate_raw(&self) -> Vec<u8> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let square = (h / 4).max(1);
        let square_x = (self.frame_count as usize * 4) % w.max(1);
        let square_y = h / 2 - square / 2;

        let luma = |x: usize, y: usize| -> u8 {
            let in_square = x >= square_x && x < square_x + square && y >= square_y && y < square_y + square;
            if in_square {
                230
            } else {
                (40 + (x * 160) / w.max(1)) as u8
            }
        };

        match self.config.pixel_format {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
                let mut pixels = Vec::with_capacity(w * h * 3);
                for y in 0..h {
                    for x in 0..w {
                        let l = luma(x, y);
                        let tint = (40 + (y * 160) / h.max(1)) as u8;
                        let rgb = [l, tint, l / 2 + tint / 2];
                        if self.config.pixel_format == PixelFormat::Bgr24 {
                            pixels.extend_from_slice(&[rgb[2], rgb[1], rgb[0]]);
                        } else {
                            pixels.extend_from_slice(&rgb);
                        }
                    }
                }
                pixels
            }
            PixelFormat::Nv12 => {
                let mut pixels = Vec::with_capacity(w * h + w * (h / 2));
                for y in 0..h {
                    for x in 0..w {
                        pixels.push(luma(x, y));
                    }
                }
                pixels.resize(w * h + w * (h / 2), 128);
                pixels
            }
            PixelFormat::Yuyv => {
                let mut pixels = Vec::with_capacity(w * h * 2);
                for y in 0..h {
                    for x in (0..w).step_by(2) {
                        pixels.extend_from_slice(&[luma(x, y), 128, luma(x + 1, y), 128]);
                    }
                }
                pixels
            }
        }
    }

    /// Sleep until the next frame is due, or fail once `timeout` elapses first.
    fn pace(&mut self, timeout: Duration) -> Result<()> {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Err(CaptureError::sensor("synthetic sensor read timed out"));
            }
            std::thread::sleep(wait);
        }
        self.next_due = Some(due.max(now) + self.config.frame_interval());
        Ok(())
    }
}

impl SensorSource for SyntheticSource {
    fn device(&self) -> &str {
        &self.config.device
    }

    /// Synthetic sources are always "connected".
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticSource: connected to {} ({}x{} @ {} fps)",
            self.config.device,
            self.config.width,
            self.config.height,
            self.config.fps
        );
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame> {
        if !self.connected {
            return Err(CaptureError::sensor("synthetic sensor not connected"));
        }
        self.pace(timeout)?;

        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate) {
            let msg = "synthetic sensor dropped a frame".to_string();
            self.last_error = Some(msg.clone());
            return Err(CaptureError::SensorUnavailable(msg));
        }

        self.frame_count += 1;
        let raw = self.generate_raw();
        let rgb = to_rgb24(&raw, self.config.width, self.config.height, self.config.pixel_format)?;
        self.last_error = None;
        Ok(Frame::new(rgb, self.config.width, self.config.height)?.with_sequence(self.frame_count))
    }

    fn is_healthy(&self) -> bool {
        self.connected && self.last_error.is_none()
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        if self.connected {
            log::debug!("SyntheticSource: released {}", self.config.device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> SensorConfig {
        SensorConfig {
            device: "stub://test".to_string(),
            width: 64,
            height: 48,
            fps: 100,
            pixel_format: PixelFormat::Rgb24,
        }
    }

    #[test]
    fn synthetic_source_produces_frames() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config());
        source.connect()?;

        let frame = source.next_frame(Duration::from_secs(1))?;
        assert_eq!(frame.dimensions(), (64, 48));
        assert_eq!(frame.sequence(), 1);
        assert!(source.is_healthy());
        Ok(())
    }

    #[test]
    fn synthetic_source_requires_connect() {
        let mut source = SyntheticSource::new(stub_config());
        let err = source.next_frame(Duration::from_millis(10)).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn synthetic_source_times_out_when_frame_not_due() -> Result<()> {
        let mut source = SyntheticSource::new(SensorConfig {
            fps: 1,
            ..stub_config()
        });
        source.connect()?;
        source.next_frame(Duration::from_millis(10))?;

        let started = Instant::now();
        let err = source.next_frame(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, CaptureError::SensorUnavailable(_)));
        assert!(started.elapsed() < Duration::from_millis(500));
        Ok(())
    }

    #[test]
    fn synthetic_source_failure_rate_one_always_fails() -> Result<()> {
        let mut source = SyntheticSource::new(stub_config()).with_failure_rate(1.0);
        source.connect()?;
        assert!(source.next_frame(Duration::from_secs(1)).is_err());
        assert!(!source.is_healthy());
        Ok(())
    }

    #[test]
    fn nv12_layout_converts_to_rgb() -> Result<()> {
        let mut source = SyntheticSource::new(SensorConfig {
            pixel_format: PixelFormat::Nv12,
            ..stub_config()
        });
        source.connect()?;
        let frame = source.next_frame(Duration::from_secs(1))?;
        // neutral chroma: every pixel is gray
        let [r, g, b] = frame.pixel(10, 2).unwrap();
        assert_eq!(r, g);
        assert_eq!(g, b);
        Ok(())
    }
}
