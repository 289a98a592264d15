//! V4L2 sensor source.
//!
//! Opens a local device node (e.g. `/dev/video0`), negotiates the configured
//! size, pixel layout and frame rate, and streams through memory-mapped
//! buffers. The device is closed when the source is dropped.

use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::pixel_format::{strip_stride, to_rgb24, PixelFormat};
use super::{SensorConfig, SensorSource};
use crate::error::{CaptureError, Result};
use crate::frame::Frame;

const MMAP_BUFFERS: u32 = 4;

pub struct V4l2Source {
    config: SensorConfig,
    path: String,
    state: Option<DeviceV4l2State>,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
    active_stride: usize,
    active_format: PixelFormat,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: SensorConfig) -> Self {
        let path = config
            .device
            .strip_prefix("v4l2:")
            .unwrap_or(&config.device)
            .to_string();
        Self {
            active_width: config.width,
            active_height: config.height,
            active_stride: 0,
            active_format: config.pixel_format,
            path,
            config,
            state: None,
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn health_grace(&self) -> Duration {
        (self.config.frame_interval() * 6).max(Duration::from_secs(2))
    }
}

impl SensorSource for V4l2Source {
    fn device(&self) -> &str {
        &self.config.device
    }

    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        // Drop any previous stream before reopening the node.
        self.state = None;

        let mut device = v4l::Device::with_path(&self.path)
            .map_err(|err| CaptureError::sensor(format!("open v4l2 device {}: {}", self.path, err)))?;
        let mut format = device
            .format()
            .map_err(|err| CaptureError::sensor(format!("read v4l2 format: {}", err)))?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(&self.config.pixel_format.fourcc());

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!("V4l2Source: failed to set format on {}: {}", self.path, err);
                device
                    .format()
                    .map_err(|err| CaptureError::sensor(format!("read v4l2 format after set failure: {}", err)))?
            }
        };

        let negotiated = format.fourcc.repr;
        self.active_format = [
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Nv12,
            PixelFormat::Yuyv,
        ]
        .into_iter()
        .find(|candidate| candidate.fourcc() == negotiated)
        .ok_or_else(|| {
            CaptureError::sensor(format!(
                "device {} negotiated unsupported fourcc {}",
                self.path, format.fourcc
            ))
        })?;

        if self.config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("V4l2Source: failed to set fps on {}: {}", self.path, err);
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.active_stride = format.stride as usize;

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            CaptureError::sensor(format!("create v4l2 buffer stream: {}", err))
        })?;
        self.state = Some(state);
        self.last_error = None;

        log::info!(
            "V4l2Source: connected to {} ({}x{} {:?})",
            self.path,
            self.active_width,
            self.active_height,
            self.active_format
        );
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let width = self.active_width;
        let height = self.active_height;
        let format = self.active_format;
        let stride = self.active_stride;

        let state = self
            .state
            .as_mut()
            .ok_or_else(|| CaptureError::sensor("v4l2 device not connected"))?;
        let packed = state
            .with_mut(|fields| {
                fields.stream.set_timeout(timeout);
                fields.stream.next().map(|(buf, meta)| {
                    let used = (meta.bytesused as usize).min(buf.len());
                    let used = if used == 0 { buf.len() } else { used };
                    strip_stride(&buf[..used], format.row_bytes(width), format.rows(height), stride)
                })
            })
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                CaptureError::sensor(format!("capture v4l2 frame: {}", err))
            })??;

        let rgb = to_rgb24(&packed, width, height, format)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        self.last_error = None;

        Ok(Frame::new(rgb, width, height)?.with_sequence(self.frame_count))
    }

    fn is_healthy(&self) -> bool {
        if self.state.is_none() || self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= self.health_grace()
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: released {}", self.path);
        }
    }
}
