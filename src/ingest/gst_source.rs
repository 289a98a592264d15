//! GStreamer sensor source.
//!
//! Builds `<camera> ! videoconvert ! video/x-raw,format=RGB ! appsink` where
//! `<camera>` is `libcamerasrc` for the `libcamera` device or the fragment
//! following `gst:`. The appsink keeps one buffer and drops late frames, so
//! the pipeline never queues behind a slow consumer.

use gstreamer::prelude::*;
use std::time::{Duration, Instant};

use super::pixel_format::{strip_stride, PixelFormat};
use super::{SensorConfig, SensorSource};
use crate::error::{CaptureError, Result};
use crate::frame::Frame;

pub struct GstreamerSource {
    config: SensorConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    last_error: Option<String>,
}

impl GstreamerSource {
    pub fn new(config: SensorConfig) -> Result<Self> {
        gstreamer::init().map_err(|err| CaptureError::sensor(format!("initialize gstreamer: {}", err)))?;

        let camera = match config.device.strip_prefix("gst:") {
            Some(fragment) => fragment.trim().to_string(),
            None => "libcamerasrc".to_string(),
        };
        let pipeline_description = format!(
            "{} ! video/x-raw,width={},height={},framerate={}/1 ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            camera, config.width, config.height, config.fps
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .map_err(|err| CaptureError::sensor(format!("build capture pipeline: {}", err)))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| CaptureError::sensor("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| CaptureError::sensor("appsink element missing from pipeline"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| CaptureError::sensor("appsink element has unexpected type"))?;

        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            last_error: None,
        })
    }

    fn health_grace(&self) -> Duration {
        (self.config.frame_interval() * 6).max(Duration::from_secs(2))
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

impl SensorSource for GstreamerSource {
    fn device(&self) -> &str {
        &self.config.device
    }

    fn connect(&mut self) -> Result<()> {
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .map_err(|err| CaptureError::sensor(format!("set capture pipeline to Playing: {}", err)))?;
        self.connected_at = Some(Instant::now());
        self.last_error = None;
        log::info!("GstreamerSource: connected to {}", self.config.device);
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            return Err(CaptureError::SensorUnavailable(err.clone()));
        }

        let sample = self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| CaptureError::sensor("capture pipeline stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());

        Ok(Frame::new(pixels, width, height)?.with_sequence(self.frame_count))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= self.health_grace()
    }
}

impl Drop for GstreamerSource {
    fn drop(&mut self) {
        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("GstreamerSource: failed to stop pipeline: {}", err);
        }
    }
}

fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| CaptureError::sensor("sample missing buffer"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| CaptureError::sensor("sample missing caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|err| CaptureError::sensor(format!("parse caps as video info: {}", err)))?;

    let width = info.width();
    let height = info.height();
    let stride = info.stride()[0] as usize;

    let map = buffer
        .map_readable()
        .map_err(|err| CaptureError::sensor(format!("map sample buffer: {}", err)))?;
    let pixels = strip_stride(
        map.as_slice(),
        PixelFormat::Rgb24.row_bytes(width),
        height as usize,
        stride,
    )?;

    Ok((pixels, width, height))
}
