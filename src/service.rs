//! Capture service facade.
//!
//! Owns the frame buffer, the acquisition loop and the recording controller,
//! and exposes the operations the HTTP layer calls. Every operation is safe to
//! call from many threads at once.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::acquisition::{AcquisitionHandle, AcquisitionLoop};
use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::frame::{Frame, FrameBuffer};
use crate::ingest::{self, SensorSource};
use crate::preprocess::{self, Preprocessed};
use crate::record::{
    CopyRemuxer, EncoderFactory, FinishedRecording, RecordingController, RecordingStatus, Remuxer,
    SyntheticEncoder,
};

/// Frames older than this many intervals mark the sensor unhealthy.
const STALE_FRAME_INTERVALS: u32 = 6;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub frame_available: bool,
    pub last_frame_age_seconds: Option<f64>,
    pub configured_resolution: String,
    pub target_resolution: String,
    pub frame_rate: u32,
    pub frames_captured: u64,
    pub capture_errors: u64,
    pub last_error: Option<String>,
    pub sensor_healthy: bool,
}

pub struct CaptureService {
    config: CaptureConfig,
    buffer: Arc<FrameBuffer>,
    acquisition: Mutex<Option<AcquisitionHandle>>,
    recorder: RecordingController,
}

impl CaptureService {
    /// Create output directories, start acquisition from `source` and build
    /// the recording controller.
    pub fn start<S>(
        config: CaptureConfig,
        source: S,
        encoders: Box<dyn EncoderFactory>,
        remuxer: Box<dyn Remuxer>,
    ) -> Result<Self>
    where
        S: SensorSource + 'static,
    {
        std::fs::create_dir_all(&config.capture.save_dir)?;
        std::fs::create_dir_all(&config.recording.dir)?;

        let buffer = Arc::new(FrameBuffer::new());
        let acquisition = AcquisitionLoop::spawn(source, buffer.clone(), config.acquisition.clone())?;
        let recorder = RecordingController::new(config.recording.clone(), encoders, remuxer);

        log::info!(
            "capture service started: {} {}x{} @ {} fps, detector input {}x{}",
            config.sensor.device,
            config.sensor.width,
            config.sensor.height,
            config.sensor.fps,
            config.preprocess.target_width,
            config.preprocess.target_height
        );

        Ok(Self {
            config,
            buffer,
            acquisition: Mutex::new(Some(acquisition)),
            recorder,
        })
    }

    /// Pick sensor, encoder and remuxer implementations for the configured
    /// device and compiled features.
    pub fn from_config(config: CaptureConfig) -> Result<Self> {
        let source = ingest::open_source(&config.sensor)?;
        let (encoders, remuxer) = recording_backends(&config)?;
        Self::start(config, source, encoders, remuxer)
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Copy of the latest frame.
    pub fn get_frame(&self) -> Option<Frame> {
        self.buffer.snapshot()
    }

    /// Latest frame run through the preprocessing pipeline.
    ///
    /// `enable_contrast_stretch` and `target_size` fall back to the configured
    /// defaults when `None`. With `normalize` the output is a CHW tensor.
    pub fn get_processed_frame(
        &self,
        enable_contrast_stretch: Option<bool>,
        target_size: Option<(u32, u32)>,
        normalize: bool,
    ) -> Result<Option<Preprocessed>> {
        let Some(frame) = self.buffer.snapshot() else {
            return Ok(None);
        };
        let contrast = enable_contrast_stretch.unwrap_or(self.config.preprocess.contrast_enabled);
        let options = self.config.preprocess.options(contrast, target_size, normalize);
        preprocess::preprocess(&frame, &options).map(Some)
    }

    /// Latest frame as JPEG. `quality` defaults to the configured value.
    pub fn get_frame_jpeg(&self, quality: Option<u8>) -> Result<Option<Vec<u8>>> {
        let Some(frame) = self.buffer.snapshot() else {
            return Ok(None);
        };
        let quality = quality.unwrap_or(self.config.capture.jpeg_quality);
        frame.to_jpeg(quality).map(Some)
    }

    /// Save the latest frame as `capture_YYYYMMDD_HHMMSS_mmm.jpg` and return
    /// its path. `directory` defaults to the configured save directory.
    pub fn save_frame(&self, directory: Option<&Path>) -> Result<String> {
        let frame = self.buffer.snapshot().ok_or(CaptureError::NoFrame)?;
        let dir = directory.unwrap_or(self.config.capture.save_dir.as_path());
        std::fs::create_dir_all(dir)?;

        let path = dir.join(still_filename(&frame));
        frame.write_jpeg(&path, self.config.capture.jpeg_quality)?;
        log::info!("saved frame {} to {}", frame.sequence(), path.display());
        Ok(path.display().to_string())
    }

    pub fn start_recording(&self, name: Option<&str>) -> Result<String> {
        self.recorder.start(name)
    }

    pub fn stop_recording(&self) -> Result<FinishedRecording> {
        self.recorder.stop()
    }

    pub fn recording_status(&self) -> RecordingStatus {
        self.recorder.status()
    }

    pub fn status(&self) -> ServiceStatus {
        let acquisition = self.acquisition();
        let (running, source_healthy, frames_captured, capture_errors, last_error) = match acquisition.as_ref() {
            Some(handle) => (
                handle.is_running(),
                handle.stats().source_healthy(),
                handle.stats().frames_captured(),
                handle.stats().errors(),
                handle.stats().last_error(),
            ),
            None => (false, false, 0, 0, None),
        };
        drop(acquisition);

        let age = self.buffer.latest_age();
        let stale_after = (self.config.sensor.frame_interval() * STALE_FRAME_INTERVALS).max(Duration::from_secs(2));
        ServiceStatus {
            running,
            frame_available: age.is_some(),
            last_frame_age_seconds: age.map(|age| age.as_secs_f64()),
            configured_resolution: format!("{}x{}", self.config.sensor.width, self.config.sensor.height),
            target_resolution: format!(
                "{}x{}",
                self.config.preprocess.target_width, self.config.preprocess.target_height
            ),
            frame_rate: self.config.sensor.fps,
            frames_captured,
            capture_errors,
            last_error,
            sensor_healthy: running && source_healthy && age.map_or(false, |age| age <= stale_after),
        }
    }

    /// Finalize any recording, then stop acquisition. Safe to call twice.
    pub fn shutdown(&self) {
        self.recorder.shutdown();
        let handle = self.acquisition().take();
        if let Some(handle) = handle {
            match handle.stop() {
                Ok(()) => log::info!("capture service stopped"),
                Err(err) => log::error!("acquisition shutdown: {}", err),
            }
        }
    }

    fn acquisition(&self) -> MutexGuard<'_, Option<AcquisitionHandle>> {
        self.acquisition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn still_filename(frame: &Frame) -> String {
    let captured: DateTime<Local> = frame.captured_wall().into();
    captured.format("capture_%Y%m%d_%H%M%S_%3f.jpg").to_string()
}

fn recording_backends(config: &CaptureConfig) -> Result<(Box<dyn EncoderFactory>, Box<dyn Remuxer>)> {
    if config.sensor.device.starts_with("stub://") {
        return Ok((Box::new(SyntheticEncoder::new()), Box::new(CopyRemuxer)));
    }

    #[cfg(feature = "encoder-gstreamer")]
    let encoders: Box<dyn EncoderFactory> =
        Box::new(crate::record::GstreamerEncoder::new(config.sensor.device.clone())?);
    #[cfg(not(feature = "encoder-gstreamer"))]
    let encoders: Box<dyn EncoderFactory> = Box::new(crate::record::UnavailableEncoder::new(
        "recording from a hardware sensor requires the encoder-gstreamer feature",
    ));

    #[cfg(feature = "remux-ffmpeg")]
    let remuxer: Box<dyn Remuxer> = Box::new(crate::record::FfmpegRemuxer::new()?);
    #[cfg(not(feature = "remux-ffmpeg"))]
    let remuxer: Box<dyn Remuxer> = Box::new(crate::record::FfmpegCliRemuxer::new(
        config.remux.ffmpeg.clone(),
        config.remux.timeout,
    ));

    Ok((encoders, remuxer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn still_filename_has_millisecond_suffix() {
        let frame = Frame::black(2, 2).unwrap();
        let name = still_filename(&frame);
        assert!(name.starts_with("capture_"));
        assert!(name.ends_with(".jpg"));
        // capture_YYYYMMDD_HHMMSS_mmm.jpg
        assert_eq!(name.len(), "capture_YYYYMMDD_HHMMSS_mmm.jpg".len());
        assert!(frame.captured_wall() <= SystemTime::now());
    }

    #[test]
    fn stub_device_selects_synthetic_backends() {
        let config = CaptureConfig::default();
        assert!(recording_backends(&config).is_ok());
    }
}
