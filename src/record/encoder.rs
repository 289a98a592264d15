//! Encoder implementations.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{EncoderFactory, EncoderHandle, EncoderSpec};
use crate::error::{CaptureError, Result};

// ----------------------------------------------------------------------------
// Synthetic
// ----------------------------------------------------------------------------

/// Annex-B start code.
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Writes a placeholder Annex-B stream (one SPS, then one IDR-typed NAL per
/// frame interval) until finished. Used with `stub://` sensors.
#[derive(Clone, Debug, Default)]
pub struct SyntheticEncoder;

impl SyntheticEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl EncoderFactory for SyntheticEncoder {
    fn start(&self, spec: &EncoderSpec) -> Result<Box<dyn EncoderHandle>> {
        let file = File::create(&spec.raw_path)
            .map_err(|err| CaptureError::Encoder(format!("create {}: {}", spec.raw_path.display(), err)))?;
        let mut out = BufWriter::new(file);
        let interval = frame_interval(spec.fps);
        let (width, height) = (spec.width, spec.height);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let join = std::thread::Builder::new()
            .name("synthetic-encoder".to_string())
            .spawn(move || -> std::io::Result<u64> {
                out.write_all(&START_CODE)?;
                out.write_all(&[0x67, 0x42, 0x00, 0x1f])?;
                out.write_all(&width.to_be_bytes())?;
                out.write_all(&height.to_be_bytes())?;

                let mut frames = 0u64;
                while !stop_thread.load(Ordering::SeqCst) {
                    out.write_all(&START_CODE)?;
                    out.write_all(&[0x65])?;
                    out.write_all(&frames.to_be_bytes())?;
                    frames += 1;
                    std::thread::sleep(interval);
                }
                out.flush()?;
                Ok(frames)
            })
            .map_err(|err| CaptureError::Encoder(format!("spawn synthetic encoder: {}", err)))?;

        log::debug!("SyntheticEncoder: writing {}", spec.raw_path.display());
        Ok(Box::new(SyntheticEncoding { stop, join: Some(join) }))
    }
}

/// Time between synthetic NAL units; never zero, whatever the frame rate.
fn frame_interval(fps: u32) -> Duration {
    Duration::from_micros((1_000_000 / u64::from(fps.max(1))).max(1))
}

struct SyntheticEncoding {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<std::io::Result<u64>>>,
}

impl SyntheticEncoding {
    fn stop_and_join(&mut self) -> Result<u64> {
        self.stop.store(true, Ordering::SeqCst);
        let Some(join) = self.join.take() else {
            return Ok(0);
        };
        let frames = join
            .join()
            .map_err(|_| CaptureError::Encoder("synthetic encoder thread panicked".to_string()))?
            .map_err(|err| CaptureError::Encoder(format!("write synthetic stream: {}", err)))?;
        Ok(frames)
    }
}

impl EncoderHandle for SyntheticEncoding {
    fn finish(mut self: Box<Self>) -> Result<()> {
        let frames = self.stop_and_join()?;
        log::debug!("SyntheticEncoder: finished after {} frames", frames);
        Ok(())
    }
}

impl Drop for SyntheticEncoding {
    fn drop(&mut self) {
        if let Err(err) = self.stop_and_join() {
            log::warn!("SyntheticEncoder: {}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Unavailable
// ----------------------------------------------------------------------------

/// Stands in when no encoder backend fits the configured device. Capture
/// keeps working; starting a recording fails with `Encoder`.
#[derive(Clone, Debug)]
pub struct UnavailableEncoder {
    reason: String,
}

impl UnavailableEncoder {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

impl EncoderFactory for UnavailableEncoder {
    fn start(&self, _spec: &EncoderSpec) -> Result<Box<dyn EncoderHandle>> {
        Err(CaptureError::Encoder(self.reason.clone()))
    }
}

// ----------------------------------------------------------------------------
// GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "encoder-gstreamer")]
pub use self::gst::GstreamerEncoder;

#[cfg(feature = "encoder-gstreamer")]
mod gst {
    use gstreamer::prelude::*;

    use super::super::{EncoderFactory, EncoderHandle, EncoderSpec};
    use crate::error::{CaptureError, Result};

    /// Bound on waiting for EOS to drain through the pipeline.
    const EOS_WAIT_SECS: u64 = 10;

    /// Hardware H.264 encoder over its own camera pipeline.
    ///
    /// `<camera> ! caps ! videoconvert ! v4l2h264enc ! h264parse ! filesink`,
    /// falling back to `x264enc` when the hardware encoder element is missing.
    #[derive(Clone, Debug)]
    pub struct GstreamerEncoder {
        device: String,
    }

    impl GstreamerEncoder {
        pub fn new(device: impl Into<String>) -> Result<Self> {
            gstreamer::init().map_err(|err| CaptureError::Encoder(format!("initialize gstreamer: {}", err)))?;
            Ok(Self { device: device.into() })
        }

        fn camera_element(&self) -> String {
            if let Some(fragment) = self.device.strip_prefix("gst:") {
                return fragment.trim().to_string();
            }
            let path = self.device.strip_prefix("v4l2:").unwrap_or(&self.device);
            if path.starts_with("/dev/") {
                return format!("v4l2src device={}", path);
            }
            "libcamerasrc".to_string()
        }

        fn encoder_element(bitrate: u32) -> String {
            if gstreamer::ElementFactory::find("v4l2h264enc").is_some() {
                format!(
                    "v4l2h264enc extra-controls=\"controls,video_bitrate={}\" ! video/x-h264,level=(string)4",
                    bitrate
                )
            } else {
                log::warn!("GstreamerEncoder: v4l2h264enc unavailable, using x264enc");
                format!(
                    "x264enc bitrate={} tune=zerolatency speed-preset=ultrafast",
                    (bitrate / 1000).max(1)
                )
            }
        }
    }

    impl EncoderFactory for GstreamerEncoder {
        fn start(&self, spec: &EncoderSpec) -> Result<Box<dyn EncoderHandle>> {
            let description = format!(
                "{} ! video/x-raw,width={},height={},framerate={}/1 ! videoconvert ! {} ! \
                 h264parse ! filesink location=\"{}\"",
                self.camera_element(),
                spec.width,
                spec.height,
                spec.fps,
                Self::encoder_element(spec.bitrate),
                spec.raw_path.display()
            );
            let pipeline = gstreamer::parse::launch(&description)
                .map_err(|err| CaptureError::Encoder(format!("build encoder pipeline: {}", err)))?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| CaptureError::Encoder("encoder pipeline is not a Pipeline".to_string()))?;

            if let Err(err) = pipeline.set_state(gstreamer::State::Playing) {
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(CaptureError::Encoder(format!("start encoder pipeline: {}", err)));
            }
            log::info!("GstreamerEncoder: recording {} to {}", self.device, spec.raw_path.display());
            Ok(Box::new(GstreamerEncoding { pipeline: Some(pipeline) }))
        }
    }

    struct GstreamerEncoding {
        pipeline: Option<gstreamer::Pipeline>,
    }

    impl EncoderHandle for GstreamerEncoding {
        fn finish(mut self: Box<Self>) -> Result<()> {
            let Some(pipeline) = self.pipeline.take() else {
                return Ok(());
            };
            pipeline.send_event(gstreamer::event::Eos::new());

            let mut outcome = Err(CaptureError::Encoder("no EOS from encoder pipeline".to_string()));
            if let Some(bus) = pipeline.bus() {
                for msg in bus.iter_timed(gstreamer::ClockTime::from_seconds(EOS_WAIT_SECS)) {
                    match msg.view() {
                        gstreamer::MessageView::Eos(..) => {
                            outcome = Ok(());
                            break;
                        }
                        gstreamer::MessageView::Error(err) => {
                            outcome = Err(CaptureError::Encoder(format!(
                                "encoder pipeline error: {} ({:?})",
                                err.error(),
                                err.debug()
                            )));
                            break;
                        }
                        _ => {}
                    }
                }
            }
            pipeline
                .set_state(gstreamer::State::Null)
                .map_err(|err| CaptureError::Encoder(format!("stop encoder pipeline: {}", err)))?;
            outcome
        }
    }

    impl Drop for GstreamerEncoding {
        fn drop(&mut self) {
            if let Some(pipeline) = self.pipeline.take() {
                if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                    log::warn!("GstreamerEncoder: failed to stop pipeline: {}", err);
                }
            }
        }
    }
}
