use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::acquisition::AcquisitionConfig;
use crate::ingest::{PixelFormat, SensorConfig};
use crate::preprocess::{ContrastParams, NormalizeParams, PreprocessOptions, IMAGENET_MEAN, IMAGENET_STD};
use crate::record::RecordingConfig;

const DEFAULT_DEVICE: &str = "stub://camera";
const DEFAULT_SENSOR_WIDTH: u32 = 1920;
const DEFAULT_SENSOR_HEIGHT: u32 = 1080;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_BACKOFF_MS: u64 = 10;
const DEFAULT_TARGET_SIZE: u32 = 640;
const DEFAULT_LOW_PCT: f32 = 1.0;
const DEFAULT_HIGH_PCT: f32 = 99.0;
const DEFAULT_SAVE_DIR: &str = "captured_images";
const DEFAULT_JPEG_QUALITY: u8 = 95;
const DEFAULT_VIDEO_DIR: &str = "videos";
const DEFAULT_BITRATE: u32 = 15_000_000;
const DEFAULT_FFMPEG: &str = "ffmpeg";
const DEFAULT_REMUX_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SETTLE_MS: u64 = 300;

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    sensor: Option<SensorConfigFile>,
    preprocess: Option<PreprocessConfigFile>,
    capture: Option<StillConfigFile>,
    recording: Option<RecordingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SensorConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    timeout_ms: Option<u64>,
    backoff_ms: Option<u64>,
    pixel_format: Option<PixelFormat>,
}

#[derive(Debug, Deserialize, Default)]
struct PreprocessConfigFile {
    target_width: Option<u32>,
    target_height: Option<u32>,
    contrast_enabled: Option<bool>,
    low_pct: Option<f32>,
    high_pct: Option<f32>,
    mean: Option<[f32; 3]>,
    std: Option<[f32; 3]>,
}

#[derive(Debug, Deserialize, Default)]
struct StillConfigFile {
    save_dir: Option<PathBuf>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    dir: Option<PathBuf>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    bitrate: Option<u32>,
    ffmpeg: Option<PathBuf>,
    remux_timeout_secs: Option<u64>,
    settle_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sensor: SensorConfig,
    pub acquisition: AcquisitionConfig,
    pub preprocess: PreprocessSettings,
    pub capture: StillSettings,
    pub recording: RecordingConfig,
    pub remux: RemuxSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocessSettings {
    pub target_width: u32,
    pub target_height: u32,
    pub contrast_enabled: bool,
    pub contrast: ContrastParams,
    pub normalize: NormalizeParams,
}

impl PreprocessSettings {
    /// Pipeline options for one request.
    pub fn options(&self, contrast: bool, target: Option<(u32, u32)>, normalize: bool) -> PreprocessOptions {
        let (target_width, target_height) = target.unwrap_or((self.target_width, self.target_height));
        PreprocessOptions {
            contrast: contrast.then_some(self.contrast),
            target_width,
            target_height,
            normalize: normalize.then_some(self.normalize),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StillSettings {
    pub save_dir: PathBuf,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemuxSettings {
    pub ffmpeg: PathBuf,
    pub timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::from_file(CaptureConfigFile::default())
    }
}

impl CaptureConfig {
    /// File named by `CAPTURE_CONFIG` (if set), then env overrides, then
    /// validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAPTURE_CONFIG").ok().map(PathBuf::from);
        Self::load_with(config_path.as_deref())
    }

    /// Like [`CaptureConfig::load`] with an explicit file path.
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => CaptureConfigFile::default(),
        };
        let explicit_timeout = file_cfg
            .sensor
            .as_ref()
            .map_or(false, |sensor| sensor.timeout_ms.is_some());
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        if !explicit_timeout {
            cfg.acquisition.timeout = cfg.sensor.default_timeout();
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CaptureConfigFile) -> Self {
        let sensor_file = file.sensor.unwrap_or_default();
        let sensor = SensorConfig {
            device: sensor_file.device.unwrap_or_else(|| DEFAULT_DEVICE.to_string()),
            width: sensor_file.width.unwrap_or(DEFAULT_SENSOR_WIDTH),
            height: sensor_file.height.unwrap_or(DEFAULT_SENSOR_HEIGHT),
            fps: sensor_file.fps.unwrap_or(DEFAULT_FPS),
            pixel_format: sensor_file.pixel_format.unwrap_or_default(),
        };
        let acquisition = AcquisitionConfig {
            timeout: sensor_file
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| sensor.default_timeout()),
            backoff: Duration::from_millis(sensor_file.backoff_ms.unwrap_or(DEFAULT_BACKOFF_MS)),
        };

        let pre = file.preprocess.unwrap_or_default();
        let preprocess = PreprocessSettings {
            target_width: pre.target_width.unwrap_or(DEFAULT_TARGET_SIZE),
            target_height: pre.target_height.unwrap_or(DEFAULT_TARGET_SIZE),
            contrast_enabled: pre.contrast_enabled.unwrap_or(true),
            contrast: ContrastParams::new(
                pre.low_pct.unwrap_or(DEFAULT_LOW_PCT),
                pre.high_pct.unwrap_or(DEFAULT_HIGH_PCT),
            ),
            normalize: NormalizeParams {
                mean: pre.mean.unwrap_or(IMAGENET_MEAN),
                std: pre.std.unwrap_or(IMAGENET_STD),
            },
        };

        let still = file.capture.unwrap_or_default();
        let capture = StillSettings {
            save_dir: still.save_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_SAVE_DIR)),
            jpeg_quality: still.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        };

        let rec = file.recording.unwrap_or_default();
        let recording = RecordingConfig {
            dir: rec.dir.unwrap_or_else(|| PathBuf::from(DEFAULT_VIDEO_DIR)),
            width: rec.width.unwrap_or(DEFAULT_SENSOR_WIDTH),
            height: rec.height.unwrap_or(DEFAULT_SENSOR_HEIGHT),
            fps: rec.fps.unwrap_or(DEFAULT_FPS),
            bitrate: rec.bitrate.unwrap_or(DEFAULT_BITRATE),
            settle: Duration::from_millis(rec.settle_ms.unwrap_or(DEFAULT_SETTLE_MS)),
        };
        let remux = RemuxSettings {
            ffmpeg: rec.ffmpeg.unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG)),
            timeout: Duration::from_secs(rec.remux_timeout_secs.unwrap_or(DEFAULT_REMUX_TIMEOUT_SECS)),
        };

        Self {
            sensor,
            acquisition,
            preprocess,
            capture,
            recording,
            remux,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(device) = std::env::var("CAPTURE_DEVICE") {
            if !device.trim().is_empty() {
                self.sensor.device = device.trim().to_string();
            }
        }
        if let Some(width) = env_number::<u32>("CAPTURE_WIDTH")? {
            self.sensor.width = width;
        }
        if let Some(height) = env_number::<u32>("CAPTURE_HEIGHT")? {
            self.sensor.height = height;
        }
        if let Some(fps) = env_number::<u32>("CAPTURE_FPS")? {
            self.sensor.fps = fps;
            self.recording.fps = fps;
        }
        if let Ok(format) = std::env::var("CAPTURE_PIXEL_FORMAT") {
            if !format.trim().is_empty() {
                self.sensor.pixel_format = format
                    .parse()
                    .map_err(|e| anyhow!("CAPTURE_PIXEL_FORMAT: {}", e))?;
            }
        }
        if let Ok(dir) = std::env::var("CAPTURE_SAVE_DIR") {
            if !dir.trim().is_empty() {
                self.capture.save_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("CAPTURE_VIDEO_DIR") {
            if !dir.trim().is_empty() {
                self.recording.dir = PathBuf::from(dir);
            }
        }
        if let Ok(flag) = std::env::var("CAPTURE_CONTRAST_STRETCH") {
            self.preprocess.contrast_enabled = parse_bool(&flag)
                .ok_or_else(|| anyhow!("CAPTURE_CONTRAST_STRETCH must be true/false/1/0, got {:?}", flag))?;
        }
        if let Ok(size) = std::env::var("CAPTURE_TARGET_SIZE") {
            let (width, height) = parse_size(&size)
                .ok_or_else(|| anyhow!("CAPTURE_TARGET_SIZE must look like 640x640, got {:?}", size))?;
            self.preprocess.target_width = width;
            self.preprocess.target_height = height;
        }
        if let Ok(program) = std::env::var("CAPTURE_FFMPEG") {
            if !program.trim().is_empty() {
                self.remux.ffmpeg = PathBuf::from(program);
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.sensor.width == 0 || self.sensor.height == 0 {
            return Err(anyhow!(
                "sensor resolution must be non-zero, got {}x{}",
                self.sensor.width,
                self.sensor.height
            ));
        }
        if self.sensor.fps == 0 {
            return Err(anyhow!("sensor fps must be greater than zero"));
        }
        if self.acquisition.timeout.is_zero() {
            return Err(anyhow!("sensor timeout must be greater than zero"));
        }
        if self.preprocess.target_width == 0 || self.preprocess.target_height == 0 {
            return Err(anyhow!(
                "preprocess target must be non-zero, got {}x{}",
                self.preprocess.target_width,
                self.preprocess.target_height
            ));
        }
        self.preprocess
            .contrast
            .validate()
            .context("invalid contrast percentiles")?;
        self.preprocess
            .normalize
            .validate()
            .context("invalid normalization parameters")?;
        if !(1..=100).contains(&self.capture.jpeg_quality) {
            return Err(anyhow!(
                "jpeg_quality must be within 1..=100, got {}",
                self.capture.jpeg_quality
            ));
        }
        if self.recording.width == 0 || self.recording.height == 0 || self.recording.fps == 0 {
            return Err(anyhow!("recording resolution and fps must be non-zero"));
        }
        if self.recording.bitrate == 0 {
            return Err(anyhow!("recording bitrate must be greater than zero"));
        }
        if self.remux.timeout.is_zero() {
            return Err(anyhow!("remux timeout must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<CaptureConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer, got {:?}", key, value)),
        _ => Ok(None),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_size(value: &str) -> Option<(u32, u32)> {
    let (width, height) = value.trim().split_once(['x', 'X'])?;
    Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_sensor_and_detector() {
        let cfg = CaptureConfig::default();
        assert_eq!(cfg.sensor.device, "stub://camera");
        assert_eq!((cfg.sensor.width, cfg.sensor.height), (1920, 1080));
        assert_eq!(cfg.sensor.fps, 30);
        assert_eq!(cfg.acquisition.timeout, Duration::from_millis(500));
        assert_eq!(cfg.acquisition.backoff, Duration::from_millis(10));
        assert_eq!((cfg.preprocess.target_width, cfg.preprocess.target_height), (640, 640));
        assert!(cfg.preprocess.contrast_enabled);
        assert_eq!(cfg.preprocess.contrast, ContrastParams::gentle());
        assert_eq!(cfg.capture.jpeg_quality, 95);
        assert_eq!(cfg.recording.bitrate, 15_000_000);
        assert_eq!(cfg.recording.settle, Duration::from_millis(300));
        assert_eq!(cfg.remux.timeout, Duration::from_secs(60));
        cfg.validate().unwrap();
    }

    #[test]
    fn size_and_bool_parsing() {
        assert_eq!(parse_size("640x480"), Some((640, 480)));
        assert_eq!(parse_size(" 320 X 320 "), Some((320, 320)));
        assert_eq!(parse_size("640"), None);
        assert_eq!(parse_size("ax1"), None);
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn options_follow_request_flags() {
        let settings = CaptureConfig::default().preprocess;
        let options = settings.options(false, Some((320, 240)), true);
        assert_eq!(options.contrast, None);
        assert_eq!((options.target_width, options.target_height), (320, 240));
        assert_eq!(options.normalize, Some(NormalizeParams::default()));

        let options = settings.options(true, None, false);
        assert_eq!(options.contrast, Some(ContrastParams::gentle()));
        assert_eq!(options.target_width, 640);
        assert_eq!(options.normalize, None);
    }
}
