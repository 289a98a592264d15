//! Channel-major float tensors and per-channel normalization.

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::frame::{Frame, CHANNELS};

/// ImageNet channel means (RGB).
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations (RGB).
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizeParams {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl NormalizeParams {
    pub fn validate(&self) -> Result<()> {
        if self.mean.iter().any(|m| !m.is_finite()) {
            return Err(CaptureError::invalid(format!(
                "normalization mean must be finite, got {:?}",
                self.mean
            )));
        }
        if self.std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(CaptureError::invalid(format!(
                "normalization std must be finite and positive, got {:?}",
                self.std
            )));
        }
        Ok(())
    }
}

/// `3 x H x W` f32 tensor, channel-major.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Tensor {
    data: Vec<f32>,
    height: usize,
    width: usize,
}

impl Tensor {
    /// Wrap CHW data. The length must be exactly `3 * height * width`.
    pub fn from_vec(data: Vec<f32>, height: usize, width: usize) -> Result<Self> {
        let expected = CHANNELS
            .checked_mul(height)
            .and_then(|v| v.checked_mul(width))
            .ok_or_else(|| CaptureError::invalid("tensor dimensions overflow"))?;
        if data.len() != expected {
            return Err(CaptureError::invalid(format!(
                "tensor length mismatch: expected {} for 3x{}x{}, got {}",
                expected,
                height,
                width,
                data.len()
            )));
        }
        Ok(Self { data, height, width })
    }

    /// `[channels, height, width]`.
    pub fn shape(&self) -> [usize; 3] {
        [CHANNELS, self.height, self.width]
    }

    pub fn get(&self, channel: usize, y: usize, x: usize) -> Option<f32> {
        if channel >= CHANNELS || y >= self.height || x >= self.width {
            return None;
        }
        Some(self.data[(channel * self.height + y) * self.width + x])
    }

    /// One channel plane, row-major.
    pub fn channel(&self, channel: usize) -> Option<&[f32]> {
        let plane = self.height * self.width;
        self.data.get(channel * plane..(channel + 1) * plane)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

/// `v / 255`, subtract mean, divide by std, reorder HWC to CHW.
pub fn normalize(frame: &Frame, params: &NormalizeParams) -> Result<Tensor> {
    params.validate()?;
    if frame.is_zero_area() {
        return Err(CaptureError::invalid("cannot normalize a zero-area frame"));
    }

    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let plane = width * height;
    let mut data = vec![0f32; plane * CHANNELS];

    for (idx, px) in frame.pixels().chunks_exact(CHANNELS).enumerate() {
        for channel in 0..CHANNELS {
            let v = px[channel] as f32 / 255.0;
            data[channel * plane + idx] = (v - params.mean[channel]) / params.std[channel];
        }
    }

    Tensor::from_vec(data, height, width)
}

/// Inverse of [`normalize`]: back to RGB24, rounded and clamped.
pub fn denormalize(tensor: &Tensor, params: &NormalizeParams) -> Result<Frame> {
    params.validate()?;
    let [_, height, width] = tensor.shape();
    let plane = width * height;
    let data = tensor.as_slice();

    let mut pixels = Vec::with_capacity(plane * CHANNELS);
    for idx in 0..plane {
        for channel in 0..CHANNELS {
            let v = (data[channel * plane + idx] * params.std[channel] + params.mean[channel]) * 255.0;
            pixels.push(v.round().clamp(0.0, 255.0) as u8);
        }
    }

    let width = u32::try_from(width).map_err(|_| CaptureError::invalid("tensor too wide for a frame"))?;
    let height = u32::try_from(height).map_err(|_| CaptureError::invalid("tensor too tall for a frame"))?;
    Frame::new(pixels, width, height)
}
