use serde::Deserialize;
use std::str::FromStr;

use crate::error::{CaptureError, Result};

/// Pixel layouts accepted from sensors. Everything is converted to RGB24.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Rgb24,
    /// Byte order B, G, R. Some ISPs label this "RGB888".
    Bgr24,
    Nv12,
    Yuyv,
}

impl PixelFormat {
    /// V4L2 fourcc for this layout.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Bgr24 => *b"BGR3",
            PixelFormat::Nv12 => *b"NV12",
            PixelFormat::Yuyv => *b"YUYV",
        }
    }

    /// Bytes per row of the first plane, without padding.
    pub(crate) fn row_bytes(self, width: u32) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width as usize * 3,
            PixelFormat::Nv12 => width as usize,
            PixelFormat::Yuyv => width as usize * 2,
        }
    }

    /// Rows in the buffer (NV12 carries a half-height chroma plane).
    pub(crate) fn rows(self, height: u32) -> usize {
        match self {
            PixelFormat::Nv12 => height as usize + height as usize / 2,
            _ => height as usize,
        }
    }
}

impl FromStr for PixelFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rgb24" | "rgb" => Ok(PixelFormat::Rgb24),
            "bgr24" | "bgr" => Ok(PixelFormat::Bgr24),
            "nv12" => Ok(PixelFormat::Nv12),
            "yuyv" | "yuy2" => Ok(PixelFormat::Yuyv),
            other => Err(CaptureError::invalid(format!(
                "unsupported pixel format '{}'",
                other
            ))),
        }
    }
}

/// Copy rows out of a padded buffer. Returns the input untouched when there
/// is no padding.
#[cfg_attr(
    not(any(feature = "sensor-v4l2", feature = "sensor-gstreamer")),
    allow(dead_code)
)]
pub(crate) fn strip_stride(data: &[u8], row_bytes: usize, rows: usize, stride: usize) -> Result<Vec<u8>> {
    if stride == row_bytes || stride == 0 {
        let len = row_bytes * rows;
        return data
            .get(..len)
            .map(|d| d.to_vec())
            .ok_or_else(|| CaptureError::sensor("sensor buffer is shorter than one frame"));
    }
    if stride < row_bytes {
        return Err(CaptureError::sensor(format!(
            "sensor stride {} is smaller than row size {}",
            stride, row_bytes
        )));
    }

    let mut pixels = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| CaptureError::sensor("sensor buffer row is out of bounds"))?,
        );
    }
    Ok(pixels)
}

/// Convert a tightly packed buffer to RGB24.
pub(crate) fn to_rgb24(pixels: &[u8], width: u32, height: u32, format: PixelFormat) -> Result<Vec<u8>> {
    let expected = format
        .row_bytes(width)
        .checked_mul(format.rows(height))
        .ok_or_else(|| CaptureError::invalid("frame dimensions overflow"))?;
    if pixels.len() != expected {
        return Err(CaptureError::sensor(format!(
            "{:?} frame length mismatch: expected {}, got {}",
            format,
            expected,
            pixels.len()
        )));
    }

    match format {
        PixelFormat::Rgb24 => Ok(pixels.to_vec()),
        PixelFormat::Bgr24 => Ok(pixels
            .chunks_exact(3)
            .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
            .collect()),
        PixelFormat::Nv12 => Ok(nv12_to_rgb(pixels, width, height)),
        PixelFormat::Yuyv => Ok(yuyv_to_rgb(pixels, width, height)),
    }
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let y_plane = w * h;

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let offset = (j * w + i) * 3;
            rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
        }
    }
    rgb
}

fn yuyv_to_rgb(pixels: &[u8], width: u32, height: u32) -> Vec<u8> {
    let pairs = (width as usize / 2) * height as usize;
    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in pixels.chunks_exact(4).take(pairs) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;
        rgb.extend_from_slice(&yuv_to_rgb(chunk[0] as f32, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(chunk[2] as f32, u, v));
    }
    rgb
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    [clamp_to_u8(r), clamp_to_u8(g), clamp_to_u8(b)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
