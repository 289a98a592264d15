//! Aspect-preserving resize onto a fixed canvas.
//!
//! The frame is scaled by `min(tw/ow, th/oh)`, resized with Catmull-Rom
//! (bicubic) interpolation and centred on a black canvas. `LetterboxMeta`
//! records the transform so detector coordinates can be mapped back:
//! `original = (canvas - pad) / scale`.

use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::frame::Frame;

/// Geometry of one letterbox transform. Produced only by [`letterbox`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LetterboxMeta {
    scale: f64,
    pad_x: u32,
    pad_y: u32,
    original_width: u32,
    original_height: u32,
    content_width: u32,
    content_height: u32,
    target_width: u32,
    target_height: u32,
}

impl LetterboxMeta {
    fn compute(original_width: u32, original_height: u32, target_width: u32, target_height: u32) -> Self {
        let scale = f64::min(
            target_width as f64 / original_width as f64,
            target_height as f64 / original_height as f64,
        );
        let content_width = scaled_len(original_width, scale, target_width);
        let content_height = scaled_len(original_height, scale, target_height);
        Self {
            scale,
            pad_x: (target_width - content_width) / 2,
            pad_y: (target_height - content_height) / 2,
            original_width,
            original_height,
            content_width,
            content_height,
            target_width,
            target_height,
        }
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn pad_x(&self) -> u32 {
        self.pad_x
    }

    pub fn pad_y(&self) -> u32 {
        self.pad_y
    }

    pub fn original_size(&self) -> (u32, u32) {
        (self.original_width, self.original_height)
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    /// `(x, y, width, height)` of the resized frame on the canvas.
    pub fn content_rect(&self) -> (u32, u32, u32, u32) {
        (self.pad_x, self.pad_y, self.content_width, self.content_height)
    }

    /// Canvas coordinates to original-frame coordinates (unclamped).
    pub fn to_original(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.pad_x as f64) / self.scale,
            (y - self.pad_y as f64) / self.scale,
        )
    }

    /// Original-frame coordinates to canvas coordinates.
    pub fn to_canvas(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x * self.scale + self.pad_x as f64,
            y * self.scale + self.pad_y as f64,
        )
    }

    /// Map an `x1, y1, x2, y2` box from the canvas back onto the original
    /// frame, clamped to its bounds.
    pub fn box_to_original(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> [f64; 4] {
        let max_x = self.original_width as f64;
        let max_y = self.original_height as f64;
        let (ox1, oy1) = self.to_original(x1, y1);
        let (ox2, oy2) = self.to_original(x2, y2);
        [
            ox1.clamp(0.0, max_x),
            oy1.clamp(0.0, max_y),
            ox2.clamp(0.0, max_x),
            oy2.clamp(0.0, max_y),
        ]
    }
}

fn scaled_len(len: u32, scale: f64, target: u32) -> u32 {
    ((len as f64 * scale).round() as u32).clamp(1, target)
}

/// Fit `frame` inside a `target_width x target_height` canvas.
pub fn letterbox(frame: &Frame, target_width: u32, target_height: u32) -> Result<(Frame, LetterboxMeta)> {
    if frame.is_zero_area() {
        return Err(CaptureError::invalid(format!(
            "cannot letterbox a zero-area frame ({}x{})",
            frame.width(),
            frame.height()
        )));
    }
    if target_width == 0 || target_height == 0 {
        return Err(CaptureError::invalid(format!(
            "letterbox target must be non-zero, got {}x{}",
            target_width, target_height
        )));
    }

    let meta = LetterboxMeta::compute(frame.width(), frame.height(), target_width, target_height);
    let (_, _, content_width, content_height) = meta.content_rect();

    let source = frame.to_rgb_image()?;
    let resized = if (content_width, content_height) == frame.dimensions() {
        source
    } else {
        imageops::resize(&source, content_width, content_height, FilterType::CatmullRom)
    };

    let canvas = if (content_width, content_height) == (target_width, target_height) {
        resized
    } else {
        let mut canvas = RgbImage::new(target_width, target_height);
        imageops::replace(&mut canvas, &resized, meta.pad_x as i64, meta.pad_y as i64);
        canvas
    };

    log::debug!(
        "letterbox {}x{} -> {}x{} (scale {:.4}, pad {}x{})",
        frame.width(),
        frame.height(),
        target_width,
        target_height,
        meta.scale,
        meta.pad_x,
        meta.pad_y
    );

    Ok((Frame::from_rgb_image(canvas).with_capture_of(frame), meta))
}
