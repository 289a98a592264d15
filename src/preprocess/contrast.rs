//! Per-channel percentile contrast stretch.
//!
//! Percentiles rather than min/max so a handful of hot or dead pixels cannot
//! pin the range. Percentiles are read from a 256-bin histogram per channel
//! and interpolated linearly between order statistics.

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, Result};
use crate::frame::{Frame, CHANNELS};

/// Added to the denominator so a uniform channel does not divide by zero.
const EPSILON: f32 = 1e-3;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContrastParams {
    /// Percentile mapped to 0.
    pub low_pct: f32,
    /// Percentile mapped to 255.
    pub high_pct: f32,
}

impl ContrastParams {
    pub const fn new(low_pct: f32, high_pct: f32) -> Self {
        Self { low_pct, high_pct }
    }

    /// 1/99: keeps colours close to the sensor's rendition.
    pub const fn gentle() -> Self {
        Self::new(1.0, 99.0)
    }

    /// 2/98: stronger stretch for general scenes.
    pub const fn aggressive() -> Self {
        Self::new(2.0, 98.0)
    }

    pub fn validate(&self) -> Result<()> {
        let Self { low_pct, high_pct } = *self;
        if !low_pct.is_finite() || !high_pct.is_finite() {
            return Err(CaptureError::invalid("contrast percentiles must be finite"));
        }
        if !(0.0..=100.0).contains(&low_pct) || !(0.0..=100.0).contains(&high_pct) {
            return Err(CaptureError::invalid(format!(
                "contrast percentiles must lie in [0, 100], got {}/{}",
                low_pct, high_pct
            )));
        }
        if low_pct >= high_pct {
            return Err(CaptureError::invalid(format!(
                "low percentile {} must be below high percentile {}",
                low_pct, high_pct
            )));
        }
        Ok(())
    }
}

impl Default for ContrastParams {
    fn default() -> Self {
        Self::gentle()
    }
}

/// Remap each channel so its low percentile becomes 0 and its high percentile
/// becomes 255, clamping values outside that range.
pub fn contrast_stretch(frame: &Frame, params: &ContrastParams) -> Result<Frame> {
    params.validate()?;
    if frame.is_zero_area() {
        return Err(CaptureError::invalid(format!(
            "cannot stretch a zero-area frame ({}x{})",
            frame.width(),
            frame.height()
        )));
    }

    let mut histograms = [[0u64; 256]; CHANNELS];
    for px in frame.pixels().chunks_exact(CHANNELS) {
        for (channel, &value) in px.iter().enumerate() {
            histograms[channel][value as usize] += 1;
        }
    }
    let count = frame.width() as u64 * frame.height() as u64;

    let mut luts = [[0u8; 256]; CHANNELS];
    for (lut, histogram) in luts.iter_mut().zip(histograms.iter()) {
        let low = percentile(histogram, count, params.low_pct) as f32;
        let high = percentile(histogram, count, params.high_pct) as f32;
        let span = high - low + EPSILON;
        for (value, out) in lut.iter_mut().enumerate() {
            let stretched = ((value as f32 - low) / span).clamp(0.0, 1.0);
            *out = (stretched * 255.0) as u8;
        }
    }

    let pixels = frame
        .pixels()
        .chunks_exact(CHANNELS)
        .flat_map(|px| {
            [
                luts[0][px[0] as usize],
                luts[1][px[1] as usize],
                luts[2][px[2] as usize],
            ]
        })
        .collect();

    Ok(Frame::new(pixels, frame.width(), frame.height())?.with_capture_of(frame))
}

/// Linear-interpolated percentile over `count` samples summarised by `histogram`.
fn percentile(histogram: &[u64; 256], count: u64, pct: f32) -> f64 {
    let rank = pct as f64 / 100.0 * (count - 1) as f64;
    let lower = rank.floor() as u64;
    let upper = (rank.ceil() as u64).min(count - 1);
    let a = order_statistic(histogram, lower) as f64;
    let b = order_statistic(histogram, upper) as f64;
    a + (b - a) * (rank - lower as f64)
}

/// Value of the `k`-th smallest sample (0-based).
fn order_statistic(histogram: &[u64; 256], k: u64) -> u8 {
    let mut seen = 0u64;
    for (value, &n) in histogram.iter().enumerate() {
        seen += n;
        if seen > k {
            return value as u8;
        }
    }
    255
}
