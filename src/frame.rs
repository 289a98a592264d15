//! Frames and the latest-frame slot.
//!
//! - `Frame`: owned RGB24 pixel grid with capture timestamps.
//! - `FrameBuffer`: single-slot holder of the most recent frame. One writer
//!   (the acquisition loop), any number of readers. Readers always receive a
//!   deep copy, never a view into the slot.
//!
//! A published frame is never mutated: the slot holds it behind an `Arc`, and
//! the only way out is `snapshot()`, which copies the pixels.

use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{CaptureError, Result};

/// Interleaved channels per pixel.
pub const CHANNELS: usize = 3;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// RGB24 frame, row-major, 3 interleaved 8-bit channels.
///
/// `Clone` is a deep copy. Frames handed out by `FrameBuffer::snapshot` are
/// owned by the caller and may be modified freely.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    /// Monotonic capture instant (frame age, ordering).
    captured_at: Instant,
    /// Wall-clock capture time (file naming, logs).
    captured_wall: SystemTime,
    /// Per-source sequence number, 0 when the frame did not come from a source.
    sequence: u64,
}

impl Frame {
    /// Wrap RGB24 pixels. The buffer length must be exactly `width * height * 3`.
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = expected_len(width, height)?;
        if data.len() != expected {
            return Err(CaptureError::invalid(format!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            captured_at: Instant::now(),
            captured_wall: SystemTime::now(),
            sequence: 0,
        })
    }

    /// Zero-filled (black) frame.
    pub fn black(width: u32, height: u32) -> Result<Self> {
        let len = expected_len(width, height)?;
        Self::new(vec![0u8; len], width, height)
    }

    pub(crate) fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            captured_at: Instant::now(),
            captured_wall: SystemTime::now(),
            sequence: 0,
        }
    }

    /// Stamp the frame with a source sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Carry capture timestamps over from `source` (derived frames keep the
    /// capture time of the frame they were computed from).
    pub(crate) fn with_capture_of(mut self, source: &Frame) -> Self {
        self.captured_at = source.captured_at;
        self.captured_wall = source.captured_wall;
        self.sequence = source.sequence;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// RGB triple at `(x, y)`, or `None` outside the frame.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let idx = (y as usize * self.width as usize + x as usize) * CHANNELS;
        Some([self.data[idx], self.data[idx + 1], self.data[idx + 2]])
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn captured_wall(&self) -> SystemTime {
        self.captured_wall
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Time since capture.
    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub(crate) fn to_rgb_image(&self) -> Result<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| CaptureError::invalid("frame buffer does not match its dimensions"))
    }

    /// Encode as baseline JPEG. `quality` is clamped to 1..=100.
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        if self.is_zero_area() {
            return Err(CaptureError::invalid("cannot encode a zero-area frame"));
        }
        let mut out = Vec::with_capacity(self.data.len() / 8);
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder.encode(&self.data, self.width, self.height, ExtendedColorType::Rgb8)?;
        Ok(out)
    }

    /// Write the frame to `path` as JPEG.
    pub fn write_jpeg(&self, path: &Path, quality: u8) -> Result<()> {
        let bytes = self.to_jpeg(quality)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

fn expected_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(CHANNELS))
        .ok_or_else(|| CaptureError::invalid("RGB frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// FrameBuffer: latest-frame slot
// ----------------------------------------------------------------------------

/// Single-slot, mutex-guarded holder of the most recent frame.
///
/// - `publish` swaps the slot in O(1); the replaced frame is dropped after the
///   lock is released.
/// - `snapshot` holds the lock only long enough to clone the `Arc`; the pixel
///   copy happens outside the critical section.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: Mutex<Option<Arc<Frame>>>,
    published: AtomicU64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held frame.
    pub fn publish(&self, frame: Frame) {
        let incoming = Arc::new(frame);
        let previous = self.lock().replace(incoming);
        self.published.fetch_add(1, Ordering::Relaxed);
        drop(previous);
    }

    /// Deep copy of the held frame, or `None` before the first publish.
    pub fn snapshot(&self) -> Option<Frame> {
        let held = self.lock().clone();
        held.map(|frame| Frame::clone(&frame))
    }

    /// Age of the held frame.
    pub fn latest_age(&self) -> Option<Duration> {
        self.lock().as_ref().map(|frame| frame.age())
    }

    /// Number of frames published since creation.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Frame>>> {
        // The slot is a single pointer swap, so a panicking holder cannot leave
        // it half-written.
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(value: u8) -> Frame {
        Frame::new(vec![value; 4 * 2 * 3], 4, 2).unwrap()
    }

    #[test]
    fn frame_rejects_length_mismatch() {
        let err = Frame::new(vec![0u8; 10], 4, 2).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidInput(_)));
    }

    #[test]
    fn frame_pixel_lookup_is_row_major() {
        let mut data = vec![0u8; 2 * 2 * 3];
        // (x=1, y=1) is the last pixel
        data[9..12].copy_from_slice(&[10, 20, 30]);
        let frame = Frame::new(data, 2, 2).unwrap();
        assert_eq!(frame.pixel(1, 1), Some([10, 20, 30]));
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0]));
        assert_eq!(frame.pixel(2, 0), None);
    }

    #[test]
    fn snapshot_before_publish_is_empty() {
        let buf = FrameBuffer::new();
        assert!(buf.snapshot().is_none());
        assert!(buf.is_empty());
        assert!(buf.latest_age().is_none());
    }

    #[test]
    fn snapshot_is_independent_copy() {
        let buf = FrameBuffer::new();
        buf.publish(make_test_frame(7).with_sequence(1));

        let mut first = buf.snapshot().expect("frame");
        assert_eq!(first.pixels(), &[7u8; 24][..]);
        assert_eq!(first.sequence(), 1);

        first.pixels_mut().fill(0);

        let second = buf.snapshot().expect("frame");
        assert_eq!(second.pixels(), &[7u8; 24][..]);
        assert_ne!(first.pixels().as_ptr(), second.pixels().as_ptr());
    }

    #[test]
    fn publish_replaces_previous_frame() {
        let buf = FrameBuffer::new();
        buf.publish(make_test_frame(1));
        buf.publish(make_test_frame(2));
        assert_eq!(buf.snapshot().unwrap().pixels()[0], 2);
        assert_eq!(buf.published_count(), 2);
    }

    #[test]
    fn jpeg_encoding_produces_soi_marker() {
        let frame = Frame::new(vec![128u8; 16 * 16 * 3], 16, 16).unwrap();
        let jpeg = frame.to_jpeg(90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
