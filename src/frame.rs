//! Frame snapshots shared between the acquisition worker and its readers.
//!
//! - `Frame`: immutable pixel buffer. Never mutated after construction; a new capture
//!   replaces the shared `Arc<Frame>` wholesale.
//! - `FrameRing`: bounded rolling history of recent frames.
//! - `FrameSlot`: the latest frame plus history behind a single lock, so a reader sees
//!   either a complete frame or none.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Default number of frames kept in the rolling history.
pub const DEFAULT_HISTORY_FRAMES: usize = 5;

/// RGB frames carry three interleaved channels.
pub const RGB_CHANNELS: u8 = 3;

// ----------------------------------------------------------------------------
// Frame: immutable snapshot
// ----------------------------------------------------------------------------

/// Immutable interleaved pixel buffer with capture metadata.
#[derive(Debug)]
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    /// Wall-clock capture time. Drives cooldowns and storage partitioning.
    pub captured_at: DateTime<Utc>,
    /// Monotonic per-source sequence number, starting at 1.
    pub sequence: u64,
}

impl Frame {
    /// Build a frame, rejecting buffers whose length does not match the dimensions.
    pub fn new(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        channels: u8,
        captured_at: DateTime<Utc>,
        sequence: u64,
    ) -> Result<Self> {
        if width == 0 || height == 0 || channels == 0 {
            return Err(anyhow!(
                "frame dimensions must be non-zero ({}x{}x{})",
                width,
                height,
                channels
            ));
        }
        let expected = expected_len(width, height, channels)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame buffer holds {} bytes, expected {} for {}x{}x{}",
                pixels.len(),
                expected,
                width,
                height,
                channels
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            channels,
            captured_at,
            sequence,
        })
    }

    pub fn rgb(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        captured_at: DateTime<Utc>,
        sequence: u64,
    ) -> Result<Self> {
        Self::new(pixels, width, height, RGB_CHANNELS, captured_at, sequence)
    }

    pub fn from_rgb_image(image: RgbImage, captured_at: DateTime<Utc>, sequence: u64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            pixels: image.into_raw(),
            width,
            height,
            channels: RGB_CHANNELS,
            captured_at,
            sequence,
        }
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Copy the pixels into an `RgbImage` for drawing or encoding.
    pub fn to_rgb_image(&self) -> Result<RgbImage> {
        if self.channels != RGB_CHANNELS {
            return Err(anyhow!(
                "expected {} channel frame, got {}",
                RGB_CHANNELS,
                self.channels
            ));
        }
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| anyhow!("frame buffer does not fit {}x{}", self.width, self.height))
    }

    /// Encode as JPEG with the given quality (clamped to 1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let image = self.to_rgb_image()?;
        let mut buffer = Vec::new();
        JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
            .encode_image(&image)
            .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
        Ok(buffer)
    }
}

fn expected_len(width: u32, height: u32, channels: u8) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(channels as usize))
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}

// ----------------------------------------------------------------------------
// FrameRing: bounded history
// ----------------------------------------------------------------------------

/// Bounded ring of recent frames in arrival order. Oldest frames are evicted first.
#[derive(Debug)]
pub struct FrameRing {
    buffer: VecDeque<Arc<Frame>>,
    max_frames: usize,
}

impl FrameRing {
    pub fn new(max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        Self {
            buffer: VecDeque::with_capacity(max_frames),
            max_frames,
        }
    }

    pub fn push(&mut self, frame: Arc<Frame>) {
        while self.buffer.len() >= self.max_frames {
            self.buffer.pop_front();
        }
        self.buffer.push_back(frame);
    }

    pub fn latest(&self) -> Option<&Arc<Frame>> {
        self.buffer.back()
    }

    /// Up to the last `n` frames, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Arc<Frame>> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_frames
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn memory_bytes(&self) -> usize {
        self.buffer.iter().map(|f| f.byte_len()).sum()
    }
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_FRAMES)
    }
}

// ----------------------------------------------------------------------------
// FrameSlot: atomically swapped latest frame + history
// ----------------------------------------------------------------------------

/// Single-writer, multi-reader holder for the most recent frame and its history.
///
/// Writers publish a fully built `Arc<Frame>`; readers clone the `Arc` under the lock.
/// No frame is ever modified in place.
#[derive(Debug)]
pub struct FrameSlot {
    inner: Mutex<FrameRing>,
}

impl FrameSlot {
    pub fn new(history: usize) -> Self {
        Self {
            inner: Mutex::new(FrameRing::new(history)),
        }
    }

    pub fn publish(&self, frame: Frame) -> Result<Arc<Frame>> {
        let frame = Arc::new(frame);
        let mut ring = self
            .inner
            .lock()
            .map_err(|_| anyhow!("frame slot lock poisoned"))?;
        ring.push(frame.clone());
        Ok(frame)
    }

    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.inner.lock().ok()?.latest().cloned()
    }

    pub fn recent(&self, n: usize) -> Vec<Arc<Frame>> {
        match self.inner.lock() {
            Ok(ring) => ring.recent(n),
            Err(_) => Vec::new(),
        }
    }

    pub fn clear(&self) {
        if let Ok(mut ring) = self.inner.lock() {
            ring.clear();
        }
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_FRAMES)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_frame(sequence: u64) -> Frame {
        Frame::rgb(vec![sequence as u8; 4 * 2 * 3], 4, 2, Utc::now(), sequence).unwrap()
    }

    #[test]
    fn frame_rejects_mismatched_buffer() {
        let err = Frame::rgb(vec![0u8; 10], 4, 2, Utc::now(), 1).unwrap_err();
        assert!(err.to_string().contains("expected 24"));
        assert!(Frame::rgb(Vec::new(), 0, 2, Utc::now(), 1).is_err());
    }

    #[test]
    fn frame_converts_to_image_and_jpeg() {
        let frame = make_test_frame(7);
        let image = frame.to_rgb_image().unwrap();
        assert_eq!(image.dimensions(), (4, 2));
        assert_eq!(image.get_pixel(0, 0).0, [7, 7, 7]);

        let jpeg = frame.encode_jpeg(90).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn frame_ring_enforces_capacity() {
        let mut ring = FrameRing::new(5);
        for i in 1..=12 {
            ring.push(Arc::new(make_test_frame(i)));
        }
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.latest().unwrap().sequence, 12);

        let recent: Vec<u64> = ring.recent(3).iter().map(|f| f.sequence).collect();
        assert_eq!(recent, vec![10, 11, 12]);

        let all: Vec<u64> = ring.recent(50).iter().map(|f| f.sequence).collect();
        assert_eq!(all, vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn frame_slot_publishes_whole_frames() {
        let slot = FrameSlot::new(2);
        assert!(slot.latest().is_none());
        assert!(slot.recent(3).is_empty());

        let first = slot.publish(make_test_frame(1)).unwrap();
        slot.publish(make_test_frame(2)).unwrap();
        slot.publish(make_test_frame(3)).unwrap();

        // Earlier snapshots stay valid after being superseded.
        assert_eq!(first.sequence, 1);
        assert_eq!(first.pixels()[0], 1);

        let latest = slot.latest().unwrap();
        assert_eq!(latest.sequence, 3);
        assert_eq!(slot.recent(5).len(), 2);
    }
}
