//! Video frame data structures

use bytes::Bytes;
use std::time::{Duration, Instant};

use super::format::{PixelFormat, Resolution};

/// A captured or normalized video frame with metadata
///
/// The payload is reference counted, so cloning a frame never copies pixels.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw frame data
    data: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Pixel format
    pub format: PixelFormat,
    /// Stride (bytes per line of the first plane)
    pub stride: u32,
    /// Frame sequence number
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub capture_ts: Instant,
}

impl VideoFrame {
    /// Create a new video frame
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        stride: u32,
        sequence: u64,
    ) -> Self {
        Self {
            data,
            resolution,
            format,
            stride,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    /// Create a tightly packed frame from a Vec<u8>
    pub fn from_vec(
        data: Vec<u8>,
        resolution: Resolution,
        format: PixelFormat,
        sequence: u64,
    ) -> Self {
        let stride = format.min_stride(resolution.width) as u32;
        Self::new(Bytes::from(data), resolution, format, stride, sequence)
    }

    /// Wrap a tightly packed I420 payload
    pub fn from_i420(data: Bytes, resolution: Resolution, sequence: u64) -> Self {
        let stride = PixelFormat::Yuv420.min_stride(resolution.width) as u32;
        Self::new(data, resolution, PixelFormat::Yuv420, stride, sequence)
    }

    /// Keep the capture timestamp of another frame (used by derived frames)
    pub fn with_capture_ts(mut self, capture_ts: Instant) -> Self {
        self.capture_ts = capture_ts;
        self
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Get frame data as Bytes (cheap clone)
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if frame is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get width
    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    /// Get height
    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Payload size this frame's format, size and stride require
    pub fn expected_len(&self) -> usize {
        self.format
            .frame_size_with_stride(self.resolution, self.stride as usize)
    }

    /// Whether the stride is the tightest one possible for the format
    pub fn is_tightly_packed(&self) -> bool {
        self.stride as usize == self.format.min_stride(self.resolution.width)
    }

    /// Get age of this frame (time since capture)
    pub fn age(&self) -> Duration {
        self.capture_ts.elapsed()
    }

    /// Check if this frame is still fresh (within threshold)
    pub fn is_fresh(&self, max_age_ms: u64) -> bool {
        self.age().as_millis() < max_age_ms as u128
    }
}

/// Frame metadata without actual data (for logging/stats)
#[derive(Debug, Clone)]
pub struct FrameMeta {
    pub resolution: Resolution,
    pub format: PixelFormat,
    pub size: usize,
    pub sequence: u64,
}

impl From<&VideoFrame> for FrameMeta {
    fn from(frame: &VideoFrame) -> Self {
        Self {
            resolution: frame.resolution,
            format: frame.format,
            size: frame.len(),
            sequence: frame.sequence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_uses_tight_stride() {
        let res = Resolution::new(160, 120);
        let frame = VideoFrame::from_vec(
            vec![0u8; PixelFormat::Bgra.frame_size(res)],
            res,
            PixelFormat::Bgra,
            7,
        );
        assert_eq!(frame.stride, 640);
        assert!(frame.is_tightly_packed());
        assert_eq!(frame.expected_len(), frame.len());
        assert_eq!(frame.sequence, 7);
    }

    #[test]
    fn test_clone_shares_payload() {
        let res = Resolution::new(160, 120);
        let frame = VideoFrame::from_vec(vec![1u8; 160 * 120], res, PixelFormat::Grey, 0);
        let copy = frame.clone();
        assert_eq!(frame.data().as_ptr(), copy.data().as_ptr());
        assert!(frame.is_fresh(10_000));
    }
}
