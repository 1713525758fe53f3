//! Cheap per-frame sanity checks run before any conversion work

use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use crate::error::RejectReason;

/// A frame that passed validation
#[derive(Debug, Clone)]
pub struct ValidatedFrame {
    pub frame: VideoFrame,
    /// The format is not the canonical encoder input and must be converted
    pub needs_conversion: bool,
}

/// Frame validator
///
/// Pure predicate: a rejected frame is dropped by the caller and never retried.
#[derive(Debug, Clone)]
pub struct FrameValidator {
    min: Resolution,
    max: Resolution,
}

impl Default for FrameValidator {
    fn default() -> Self {
        Self {
            min: Resolution::MIN,
            max: Resolution::MAX,
        }
    }
}

impl FrameValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validator with custom bounds (clamped to the pipeline's hard limits)
    pub fn with_bounds(min: Resolution, max: Resolution) -> Self {
        Self {
            min: Resolution::new(
                min.width.max(Resolution::MIN.width),
                min.height.max(Resolution::MIN.height),
            ),
            max: Resolution::new(
                max.width.min(Resolution::MAX.width),
                max.height.min(Resolution::MAX.height),
            ),
        }
    }

    pub fn validate(&self, frame: VideoFrame) -> Result<ValidatedFrame, RejectReason> {
        let Resolution { width, height } = frame.resolution;

        if width == 0 || height == 0 {
            return Err(RejectReason::ZeroDimension);
        }
        if width < self.min.width || height < self.min.height {
            return Err(RejectReason::TooSmall);
        }
        if width > self.max.width || height > self.max.height {
            return Err(RejectReason::TooLarge);
        }
        if (frame.stride as usize) < frame.format.min_stride(width)
            || frame.len() < frame.expected_len()
        {
            return Err(RejectReason::Truncated);
        }

        let needs_conversion = frame.format != PixelFormat::CANONICAL;
        Ok(ValidatedFrame {
            frame,
            needs_conversion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, format: PixelFormat) -> VideoFrame {
        let res = Resolution::new(width, height);
        VideoFrame::from_vec(vec![0u8; format.frame_size(res)], res, format, 0)
    }

    #[test]
    fn test_accepts_canonical_frame() {
        let v = FrameValidator::new();
        let ok = v.validate(frame(1280, 720, PixelFormat::Yuv420)).unwrap();
        assert!(!ok.needs_conversion);
    }

    #[test]
    fn test_flags_non_canonical_format() {
        let v = FrameValidator::new();
        let ok = v.validate(frame(1280, 720, PixelFormat::Bgra)).unwrap();
        assert!(ok.needs_conversion);
        let ok = v.validate(frame(640, 480, PixelFormat::Grey)).unwrap();
        assert!(ok.needs_conversion);
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        let v = FrameValidator::new();
        assert_eq!(
            v.validate(frame(0, 720, PixelFormat::Yuv420)).unwrap_err(),
            RejectReason::ZeroDimension
        );
        assert_eq!(
            v.validate(frame(159, 120, PixelFormat::Yuv420)).unwrap_err(),
            RejectReason::TooSmall
        );
        assert_eq!(
            v.validate(frame(3856, 2160, PixelFormat::Yuv420)).unwrap_err(),
            RejectReason::TooLarge
        );
        assert!(v.validate(frame(160, 120, PixelFormat::Yuv420)).is_ok());
        assert!(v.validate(frame(3840, 2160, PixelFormat::Yuv420)).is_ok());
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let v = FrameValidator::new();
        let res = Resolution::new(320, 240);
        let short = VideoFrame::from_vec(vec![0u8; 100], res, PixelFormat::Rgba, 0);
        assert_eq!(v.validate(short).unwrap_err(), RejectReason::Truncated);
    }

    #[test]
    fn test_custom_bounds_are_clamped() {
        let v = FrameValidator::with_bounds(Resolution::new(10, 10), Resolution::new(8000, 8000));
        assert_eq!(
            v.validate(frame(100, 100, PixelFormat::Grey)).unwrap_err(),
            RejectReason::TooSmall
        );
    }
}
