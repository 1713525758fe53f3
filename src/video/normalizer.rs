//! Frame normalization: color conversion plus encoder-safe scaling
//!
//! Every frame leaves here as tightly packed I420. When scaling fails on
//! both paths the converted, unscaled frame is handed on and flagged as
//! degraded so the stream keeps flowing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::convert::{convert_to_i420, yuv420p_buffer_size};
use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use super::pool::BufferPool;
use super::scale::{BilinearScaler, CompositingScaler, ScalePath};
use crate::error::NormalizeError;
use crate::utils::LogThrottler;

/// Default number of buffers the normalizer may have in flight
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Output geometry the encoder expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeTarget {
    pub resolution: Resolution,
}

impl NormalizeTarget {
    /// Target for a requested resolution, rounded up to encoder-safe dimensions
    pub fn new(requested: Resolution) -> Self {
        Self {
            resolution: requested.encoder_safe(),
        }
    }

    /// Target with exactly this resolution (no alignment applied)
    pub fn exact(resolution: Resolution) -> Self {
        Self { resolution }
    }
}

/// Result of normalizing one frame
#[derive(Debug, Clone)]
pub struct Normalized {
    pub frame: VideoFrame,
    /// Scaling failed; `frame` is converted but keeps the source size
    pub degraded: bool,
}

/// Normalizer counters
#[derive(Debug, Default)]
struct Counters {
    passthrough: AtomicU64,
    fallback: AtomicU64,
    degraded: AtomicU64,
}

/// Snapshot of normalizer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub passthrough: u64,
    pub fallback: u64,
    pub degraded: u64,
}

/// Format normalizer
pub struct FormatNormalizer {
    pool: BufferPool,
    primary: Box<dyn ScalePath>,
    fallback: Box<dyn ScalePath>,
    counters: Arc<Counters>,
    throttler: LogThrottler,
}

impl FormatNormalizer {
    /// Normalizer with the default bilinear/compositing scaler pair
    pub fn new(pool: BufferPool) -> Self {
        Self::with_scalers(pool, Box::new(BilinearScaler), Box::new(CompositingScaler))
    }

    /// Normalizer with explicit scaling paths
    pub fn with_scalers(
        pool: BufferPool,
        primary: Box<dyn ScalePath>,
        fallback: Box<dyn ScalePath>,
    ) -> Self {
        Self {
            pool,
            primary,
            fallback,
            counters: Arc::new(Counters::default()),
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn stats(&self) -> NormalizerStats {
        NormalizerStats {
            passthrough: self.counters.passthrough.load(Ordering::Relaxed),
            fallback: self.counters.fallback.load(Ordering::Relaxed),
            degraded: self.counters.degraded.load(Ordering::Relaxed),
        }
    }

    /// Normalize a frame into I420 at the target resolution
    pub fn normalize(
        &self,
        frame: VideoFrame,
        target: NormalizeTarget,
    ) -> Result<Normalized, NormalizeError> {
        let src_res = frame.resolution;

        if frame.format == PixelFormat::CANONICAL
            && src_res == target.resolution
            && frame.is_tightly_packed()
        {
            self.counters.passthrough.fetch_add(1, Ordering::Relaxed);
            return Ok(Normalized {
                frame,
                degraded: false,
            });
        }

        let converted = if frame.format == PixelFormat::CANONICAL && frame.is_tightly_packed() {
            frame.clone()
        } else {
            let mut buf = self
                .pool
                .acquire(yuv420p_buffer_size(src_res))
                .ok_or(NormalizeError::PoolExhausted)?;
            convert_to_i420(&frame, &mut buf)?;
            VideoFrame::from_i420(buf.freeze(), src_res, frame.sequence)
                .with_capture_ts(frame.capture_ts)
        };

        if src_res == target.resolution {
            return Ok(Normalized {
                frame: converted,
                degraded: false,
            });
        }

        let mut dst = self
            .pool
            .acquire(yuv420p_buffer_size(target.resolution))
            .ok_or(NormalizeError::PoolExhausted)?;

        let primary = self
            .primary
            .scale(converted.data(), src_res, &mut dst, target.resolution);
        let scaled = match primary {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "{} scaler failed ({}), trying {}",
                    self.primary.name(),
                    e,
                    self.fallback.name()
                );
                self.counters.fallback.fetch_add(1, Ordering::Relaxed);
                match self
                    .fallback
                    .scale(converted.data(), src_res, &mut dst, target.resolution)
                {
                    Ok(()) => true,
                    Err(e) => {
                        if self.throttler.should_log("scale_failed") {
                            warn!(
                                "Scaling {} -> {} failed on every path: {}; sending unscaled frame",
                                src_res, target.resolution, e
                            );
                        }
                        false
                    }
                }
            }
        };

        if !scaled {
            self.counters.degraded.fetch_add(1, Ordering::Relaxed);
            return Ok(Normalized {
                frame: converted,
                degraded: true,
            });
        }

        let frame = VideoFrame::from_i420(dst.freeze(), target.resolution, converted.sequence)
            .with_capture_ts(converted.capture_ts);
        Ok(Normalized {
            frame,
            degraded: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingScaler;

    impl ScalePath for FailingScaler {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn scale(
            &self,
            _src: &[u8],
            _src_res: Resolution,
            _dst: &mut [u8],
            _dst_res: Resolution,
        ) -> Result<(), NormalizeError> {
            Err(NormalizeError::ScaleFailed("unavailable".to_string()))
        }
    }

    fn bgra(res: Resolution) -> VideoFrame {
        VideoFrame::from_vec(
            vec![0x40; PixelFormat::Bgra.frame_size(res)],
            res,
            PixelFormat::Bgra,
            3,
        )
    }

    #[test]
    fn test_output_is_aligned_canonical() {
        let normalizer = FormatNormalizer::new(BufferPool::new(4));
        let target = NormalizeTarget::new(Resolution::new(1280, 720));
        for &format in PixelFormat::all() {
            let res = Resolution::new(642, 482);
            let frame = VideoFrame::from_vec(vec![90; format.frame_size(res)], res, format, 0);
            let out = normalizer.normalize(frame, target).unwrap();
            assert!(!out.degraded);
            assert_eq!(out.frame.format, PixelFormat::CANONICAL);
            assert!(out.frame.resolution.is_macroblock_aligned());
            assert_eq!(out.frame.len(), yuv420p_buffer_size(out.frame.resolution));
        }
    }

    #[test]
    fn test_fill_1088_to_720p() {
        let normalizer = FormatNormalizer::new(BufferPool::new(4));
        let res = Resolution::new(1920, 1088);
        let frame = VideoFrame::from_vec(
            vec![16; PixelFormat::Yuv420.frame_size(res)],
            res,
            PixelFormat::Yuv420,
            1,
        );
        let out = normalizer
            .normalize(frame, NormalizeTarget::exact(Resolution::HD720))
            .unwrap();
        assert_eq!(out.frame.resolution, Resolution::HD720);
        assert_eq!(out.frame.len(), 1280 * 720 * 3 / 2);
        assert_eq!(out.frame.sequence, 1);
    }

    #[test]
    fn test_conformant_frame_passes_through() {
        let normalizer = FormatNormalizer::new(BufferPool::new(1));
        let res = Resolution::HD720;
        let frame = VideoFrame::from_vec(
            vec![7; PixelFormat::Yuv420.frame_size(res)],
            res,
            PixelFormat::Yuv420,
            9,
        );
        let ptr = frame.data().as_ptr();
        let out = normalizer.normalize(frame, NormalizeTarget::new(res)).unwrap();
        assert_eq!(out.frame.data().as_ptr(), ptr);
        assert_eq!(normalizer.stats().passthrough, 1);

        // normalizing the output again changes nothing
        let again = normalizer
            .normalize(out.frame.clone(), NormalizeTarget::new(res))
            .unwrap();
        assert_eq!(again.frame.data(), out.frame.data());
    }

    #[test]
    fn test_fallback_scaler_used_when_primary_fails() {
        let normalizer = FormatNormalizer::with_scalers(
            BufferPool::new(4),
            Box::new(FailingScaler),
            Box::new(CompositingScaler),
        );
        let out = normalizer
            .normalize(bgra(Resolution::VGA), NormalizeTarget::new(Resolution::HD720))
            .unwrap();
        assert!(!out.degraded);
        assert_eq!(out.frame.resolution, Resolution::HD720);
        assert_eq!(normalizer.stats().fallback, 1);
    }

    #[test]
    fn test_degraded_when_every_scaler_fails() {
        let normalizer = FormatNormalizer::with_scalers(
            BufferPool::new(4),
            Box::new(FailingScaler),
            Box::new(FailingScaler),
        );
        let out = normalizer
            .normalize(bgra(Resolution::VGA), NormalizeTarget::new(Resolution::HD720))
            .unwrap();
        assert!(out.degraded);
        assert_eq!(out.frame.resolution, Resolution::VGA);
        assert_eq!(out.frame.format, PixelFormat::Yuv420);
        assert_eq!(normalizer.stats().degraded, 1);
    }

    #[test]
    fn test_pool_exhaustion_is_reported() {
        let pool = BufferPool::new(1);
        let normalizer = FormatNormalizer::new(pool.clone());
        let _held = pool.acquire(16).unwrap();
        let err = normalizer
            .normalize(bgra(Resolution::VGA), NormalizeTarget::new(Resolution::VGA))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::PoolExhausted));
    }

    #[test]
    fn test_buffers_return_to_pool() {
        let pool = BufferPool::new(2);
        let normalizer = FormatNormalizer::new(pool.clone());
        let out = normalizer
            .normalize(bgra(Resolution::VGA), NormalizeTarget::new(Resolution::HD720))
            .unwrap();
        // the converted intermediate has already gone back
        assert_eq!(pool.in_use(), 1);
        drop(out);
        assert_eq!(pool.in_use(), 0);
    }
}
