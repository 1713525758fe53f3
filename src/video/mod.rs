//! Video frame handling and encoding
//!
//! This module provides frame validation, pixel-format normalization,
//! scaling and the encoder session machinery.

pub mod convert;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod normalizer;
pub mod pool;
pub mod scale;
pub mod source;
pub mod validator;

pub use convert::{convert_to_i420, i420_to_nv12, yuv420p_buffer_size, I420Layout};
pub use format::{PixelFormat, Resolution};
pub use frame::VideoFrame;
pub use normalizer::{FormatNormalizer, NormalizeTarget, Normalized};
pub use pool::BufferPool;
pub use scale::{BilinearScaler, CompositingScaler, CropRect, ScalePath};
pub use source::TestPatternSource;
pub use validator::{FrameValidator, ValidatedFrame};
