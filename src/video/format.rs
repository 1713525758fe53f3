//! Pixel format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macroblock size the hardware encoders require dimensions to be aligned to
pub const MACROBLOCK: u32 = 16;

/// Supported pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// RGBA 8:8:8:8 packed
    Rgba,
    /// BGRA 8:8:8:8 packed (typical screen capture output)
    Bgra,
    /// ARGB 8:8:8:8 packed
    Argb,
    /// ABGR 8:8:8:8 packed
    Abgr,
    /// RGB24 format (3 bytes per pixel)
    Rgb24,
    /// BGR24 format (3 bytes per pixel)
    Bgr24,
    /// YUYV 4:2:2 packed format
    Yuyv,
    /// UYVY 4:2:2 packed format
    Uyvy,
    /// NV12 semi-planar format (Y plane + interleaved UV)
    Nv12,
    /// NV21 semi-planar format (Y plane + interleaved VU)
    Nv21,
    /// YUV420 planar format (I420), the canonical encoder input
    Yuv420,
    /// YVU420 planar format (YV12)
    Yvu420,
    /// Grayscale format
    Grey,
}

impl PixelFormat {
    /// The single format the encoder is configured to accept
    pub const CANONICAL: PixelFormat = PixelFormat::Yuv420;

    /// Formats the normalizer takes through the RGBA fast path
    pub fn is_rgba_family(&self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Argb | PixelFormat::Abgr
        )
    }

    /// Whether the format carries RGB samples (needs a color-space transform)
    pub fn is_rgb(&self) -> bool {
        self.is_rgba_family() || matches!(self, PixelFormat::Rgb24 | PixelFormat::Bgr24)
    }

    /// Whether the format is a YUV layout (only needs repacking)
    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            PixelFormat::Yuyv
                | PixelFormat::Uyvy
                | PixelFormat::Nv12
                | PixelFormat::Nv21
                | PixelFormat::Yuv420
                | PixelFormat::Yvu420
        )
    }

    /// Whether this format can be handed to the encoder without conversion
    pub fn is_encoder_native(&self) -> bool {
        matches!(self, PixelFormat::Yuv420 | PixelFormat::Nv12)
    }

    /// Whether the format stores chroma in separate planes
    pub fn is_planar(&self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420 | PixelFormat::Yvu420
        )
    }

    /// Get bytes per pixel for packed formats
    /// Returns None for planar formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Argb | PixelFormat::Abgr => {
                Some(4)
            }
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Yuyv | PixelFormat::Uyvy => Some(2),
            PixelFormat::Grey => Some(1),
            PixelFormat::Nv12 | PixelFormat::Nv21 | PixelFormat::Yuv420 | PixelFormat::Yvu420 => {
                None
            }
        }
    }

    /// Minimum stride (bytes in one row of the first plane) for a width
    pub fn min_stride(&self, width: u32) -> usize {
        let width = width as usize;
        match self {
            PixelFormat::Yuyv | PixelFormat::Uyvy => width.div_ceil(2) * 4,
            _ => width * self.bytes_per_pixel().unwrap_or(1),
        }
    }

    /// Expected payload size for a tightly packed frame
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        self.frame_size_with_stride(resolution, self.min_stride(resolution.width))
    }

    /// Expected payload size for a frame whose first plane uses `stride`
    ///
    /// Planar chroma strides are derived from the luma stride.
    pub fn frame_size_with_stride(&self, resolution: Resolution, stride: usize) -> usize {
        let height = resolution.height as usize;
        let chroma_rows = height.div_ceil(2);
        match self {
            PixelFormat::Nv12 | PixelFormat::Nv21 => {
                let uv_stride = stride.div_ceil(2) * 2;
                stride * height + uv_stride * chroma_rows
            }
            PixelFormat::Yuv420 | PixelFormat::Yvu420 => {
                stride * height + 2 * stride.div_ceil(2) * chroma_rows
            }
            _ => stride * height,
        }
    }

    /// Get all supported formats
    pub fn all() -> &'static [PixelFormat] {
        &[
            PixelFormat::Rgba,
            PixelFormat::Bgra,
            PixelFormat::Argb,
            PixelFormat::Abgr,
            PixelFormat::Rgb24,
            PixelFormat::Bgr24,
            PixelFormat::Yuyv,
            PixelFormat::Uyvy,
            PixelFormat::Nv12,
            PixelFormat::Nv21,
            PixelFormat::Yuv420,
            PixelFormat::Yvu420,
            PixelFormat::Grey,
        ]
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PixelFormat::Rgba => "RGBA",
            PixelFormat::Bgra => "BGRA",
            PixelFormat::Argb => "ARGB",
            PixelFormat::Abgr => "ABGR",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Bgr24 => "BGR24",
            PixelFormat::Yuyv => "YUYV",
            PixelFormat::Uyvy => "UYVY",
            PixelFormat::Nv12 => "NV12",
            PixelFormat::Nv21 => "NV21",
            PixelFormat::Yuv420 => "YUV420",
            PixelFormat::Yvu420 => "YVU420",
            PixelFormat::Grey => "GREY",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RGBA" => Ok(PixelFormat::Rgba),
            "BGRA" => Ok(PixelFormat::Bgra),
            "ARGB" => Ok(PixelFormat::Argb),
            "ABGR" => Ok(PixelFormat::Abgr),
            "RGB24" | "RGB" => Ok(PixelFormat::Rgb24),
            "BGR24" | "BGR" => Ok(PixelFormat::Bgr24),
            "YUYV" | "YUY2" => Ok(PixelFormat::Yuyv),
            "UYVY" => Ok(PixelFormat::Uyvy),
            "NV12" => Ok(PixelFormat::Nv12),
            "NV21" => Ok(PixelFormat::Nv21),
            "YUV420" | "I420" => Ok(PixelFormat::Yuv420),
            "YVU420" | "YV12" => Ok(PixelFormat::Yvu420),
            "GREY" | "GRAY" => Ok(PixelFormat::Grey),
            _ => Err(format!("Unknown pixel format: {}", s)),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Smallest frame the pipeline accepts and the alignment floor
    pub const MIN: Resolution = Resolution {
        width: 160,
        height: 120,
    };
    /// Largest frame the pipeline accepts
    pub const MAX: Resolution = Resolution {
        width: 3840,
        height: 2160,
    };

    /// Check if resolution is within the supported bounds
    pub fn is_valid(&self) -> bool {
        self.width >= Self::MIN.width
            && self.width <= Self::MAX.width
            && self.height >= Self::MIN.height
            && self.height <= Self::MAX.height
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Width divided by height
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f64 / self.height as f64
    }

    /// Whether both dimensions are multiples of the macroblock size
    pub fn is_macroblock_aligned(&self) -> bool {
        self.width % MACROBLOCK == 0 && self.height % MACROBLOCK == 0
    }

    /// Round each dimension up to the macroblock size (floor 160x120)
    ///
    /// This is the size handed to the encoder.
    pub fn encoder_safe(&self) -> Resolution {
        Resolution {
            width: align_up(self.width.max(Self::MIN.width), MACROBLOCK),
            height: align_up(self.height.max(Self::MIN.height), MACROBLOCK),
        }
    }

    /// Round each dimension down to the macroblock size (floor 160x120)
    ///
    /// Never grows the picture, used for preview/display targets.
    pub fn display_safe(&self) -> Resolution {
        Resolution {
            width: align_down(self.width, MACROBLOCK).max(Self::MIN.width),
            height: align_down(self.height, MACROBLOCK).max(Self::MIN.height),
        }
    }

    /// Common resolutions
    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
    pub const UHD4K: Resolution = Resolution {
        width: 3840,
        height: 2160,
    };
}

fn align_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

fn align_down(value: u32, align: u32) -> u32 {
    value / align * align
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

impl std::str::FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("Invalid resolution: {}", s))?;
        let width = w
            .trim()
            .parse()
            .map_err(|_| format!("Invalid width: {}", w))?;
        let height = h
            .trim()
            .parse()
            .map_err(|_| format!("Invalid height: {}", h))?;
        Ok(Resolution { width, height })
    }
}
