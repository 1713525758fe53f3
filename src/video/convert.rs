//! Pixel format conversion into the canonical I420 layout
//!
//! RGBA-family input takes the direct fast path. Other RGB layouts are first
//! reordered into an RGBA row buffer and then share the same transform. YUV
//! layouts only need their planes repacked.
//!
//! Color math is ITU-R BT.709, video range, 8-bit fixed point.

use super::format::{PixelFormat, Resolution};
use super::frame::VideoFrame;
use crate::error::NormalizeError;

/// Fixed-point BT.709 video-range coefficients (scaled by 256)
pub mod bt709 {
    pub const Y_R: i32 = 47;
    pub const Y_G: i32 = 157;
    pub const Y_B: i32 = 16;
    pub const U_R: i32 = -26;
    pub const U_G: i32 = -86;
    pub const U_B: i32 = 112;
    pub const V_R: i32 = 112;
    pub const V_G: i32 = -102;
    pub const V_B: i32 = -10;

    pub const LUMA_BIAS: i32 = 16;
    pub const CHROMA_BIAS: i32 = 128;
    pub const LUMA_MIN: i32 = 16;
    pub const LUMA_MAX: i32 = 235;
    pub const CHROMA_MIN: i32 = 16;
    pub const CHROMA_MAX: i32 = 240;
}

/// Plane geometry of an I420 buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct I420Layout {
    pub width: usize,
    pub height: usize,
    pub chroma_width: usize,
    pub chroma_height: usize,
}

impl I420Layout {
    pub fn new(resolution: Resolution) -> Self {
        let width = resolution.width as usize;
        let height = resolution.height as usize;
        Self {
            width,
            height,
            chroma_width: width.div_ceil(2),
            chroma_height: height.div_ceil(2),
        }
    }

    pub fn y_size(&self) -> usize {
        self.width * self.height
    }

    pub fn chroma_size(&self) -> usize {
        self.chroma_width * self.chroma_height
    }

    /// Total buffer length
    pub fn len(&self) -> usize {
        self.y_size() + 2 * self.chroma_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split a buffer into (Y, U, V) planes
    pub fn planes<'a>(&self, buf: &'a [u8]) -> (&'a [u8], &'a [u8], &'a [u8]) {
        let (y, rest) = buf.split_at(self.y_size());
        let (u, v) = rest.split_at(self.chroma_size());
        (y, u, &v[..self.chroma_size()])
    }

    /// Split a mutable buffer into (Y, U, V) planes
    pub fn planes_mut<'a>(&self, buf: &'a mut [u8]) -> (&'a mut [u8], &'a mut [u8], &'a mut [u8]) {
        let (y, rest) = buf.split_at_mut(self.y_size());
        let (u, v) = rest.split_at_mut(self.chroma_size());
        let c = self.chroma_size();
        (y, u, &mut v[..c])
    }
}

/// Calculate I420 buffer size for a given resolution
pub fn yuv420p_buffer_size(resolution: Resolution) -> usize {
    I420Layout::new(resolution).len()
}

#[inline]
fn clamp(v: i32, lo: i32, hi: i32) -> u8 {
    v.clamp(lo, hi) as u8
}

#[inline]
fn rgb_to_y(r: i32, g: i32, b: i32) -> u8 {
    use bt709::*;
    clamp(
        ((Y_R * r + Y_G * g + Y_B * b + 128) >> 8) + LUMA_BIAS,
        LUMA_MIN,
        LUMA_MAX,
    )
}

#[inline]
fn rgb_to_uv(r: i32, g: i32, b: i32) -> (u8, u8) {
    use bt709::*;
    let u = ((U_R * r + U_G * g + U_B * b + 128) >> 8) + CHROMA_BIAS;
    let v = ((V_R * r + V_G * g + V_B * b + 128) >> 8) + CHROMA_BIAS;
    (
        clamp(u, CHROMA_MIN, CHROMA_MAX),
        clamp(v, CHROMA_MIN, CHROMA_MAX),
    )
}

/// Byte offsets of R, G, B within one 4-byte pixel
fn rgba_offsets(format: PixelFormat) -> Option<(usize, usize, usize)> {
    match format {
        PixelFormat::Rgba => Some((0, 1, 2)),
        PixelFormat::Bgra => Some((2, 1, 0)),
        PixelFormat::Argb => Some((1, 2, 3)),
        PixelFormat::Abgr => Some((3, 2, 1)),
        _ => None,
    }
}

/// Convert any supported frame into I420 written to `dst`
///
/// `dst` must be at least `yuv420p_buffer_size(frame.resolution)` bytes.
pub fn convert_to_i420(frame: &VideoFrame, dst: &mut [u8]) -> Result<(), NormalizeError> {
    let layout = I420Layout::new(frame.resolution);
    if dst.len() < layout.len() {
        return Err(NormalizeError::ScaleFailed(format!(
            "destination too small: {} < {}",
            dst.len(),
            layout.len()
        )));
    }
    let min_stride = frame.format.min_stride(frame.resolution.width);
    if (frame.stride as usize) < min_stride {
        return Err(NormalizeError::UnreadableInput {
            format: frame.format.to_string(),
            reason: format!("stride {} < row width {}", frame.stride, min_stride),
        });
    }
    if frame.len() < frame.expected_len() {
        return Err(NormalizeError::UnreadableInput {
            format: frame.format.to_string(),
            reason: format!("payload {} < {}", frame.len(), frame.expected_len()),
        });
    }

    let src = frame.data();
    let stride = frame.stride as usize;
    let dst = &mut dst[..layout.len()];

    match frame.format {
        PixelFormat::Rgba | PixelFormat::Bgra | PixelFormat::Argb | PixelFormat::Abgr => {
            let offsets = rgba_offsets(frame.format).ok_or_else(|| unreadable(frame))?;
            rgba_to_i420(src, stride, offsets, layout, dst);
        }
        PixelFormat::Rgb24 | PixelFormat::Bgr24 => {
            rgb24_to_i420(src, stride, frame.format == PixelFormat::Bgr24, layout, dst);
        }
        PixelFormat::Yuv420 => copy_i420(src, stride, false, layout, dst),
        PixelFormat::Yvu420 => copy_i420(src, stride, true, layout, dst),
        PixelFormat::Nv12 => nv_to_i420(src, stride, false, layout, dst),
        PixelFormat::Nv21 => nv_to_i420(src, stride, true, layout, dst),
        PixelFormat::Yuyv => packed422_to_i420(src, stride, (0, 1, 3), layout, dst),
        PixelFormat::Uyvy => packed422_to_i420(src, stride, (1, 0, 2), layout, dst),
        PixelFormat::Grey => grey_to_i420(src, stride, layout, dst),
    }

    Ok(())
}

fn unreadable(frame: &VideoFrame) -> NormalizeError {
    NormalizeError::UnreadableInput {
        format: frame.format.to_string(),
        reason: "unsupported layout".to_string(),
    }
}

/// RGBA-family fast path
///
/// Luma per pixel, chroma from the average of each 2x2 block.
fn rgba_to_i420(
    src: &[u8],
    stride: usize,
    (ro, go, bo): (usize, usize, usize),
    layout: I420Layout,
    dst: &mut [u8],
) {
    let (y_plane, u_plane, v_plane) = layout.planes_mut(dst);
    let (w, h) = (layout.width, layout.height);

    for row in 0..h {
        let line = &src[row * stride..row * stride + w * 4];
        let out = &mut y_plane[row * w..(row + 1) * w];
        for (col, px) in line.chunks_exact(4).enumerate() {
            out[col] = rgb_to_y(px[ro] as i32, px[go] as i32, px[bo] as i32);
        }
    }

    for crow in 0..layout.chroma_height {
        let r0 = crow * 2;
        let r1 = (r0 + 1).min(h - 1);
        for ccol in 0..layout.chroma_width {
            let c0 = ccol * 2;
            let c1 = (c0 + 1).min(w - 1);
            let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
            for &(row, col) in &[(r0, c0), (r0, c1), (r1, c0), (r1, c1)] {
                let i = row * stride + col * 4;
                r += src[i + ro] as i32;
                g += src[i + go] as i32;
                b += src[i + bo] as i32;
            }
            let (u, v) = rgb_to_uv((r + 2) >> 2, (g + 2) >> 2, (b + 2) >> 2);
            let idx = crow * layout.chroma_width + ccol;
            u_plane[idx] = u;
            v_plane[idx] = v;
        }
    }
}

/// RGB24/BGR24: reorder two rows at a time into RGBA, then run the fast path
fn rgb24_to_i420(src: &[u8], stride: usize, bgr: bool, layout: I420Layout, dst: &mut [u8]) {
    let (w, h) = (layout.width, layout.height);
    let rgba_stride = w * 4;
    let mut scratch = vec![0u8; rgba_stride * 2];
    let (y_all, u_all, v_all) = layout.planes_mut(dst);

    for pair in 0..layout.chroma_height {
        let rows = if pair * 2 + 1 < h { 2 } else { 1 };
        for r in 0..rows {
            let line = &src[(pair * 2 + r) * stride..(pair * 2 + r) * stride + w * 3];
            let out = &mut scratch[r * rgba_stride..(r + 1) * rgba_stride];
            for (px, o) in line.chunks_exact(3).zip(out.chunks_exact_mut(4)) {
                if bgr {
                    o[0] = px[2];
                    o[2] = px[0];
                } else {
                    o[0] = px[0];
                    o[2] = px[2];
                }
                o[1] = px[1];
                o[3] = 0xFF;
            }
        }

        let band = I420Layout {
            width: w,
            height: rows,
            chroma_width: layout.chroma_width,
            chroma_height: 1,
        };
        let mut band_buf = vec![0u8; band.len()];
        rgba_to_i420(&scratch, rgba_stride, (0, 1, 2), band, &mut band_buf);

        let (by, bu, bv) = band.planes(&band_buf);
        y_all[pair * 2 * w..(pair * 2 + rows) * w].copy_from_slice(by);
        let c = pair * layout.chroma_width;
        u_all[c..c + layout.chroma_width].copy_from_slice(bu);
        v_all[c..c + layout.chroma_width].copy_from_slice(bv);
    }
}

fn copy_plane(src: &[u8], src_stride: usize, width: usize, height: usize, dst: &mut [u8]) {
    for row in 0..height {
        dst[row * width..(row + 1) * width]
            .copy_from_slice(&src[row * src_stride..row * src_stride + width]);
    }
}

/// I420 / YV12 copy honoring the source stride
fn copy_i420(src: &[u8], stride: usize, swap_uv: bool, layout: I420Layout, dst: &mut [u8]) {
    let (y_plane, u_plane, v_plane) = layout.planes_mut(dst);
    let c_stride = stride.div_ceil(2);
    let y_len = stride * layout.height;
    let c_len = c_stride * layout.chroma_height;

    copy_plane(src, stride, layout.width, layout.height, y_plane);
    let first = &src[y_len..y_len + c_len];
    let second = &src[y_len + c_len..y_len + 2 * c_len];
    let (u_src, v_src) = if swap_uv { (second, first) } else { (first, second) };
    copy_plane(u_src, c_stride, layout.chroma_width, layout.chroma_height, u_plane);
    copy_plane(v_src, c_stride, layout.chroma_width, layout.chroma_height, v_plane);
}

/// NV12 / NV21 deinterleave
fn nv_to_i420(src: &[u8], stride: usize, swap_uv: bool, layout: I420Layout, dst: &mut [u8]) {
    let (y_plane, u_plane, v_plane) = layout.planes_mut(dst);
    let uv_stride = stride.div_ceil(2) * 2;
    let y_len = stride * layout.height;

    copy_plane(src, stride, layout.width, layout.height, y_plane);
    for crow in 0..layout.chroma_height {
        let line = &src[y_len + crow * uv_stride..];
        for ccol in 0..layout.chroma_width {
            let (a, b) = (line[ccol * 2], line[ccol * 2 + 1]);
            let idx = crow * layout.chroma_width + ccol;
            if swap_uv {
                u_plane[idx] = b;
                v_plane[idx] = a;
            } else {
                u_plane[idx] = a;
                v_plane[idx] = b;
            }
        }
    }
}

/// YUYV / UYVY repack; chroma is averaged over each pair of rows
///
/// `offsets` are the positions of (Y0, U, V) in a 4-byte macropixel; Y1 sits
/// two bytes after Y0.
fn packed422_to_i420(
    src: &[u8],
    stride: usize,
    (yo, uo, vo): (usize, usize, usize),
    layout: I420Layout,
    dst: &mut [u8],
) {
    let (y_plane, u_plane, v_plane) = layout.planes_mut(dst);
    let (w, h) = (layout.width, layout.height);

    for row in 0..h {
        let line = &src[row * stride..];
        for col in 0..w {
            let macro_px = (col / 2) * 4;
            y_plane[row * w + col] = line[macro_px + yo + (col % 2) * 2];
        }
    }

    for crow in 0..layout.chroma_height {
        let r0 = crow * 2;
        let r1 = (r0 + 1).min(h - 1);
        for ccol in 0..layout.chroma_width {
            let m = ccol * 4;
            let u = (src[r0 * stride + m + uo] as u16 + src[r1 * stride + m + uo] as u16 + 1) / 2;
            let v = (src[r0 * stride + m + vo] as u16 + src[r1 * stride + m + vo] as u16 + 1) / 2;
            let idx = crow * layout.chroma_width + ccol;
            u_plane[idx] = u as u8;
            v_plane[idx] = v as u8;
        }
    }
}

fn grey_to_i420(src: &[u8], stride: usize, layout: I420Layout, dst: &mut [u8]) {
    let (y_plane, u_plane, v_plane) = layout.planes_mut(dst);
    copy_plane(src, stride, layout.width, layout.height, y_plane);
    u_plane.fill(bt709::CHROMA_BIAS as u8);
    v_plane.fill(bt709::CHROMA_BIAS as u8);
}

/// Interleave I420 chroma into NV12 (for encoders that prefer semi-planar input)
pub fn i420_to_nv12(src: &[u8], resolution: Resolution, dst: &mut [u8]) {
    let layout = I420Layout::new(resolution);
    let (y, u, v) = layout.planes(src);
    let (dst_y, dst_uv) = dst.split_at_mut(layout.y_size());
    dst_y.copy_from_slice(y);
    for (i, (&cu, &cv)) in u.iter().zip(v.iter()).enumerate() {
        dst_uv[i * 2] = cu;
        dst_uv[i * 2 + 1] = cv;
    }
}
