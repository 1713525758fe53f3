//! I420 scaling with a fill (scale-then-center-crop) policy
//!
//! Two paths are provided. [`BilinearScaler`] is the primary, fixed-point
//! bilinear path. It refuses extreme ratios, where it would alias badly.
//! [`CompositingScaler`] is the CPU compositing fallback: nearest-neighbour
//! sampling that accepts any geometry.

use super::convert::I420Layout;
use super::format::Resolution;
use crate::error::NormalizeError;

/// Largest per-axis ratio the bilinear path accepts (up or down)
pub const MAX_BILINEAR_RATIO: u32 = 8;

/// Source region that maps onto the whole target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    /// Fill policy: scale by `max(sx, sy)` so the target is fully covered,
    /// then center the crop. Offsets stay even so chroma stays sited.
    pub fn fill(src: Resolution, dst: Resolution) -> Self {
        let (sw, sh) = (src.width as u64, src.height as u64);
        let (tw, th) = (dst.width as u64, dst.height as u64);

        let (width, height) = if tw * sh >= th * sw {
            // horizontal factor dominates, crop rows
            (sw, ((th * sw + tw / 2) / tw).clamp(1, sh))
        } else {
            (((tw * sh + th / 2) / th).clamp(1, sw), sh)
        };

        let x = ((sw - width) / 2) & !1;
        let y = ((sh - height) / 2) & !1;

        Self {
            x: x as u32,
            y: y as u32,
            width: width as u32,
            height: height as u32,
        }
    }

    fn chroma(&self, layout: &I420Layout) -> CropRect {
        let x = self.x / 2;
        let y = self.y / 2;
        CropRect {
            x,
            y,
            width: self.width.div_ceil(2).min(layout.chroma_width as u32 - x).max(1),
            height: self.height.div_ceil(2).min(layout.chroma_height as u32 - y).max(1),
        }
    }
}

/// One way of resizing a canonical I420 buffer
pub trait ScalePath: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Scale `src` (I420 at `src_res`) into `dst` (I420 at `dst_res`)
    fn scale(
        &self,
        src: &[u8],
        src_res: Resolution,
        dst: &mut [u8],
        dst_res: Resolution,
    ) -> Result<(), NormalizeError>;
}

fn check_sizes(
    src: &[u8],
    src_res: Resolution,
    dst: &[u8],
    dst_res: Resolution,
) -> Result<(I420Layout, I420Layout), NormalizeError> {
    let sl = I420Layout::new(src_res);
    let dl = I420Layout::new(dst_res);
    if src_res.width == 0 || src_res.height == 0 || dst_res.width == 0 || dst_res.height == 0 {
        return Err(NormalizeError::ScaleFailed("zero dimension".to_string()));
    }
    if src.len() < sl.len() || dst.len() < dl.len() {
        return Err(NormalizeError::ScaleFailed(format!(
            "buffer sizes {}/{} do not match {} -> {}",
            src.len(),
            dst.len(),
            src_res,
            dst_res
        )));
    }
    Ok((sl, dl))
}

type PlaneFn = fn(&[u8], usize, CropRect, &mut [u8], usize, usize);

fn scale_planes(
    src: &[u8],
    src_res: Resolution,
    dst: &mut [u8],
    dst_res: Resolution,
    plane: PlaneFn,
) -> Result<(), NormalizeError> {
    let (sl, dl) = check_sizes(src, src_res, dst, dst_res)?;
    let crop = CropRect::fill(src_res, dst_res);
    let chroma_crop = crop.chroma(&sl);

    let (sy, su, sv) = sl.planes(src);
    let (dy, du, dv) = dl.planes_mut(&mut dst[..dl.len()]);

    plane(sy, sl.width, crop, dy, dl.width, dl.height);
    plane(su, sl.chroma_width, chroma_crop, du, dl.chroma_width, dl.chroma_height);
    plane(sv, sl.chroma_width, chroma_crop, dv, dl.chroma_width, dl.chroma_height);
    Ok(())
}

/// Primary path: 16.16 fixed-point bilinear
#[derive(Debug, Default, Clone, Copy)]
pub struct BilinearScaler;

impl ScalePath for BilinearScaler {
    fn name(&self) -> &'static str {
        "bilinear"
    }

    fn scale(
        &self,
        src: &[u8],
        src_res: Resolution,
        dst: &mut [u8],
        dst_res: Resolution,
    ) -> Result<(), NormalizeError> {
        let ratio_ok = |a: u32, b: u32| a <= b * MAX_BILINEAR_RATIO && b <= a * MAX_BILINEAR_RATIO;
        if !ratio_ok(src_res.width, dst_res.width) || !ratio_ok(src_res.height, dst_res.height) {
            return Err(NormalizeError::ScaleFailed(format!(
                "ratio {} -> {} outside bilinear range",
                src_res, dst_res
            )));
        }
        scale_planes(src, src_res, dst, dst_res, bilinear_plane)
    }
}

fn bilinear_plane(
    src: &[u8],
    src_stride: usize,
    crop: CropRect,
    dst: &mut [u8],
    dst_w: usize,
    dst_h: usize,
) {
    let max_x = (crop.x + crop.width - 1) as i64;
    let max_y = (crop.y + crop.height - 1) as i64;
    // source position of the center of dst pixel d, in 16.16
    let pos = |d: usize, offset: u32, span: u32, out: usize| -> i64 {
        let num = (2 * d as i64 + 1) * span as i64 * 65536 / (2 * out as i64) - 32768;
        (num + offset as i64 * 65536).max(offset as i64 * 65536)
    };

    for dy in 0..dst_h {
        let fy = pos(dy, crop.y, crop.height, dst_h);
        let y0 = (fy >> 16).min(max_y);
        let y1 = (y0 + 1).min(max_y);
        let wy = ((fy >> 8) & 0xFF) as u32;
        let row0 = &src[y0 as usize * src_stride..];
        let row1 = &src[y1 as usize * src_stride..];

        for dx in 0..dst_w {
            let fx = pos(dx, crop.x, crop.width, dst_w);
            let x0 = (fx >> 16).min(max_x) as usize;
            let x1 = (x0 as i64 + 1).min(max_x) as usize;
            let wx = ((fx >> 8) & 0xFF) as u32;

            let top = row0[x0] as u32 * (256 - wx) + row0[x1] as u32 * wx;
            let bottom = row1[x0] as u32 * (256 - wx) + row1[x1] as u32 * wx;
            let v = (top * (256 - wy) + bottom * wy + 32768) >> 16;
            dst[dy * dst_w + dx] = v.min(255) as u8;
        }
    }
}

/// Fallback path: nearest-neighbour CPU compositing
#[derive(Debug, Default, Clone, Copy)]
pub struct CompositingScaler;

impl ScalePath for CompositingScaler {
    fn name(&self) -> &'static str {
        "compositing"
    }

    fn scale(
        &self,
        src: &[u8],
        src_res: Resolution,
        dst: &mut [u8],
        dst_res: Resolution,
    ) -> Result<(), NormalizeError> {
        scale_planes(src, src_res, dst, dst_res, nearest_plane)
    }
}

fn nearest_plane(
    src: &[u8],
    src_stride: usize,
    crop: CropRect,
    dst: &mut [u8],
    dst_w: usize,
    dst_h: usize,
) {
    let (cw, ch) = (crop.width as usize, crop.height as usize);
    let cols: Vec<usize> = (0..dst_w)
        .map(|dx| crop.x as usize + ((2 * dx + 1) * cw / (2 * dst_w)).min(cw - 1))
        .collect();

    for dy in 0..dst_h {
        let sy = crop.y as usize + ((2 * dy + 1) * ch / (2 * dst_h)).min(ch - 1);
        let row = &src[sy * src_stride..];
        let out = &mut dst[dy * dst_w..(dy + 1) * dst_w];
        for (o, &sx) in out.iter_mut().zip(cols.iter()) {
            *o = row[sx];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::convert::yuv420p_buffer_size;

    fn gradient(res: Resolution) -> Vec<u8> {
        let layout = I420Layout::new(res);
        let mut buf = vec![128u8; layout.len()];
        for y in 0..layout.height {
            for x in 0..layout.width {
                buf[y * layout.width + x] = ((x + y) % 256) as u8;
            }
        }
        buf
    }

    #[test]
    fn test_fill_crop_1088_to_720p() {
        let crop = CropRect::fill(Resolution::new(1920, 1088), Resolution::HD720);
        assert_eq!(
            crop,
            CropRect {
                x: 0,
                y: 4,
                width: 1920,
                height: 1080
            }
        );
    }

    #[test]
    fn test_fill_crop_crops_columns_for_narrow_target() {
        let crop = CropRect::fill(Resolution::new(1920, 1080), Resolution::new(480, 480));
        assert_eq!(crop.height, 1080);
        assert_eq!(crop.width, 1080);
        assert_eq!(crop.x, 420);
        assert_eq!(crop.y, 0);
    }

    #[test]
    fn test_same_aspect_uses_whole_source() {
        let crop = CropRect::fill(Resolution::HD1080, Resolution::HD720);
        assert_eq!((crop.x, crop.y, crop.width, crop.height), (0, 0, 1920, 1080));
    }

    #[test]
    fn test_bilinear_output_fills_target() {
        let src_res = Resolution::new(1920, 1088);
        let dst_res = Resolution::HD720;
        let src = gradient(src_res);
        let mut dst = vec![0u8; yuv420p_buffer_size(dst_res)];
        BilinearScaler.scale(&src, src_res, &mut dst, dst_res).unwrap();

        let layout = I420Layout::new(dst_res);
        let (_, u, v) = layout.planes(&dst);
        assert!(u.iter().all(|&b| b == 128));
        assert!(v.iter().all(|&b| b == 128));
    }

    #[test]
    fn test_identity_scale_is_lossless() {
        let res = Resolution::new(320, 240);
        let src = gradient(res);
        let mut a = vec![0u8; src.len()];
        let mut b = vec![0u8; src.len()];
        BilinearScaler.scale(&src, res, &mut a, res).unwrap();
        CompositingScaler.scale(&src, res, &mut b, res).unwrap();
        assert_eq!(a, src);
        assert_eq!(b, src);
    }

    #[test]
    fn test_bilinear_rejects_extreme_ratio() {
        let src_res = Resolution::new(3840, 2160);
        let dst_res = Resolution::new(160, 128);
        let src = gradient(src_res);
        let mut dst = vec![0u8; yuv420p_buffer_size(dst_res)];
        assert!(BilinearScaler.scale(&src, src_res, &mut dst, dst_res).is_err());
        assert!(CompositingScaler.scale(&src, src_res, &mut dst, dst_res).is_ok());
    }

    #[test]
    fn test_size_mismatch_fails() {
        let res = Resolution::new(320, 240);
        let mut dst = vec![0u8; 16];
        assert!(CompositingScaler
            .scale(&[0u8; 8], res, &mut dst, res)
            .is_err());
    }
}
