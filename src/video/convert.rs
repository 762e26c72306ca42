//! Reference YUV to XRGB8888 conversion for the in-crate fake decoder
//!
//! BT.709 limited range, 8.8 fixed point. Output pixels are little-endian
//! `0xFFRRGGBB`, the memory layout of DRM XRGB8888. Real frames go through
//! the FFmpeg scaler instead.

use crate::error::{Result, SinkError};
use smallvec::SmallVec;

/// Planar layouts the reference converter reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanarFormat {
    /// Y, U, V planes, chroma subsampled 2x2
    Yuv420p,
    /// Y plane, interleaved UV plane
    Nv12,
}

/// A borrowed plane: bytes plus line stride
#[derive(Debug, Clone, Copy)]
pub struct PlaneData<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

/// A CPU-visible decoded picture
#[derive(Debug, Clone)]
pub struct PlanarImage<'a> {
    pub format: PlanarFormat,
    pub width: u32,
    pub height: u32,
    pub planes: SmallVec<[PlaneData<'a>; 3]>,
}

#[inline]
fn clamp(value: i32) -> u32 {
    value.clamp(0, 255) as u32
}

#[inline]
fn yuv_to_xrgb(y: u8, u: u8, v: u8) -> u32 {
    let c = 298 * (y as i32 - 16);
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let r = clamp((c + 459 * e + 128) >> 8);
    let g = clamp((c - 55 * d - 136 * e + 128) >> 8);
    let b = clamp((c + 541 * d + 128) >> 8);

    0xFF00_0000 | r << 16 | g << 8 | b
}

fn plane_len(stride: usize, rows: usize, row_bytes: usize) -> usize {
    if rows == 0 {
        0
    } else {
        stride * (rows - 1) + row_bytes
    }
}

fn check(image: &PlanarImage<'_>, dst_len: usize, pitch: usize) -> Result<()> {
    let width = image.width as usize;
    let height = image.height as usize;
    let chroma_w = width.div_ceil(2);
    let chroma_h = height.div_ceil(2);

    let expected: &[(usize, usize)] = match image.format {
        PlanarFormat::Yuv420p => &[(width, height), (chroma_w, chroma_h), (chroma_w, chroma_h)],
        PlanarFormat::Nv12 => &[(width, height), (chroma_w * 2, chroma_h)],
    };
    if image.planes.len() < expected.len() {
        return Err(SinkError::decoder(format!(
            "{:?} frame has {} planes",
            image.format,
            image.planes.len()
        )));
    }
    for (i, (plane, &(row_bytes, rows))) in image.planes.iter().zip(expected).enumerate() {
        if plane.stride < row_bytes || plane.data.len() < plane_len(plane.stride, rows, row_bytes)
        {
            return Err(SinkError::decoder(format!("plane {} too small", i)));
        }
    }

    if pitch < width * 4 || dst_len < plane_len(pitch, height, width * 4) {
        return Err(SinkError::display(format!(
            "destination too small for {}x{} (pitch {})",
            width, height, pitch
        )));
    }
    Ok(())
}

/// Convert `image` into `dst`, one row every `pitch` bytes
pub fn convert_to_xrgb(image: &PlanarImage<'_>, dst: &mut [u8], pitch: usize) -> Result<()> {
    check(image, dst.len(), pitch)?;

    let width = image.width as usize;
    let luma = image.planes[0];

    for row in 0..image.height as usize {
        let y_row = &luma.data[row * luma.stride..][..width];
        let out = &mut dst[row * pitch..][..width * 4];
        let chroma_row = row / 2;

        match image.format {
            PlanarFormat::Yuv420p => {
                let (u, v) = (image.planes[1], image.planes[2]);
                let u_row = &u.data[chroma_row * u.stride..];
                let v_row = &v.data[chroma_row * v.stride..];
                for (x, (px, &y)) in out.chunks_exact_mut(4).zip(y_row).enumerate() {
                    let color = yuv_to_xrgb(y, u_row[x / 2], v_row[x / 2]);
                    px.copy_from_slice(&color.to_le_bytes());
                }
            }
            PlanarFormat::Nv12 => {
                let uv = image.planes[1];
                let uv_row = &uv.data[chroma_row * uv.stride..];
                for (x, (px, &y)) in out.chunks_exact_mut(4).zip(y_row).enumerate() {
                    let pair = (x / 2) * 2;
                    let color = yuv_to_xrgb(y, uv_row[pair], uv_row[pair + 1]);
                    px.copy_from_slice(&color.to_le_bytes());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn pixel(buf: &[u8], pitch: usize, x: usize, y: usize) -> u32 {
        let at = y * pitch + x * 4;
        u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
    }

    #[test]
    fn test_reference_colors() {
        assert_eq!(yuv_to_xrgb(16, 128, 128), 0xFF00_0000);
        assert_eq!(yuv_to_xrgb(235, 128, 128), 0xFFFF_FFFF);
        // Below black and above white clamp
        assert_eq!(yuv_to_xrgb(0, 128, 128), 0xFF00_0000);
        assert_eq!(yuv_to_xrgb(255, 128, 128), 0xFFFF_FFFF);

        // BT.709 red: Y=63 U=102 V=240
        let red = yuv_to_xrgb(63, 102, 240);
        assert!((red >> 16 & 0xFF) > 0xF0);
        assert!((red >> 8 & 0xFF) < 0x10);
        assert!((red & 0xFF) < 0x10);
    }

    #[test]
    fn test_yuv420p_with_padded_strides() {
        // 4x2 picture: left half black, right half white
        let y = [16, 16, 235, 235, 0, 0, 16, 16, 235, 235, 0, 0];
        let u = [128, 128, 0];
        let v = [128, 128, 0];
        let image = PlanarImage {
            format: PlanarFormat::Yuv420p,
            width: 4,
            height: 2,
            planes: smallvec![
                PlaneData { data: &y, stride: 6 },
                PlaneData { data: &u, stride: 3 },
                PlaneData { data: &v, stride: 3 },
            ],
        };

        let pitch = 64;
        let mut dst = vec![0u8; pitch * 2];
        convert_to_xrgb(&image, &mut dst, pitch).unwrap();

        for row in 0..2 {
            assert_eq!(pixel(&dst, pitch, 0, row), 0xFF00_0000);
            assert_eq!(pixel(&dst, pitch, 3, row), 0xFFFF_FFFF);
        }
        // Padding past the picture width is untouched
        assert_eq!(pixel(&dst, pitch, 4, 0), 0);
    }

    #[test]
    fn test_nv12_matches_yuv420p() {
        let y = [16, 100, 180, 235];
        let (u, v) = ([90u8], [200u8]);
        let uv = [90u8, 200];

        let planar = PlanarImage {
            format: PlanarFormat::Yuv420p,
            width: 2,
            height: 2,
            planes: smallvec![
                PlaneData { data: &y, stride: 2 },
                PlaneData { data: &u, stride: 1 },
                PlaneData { data: &v, stride: 1 },
            ],
        };
        let nv12 = PlanarImage {
            format: PlanarFormat::Nv12,
            width: 2,
            height: 2,
            planes: smallvec![
                PlaneData { data: &y, stride: 2 },
                PlaneData { data: &uv, stride: 2 },
            ],
        };

        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        convert_to_xrgb(&planar, &mut a, 8).unwrap();
        convert_to_xrgb(&nv12, &mut b, 8).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_short_planes_rejected() {
        let y = [16u8; 3];
        let image = PlanarImage {
            format: PlanarFormat::Nv12,
            width: 2,
            height: 2,
            planes: smallvec![
                PlaneData { data: &y, stride: 2 },
                PlaneData { data: &y, stride: 2 },
            ],
        };
        let mut dst = vec![0u8; 16];
        assert!(convert_to_xrgb(&image, &mut dst, 8).is_err());
    }

    #[test]
    fn test_small_destination_rejected() {
        let y = [16u8; 4];
        let uv = [128u8; 2];
        let image = PlanarImage {
            format: PlanarFormat::Nv12,
            width: 2,
            height: 2,
            planes: smallvec![
                PlaneData { data: &y, stride: 2 },
                PlaneData { data: &uv, stride: 2 },
            ],
        };
        let mut dst = vec![0u8; 8];
        assert!(matches!(
            convert_to_xrgb(&image, &mut dst, 4),
            Err(SinkError::Display(_))
        ));
    }
}
