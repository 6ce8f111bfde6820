// SPDX-License-Identifier: GPL-3.0-only

//! CPU pixel format conversion
//!
//! Everything downstream of capture (segmentation, compositing, display)
//! works on tightly packed RGBA. YUV input uses BT.601 limited-range
//! coefficients.

use super::frame::{Frame, PixelFormat};
use crate::errors::{CaptureError, CaptureResult};
use image::RgbaImage;

/// Convert any supported frame to tightly packed RGBA bytes
pub fn to_rgba(frame: &Frame) -> CaptureResult<Vec<u8>> {
    if !frame.is_well_formed() {
        return Err(CaptureError::Image(format!(
            "{} frame {}x{} (stride {}) has only {} bytes",
            frame.format,
            frame.width,
            frame.height,
            frame.stride,
            frame.data.len()
        )));
    }

    let width = frame.width as usize;
    let height = frame.height as usize;
    let stride = frame.stride as usize;
    let data: &[u8] = &frame.data;

    let mut rgba = vec![0u8; width * height * 4];
    match frame.format {
        PixelFormat::Rgba => {
            let row_bytes = width * 4;
            if stride == row_bytes {
                rgba.copy_from_slice(&data[..row_bytes * height]);
            } else {
                for y in 0..height {
                    rgba[y * row_bytes..(y + 1) * row_bytes]
                        .copy_from_slice(&data[y * stride..y * stride + row_bytes]);
                }
            }
        }
        PixelFormat::Gray8 => {
            for y in 0..height {
                for x in 0..width {
                    let l = data[y * stride + x];
                    let o = (y * width + x) * 4;
                    rgba[o..o + 4].copy_from_slice(&[l, l, l, 255]);
                }
            }
        }
        PixelFormat::Nv21 => {
            let vu_offset = stride * height;
            let vu_stride = stride.max(width.div_ceil(2) * 2);
            for y in 0..height {
                for x in 0..width {
                    let luma = data[y * stride + x];
                    let vu = vu_offset + (y / 2) * vu_stride + (x / 2) * 2;
                    let (r, g, b) = yuv_to_rgb(luma, data[vu + 1], data[vu]);
                    let o = (y * width + x) * 4;
                    rgba[o..o + 4].copy_from_slice(&[r, g, b, 255]);
                }
            }
        }
        PixelFormat::I420 => {
            let chroma_stride = stride.div_ceil(2);
            let u_offset = stride * height;
            let v_offset = u_offset + chroma_stride * height.div_ceil(2);
            for y in 0..height {
                for x in 0..width {
                    let luma = data[y * stride + x];
                    let c = (y / 2) * chroma_stride + x / 2;
                    let (r, g, b) = yuv_to_rgb(luma, data[u_offset + c], data[v_offset + c]);
                    let o = (y * width + x) * 4;
                    rgba[o..o + 4].copy_from_slice(&[r, g, b, 255]);
                }
            }
        }
    }

    Ok(rgba)
}

/// Convert a frame into an owned RGBA image for display or saving
pub fn to_rgba_image(frame: &Frame) -> CaptureResult<RgbaImage> {
    let rgba = to_rgba(frame)?;
    RgbaImage::from_raw(frame.width, frame.height, rgba).ok_or_else(|| {
        CaptureError::Image(format!(
            "RGBA buffer does not match {}x{}",
            frame.width, frame.height
        ))
    })
}

/// Pack RGBA pixels into NV21 (Y plane + interleaved VU plane)
///
/// Chroma is taken from the top-left pixel of each 2x2 block.
pub fn rgba_to_nv21(rgba: &[u8], width: u32, height: u32) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let vu_stride = w.div_ceil(2) * 2;
    let mut out = vec![0u8; PixelFormat::Nv21.frame_len(width, height)];
    let vu_offset = w * h;

    for y in 0..h {
        for x in 0..w {
            let p = (y * w + x) * 4;
            let (luma, u, v) = rgb_to_yuv(rgba[p], rgba[p + 1], rgba[p + 2]);
            out[y * w + x] = luma;
            if x % 2 == 0 && y % 2 == 0 {
                let vu = vu_offset + (y / 2) * vu_stride + x;
                out[vu] = v;
                out[vu + 1] = u;
            }
        }
    }

    out
}

/// BT.601 limited-range YUV to RGB
#[inline]
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> (u8, u8, u8) {
    let y = (y.max(16) as f32 - 16.0) * 1.164;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;

    let r = y + 1.596 * v;
    let g = y - 0.813 * v - 0.391 * u;
    let b = y + 2.018 * u;

    (clamp_u8(r), clamp_u8(g), clamp_u8(b))
}

/// BT.601 limited-range RGB to YUV
#[inline]
pub fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let y = 0.257 * r + 0.504 * g + 0.098 * b + 16.0;
    let u = -0.148 * r - 0.291 * g + 0.439 * b + 128.0;
    let v = 0.439 * r - 0.368 * g - 0.071 * b + 128.0;
    (clamp_u8(y), clamp_u8(u), clamp_u8(v))
}

#[inline]
fn clamp_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame(data: Vec<u8>, width: u32, height: u32, stride: u32, format: PixelFormat) -> Frame {
        Frame {
            data: data.into(),
            width,
            height,
            stride,
            format,
            timestamp: Duration::ZERO,
            sequence: 0,
        }
    }

    #[test]
    fn test_rgba_strips_stride_padding() {
        // 2x2 RGBA with 4 bytes of padding per row
        let mut data = Vec::new();
        data.extend_from_slice(&[1, 1, 1, 255, 2, 2, 2, 255, 0, 0, 0, 0]);
        data.extend_from_slice(&[3, 3, 3, 255, 4, 4, 4, 255, 0, 0, 0, 0]);
        let rgba = to_rgba(&frame(data, 2, 2, 12, PixelFormat::Rgba)).unwrap();
        assert_eq!(rgba.len(), 16);
        assert_eq!(rgba[8], 3);
        assert_eq!(rgba[12], 4);
    }

    #[test]
    fn test_gray_expands_to_rgba() {
        let rgba = to_rgba(&frame(vec![10, 20], 2, 1, 2, PixelFormat::Gray8)).unwrap();
        assert_eq!(rgba, vec![10, 10, 10, 255, 20, 20, 20, 255]);
    }

    #[test]
    fn test_neutral_chroma_is_gray() {
        let (r, g, b) = yuv_to_rgb(128, 128, 128);
        assert_eq!(r, g);
        assert_eq!(g, b);
    }

    #[test]
    fn test_nv21_round_trip_is_close() {
        let rgba: Vec<u8> = [200u8, 40, 40, 255].repeat(4);
        let nv21 = rgba_to_nv21(&rgba, 2, 2);
        let back = to_rgba(&frame(nv21, 2, 2, 2, PixelFormat::Nv21)).unwrap();
        for (a, b) in rgba.iter().zip(back.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        let result = to_rgba(&frame(vec![0; 5], 2, 2, 2, PixelFormat::I420));
        assert!(matches!(result, Err(CaptureError::Image(_))));
    }
}
