// SPDX-License-Identifier: GPL-3.0-only

//! Foreground segmentation and mask smoothing
//!
//! A [`Segmenter`] turns an RGBA frame into a [`Mask`] of per-pixel
//! foreground confidence. ML models plug in through the trait; the built-in
//! [`ChromaKeySegmenter`] keys out a backdrop colour.
//!
//! Masks are averaged over a short window by [`SmoothingBuffer`] to reduce
//! flicker, then mapped to per-pixel background alpha by [`Matte`].

use crate::constants::{
    MASK_FOREGROUND_CUTOFF, MASK_FULL_BACKGROUND, MASK_RAMP_OFFSET, MASK_RAMP_SLOPE,
};
use crate::errors::{CaptureError, CaptureResult};
use image::RgbaImage;
use std::collections::VecDeque;

/// Per-pixel foreground confidence in `0.0..=1.0`
///
/// May be lower resolution than the frame it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub width: u32,
    pub height: u32,
    pub confidence: Vec<f32>,
}

impl Mask {
    /// Build a mask, checking the buffer matches the dimensions
    pub fn new(width: u32, height: u32, confidence: Vec<f32>) -> CaptureResult<Self> {
        if confidence.len() != width as usize * height as usize {
            return Err(CaptureError::Image(format!(
                "mask of {}x{} needs {} values, got {}",
                width,
                height,
                width as usize * height as usize,
                confidence.len()
            )));
        }
        Ok(Self {
            width,
            height,
            confidence,
        })
    }

    /// A mask with the same confidence everywhere
    pub fn filled(width: u32, height: u32, value: f32) -> Self {
        Self {
            width,
            height,
            confidence: vec![value; width as usize * height as usize],
        }
    }

    /// Nearest-neighbour sample at frame coordinates
    pub fn sample(&self, x: u32, y: u32, frame_width: u32, frame_height: u32) -> f32 {
        if self.width == 0 || self.height == 0 {
            return 0.0;
        }
        let mx = (x as u64 * self.width as u64 / frame_width.max(1) as u64) as usize;
        let my = (y as u64 * self.height as u64 / frame_height.max(1) as u64) as usize;
        let mx = mx.min(self.width as usize - 1);
        let my = my.min(self.height as usize - 1);
        self.confidence[my * self.width as usize + mx]
    }
}

/// Produces a foreground mask for a frame
pub trait Segmenter: Send {
    /// Classify every pixel of the frame
    fn segment(&mut self, frame: &RgbaImage) -> CaptureResult<Mask>;

    /// Short name for logging
    fn name(&self) -> &'static str;
}

/// Segments by distance from a backdrop key colour
#[derive(Debug, Clone)]
pub struct ChromaKeySegmenter {
    key: [f32; 3],
    /// Distances up to this are fully background
    tolerance: f32,
    /// Distances above `tolerance + softness` are fully foreground
    softness: f32,
}

impl ChromaKeySegmenter {
    pub fn new(key: [u8; 3], tolerance: f32, softness: f32) -> Self {
        Self {
            key: [key[0] as f32, key[1] as f32, key[2] as f32],
            tolerance: tolerance.max(0.0),
            softness: softness.max(f32::EPSILON),
        }
    }
}

impl Segmenter for ChromaKeySegmenter {
    fn segment(&mut self, frame: &RgbaImage) -> CaptureResult<Mask> {
        let confidence = frame
            .pixels()
            .map(|p| {
                let dr = p[0] as f32 - self.key[0];
                let dg = p[1] as f32 - self.key[1];
                let db = p[2] as f32 - self.key[2];
                let distance = (dr * dr + dg * dg + db * db).sqrt();
                ((distance - self.tolerance) / self.softness).clamp(0.0, 1.0)
            })
            .collect();

        Ok(Mask {
            width: frame.width(),
            height: frame.height(),
            confidence,
        })
    }

    fn name(&self) -> &'static str {
        "chroma-key"
    }
}

/// Rolling average of the last few masks
///
/// Owned by exactly one processor; a change of mask size restarts the window.
#[derive(Debug)]
pub struct SmoothingBuffer {
    window: usize,
    masks: VecDeque<Mask>,
}

impl SmoothingBuffer {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            masks: VecDeque::with_capacity(window),
        }
    }

    /// Add a mask and return the average over the window
    pub fn push(&mut self, mask: Mask) -> Mask {
        if self
            .masks
            .back()
            .is_some_and(|m| m.width != mask.width || m.height != mask.height)
        {
            self.masks.clear();
        }
        if self.masks.len() == self.window {
            self.masks.pop_front();
        }
        self.masks.push_back(mask);

        let count = self.masks.len() as f32;
        let first = &self.masks[0];
        let mut sum = vec![0.0f32; first.confidence.len()];
        for mask in &self.masks {
            for (acc, value) in sum.iter_mut().zip(&mask.confidence) {
                *acc += value;
            }
        }
        for value in &mut sum {
            *value /= count;
        }

        Mask {
            width: first.width,
            height: first.height,
            confidence: sum,
        }
    }

    pub fn len(&self) -> usize {
        self.masks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }
}

/// Background alpha for a foreground confidence
///
/// Confident background is replaced outright, uncertain pixels ramp in
/// linearly and likely foreground is kept.
pub fn background_alpha(foreground: f32) -> f32 {
    let background = 1.0 - foreground.clamp(0.0, 1.0);
    if background > MASK_FULL_BACKGROUND {
        1.0
    } else if background > MASK_FOREGROUND_CUTOFF {
        ((MASK_RAMP_SLOPE * background + MASK_RAMP_OFFSET) / 255.0).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Per-pixel background alpha at frame resolution
#[derive(Debug, Clone)]
pub struct Matte {
    pub width: u32,
    pub height: u32,
    pub alpha: Vec<f32>,
}

impl Matte {
    /// Scale a mask to the frame size and apply the alpha curve
    pub fn from_mask(mask: &Mask, width: u32, height: u32) -> Self {
        let mut alpha = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                alpha.push(background_alpha(mask.sample(x, y, width, height)));
            }
        }
        Self {
            width,
            height,
            alpha,
        }
    }

    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_alpha_curve() {
        assert_eq!(background_alpha(0.0), 1.0);
        assert_eq!(background_alpha(1.0), 0.0);
        assert_eq!(background_alpha(0.85), 0.0);
        let mid = background_alpha(0.5);
        assert!(mid > 0.0 && mid < 1.0);
        // Ramp tops out at roughly half alpha just below the full cutoff
        let top = background_alpha(0.1001);
        assert!((top - 128.0 / 255.0).abs() < 0.01);
    }

    #[test]
    fn test_chroma_key_separates_key_and_subject() {
        let mut image = RgbaImage::from_pixel(2, 1, Rgba([0, 177, 64, 255]));
        image.put_pixel(1, 0, Rgba([224, 172, 105, 255]));
        let mut segmenter = ChromaKeySegmenter::new([0, 177, 64], 90.0, 60.0);
        let mask = segmenter.segment(&image).unwrap();
        assert_eq!(mask.confidence[0], 0.0);
        assert_eq!(mask.confidence[1], 1.0);
    }

    #[test]
    fn test_smoothing_averages_window() {
        let mut buffer = SmoothingBuffer::new(2);
        buffer.push(Mask::filled(1, 1, 1.0));
        let smoothed = buffer.push(Mask::filled(1, 1, 0.0));
        assert_eq!(smoothed.confidence[0], 0.5);
        let smoothed = buffer.push(Mask::filled(1, 1, 0.0));
        assert_eq!(smoothed.confidence[0], 0.0);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_smoothing_restarts_on_resize() {
        let mut buffer = SmoothingBuffer::new(3);
        buffer.push(Mask::filled(2, 2, 1.0));
        let smoothed = buffer.push(Mask::filled(1, 1, 0.0));
        assert_eq!(buffer.len(), 1);
        assert_eq!(smoothed.confidence, vec![0.0]);
    }

    #[test]
    fn test_mask_sample_scales() {
        let mask = Mask::new(2, 1, vec![0.0, 1.0]).unwrap();
        assert_eq!(mask.sample(0, 0, 4, 2), 0.0);
        assert_eq!(mask.sample(3, 1, 4, 2), 1.0);
    }

    #[test]
    fn test_mask_new_checks_length() {
        assert!(Mask::new(2, 2, vec![0.0; 3]).is_err());
    }
}
