// SPDX-License-Identifier: GPL-3.0-only

//! Background effects and compositing
//!
//! An effect renders the replacement background for a frame. The processor
//! then blends it under the foreground with [`composite`].

use crate::errors::CaptureResult;
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use std::borrow::Cow;
use std::path::Path;
use tracing::{debug, info};

/// Size of the generated fallback background before scaling
const GRADIENT_SIZE: u32 = 64;

/// Renders the image that replaces the background
pub trait BackgroundEffect: Send {
    /// Produce a background the same size as `frame`
    fn render_background<'a>(&'a mut self, frame: &RgbaImage) -> CaptureResult<Cow<'a, RgbaImage>>;

    /// Short name for logging
    fn name(&self) -> &'static str;
}

/// Blurs the frame itself
#[derive(Debug, Clone)]
pub struct BlurEffect {
    radius: u32,
}

impl BlurEffect {
    pub fn new(radius: u32) -> Self {
        Self { radius }
    }
}

impl BackgroundEffect for BlurEffect {
    fn render_background<'a>(&'a mut self, frame: &RgbaImage) -> CaptureResult<Cow<'a, RgbaImage>> {
        Ok(Cow::Owned(blur(frame, self.radius)))
    }

    fn name(&self) -> &'static str {
        "blur"
    }
}

/// Replaces the background with a still image
///
/// The source image is stretched to the frame size; the scaled copy is kept
/// until the frame size changes.
#[derive(Debug, Clone)]
pub struct VirtualBackgroundEffect {
    source: RgbaImage,
    scaled: Option<RgbaImage>,
}

impl VirtualBackgroundEffect {
    pub fn new(source: RgbaImage) -> Self {
        Self {
            source,
            scaled: None,
        }
    }

    /// Load the background from an image file
    pub fn from_path(path: &Path) -> CaptureResult<Self> {
        let source = image::open(path)?.to_rgba8();
        info!(
            path = %path.display(),
            width = source.width(),
            height = source.height(),
            "Loaded virtual background"
        );
        Ok(Self::new(source))
    }

    /// A generated dusk gradient, used when no image is configured
    pub fn gradient() -> Self {
        let source = RgbaImage::from_fn(GRADIENT_SIZE, GRADIENT_SIZE, |_, y| {
            let t = y as f32 / (GRADIENT_SIZE - 1) as f32;
            let lerp = |a: f32, b: f32| (a + (b - a) * t).round() as u8;
            Rgba([lerp(40.0, 200.0), lerp(60.0, 120.0), lerp(140.0, 90.0), 255])
        });
        Self::new(source)
    }
}

impl BackgroundEffect for VirtualBackgroundEffect {
    fn render_background<'a>(&'a mut self, frame: &RgbaImage) -> CaptureResult<Cow<'a, RgbaImage>> {
        let (width, height) = frame.dimensions();
        let stale = self
            .scaled
            .as_ref()
            .is_none_or(|img| img.dimensions() != (width, height));

        if stale {
            debug!(width, height, "Scaling virtual background");
            self.scaled = Some(imageops::resize(&self.source, width, height, FilterType::Triangle));
        }

        Ok(match &self.scaled {
            Some(img) => Cow::Borrowed(img),
            None => Cow::Owned(imageops::resize(&self.source, width, height, FilterType::Triangle)),
        })
    }

    fn name(&self) -> &'static str {
        "virtual-background"
    }
}

/// Approximate Gaussian blur with a spread of about `radius` pixels
///
/// Runs the `image` crate's three-pass box blur with sigma `radius / 2`,
/// capped so the blur window fits inside the frame.
pub fn blur(src: &RgbaImage, radius: u32) -> RgbaImage {
    let shortest = src.width().min(src.height());
    let sigma = (radius as f32 / 2.0).min(shortest.saturating_sub(1) as f32 / 2.0);
    if sigma <= 0.0 {
        return src.clone();
    }
    imageops::fast_blur(src, sigma)
}

/// Blend background under foreground: `out = fg * (1 - a) + bg * a`
///
/// `alpha` holds one background weight per pixel. The output is opaque.
pub fn composite(foreground: &RgbaImage, background: &RgbaImage, alpha: &[f32]) -> RgbaImage {
    let (width, height) = foreground.dimensions();
    let mut out = RgbaImage::new(width, height);

    for (i, ((dst, fg), bg)) in out
        .pixels_mut()
        .zip(foreground.pixels())
        .zip(background.pixels())
        .enumerate()
    {
        let a = alpha.get(i).copied().unwrap_or(0.0).clamp(0.0, 1.0);
        let mix = |f: u8, b: u8| (f as f32 * (1.0 - a) + b as f32 * a).round().clamp(0.0, 255.0) as u8;
        *dst = Rgba([mix(fg[0], bg[0]), mix(fg[1], bg[1]), mix(fg[2], bg[2]), 255]);
    }

    out
}
