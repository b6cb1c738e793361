// src/engine/premultiply.rs
//
// Alpha pre-multiplication and the per-handle tracker that remembers how to
// undo it.

use crate::engine::common::EngineResult;
use crate::engine::native::{cast_pixels, Layout, NativeImage};
use crate::ops::BandFormat;
use image::DynamicImage;

/// Whether the handle's pixels currently carry premultiplied alpha.
///
/// `Active` records the band format the pixels had before premultiplying,
/// so the reverse step can restore it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PremultiplyState {
    #[default]
    Inactive,
    Active(BandFormat),
}

impl PremultiplyState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }
}

/// Multiply colour bands by alpha. The result is a float image.
pub(crate) fn premultiply(img: &NativeImage) -> EngineResult<NativeImage> {
    let mut rgba = img.pixels().to_rgba32f();
    for px in rgba.pixels_mut() {
        let a = px.0[3];
        px.0 = [px.0[0] * a, px.0[1] * a, px.0[2] * a, a];
    }
    let pixels = cast_pixels(
        &DynamicImage::ImageRgba32F(rgba),
        Layout::of(img),
        BandFormat::Float,
    );
    Ok(img.derive(pixels))
}

/// Divide colour bands by alpha and cast back to `format`.
pub(crate) fn unpremultiply(img: &NativeImage, format: BandFormat) -> EngineResult<NativeImage> {
    let mut rgba = img.pixels().to_rgba32f();
    for px in rgba.pixels_mut() {
        let a = px.0[3];
        px.0 = if a > 0.0 {
            [
                (px.0[0] / a).min(1.0),
                (px.0[1] / a).min(1.0),
                (px.0[2] / a).min(1.0),
                a,
            ]
        } else {
            [0.0, 0.0, 0.0, 0.0]
        };
    }
    let pixels = cast_pixels(&DynamicImage::ImageRgba32F(rgba), Layout::of(img), format);
    Ok(img.derive(pixels))
}
