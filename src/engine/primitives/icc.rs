// src/engine/primitives/icc.rs
//
// ICC colour transforms with moxcms. Pixels are converted at 16 bits and
// cast back to the source's band format.

use crate::engine::common::EngineResult;
use crate::engine::native::{cast_pixels, Layout, NativeImage};
use crate::error::ImageRefError;
use crate::ops::{BandFormat, Interpretation};
use image::{DynamicImage, ImageBuffer, Luma, LumaA, Rgb, Rgba};
use moxcms::{ColorProfile, DataColorSpace, Layout as CmsLayout, TransformOptions};
use std::sync::Arc;

fn cms_error(e: moxcms::CmsError) -> ImageRefError {
    ImageRefError::operation_failed("icc_transform", e.to_string())
}

/// Parse ICC bytes, rejecting profiles that cannot describe RGB, grey or
/// CMYK pixels.
pub(crate) fn parse_profile(bytes: &[u8]) -> EngineResult<ColorProfile> {
    let profile = ColorProfile::new_from_slice(bytes).map_err(cms_error)?;
    match profile.color_space {
        DataColorSpace::Rgb | DataColorSpace::Gray | DataColorSpace::Cmyk => Ok(profile),
        other => Err(ImageRefError::operation_failed(
            "icc_transform",
            format!("unsupported profile colour space {other:?}"),
        )),
    }
}

/// The profile the pixels are in: the embedded one, otherwise sRGB (or a
/// 2.2 gamma grey for one and two band images).
fn source_profile(img: &NativeImage) -> EngineResult<ColorProfile> {
    match img.icc_profile() {
        Some(bytes) => parse_profile(bytes),
        None if img.interpretation() == Interpretation::Cmyk => Err(ImageRefError::operation_failed(
            "icc_transform",
            "CMYK input needs an embedded profile",
        )),
        None if img.bands() <= 2 => Ok(ColorProfile::new_gray_with_gamma(2.2)),
        None => Ok(ColorProfile::new_srgb()),
    }
}

/// 16-bit samples laid out for `space`, with the alpha channel kept when
/// the layout has one.
fn source_samples(img: &NativeImage, space: DataColorSpace) -> (Vec<u16>, CmsLayout) {
    let pixels = img.pixels();
    let alpha = img.has_alpha();
    match (space, alpha) {
        (DataColorSpace::Cmyk, _) => (pixels.to_rgba16().into_raw(), CmsLayout::Rgba),
        (DataColorSpace::Gray, false) => (pixels.to_luma16().into_raw(), CmsLayout::Gray),
        (DataColorSpace::Gray, true) => (pixels.to_luma_alpha16().into_raw(), CmsLayout::GrayAlpha),
        (_, false) => (pixels.to_rgb16().into_raw(), CmsLayout::Rgb),
        (_, true) => (pixels.to_rgba16().into_raw(), CmsLayout::Rgba),
    }
}

fn channels(layout: CmsLayout) -> usize {
    match layout {
        CmsLayout::Gray => 1,
        CmsLayout::GrayAlpha => 2,
        CmsLayout::Rgb => 3,
        _ => 4,
    }
}

fn build(width: u32, height: u32, layout: CmsLayout, data: Vec<u16>) -> Option<DynamicImage> {
    match layout {
        CmsLayout::Gray => {
            ImageBuffer::<Luma<u16>, _>::from_raw(width, height, data).map(DynamicImage::ImageLuma16)
        }
        CmsLayout::GrayAlpha => ImageBuffer::<LumaA<u16>, _>::from_raw(width, height, data)
            .map(DynamicImage::ImageLumaA16),
        CmsLayout::Rgb => {
            ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, data).map(DynamicImage::ImageRgb16)
        }
        _ => ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, data)
            .map(DynamicImage::ImageRgba16),
    }
}

/// Convert the pixels into the colour space of `target` (ICC bytes) and
/// embed `target`. The band format is kept; CMYK input loses its fourth
/// band.
pub(crate) fn transform(img: &NativeImage, target: &[u8]) -> EngineResult<NativeImage> {
    let source = source_profile(img)?;
    let destination = parse_profile(target)?;
    if destination.color_space == DataColorSpace::Cmyk {
        return Err(ImageRefError::operation_failed(
            "icc_transform",
            "CMYK output profiles are not supported",
        ));
    }

    let (src, src_layout) = source_samples(img, source.color_space);
    let keep_alpha = matches!(src_layout, CmsLayout::GrayAlpha)
        || (src_layout == CmsLayout::Rgba && source.color_space != DataColorSpace::Cmyk);
    let grey = destination.color_space == DataColorSpace::Gray;
    let dst_layout = match (grey, keep_alpha) {
        (true, false) => CmsLayout::Gray,
        (true, true) => CmsLayout::GrayAlpha,
        (false, false) => CmsLayout::Rgb,
        (false, true) => CmsLayout::Rgba,
    };

    let executor = source
        .create_transform_16bit(src_layout, &destination, dst_layout, TransformOptions::default())
        .map_err(cms_error)?;
    let pixels = img.width() as usize * img.height() as usize;
    let mut dst = vec![0u16; pixels * channels(dst_layout)];
    executor.transform(&src, &mut dst).map_err(cms_error)?;

    let converted = build(img.width(), img.height(), dst_layout, dst).ok_or_else(|| {
        ImageRefError::operation_failed("icc_transform", "transform produced a short buffer")
    })?;
    let format = img.band_format();
    let pixels = cast_pixels(
        &converted,
        Layout {
            grey,
            alpha: keep_alpha,
        },
        format,
    );
    let interpretation = match (grey, format) {
        (true, BandFormat::UShort) => Interpretation::Grey16,
        (true, _) => Interpretation::BW,
        (false, BandFormat::UShort) => Interpretation::Rgb16,
        (false, _) => Interpretation::Srgb,
    };
    let mut out = img.derive(pixels).with_interpretation(interpretation);
    out.icc = Some(Arc::new(target.to_vec()));
    Ok(out)
}
