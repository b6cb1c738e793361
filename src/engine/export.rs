// src/engine/export.rs
//
// Format export dispatcher: resolves the target format and its parameter
// set, then encodes a snapshot of the handle outside the lock.

use crate::engine::api::ImageRef;
use crate::engine::common::EngineResult;
use crate::engine::encoder::{self, Attachments};
use crate::engine::native::NativeImage;
use crate::engine::params::{
    map_generic, AvifExportParams, CodecParams, ExportParams, GifExportParams,
    HeifExportParams, Jp2kExportParams, JpegExportParams, PngExportParams, TiffExportParams,
    WebpExportParams,
};
use crate::engine::primitives::colour;
use crate::error::{ImageRefError, Result};
use crate::ops::{ImageType, Interpretation};
use std::borrow::Cow;
use tracing::debug;

/// Snapshot of the image taken when it was exported or queried.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageMetadata {
    pub format: ImageType,
    pub width: u32,
    pub height: u32,
    pub colorspace: Interpretation,
    pub orientation: Option<u16>,
    pub pages: u32,
}

impl ImageMetadata {
    fn of(img: &NativeImage, format: ImageType) -> Self {
        Self {
            format,
            width: img.width(),
            height: img.height(),
            colorspace: img.color_space(),
            orientation: img.orientation(),
            pages: img.reported_pages(format),
        }
    }
}

/// Encoders only understand display spaces. Anything else goes to sRGB.
fn display_ready(img: &NativeImage) -> EngineResult<Cow<'_, NativeImage>> {
    match img.interpretation() {
        Interpretation::ScRgb | Interpretation::Hsv | Interpretation::Lab | Interpretation::Lch => {
            Ok(Cow::Owned(colour::to_color_space(img, Interpretation::Srgb)?))
        }
        _ => Ok(Cow::Borrowed(img)),
    }
}

/// Orientation tag to write over the attached EXIF. A handle without
/// EXIF only gets one when it is not upright.
fn orientation_for_export(img: &NativeImage) -> Option<u16> {
    match (img.exif(), img.orientation()) {
        (Some(_), orientation) => Some(orientation.unwrap_or(1)),
        (None, Some(orientation)) if orientation != 1 => Some(orientation),
        (None, _) => None,
    }
}

impl ImageRef {
    // =========================================================================
    // EXPORT
    // =========================================================================

    /// Export with generic parameters. `None`, or a format of `Unknown`,
    /// exports in the current format with that format's defaults.
    pub fn export(&self, params: Option<&ExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        let params = match params {
            Some(p) if p.format != ImageType::Unknown => p,
            _ => return self.export_native(),
        };
        if !params.format.is_encodable() {
            return Err(ImageRefError::unsupported_export_format(params.format.name()));
        }
        self.export_with(map_generic(params, params.format))
    }

    /// Export in the current format with its default parameters. Formats
    /// this build cannot write fall back to JPEG.
    pub fn export_native(&self) -> Result<(Vec<u8>, ImageMetadata)> {
        let current = self.format();
        let format = if current.is_encodable() {
            current
        } else {
            debug!(target: "image_ref::export", from = %current, "not encodable, falling back to jpeg");
            ImageType::Jpeg
        };
        self.export_with(CodecParams::defaults_for(format))
    }

    pub fn export_jpeg(&self, params: Option<&JpegExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        self.export_with(CodecParams::Jpeg(params.cloned().unwrap_or_default()))
    }

    pub fn export_png(&self, params: Option<&PngExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        self.export_with(CodecParams::Png(params.cloned().unwrap_or_default()))
    }

    /// WebP always embeds the profile chosen by `optimize_icc_profile`, if
    /// any, in place of `icc_profile`.
    pub fn export_webp(&self, params: Option<&WebpExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        self.export_with(CodecParams::Webp(params.cloned().unwrap_or_default()))
    }

    pub fn export_tiff(&self, params: Option<&TiffExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        self.export_with(CodecParams::Tiff(params.cloned().unwrap_or_default()))
    }

    pub fn export_gif(&self, params: Option<&GifExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        self.export_with(CodecParams::Gif(params.cloned().unwrap_or_default()))
    }

    pub fn export_avif(&self, params: Option<&AvifExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        self.export_with(CodecParams::Avif(params.cloned().unwrap_or_default()))
    }

    /// Always fails: no HEIF encoder in this build.
    pub fn export_heif(&self, params: Option<&HeifExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        self.export_with(CodecParams::Heif(params.cloned().unwrap_or_default()))
    }

    /// Always fails: no JPEG 2000 encoder in this build.
    pub fn export_jp2k(&self, params: Option<&Jp2kExportParams>) -> Result<(Vec<u8>, ImageMetadata)> {
        self.export_with(CodecParams::Jp2k(params.cloned().unwrap_or_default()))
    }

    /// Metadata of the current image in its current format.
    pub fn metadata(&self) -> Result<ImageMetadata> {
        let state = self.state.lock();
        Ok(ImageMetadata::of(state.native()?, state.format))
    }

    fn export_with(&self, params: CodecParams) -> Result<(Vec<u8>, ImageMetadata)> {
        let format = params.format();
        if !format.is_encodable() {
            return Err(ImageRefError::unsupported_export_format(format.name()));
        }
        let (native, optimized, metadata) = {
            let state = self.state.lock();
            let native = state.native()?.clone();
            let metadata = ImageMetadata::of(&native, format);
            (native, state.optimized_profile, metadata)
        };
        let params = match params {
            CodecParams::Webp(mut p) => {
                p.icc_profile = optimized.map(|profile| profile.bytes().to_vec());
                CodecParams::Webp(p)
            }
            other => other,
        };

        let img = display_ready(&native)?;
        let attachments = Attachments {
            icc: img.icc_profile(),
            exif: img.exif(),
            orientation: orientation_for_export(&img),
        };
        let bytes = encoder::encode(&img, &params, attachments)?;
        debug!(
            target: "image_ref::export",
            format = %format,
            width = img.width(),
            height = img.height(),
            bytes = bytes.len(),
            "exported"
        );
        Ok((bytes, metadata))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::native::NativeImage;
    use image::{DynamicImage, Rgb, RgbImage};

    fn rgb(format: ImageType) -> ImageRef {
        let pixels = DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 8, Rgb([120, 80, 40])));
        ImageRef::from_native(NativeImage::new(pixels), format)
    }

    #[test]
    fn none_equals_default() {
        let img = rgb(ImageType::Png);
        let (a, meta_a) = img.export(None).unwrap();
        let (b, meta_b) = img.export(Some(&ExportParams::default())).unwrap();
        assert_eq!(a, b);
        assert_eq!(meta_a, meta_b);
        assert_eq!(meta_a.format, ImageType::Png);
    }

    #[test]
    fn unknown_format_falls_back_to_jpeg() {
        let img = rgb(ImageType::Unknown);
        let (bytes, meta) = img.export_native().unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        assert_eq!(meta.format, ImageType::Jpeg);
    }

    #[test]
    fn unsupported_format_is_rejected_before_encoding() {
        let img = rgb(ImageType::Png);
        let before = img.snapshot().unwrap();
        let params = ExportParams {
            format: ImageType::Heif,
            ..ExportParams::default()
        };
        let err = img.export(Some(&params)).unwrap_err();
        assert!(matches!(err, ImageRefError::UnsupportedExportFormat { .. }));
        assert!(img.export_jp2k(None).is_err());
        assert!(img.snapshot().unwrap().same_object(&before));
    }

    #[test]
    fn generic_png_export() {
        let img = rgb(ImageType::Jpeg);
        let params = ExportParams {
            format: ImageType::Png,
            interlaced: false,
            ..ExportParams::default()
        };
        let (bytes, meta) = img.export(Some(&params)).unwrap();
        assert_eq!(&bytes[..4], b"\x89PNG");
        assert_eq!((meta.width, meta.height), (16, 8));
        assert_eq!(img.format(), ImageType::Jpeg);
    }

    #[test]
    fn lab_images_are_converted_for_export() {
        let img = rgb(ImageType::Png);
        img.to_color_space(Interpretation::Lab).unwrap();
        let (bytes, _) = img.export_png(None).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        let px = decoded.get_pixel(3, 3).0;
        assert!((px[0] as i32 - 120).abs() <= 1);
    }

    #[test]
    fn orientation_travels_in_exif() {
        let img = rgb(ImageType::Jpeg);
        img.set_orientation(6).unwrap();
        let (bytes, meta) = img.export_jpeg(None).unwrap();
        assert_eq!(meta.orientation, Some(6));
        assert_eq!(crate::engine::orientation::detect_exif_orientation(&bytes), Some(6));
    }

    #[test]
    fn removed_orientation_exports_upright() {
        let source = rgb(ImageType::Jpeg);
        source.set_orientation(3).unwrap();
        let (bytes, _) = source.export_jpeg(None).unwrap();

        let img = ImageRef::new(&bytes).unwrap();
        assert!(img.has_exif());
        assert_eq!(img.orientation(), Some(3));
        img.remove_orientation().unwrap();
        let (bytes, meta) = img.export_png(None).unwrap();
        assert_eq!(meta.orientation, None);
        assert_eq!(crate::engine::orientation::detect_exif_orientation(&bytes), Some(1));
    }

    #[test]
    fn metadata_matches_one_native_object() {
        let narrow = NativeImage::new(DynamicImage::ImageRgb8(RgbImage::new(4, 12))).with_page_height(4);
        let wide = NativeImage::new(DynamicImage::ImageRgb8(RgbImage::new(6, 12)));
        let img = std::sync::Arc::new(ImageRef::from_native(narrow.clone(), ImageType::Gif));

        let writer = {
            let img = std::sync::Arc::clone(&img);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let next = if i % 2 == 0 { wide.clone() } else { narrow.clone() };
                    img.mutate("swap", |draft| draft.apply(|_| Ok(next))).unwrap();
                    img.set_page_height(if i % 2 == 0 { 12 } else { 4 }).unwrap();
                }
            })
        };
        for _ in 0..200 {
            let meta = img.metadata().unwrap();
            assert!(
                matches!((meta.width, meta.pages), (4, 3) | (6, 1)),
                "{meta:?}"
            );
            let (_, exported) = img.export_gif(None).unwrap();
            assert!(matches!((exported.width, exported.pages), (4, 3) | (6, 1)));
        }
        writer.join().unwrap();
    }

    #[test]
    fn jp2k_handles_report_one_page() {
        let pixels = DynamicImage::ImageRgb8(RgbImage::new(4, 12));
        let img = ImageRef::from_native(NativeImage::new(pixels).with_page_height(4), ImageType::Jp2k);
        assert_eq!(img.pages(), 1);
        assert_eq!(img.metadata().unwrap().pages, 1);
    }

    #[test]
    fn metadata_colorspace_matches_color_space() {
        let coords = ImageRef::xyz(4, 4).unwrap();
        assert_eq!(coords.metadata().unwrap().colorspace, Interpretation::BW);
        assert_eq!(coords.color_space(), Some(Interpretation::BW));

        let pixels = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
        let native = NativeImage::new(pixels).with_interpretation(Interpretation::Multiband);
        let img = ImageRef::from_native(native, ImageType::Png);
        assert_eq!(img.interpretation(), Some(Interpretation::Multiband));
        assert_eq!(img.metadata().unwrap().colorspace, Interpretation::Srgb);
        assert_eq!(img.color_space(), Some(Interpretation::Srgb));
    }

    #[test]
    fn metadata_fails_when_closed() {
        let img = rgb(ImageType::Png);
        assert_eq!(img.metadata().unwrap().width, 16);
        img.close();
        assert!(matches!(img.metadata(), Err(ImageRefError::ImageClosed)));
        assert!(matches!(img.export(None), Err(ImageRefError::ImageClosed)));
    }
}
