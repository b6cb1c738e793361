// tests/edge_cases.rs
//
// Edge case tests for image-ref
// Tests boundary values, invalid inputs, closed handles and the guarantee
// that a failed call leaves the handle untouched.

use image::{DynamicImage, RgbImage, RgbaImage};
use image_ref::engine::{
    check_dimensions, CodecParams, ExportParams, ImportParams, PngExportParams, MAX_DIMENSION,
};
use image_ref::error::ErrorCategory;
use image_ref::ops::{Angle, BandFormat, Direction, ExtendStrategy, Interpretation, Kernel};
use image_ref::{ImageRef, ImageRefError, ImageType};
use std::io::Cursor;

// Helper function to create test images
fn create_test_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

fn create_png(img: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

fn rgba_handle(width: u32, height: u32) -> ImageRef {
    let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, image::Rgba([9, 8, 7, 100])));
    ImageRef::new(&create_png(&img)).unwrap()
}

/// Everything observable about a handle, for before/after comparisons.
fn observe(img: &ImageRef) -> (u32, u32, u32, Option<BandFormat>, ImageType, ImageType, bool, u32) {
    (
        img.width(),
        img.height(),
        img.bands(),
        img.band_format(),
        img.format(),
        img.original_format(),
        img.is_premultiplied(),
        img.page_height(),
    )
}

mod minimal_image_tests {
    use super::*;

    #[test]
    fn one_pixel_image_survives_operations() {
        let img = ImageRef::new(&create_png(&create_test_image(1, 1))).unwrap();
        img.rotate(Angle::D90).unwrap();
        img.flip(Direction::Vertical).unwrap();
        img.resize(3.0, Kernel::Cubic).unwrap();
        assert_eq!((img.width(), img.height()), (3, 3));
        img.resize(0.01, Kernel::Linear).unwrap();
        assert_eq!((img.width(), img.height()), (1, 1));
        let (bytes, _) = img.export_jpeg(None).unwrap();
        assert!(!bytes.is_empty());
    }

    #[test]
    fn black_rejects_oversized_canvas() {
        assert!(ImageRef::black(MAX_DIMENSION + 1, 1).is_err());
        assert!(ImageRef::black(1, 0).is_err());
        assert!(check_dimensions(MAX_DIMENSION, MAX_DIMENSION).is_err());
    }
}

mod failure_atomicity_tests {
    use super::*;

    #[test]
    fn failed_crop_leaves_state_unchanged() {
        let img = rgba_handle(20, 20);
        img.premultiply_alpha().unwrap();
        let before = observe(&img);
        let pixels = img.to_image().unwrap();

        let err = img.extract_area(15, 15, 10, 10).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Primitive);
        assert_eq!(observe(&img), before);
        assert_eq!(img.to_image().unwrap(), pixels);
        assert!(img.is_premultiplied());
    }

    #[test]
    fn failed_resize_keeps_premultiplication_inactive() {
        let img = rgba_handle(8, 8);
        let before = observe(&img);
        assert!(img.resize(-1.0, Kernel::Linear).is_err());
        assert!(img.resize(f64::NAN, Kernel::Linear).is_err());
        assert_eq!(observe(&img), before);
        assert!(!img.is_premultiplied());
    }

    #[test]
    fn failed_embed_and_zoom_keep_geometry() {
        let img = rgba_handle(8, 8);
        let before = observe(&img);
        assert!(img.embed(0, 0, 0, 10, ExtendStrategy::Copy).is_err());
        assert!(img.zoom(0, 2).is_err());
        assert!(img.zoom(MAX_DIMENSION, 1).is_err());
        assert!(img.replicate(MAX_DIMENSION, 1).is_err());
        assert!(img.grid(3, 1, 1).is_err());
        assert_eq!(observe(&img), before);
    }

    #[test]
    fn invalid_page_metadata_is_rejected() {
        let img = ImageRef::black(10, 30).unwrap();
        let before = observe(&img);
        assert!(img.set_page_height(7).is_err());
        assert!(img.set_page_height(0).is_err());
        assert!(img.set_pages(0).is_err());
        assert!(img.set_page_delay(&[1, 2]).is_err());
        assert_eq!(observe(&img), before);
        assert!(img.page_delay().is_empty());
    }

    #[test]
    fn cmyk_conversion_fails_cleanly() {
        let img = rgba_handle(4, 4);
        let before = observe(&img);
        assert!(img.to_color_space(Interpretation::Cmyk).is_err());
        assert_eq!(observe(&img), before);
    }
}

mod export_rejection_tests {
    use super::*;

    #[test]
    fn unsupported_formats_are_parameter_errors() {
        let img = rgba_handle(4, 4);
        let before = observe(&img);
        for format in [ImageType::Heif, ImageType::Jp2k, ImageType::Bmp, ImageType::Svg] {
            let params = ExportParams {
                format,
                ..ExportParams::default()
            };
            let err = img.export(Some(&params)).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Parameter, "{format}");
            assert!(err.is_recoverable());
        }
        assert!(img.export_heif(None).is_err());
        assert!(img.export_jp2k(None).is_err());
        assert_eq!(observe(&img), before);
    }

    #[test]
    fn none_and_default_params_match() {
        let img = ImageRef::new(&create_png(&create_test_image(10, 6))).unwrap();
        let (a, _) = img.export_png(None).unwrap();
        let (b, _) = img.export_png(Some(&PngExportParams::default())).unwrap();
        assert_eq!(a, b);
        let (c, _) = img.export(None).unwrap();
        let (d, _) = img.export(Some(&ExportParams::default())).unwrap();
        assert_eq!(c, d);
    }

    #[test]
    fn codec_defaults_follow_format() {
        assert!(matches!(CodecParams::defaults_for(ImageType::Png), CodecParams::Png(_)));
        assert!(matches!(CodecParams::defaults_for(ImageType::Bmp), CodecParams::Jpeg(_)));
    }
}

mod lifecycle_tests {
    use super::*;

    #[test]
    fn double_close_releases_once() {
        let img = ImageRef::black(4, 4).unwrap();
        assert!(img.close());
        assert!(!img.close());
    }

    #[test]
    fn closed_handle_rejects_everything() {
        let img = rgba_handle(4, 4);
        let other = rgba_handle(4, 4);
        img.close();
        assert!(matches!(img.invert(), Err(ImageRefError::ImageClosed)));
        assert!(matches!(img.resize(0.5, Kernel::Auto), Err(ImageRefError::ImageClosed)));
        assert!(matches!(img.export(None), Err(ImageRefError::ImageClosed)));
        assert!(matches!(img.metadata(), Err(ImageRefError::ImageClosed)));
        assert!(matches!(img.to_bytes(), Err(ImageRefError::ImageClosed)));
        assert!(matches!(
            other.join(&img, Direction::Horizontal),
            Err(ImageRefError::ImageClosed)
        ));
        assert_eq!(other.width(), 4);
        assert_eq!((img.width(), img.height(), img.bands(), img.pages()), (0, 0, 0, 0));
        assert_eq!(img.orientation(), None);
        assert!(!img.has_icc_profile());
    }

    #[test]
    fn drop_after_close_is_quiet() {
        let img = ImageRef::black(4, 4).unwrap();
        img.close();
        drop(img);
    }
}

mod decode_rejection_tests {
    use super::*;

    #[test]
    fn garbage_is_unsupported() {
        let err = ImageRef::new(b"definitely not an image").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Decode);
        assert!(ImageRef::new(&[]).is_err());
    }

    #[test]
    fn svg_is_sniffed_but_unsupported() {
        let svg = br#"<svg xmlns="http://www.w3.org/2000/svg" width="4" height="4"></svg>"#;
        let err = ImageRef::new(svg).unwrap_err();
        assert!(matches!(err, ImageRefError::UnsupportedFormat { .. }));
    }

    #[test]
    fn invalid_shrink_factor_is_rejected() {
        let params = ImportParams {
            jpeg_shrink_factor: Some(3),
            ..ImportParams::default()
        };
        let png = create_png(&create_test_image(8, 8));
        let err = ImageRef::load_with(&png, &params).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Parameter);
        let params = ImportParams {
            jpeg_shrink_factor: Some(2),
            ..ImportParams::default()
        };
        assert!(ImageRef::load_with(&png, &params).is_ok());
    }
}
