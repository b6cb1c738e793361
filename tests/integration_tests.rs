// tests/integration_tests.rs
//
// End-to-end scenarios through the public ImageRef API: decode, mutate,
// export, decode again.

use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, GenericImageView, RgbImage, RgbaImage};
use image_ref::engine::{
    JpegExportParams, PngExportParams, ProfileId, TiffExportParams, WebpExportParams,
};
use image_ref::ops::{
    Angle, BandFormat, BlendMode, Color, ColorRgba, Direction, Interesting, Interpretation,
    Kernel,
};
use image_ref::{pixelate, ExportParams, ImageRef, ImageType, ImportParams};
use std::io::Cursor;

// Helper function to create test images
fn create_test_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

// Helper to create valid JPEG of specified size
fn create_valid_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = create_test_image(width, height);
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let pixels = rgb.into_raw();

    use mozjpeg::ColorSpace;
    use mozjpeg::Compress;

    let mut comp = Compress::new(ColorSpace::JCS_RGB);
    comp.set_size(w as usize, h as usize);
    comp.set_quality(80.0);
    comp.set_color_space(ColorSpace::JCS_YCbCr);
    comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));

    let mut output = Vec::new();
    {
        let mut writer = comp.start_compress(&mut output).unwrap();
        let stride = w as usize * 3;
        for row in pixels.chunks(stride) {
            writer.write_scanlines(row).unwrap();
        }
        writer.finish().unwrap();
    }
    output
}

fn create_png(img: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

fn create_tagged_png(width: u32, height: u32, icc: &[u8]) -> Vec<u8> {
    use image::codecs::png::PngEncoder;
    use image::{ExtendedColorType, ImageEncoder};

    let img = create_test_image(width, height).to_rgb8();
    let mut buf = Vec::new();
    let mut encoder = PngEncoder::new(&mut buf);
    encoder.set_icc_profile(icc.to_vec()).unwrap();
    encoder
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    buf
}

// Animated GIF, each frame a different solid colour
fn create_animated_gif(width: u32, height: u32, frames: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        encoder.set_repeat(Repeat::Infinite).unwrap();
        for i in 0..frames {
            let frame = RgbaImage::from_pixel(width, height, image::Rgba([(i * 80) as u8, 0, 0, 255]));
            encoder
                .encode_frame(Frame::from_parts(frame, 0, 0, Delay::from_numer_denom_ms(100, 1)))
                .unwrap();
        }
    }
    buf
}

#[test]
fn jpeg_resize_export_round_trip() {
    let img = ImageRef::new(&create_valid_jpeg(100, 100)).unwrap();
    assert_eq!(img.format(), ImageType::Jpeg);
    img.resize(0.5, Kernel::Auto).unwrap();
    assert_eq!((img.width(), img.height()), (50, 50));

    let (bytes, meta) = img.export_jpeg(None).unwrap();
    assert_eq!(meta.format, ImageType::Jpeg);
    assert_eq!((meta.width, meta.height), (50, 50));

    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!(decoded.dimensions(), (50, 50));
    let again = ImageRef::new(&bytes).unwrap();
    assert_eq!(again.format(), ImageType::Jpeg);
    assert_eq!(again.width(), 50);
}

#[test]
fn animated_rotate_keeps_page_geometry() {
    let params = ImportParams {
        n: Some(-1),
        ..ImportParams::default()
    };
    let img = ImageRef::load_with(&create_animated_gif(80, 80, 3), &params).unwrap();
    assert_eq!(img.format(), ImageType::Gif);
    assert_eq!(img.height(), 240);
    assert_eq!(img.pages(), 3);
    assert_eq!(img.page_delay().len(), 3);

    img.rotate(Angle::D90).unwrap();
    assert_eq!(img.page_height(), 80);
    assert_eq!(img.pages(), 3);

    let (bytes, meta) = img.export_gif(None).unwrap();
    assert_eq!(meta.pages, 3);
    let back = ImageRef::load_with(&bytes, &params).unwrap();
    assert_eq!(back.pages(), 3);
}

#[test]
fn cumulative_mutations_are_visible() {
    let img = ImageRef::new(&create_png(&create_test_image(64, 48))).unwrap();
    img.extract_area(8, 8, 32, 24).unwrap();
    img.rotate(Angle::D90).unwrap();
    img.flip(Direction::Horizontal).unwrap();
    img.embed(2, 2, 40, 40, image_ref::ops::ExtendStrategy::Black).unwrap();
    img.gaussian_blur(1.0).unwrap();
    assert_eq!((img.width(), img.height()), (40, 40));
    assert_eq!(img.bands(), 3);

    img.add_alpha().unwrap();
    img.flatten(Color { r: 255, g: 255, b: 255 }).unwrap();
    assert!(!img.has_alpha());

    img.to_color_space(Interpretation::BW).unwrap();
    assert_eq!(img.bands(), 1);
    let (png, meta) = img.export_png(None).unwrap();
    assert_eq!(meta.colorspace, Interpretation::BW);
    let decoded = image::load_from_memory(&png).unwrap();
    assert_eq!(decoded.color(), image::ColorType::L8);
}

#[test]
fn thumbnail_and_smart_crop() {
    let img = ImageRef::new(&create_png(&create_test_image(200, 100))).unwrap();
    img.thumbnail(50, 50, Interesting::None).unwrap();
    assert_eq!((img.width(), img.height()), (50, 25));

    let img = ImageRef::new(&create_png(&create_test_image(200, 100))).unwrap();
    img.thumbnail(50, 50, Interesting::Centre).unwrap();
    assert_eq!((img.width(), img.height()), (50, 50));

    let img = ImageRef::new(&create_png(&create_test_image(200, 100))).unwrap();
    img.smart_crop(60, 60, Interesting::Entropy).unwrap();
    assert_eq!((img.width(), img.height()), (60, 60));
}

#[test]
fn premultiply_round_trip_on_loaded_image() {
    let rgba = DynamicImage::ImageRgba8(RgbaImage::from_fn(16, 16, |x, y| {
        image::Rgba([200, (x * 10) as u8, (y * 10) as u8, 128])
    }));
    let img = ImageRef::new(&create_png(&rgba)).unwrap();
    assert_eq!(img.band_format(), Some(BandFormat::UChar));
    img.premultiply_alpha().unwrap();
    assert!(img.is_premultiplied());
    img.resize(0.5, Kernel::Linear).unwrap();
    assert!(img.is_premultiplied());
    img.unpremultiply_alpha().unwrap();
    assert!(!img.is_premultiplied());
    assert_eq!(img.band_format(), Some(BandFormat::UChar));
    assert_eq!(img.width(), 8);
}

#[test]
fn compositing_operations() {
    let base = ImageRef::new(&create_png(&create_test_image(40, 40))).unwrap();
    let overlay = ImageRef::black(10, 10).unwrap();
    overlay.add_alpha().unwrap();
    base.composite(&overlay, BlendMode::Over, 5, 5).unwrap();
    assert_eq!((base.width(), base.height()), (40, 40));

    base.insert(&overlay, 35, 35, true, ColorRgba { r: 0, g: 0, b: 0, a: 255 })
        .unwrap();
    assert_eq!((base.width(), base.height()), (45, 45));

    let other = ImageRef::new(&create_png(&create_test_image(45, 45))).unwrap();
    base.join(&other, Direction::Vertical).unwrap();
    assert_eq!(base.height(), 90);

    base.draw_rect(ColorRgba { r: 255, g: 0, b: 0, a: 255 }, 0, 0, 4, 4, true)
        .unwrap();
    let px = base.get_point(1, 1).unwrap();
    assert_eq!(&px[..3], &[255.0, 0.0, 0.0]);
}

#[test]
fn every_encodable_format_exports() {
    let img = ImageRef::new(&create_png(&create_test_image(32, 24))).unwrap();
    for format in image_ref::supported_output_formats() {
        let params = ExportParams {
            format,
            ..ExportParams::default()
        };
        let (bytes, meta) = img.export(Some(&params)).unwrap();
        assert!(!bytes.is_empty(), "{format}");
        assert_eq!(meta.format, format);
    }
}

#[test]
fn per_codec_exports_decode() {
    let img = ImageRef::new(&create_png(&create_test_image(32, 24))).unwrap();

    let (png, _) = img
        .export_png(Some(&PngExportParams {
            interlace: true,
            ..PngExportParams::default()
        }))
        .unwrap();
    assert_eq!(image::load_from_memory(&png).unwrap().dimensions(), (32, 24));

    let (webp, _) = img
        .export_webp(Some(&WebpExportParams {
            lossless: true,
            ..WebpExportParams::default()
        }))
        .unwrap();
    assert_eq!(&webp[..4], b"RIFF");

    let (tiff, _) = img.export_tiff(Some(&TiffExportParams::default())).unwrap();
    let back = ImageRef::new(&tiff).unwrap();
    assert_eq!(back.format(), ImageType::Tiff);
    assert_eq!((back.width(), back.height()), (32, 24));

    let (jpeg, _) = img
        .export_jpeg(Some(&JpegExportParams {
            interlace: false,
            quality: 95,
            ..JpegExportParams::default()
        }))
        .unwrap();
    assert_eq!(image::load_from_memory(&jpeg).unwrap().dimensions(), (32, 24));
}

#[test]
fn optimized_profile_is_embedded_in_webp() {
    let untagged = ImageRef::new(&create_png(&create_test_image(8, 8))).unwrap();
    // no profile and not CMYK: nothing to optimize
    untagged.optimize_icc_profile().unwrap();
    assert_eq!(untagged.optimized_profile(), None);
    let (webp, _) = untagged.export_webp(None).unwrap();
    assert!(!webp.windows(4).any(|w| w == b"ICCP"));

    let img = ImageRef::new(&create_tagged_png(8, 8, ProfileId::Srgb.bytes())).unwrap();
    assert!(img.has_icc_profile());
    img.optimize_icc_profile().unwrap();
    assert_eq!(img.optimized_profile(), Some(ProfileId::Srgb));
    let (webp, _) = img.export_webp(None).unwrap();
    assert!(webp.windows(4).any(|w| w == b"ICCP"));

    img.remove_icc_profile().unwrap();
    assert!(!img.has_icc_profile());
    assert_eq!(img.optimized_profile(), None);
}

#[test]
fn from_file_maps_and_decodes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("input.png");
    std::fs::write(&path, create_png(&create_test_image(20, 10))).unwrap();

    let img = ImageRef::from_file(&path).unwrap();
    assert_eq!((img.width(), img.height()), (20, 10));
    img.invert().unwrap();
    assert!(img.close());
    assert!(ImageRef::from_file(dir.path().join("missing.png")).is_err());
}

#[test]
fn raw_bytes_round_trip_through_public_api() {
    let img = ImageRef::new(&create_png(&create_test_image(12, 9))).unwrap();
    img.set_orientation(3).unwrap();
    let bytes = img.to_bytes().unwrap();
    let back = ImageRef::from_raw_bytes(&bytes).unwrap();
    assert_eq!(back.to_image().unwrap(), img.to_image().unwrap());
    assert_eq!(back.orientation(), Some(3));
}

#[test]
fn pixelate_and_queries() {
    let img = ImageRef::new(&create_png(&create_test_image(32, 32))).unwrap();
    let before = img.average().unwrap();
    pixelate(&img, 8.0).unwrap();
    assert_eq!((img.width(), img.height()), (32, 32));
    // block averages keep the overall mean close
    assert!((img.average().unwrap() - before).abs() < 8.0);
}

#[test]
fn handles_share_across_threads() {
    let img = std::sync::Arc::new(ImageRef::new(&create_png(&create_test_image(64, 64))).unwrap());
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let img = img.clone();
            std::thread::spawn(move || {
                for _ in 0..5 {
                    img.invert().unwrap();
                    let _ = img.width();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    // 20 inversions cancel out
    let px = img.get_point(3, 5).unwrap();
    assert_eq!(px, vec![3.0, 5.0, 128.0]);
}
