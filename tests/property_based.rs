use image::{DynamicImage, RgbImage, RgbaImage};
use image_ref::engine::{ExportParams, PngExportParams};
use image_ref::ops::{Angle, BandFormat, Direction, Kernel};
use image_ref::ImageRef;
use proptest::prelude::*;
use std::io::Cursor;

fn create_test_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

fn handle(img: &DynamicImage) -> ImageRef {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    ImageRef::new(&buf).unwrap()
}

fn valid_crop_strategy() -> impl Strategy<Value = (u32, u32, u32, u32, u32, u32)> {
    (1u32..=64, 1u32..=64)
        .prop_flat_map(|(img_w, img_h)| {
            let crop_w = 1u32..=img_w;
            let crop_h = 1u32..=img_h;
            (Just(img_w), Just(img_h), crop_w, crop_h)
        })
        .prop_flat_map(|(img_w, img_h, crop_w, crop_h)| {
            let max_x = img_w - crop_w;
            let max_y = img_h - crop_h;
            (
                Just(img_w),
                Just(img_h),
                Just(crop_w),
                Just(crop_h),
                0u32..=max_x,
                0u32..=max_y,
            )
        })
}

fn invalid_crop_strategy() -> impl Strategy<Value = (u32, u32, u32, u32, u32, u32)> {
    (1u32..=64, 1u32..=64)
        .prop_flat_map(|(img_w, img_h)| {
            let crop_w = 1u32..=img_w;
            let crop_h = 1u32..=img_h;
            (Just(img_w), Just(img_h), crop_w, crop_h)
        })
        .prop_flat_map(|(img_w, img_h, crop_w, crop_h)| {
            let min_x = img_w - crop_w + 1;
            let min_y = img_h - crop_h + 1;
            prop_oneof![
                (
                    Just(img_w),
                    Just(img_h),
                    Just(crop_w),
                    Just(crop_h),
                    min_x..=img_w,
                    Just(0u32),
                ),
                (
                    Just(img_w),
                    Just(img_h),
                    Just(crop_w),
                    Just(crop_h),
                    Just(0u32),
                    min_y..=img_h,
                ),
            ]
        })
}

fn angle_strategy() -> impl Strategy<Value = Angle> {
    prop_oneof![
        Just(Angle::D0),
        Just(Angle::D90),
        Just(Angle::D180),
        Just(Angle::D270),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_crop_within_bounds_succeeds(
        (img_w, img_h, crop_w, crop_h, x, y) in valid_crop_strategy()
    ) {
        let img = handle(&create_test_image(img_w, img_h));
        img.extract_area(x, y, crop_w, crop_h).unwrap();
        prop_assert_eq!((img.width(), img.height()), (crop_w, crop_h));
        prop_assert_eq!(img.get_point(0, 0).unwrap()[0], ((x % 256) as f64));
    }

    #[test]
    fn prop_crop_out_of_bounds_leaves_handle_untouched(
        (img_w, img_h, crop_w, crop_h, x, y) in invalid_crop_strategy()
    ) {
        let img = handle(&create_test_image(img_w, img_h));
        let before = img.to_image().unwrap();
        prop_assert!(img.extract_area(x, y, crop_w, crop_h).is_err());
        prop_assert_eq!((img.width(), img.height()), (img_w, img_h));
        prop_assert_eq!(img.to_image().unwrap(), before);
    }

    #[test]
    fn prop_rotate_swaps_dimensions(
        w in 1u32..=48,
        h in 1u32..=48,
        angle in angle_strategy(),
    ) {
        let img = handle(&create_test_image(w, h));
        img.rotate(angle).unwrap();
        let expected = match angle {
            Angle::D90 | Angle::D270 => (h, w),
            _ => (w, h),
        };
        prop_assert_eq!((img.width(), img.height()), expected);
    }

    #[test]
    fn prop_four_quarter_turns_are_identity(w in 1u32..=32, h in 1u32..=32) {
        let img = handle(&create_test_image(w, h));
        let before = img.to_image().unwrap();
        for _ in 0..4 {
            img.rotate(Angle::D90).unwrap();
        }
        prop_assert_eq!(img.to_image().unwrap(), before);
    }

    #[test]
    fn prop_double_flip_is_identity(
        w in 1u32..=32,
        h in 1u32..=32,
        horizontal in any::<bool>(),
    ) {
        let img = handle(&create_test_image(w, h));
        let before = img.to_image().unwrap();
        let direction = if horizontal { Direction::Horizontal } else { Direction::Vertical };
        img.flip(direction).unwrap();
        img.flip(direction).unwrap();
        prop_assert_eq!(img.to_image().unwrap(), before);
    }

    #[test]
    fn prop_resize_rounds_each_axis(
        w in 1u32..=64,
        h in 1u32..=64,
        scale in 0.05f64..3.0,
    ) {
        let img = handle(&create_test_image(w, h));
        img.resize(scale, Kernel::Linear).unwrap();
        let expect = |v: u32| ((v as f64 * scale).round() as u32).max(1);
        prop_assert_eq!((img.width(), img.height()), (expect(w), expect(h)));
        prop_assert!(!img.is_premultiplied());
        prop_assert_eq!(img.band_format(), Some(BandFormat::UChar));
    }

    #[test]
    fn prop_premultiply_round_trip_is_close(
        r in any::<u8>(),
        g in any::<u8>(),
        b in any::<u8>(),
        a in 1u8..=255,
    ) {
        let src = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, image::Rgba([r, g, b, a])));
        let img = handle(&src);
        img.premultiply_alpha().unwrap();
        prop_assert!(img.is_premultiplied());
        prop_assert_eq!(img.band_format(), Some(BandFormat::Float));
        img.unpremultiply_alpha().unwrap();
        prop_assert!(!img.is_premultiplied());
        prop_assert_eq!(img.band_format(), Some(BandFormat::UChar));

        let px = img.get_point(1, 1).unwrap();
        prop_assert_eq!(px[3], a as f64);
        // small alphas lose precision in the float round trip
        let tolerance = (255.0 / a as f64).ceil();
        for (got, want) in px.iter().zip([r, g, b]) {
            prop_assert!((got - want as f64).abs() <= tolerance, "{} vs {}", got, want);
        }
    }

    #[test]
    fn prop_raw_round_trip_preserves_pixels(w in 1u32..=32, h in 1u32..=32) {
        let img = handle(&create_test_image(w, h));
        let back = ImageRef::from_raw_bytes(&img.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(back.to_image().unwrap(), img.to_image().unwrap());
        prop_assert_eq!(back.bands(), img.bands());
    }

    #[test]
    fn prop_export_none_matches_default(w in 1u32..=24, h in 1u32..=24) {
        let img = handle(&create_test_image(w, h));
        let (a, meta_a) = img.export(None).unwrap();
        let (b, meta_b) = img.export(Some(&ExportParams::default())).unwrap();
        prop_assert_eq!(a, b);
        prop_assert_eq!(meta_a, meta_b);
        let (c, _) = img.export_png(None).unwrap();
        let (d, _) = img.export_png(Some(&PngExportParams::default())).unwrap();
        prop_assert_eq!(c, d);
    }
}
