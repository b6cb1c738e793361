// src/engine/primitives/bands.rs
//
// Band-level primitives: extracting and joining bands, arithmetic between
// two images, lookup tables and trim detection.
//
// Samples are read scaled to 0..1 of their format's full range, so images
// of different formats combine without rescaling by hand.

use crate::engine::common::EngineResult;
use crate::engine::native::{cast_pixels, Layout, NativeImage};
use crate::engine::primitives::compose::wider;
use crate::error::ImageRefError;
use crate::ops::{BandFormat, Color, Interpretation};
use image::{DynamicImage, Rgb32FImage, Rgba32FImage};
use rayon::prelude::*;

/// Full-range value of one sample in `format`.
fn full(format: BandFormat) -> f32 {
    match format {
        BandFormat::UChar => 255.0,
        BandFormat::UShort => 65535.0,
        BandFormat::Float => 1.0,
    }
}

/// Interleaved logical bands of an image: `bands` samples per pixel.
struct Bands {
    width: u32,
    height: u32,
    bands: usize,
    data: Vec<f32>,
}

impl Bands {
    fn of(img: &NativeImage) -> Self {
        let bands = img.bands() as usize;
        let grey = Layout::of(img).grey;
        let rgba = img.pixels().to_rgba32f();
        let mut data = Vec::with_capacity(img.width() as usize * img.height() as usize * bands);
        for px in rgba.pixels() {
            let [r, g, b, a] = px.0;
            match (grey, bands) {
                (true, 1) => data.push(r),
                (true, _) => data.extend([r, a]),
                (false, 3) => data.extend([r, g, b]),
                _ => data.extend([r, g, b, a]),
            }
        }
        Self {
            width: img.width(),
            height: img.height(),
            bands,
            data,
        }
    }

    fn pixel(&self, i: usize) -> &[f32] {
        &self.data[i * self.bands..(i + 1) * self.bands]
    }

    fn len(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Pixels in `format`. One or two bands are stored grey, two and four
    /// carry the last band as alpha.
    fn into_pixels(self, format: BandFormat) -> EngineResult<DynamicImage> {
        let Bands {
            width,
            height,
            bands,
            data,
        } = self;
        let short = || ImageRefError::operation_failed("bands", "band buffer does not match size");
        let float = match bands {
            1 => {
                let rgb = data.iter().flat_map(|&v| [v, v, v]).collect();
                DynamicImage::ImageRgb32F(Rgb32FImage::from_raw(width, height, rgb).ok_or_else(short)?)
            }
            2 => {
                let rgba = data.chunks_exact(2).flat_map(|p| [p[0], p[0], p[0], p[1]]).collect();
                DynamicImage::ImageRgba32F(Rgba32FImage::from_raw(width, height, rgba).ok_or_else(short)?)
            }
            3 => DynamicImage::ImageRgb32F(Rgb32FImage::from_raw(width, height, data).ok_or_else(short)?),
            4 => DynamicImage::ImageRgba32F(Rgba32FImage::from_raw(width, height, data).ok_or_else(short)?),
            n => return Err(too_many_bands(n)),
        };
        let layout = Layout {
            grey: bands <= 2,
            alpha: bands % 2 == 0,
        };
        Ok(cast_pixels(&float, layout, format))
    }
}

fn too_many_bands(bands: usize) -> ImageRefError {
    ImageRefError::invalid_argument("bands", bands.to_string(), "images hold 1 to 4 bands")
}

/// Interpretation for a result with `bands` bands in `format`, derived
/// from the image it was built from.
fn interpretation_for(bands: usize, format: BandFormat, like: &NativeImage) -> Interpretation {
    match (bands, format) {
        (1 | 2, BandFormat::UShort) => Interpretation::Grey16,
        (1 | 2, _) => Interpretation::BW,
        _ if like.bands() < 3 => Interpretation::Multiband,
        (_, BandFormat::UShort) if like.interpretation() == Interpretation::Srgb => {
            Interpretation::Rgb16
        }
        (_, BandFormat::UChar) if like.interpretation() == Interpretation::Rgb16 => {
            Interpretation::Srgb
        }
        _ => like.interpretation(),
    }
}

fn build(
    like: &NativeImage,
    bands: Bands,
    format: BandFormat,
) -> EngineResult<NativeImage> {
    let count = bands.bands;
    let pixels = bands.into_pixels(format)?;
    Ok(like
        .derive(pixels)
        .with_interpretation(interpretation_for(count, format, like)))
}

/// Keep `n` bands starting at `band`.
pub(crate) fn extract_band(img: &NativeImage, band: u32, n: u32) -> EngineResult<NativeImage> {
    let bands = img.bands();
    if n == 0 || band.saturating_add(n) > bands {
        return Err(ImageRefError::invalid_argument(
            "extract_band",
            format!("band {band}, n {n}"),
            format!("image has {bands} band(s)"),
        ));
    }
    let src = Bands::of(img);
    let (start, n) = (band as usize, n as usize);
    let data = (0..src.len())
        .flat_map(|i| src.pixel(i)[start..start + n].to_vec())
        .collect();
    let out = Bands {
        width: src.width,
        height: src.height,
        bands: n,
        data,
    };
    build(img, out, img.band_format())
}

/// Append the bands of `others`, in order. Every image must have the same
/// size; the result takes the widest band format.
pub(crate) fn band_join(img: &NativeImage, others: &[&NativeImage]) -> EngineResult<NativeImage> {
    let total: u32 = img.bands() + others.iter().map(|o| o.bands()).sum::<u32>();
    if total > 4 {
        return Err(too_many_bands(total as usize));
    }
    let mut format = img.band_format();
    for other in others {
        same_size(img, other)?;
        format = wider(format, other.band_format());
    }
    let mut sources = vec![Bands::of(img)];
    sources.extend(others.iter().map(|o| Bands::of(o)));
    let pixels = sources[0].len();
    let mut data = Vec::with_capacity(pixels * total as usize);
    for i in 0..pixels {
        for source in &sources {
            data.extend_from_slice(source.pixel(i));
        }
    }
    let out = Bands {
        width: img.width(),
        height: img.height(),
        bands: total as usize,
        data,
    };
    build(img, out, format)
}

/// Append constant bands. Constants are in the image's sample units
/// (0-255 for 8-bit, 0-65535 for 16-bit, 0-1 for float).
pub(crate) fn band_join_const(img: &NativeImage, constants: &[f64]) -> EngineResult<NativeImage> {
    if constants.is_empty() {
        return Err(ImageRefError::invalid_argument(
            "band_join_const",
            "0 constants",
            "need at least one constant",
        ));
    }
    let total = img.bands() as usize + constants.len();
    if total > 4 {
        return Err(too_many_bands(total));
    }
    let format = img.band_format();
    let extra: Vec<f32> = constants
        .iter()
        .map(|&c| c as f32 / full(format))
        .collect();
    let src = Bands::of(img);
    let mut data = Vec::with_capacity(src.len() * total);
    for i in 0..src.len() {
        data.extend_from_slice(src.pixel(i));
        data.extend_from_slice(&extra);
    }
    let out = Bands {
        width: src.width,
        height: src.height,
        bands: total,
        data,
    };
    build(img, out, format)
}

fn same_size(a: &NativeImage, b: &NativeImage) -> EngineResult<()> {
    if (a.width(), a.height()) == (b.width(), b.height()) {
        return Ok(());
    }
    Err(ImageRefError::invalid_argument(
        "image size",
        format!("{}x{}", b.width(), b.height()),
        format!("must match {}x{}", a.width(), a.height()),
    ))
}

/// Per-pixel arithmetic between two images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Arithmetic {
    Add,
    Multiply,
    Divide,
}

impl Arithmetic {
    fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
        }
    }

    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            Self::Add => a + b,
            Self::Multiply => a * b,
            // x / 0 is 0
            Self::Divide if b == 0.0 => 0.0,
            Self::Divide => a / b,
        }
    }
}

/// `left op right`, band by band on samples scaled to 0..1. A one-band
/// operand is applied to every band of the other. Add and multiply keep the
/// wider input format and saturate integer results; divide always gives
/// float.
pub(crate) fn arithmetic(
    left: &NativeImage,
    right: &NativeImage,
    op: Arithmetic,
) -> EngineResult<NativeImage> {
    same_size(left, right)?;
    let (a, b) = (Bands::of(left), Bands::of(right));
    let bands = match (a.bands, b.bands) {
        (x, y) if x == y => x,
        (1, y) => y,
        (x, 1) => x,
        (x, y) => {
            return Err(ImageRefError::invalid_argument(
                op.name(),
                format!("{x} and {y} bands"),
                "band counts must match, or one image must have one band",
            ))
        }
    };
    let pick = |src: &Bands, i: usize, band: usize| {
        let px = src.pixel(i);
        if px.len() == 1 {
            px[0]
        } else {
            px[band]
        }
    };
    let data: Vec<f32> = (0..a.len())
        .into_par_iter()
        .flat_map_iter(|i| {
            let (a, b) = (&a, &b);
            (0..bands).map(move |band| op.apply(pick(a, i, band), pick(b, i, band)))
        })
        .collect();
    let format = match op {
        Arithmetic::Divide => BandFormat::Float,
        _ => wider(left.band_format(), right.band_format()),
    };
    let like = if a.bands >= b.bands { left } else { right };
    let out = Bands {
        width: a.width,
        height: a.height,
        bands,
        data,
    };
    let mut result = build(like, out, format)?;
    result.page_height = left.page_height;
    Ok(result)
}

/// Map every sample through `lut`, read as a flat table in row-major
/// order. The image must be 8 or 16-bit; its sample value picks the entry,
/// clamped to the table length. A one-band table applies to every band; a
/// one-band image takes every band of the table. The result has the
/// table's band format.
pub(crate) fn maplut(img: &NativeImage, lut: &NativeImage) -> EngineResult<NativeImage> {
    let format = img.band_format();
    if format == BandFormat::Float {
        return Err(ImageRefError::invalid_argument(
            "maplut",
            "float",
            "lookup needs 8 or 16-bit samples",
        ));
    }
    let (src, table) = (Bands::of(img), Bands::of(lut));
    let bands = match (src.bands, table.bands) {
        (x, y) if x == y => x,
        (x, 1) => x,
        (1, y) => y,
        (x, y) => {
            return Err(ImageRefError::invalid_argument(
                "maplut",
                format!("{x} image bands, {y} table bands"),
                "band counts must match, or one side must have one band",
            ))
        }
    };
    let entries = table.len();
    let scale = full(format);
    let data: Vec<f32> = (0..src.len())
        .flat_map(|i| {
            let (src, table) = (&src, &table);
            (0..bands).map(move |band| {
                let px = src.pixel(i);
                let value = if px.len() == 1 { px[0] } else { px[band] };
                let index = ((value * scale).round().max(0.0) as usize).min(entries - 1);
                let entry = table.pixel(index);
                if entry.len() == 1 {
                    entry[0]
                } else {
                    entry[band]
                }
            })
        })
        .collect();
    let out = Bands {
        width: src.width,
        height: src.height,
        bands,
        data,
    };
    build(img, out, lut.band_format())
}

/// A `size` x 1 table whose entries equal their index: 256 entries of
/// 8-bit, or 65536 of 16-bit with `ushort`.
pub(crate) fn identity(ushort: bool) -> NativeImage {
    use image::{GrayImage, ImageBuffer, Luma};
    if ushort {
        let buf: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(65536, 1, |x, _| Luma([x as u16]));
        NativeImage::new(DynamicImage::ImageLuma16(buf))
    } else {
        NativeImage::new(DynamicImage::ImageLuma8(GrayImage::from_fn(256, 1, |x, _| {
            Luma([x as u8])
        })))
    }
}

/// A two-band, 16-bit image whose first band is the x coordinate and second
/// the y coordinate of each pixel.
pub(crate) fn xyz(width: u32, height: u32) -> EngineResult<NativeImage> {
    use image::{ImageBuffer, LumaA};
    if width == 0 || height == 0 || width > 65536 || height > 65536 {
        return Err(ImageRefError::invalid_argument(
            "xyz size",
            format!("{width}x{height}"),
            "coordinates must fit 16 bits",
        ));
    }
    crate::engine::decoder::check_dimensions(width, height)?;
    let buf: ImageBuffer<LumaA<u16>, Vec<u16>> =
        ImageBuffer::from_fn(width, height, |x, y| LumaA([x as u16, y as u16]));
    Ok(NativeImage::new(DynamicImage::ImageLumaA16(buf)).with_interpretation(Interpretation::Multiband))
}

/// Bounding box `(left, top, width, height)` of everything that differs
/// from `background` by more than `threshold` (on a 0-255 scale) in any
/// band. Alpha is flattened onto the background first and a 3x3 median
/// drops isolated noise pixels. An image that is all background gives a
/// zero-sized box.
pub(crate) fn find_trim(
    img: &NativeImage,
    threshold: f64,
    background: Color,
) -> EngineResult<(u32, u32, u32, u32)> {
    if !threshold.is_finite() || threshold < 0.0 {
        return Err(ImageRefError::invalid_argument(
            "threshold",
            threshold.to_string(),
            "must be a non-negative number",
        ));
    }
    let src = Bands::of(img);
    let layout = Layout::of(img);
    let bg = [background.r, background.g, background.b].map(|v| v as f32 / 255.0);
    let bg_luma = 0.2126 * bg[0] + 0.7152 * bg[1] + 0.0722 * bg[2];
    let colour_bands = if layout.grey { 1 } else { 3 };
    let limit = threshold as f32 / 255.0;
    let (w, h) = (src.width as usize, src.height as usize);

    let mask: Vec<bool> = (0..src.len())
        .map(|i| {
            let px = src.pixel(i);
            let alpha = if layout.alpha { px[px.len() - 1] } else { 1.0 };
            (0..colour_bands).any(|band| {
                let target = if layout.grey { bg_luma } else { bg[band] };
                let value = px[band] * alpha + target * (1.0 - alpha);
                (value - target).abs() > limit
            })
        })
        .collect();

    let at = |x: i64, y: i64| {
        let x = x.clamp(0, w as i64 - 1) as usize;
        let y = y.clamp(0, h as i64 - 1) as usize;
        mask[y * w + x]
    };
    let (mut left, mut top, mut right, mut bottom) = (w, h, 0usize, 0usize);
    for y in 0..h {
        for x in 0..w {
            let set = (-1..=1)
                .flat_map(|dy| (-1..=1).map(move |dx| (dx, dy)))
                .filter(|&(dx, dy)| at(x as i64 + dx, y as i64 + dy))
                .count();
            if set >= 5 {
                left = left.min(x);
                top = top.min(y);
                right = right.max(x + 1);
                bottom = bottom.max(y + 1);
            }
        }
    }
    if right <= left || bottom <= top {
        return Ok((0, 0, 0, 0));
    }
    Ok((
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    fn solid(r: u8, g: u8, b: u8) -> NativeImage {
        NativeImage::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 3, Rgb([r, g, b]))))
    }

    fn grey(v: u8) -> NativeImage {
        NativeImage::new(DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 3, Luma([v]))))
    }

    #[test]
    fn extract_band_picks_one_channel() {
        let img = solid(10, 20, 30);
        let green = extract_band(&img, 1, 1).unwrap();
        assert_eq!(green.bands(), 1);
        assert_eq!(green.interpretation(), Interpretation::BW);
        assert_eq!(green.pixels().to_luma8().get_pixel(0, 0).0, [20]);

        let rgba = NativeImage::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            2,
            2,
            Rgba([1, 2, 3, 4]),
        )));
        let colour = extract_band(&rgba, 0, 3).unwrap();
        assert_eq!(colour.bands(), 3);
        assert!(!colour.has_alpha());
        assert_eq!(colour.interpretation(), Interpretation::Srgb);
        assert!(extract_band(&img, 2, 2).is_err());
        assert!(extract_band(&img, 0, 0).is_err());
    }

    #[test]
    fn band_join_appends_in_order() {
        let joined = band_join(&grey(7), &[&grey(9)]).unwrap();
        assert_eq!(joined.bands(), 2);
        assert_eq!(joined.pixels().to_luma_alpha8().get_pixel(3, 2).0, [7, 9]);

        let rgba = band_join(&solid(1, 2, 3), &[&grey(200)]).unwrap();
        assert_eq!(rgba.bands(), 4);
        assert_eq!(rgba.pixels().to_rgba8().get_pixel(0, 0).0, [1, 2, 3, 200]);

        assert!(band_join(&solid(1, 2, 3), &[&solid(1, 2, 3)]).is_err());
        let small = NativeImage::new(DynamicImage::ImageLuma8(GrayImage::new(2, 2)));
        assert!(band_join(&grey(1), &[&small]).is_err());
    }

    #[test]
    fn band_join_takes_widest_format() {
        let wide = NativeImage::new(DynamicImage::ImageLuma16(image::ImageBuffer::from_pixel(
            4,
            3,
            Luma([65535u16]),
        )));
        let joined = band_join(&grey(255), &[&wide]).unwrap();
        assert_eq!(joined.band_format(), BandFormat::UShort);
        assert_eq!(joined.interpretation(), Interpretation::Grey16);
    }

    #[test]
    fn band_join_const_uses_sample_units() {
        let out = band_join_const(&solid(10, 20, 30), &[128.0]).unwrap();
        assert_eq!(out.pixels().to_rgba8().get_pixel(1, 1).0, [10, 20, 30, 128]);
        assert!(band_join_const(&solid(1, 1, 1), &[1.0, 2.0]).is_err());
        assert!(band_join_const(&grey(1), &[]).is_err());
    }

    #[test]
    fn add_saturates_and_multiply_scales() {
        let sum = arithmetic(&solid(200, 100, 0), &solid(100, 100, 10), Arithmetic::Add).unwrap();
        assert_eq!(sum.pixels().to_rgb8().get_pixel(0, 0).0, [255, 200, 10]);

        let product = arithmetic(&solid(255, 128, 40), &grey(128), Arithmetic::Multiply).unwrap();
        assert_eq!(product.bands(), 3);
        let px = product.pixels().to_rgb8().get_pixel(0, 0).0;
        assert_eq!(px[0], 128);
        assert!((px[1] as i32 - 64).abs() <= 1, "{px:?}");
    }

    #[test]
    fn divide_gives_float_and_zero_for_zero() {
        let q = arithmetic(&grey(100), &grey(200), Arithmetic::Divide).unwrap();
        assert_eq!(q.band_format(), BandFormat::Float);
        assert_eq!(q.bands(), 1);
        let v = q.pixels().to_rgb32f().get_pixel(0, 0).0[0];
        assert!((v - 0.5).abs() < 1e-6);

        let by_zero = arithmetic(&grey(100), &grey(0), Arithmetic::Divide).unwrap();
        assert_eq!(by_zero.pixels().to_rgb32f().get_pixel(0, 0).0[0], 0.0);
    }

    #[test]
    fn arithmetic_checks_shapes() {
        let rgba = NativeImage::new(DynamicImage::ImageRgba8(RgbaImage::new(4, 3)));
        assert!(arithmetic(&solid(1, 1, 1), &rgba, Arithmetic::Add).is_err());
        let small = NativeImage::new(DynamicImage::ImageLuma8(GrayImage::new(2, 2)));
        assert!(arithmetic(&grey(1), &small, Arithmetic::Multiply).is_err());
    }

    #[test]
    fn identity_tables() {
        let lut = identity(false);
        assert_eq!((lut.width(), lut.height()), (256, 1));
        assert_eq!(lut.pixels().to_luma8().get_pixel(200, 0).0, [200]);
        let wide = identity(true);
        assert_eq!(wide.width(), 65536);
        assert_eq!(wide.band_format(), BandFormat::UShort);
    }

    #[test]
    fn maplut_with_identity_is_a_no_op() {
        let img = solid(10, 120, 250);
        let out = maplut(&img, &identity(false)).unwrap();
        assert_eq!(out.pixels().to_rgb8().get_pixel(2, 1).0, [10, 120, 250]);
        assert_eq!(out.band_format(), BandFormat::UChar);
    }

    #[test]
    fn maplut_inverts_through_table() {
        let table = NativeImage::new(DynamicImage::ImageLuma8(GrayImage::from_fn(256, 1, |x, _| {
            Luma([255 - x as u8])
        })));
        let out = maplut(&solid(0, 100, 255), &table).unwrap();
        assert_eq!(out.pixels().to_rgb8().get_pixel(0, 0).0, [255, 155, 0]);

        // one-band image through a three-band table
        let colour = NativeImage::new(DynamicImage::ImageRgb8(RgbImage::from_fn(256, 1, |x, _| {
            Rgb([x as u8, 0, 255 - x as u8])
        })));
        let tinted = maplut(&grey(40), &colour).unwrap();
        assert_eq!(tinted.bands(), 3);
        assert_eq!(tinted.pixels().to_rgb8().get_pixel(0, 0).0, [40, 0, 215]);

        let float = NativeImage::new(DynamicImage::ImageRgb32F(Rgb32FImage::new(2, 2)));
        assert!(maplut(&float, &table).is_err());
    }

    #[test]
    fn xyz_holds_coordinates() {
        let img = xyz(300, 5).unwrap();
        assert_eq!(img.bands(), 2);
        assert_eq!(img.interpretation(), Interpretation::Multiband);
        assert_eq!(img.pixels().to_luma_alpha16().get_pixel(299, 4).0, [299, 4]);
        assert!(xyz(0, 5).is_err());
        assert!(xyz(70000, 1).is_err());
    }

    #[test]
    fn find_trim_boxes_content() {
        let mut buf = RgbImage::from_pixel(20, 10, Rgb([255, 255, 255]));
        for y in 2..6 {
            for x in 5..12 {
                buf.put_pixel(x, y, Rgb([0, 0, 0]));
            }
        }
        // isolated speck is noise
        buf.put_pixel(18, 9, Rgb([0, 0, 0]));
        let img = NativeImage::new(DynamicImage::ImageRgb8(buf));
        let white = Color { r: 255, g: 255, b: 255 };
        assert_eq!(find_trim(&img, 10.0, white).unwrap(), (5, 2, 7, 4));
    }

    #[test]
    fn find_trim_of_plain_background_is_empty() {
        let img = solid(250, 250, 250);
        let white = Color { r: 255, g: 255, b: 255 };
        assert_eq!(find_trim(&img, 10.0, white).unwrap(), (0, 0, 0, 0));
        assert_eq!(find_trim(&img, 2.0, white).unwrap(), (0, 0, 4, 3));
        assert!(find_trim(&img, -1.0, white).is_err());
    }

    #[test]
    fn find_trim_flattens_transparent_pixels() {
        let mut buf = RgbaImage::from_pixel(6, 6, Rgba([0, 0, 0, 0]));
        for y in 1..4 {
            for x in 1..4 {
                buf.put_pixel(x, y, Rgba([255, 0, 0, 255]));
            }
        }
        let img = NativeImage::new(DynamicImage::ImageRgba8(buf));
        let white = Color { r: 255, g: 255, b: 255 };
        assert_eq!(find_trim(&img, 10.0, white).unwrap(), (1, 1, 3, 3));
    }
}
