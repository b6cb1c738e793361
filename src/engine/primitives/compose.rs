// src/engine/primitives/compose.rs
//
// Primitives that combine images or draw onto them.

use crate::engine::common::EngineResult;
use crate::engine::decoder::check_dimensions;
use crate::engine::native::{
    cast_pixels, dynamic_map, fill_pixel, Buffer, Layout, NativeImage, Sample,
};
use crate::error::ImageRefError;
use crate::ops::{BandFormat, BlendMode, ColorRgba, Direction};
use image::{imageops, DynamicImage, ImageBuffer, Pixel};

fn rank_of(format: BandFormat) -> u8 {
    match format {
        BandFormat::UChar => 0,
        BandFormat::UShort => 1,
        BandFormat::Float => 2,
    }
}

/// The format that can hold samples of both `a` and `b`.
pub(crate) fn wider(a: BandFormat, b: BandFormat) -> BandFormat {
    if rank_of(b) > rank_of(a) {
        b
    } else {
        a
    }
}

/// Smallest layout and format that loses nothing from any input.
fn common_target<'a>(images: impl IntoIterator<Item = &'a NativeImage>) -> (Layout, BandFormat) {
    let mut layout = Layout {
        grey: true,
        alpha: false,
    };
    let mut format = BandFormat::UChar;
    for img in images {
        let l = Layout::of(img);
        layout.grey &= l.grey;
        layout.alpha |= l.alpha;
        format = wider(format, img.band_format());
    }
    (layout, format)
}

fn conform(img: &NativeImage, layout: Layout, format: BandFormat) -> DynamicImage {
    if Layout::of(img) == layout && img.band_format() == format {
        img.pixels().clone()
    } else {
        cast_pixels(img.pixels(), layout, format)
    }
}

fn canvas(template: &DynamicImage, width: u32, height: u32, color: ColorRgba) -> EngineResult<DynamicImage> {
    check_dimensions(width, height)?;
    dynamic_map!(template, |_buf| ImageBuffer::from_pixel(
        width,
        height,
        fill_pixel(color)
    ))
}

/// Interpretation for a result built from several inputs: the first
/// input's, unless the layouts disagree on greyness.
fn result_interpretation(first: &NativeImage, layout: Layout) -> crate::ops::Interpretation {
    use crate::ops::Interpretation;
    if first.interpretation().is_grey() && !layout.grey {
        Interpretation::Srgb
    } else {
        first.interpretation()
    }
}

/// W3C separable blend function on unpremultiplied values.
fn blend_channel(mode: BlendMode, s: f32, d: f32) -> f32 {
    match mode {
        BlendMode::Multiply => s * d,
        BlendMode::Screen => s + d - s * d,
        BlendMode::Darken => s.min(d),
        BlendMode::Lighten => s.max(d),
        BlendMode::Difference => (s - d).abs(),
        BlendMode::Exclusion => s + d - 2.0 * s * d,
        _ => s,
    }
}

fn blend_pixel(mode: BlendMode, src: [f32; 4], dst: [f32; 4]) -> [f32; 4] {
    let (sa, da) = (src[3], dst[3]);
    let mix = |alpha: f32, premultiplied: [f32; 3]| -> [f32; 4] {
        if alpha <= 0.0 {
            return [0.0; 4];
        }
        [
            premultiplied[0] / alpha,
            premultiplied[1] / alpha,
            premultiplied[2] / alpha,
            alpha,
        ]
    };
    let over = |top: [f32; 4], bottom: [f32; 4]| {
        let (ta, ba) = (top[3], bottom[3]);
        let a = ta + ba * (1.0 - ta);
        mix(
            a,
            [0, 1, 2].map(|i| top[i] * ta + bottom[i] * ba * (1.0 - ta)),
        )
    };
    match mode {
        BlendMode::Clear => [0.0; 4],
        BlendMode::Source => src,
        BlendMode::Dest => dst,
        BlendMode::Over => over(src, dst),
        BlendMode::DestOver => over(dst, src),
        BlendMode::Add => {
            let a = (sa + da).min(1.0);
            mix(a, [0, 1, 2].map(|i| (src[i] * sa + dst[i] * da).min(a)))
        }
        _ => {
            let a = sa + da - sa * da;
            mix(
                a,
                [0, 1, 2].map(|i| {
                    sa * da * blend_channel(mode, src[i], dst[i])
                        + sa * (1.0 - da) * src[i]
                        + da * (1.0 - sa) * dst[i]
                }),
            )
        }
    }
}

/// Blend `overlay` onto `base` with its top-left corner at (`x`, `y`).
/// The result has the base's bands plus alpha.
pub(crate) fn composite(
    base: &NativeImage,
    overlay: &NativeImage,
    mode: BlendMode,
    x: i32,
    y: i32,
) -> EngineResult<NativeImage> {
    let mut dst = base.pixels().to_rgba32f();
    let src = overlay.pixels().to_rgba32f();
    let (bw, bh) = (dst.width() as i64, dst.height() as i64);
    for (ox, oy, px) in src.enumerate_pixels() {
        let tx = ox as i64 + x as i64;
        let ty = oy as i64 + y as i64;
        if tx < 0 || ty < 0 || tx >= bw || ty >= bh {
            continue;
        }
        let target = dst.get_pixel_mut(tx as u32, ty as u32);
        target.0 = blend_pixel(mode, px.0, target.0);
    }
    let layout = Layout {
        alpha: true,
        ..Layout::of(base)
    };
    let format = wider(base.band_format(), overlay.band_format());
    let pixels = cast_pixels(&DynamicImage::ImageRgba32F(dst), layout, format);
    Ok(base.derive(pixels))
}

/// Place `sub` inside `main` at (`x`, `y`). With `expand`, the output grows
/// to hold both images and new pixels take `background`.
pub(crate) fn insert(
    main: &NativeImage,
    sub: &NativeImage,
    x: i32,
    y: i32,
    expand: bool,
    background: ColorRgba,
) -> EngineResult<NativeImage> {
    let layout = Layout::of(main);
    let format = main.band_format();
    let sub_pixels = conform(sub, layout, format);
    let (x, y) = (x as i64, y as i64);
    if !expand {
        let mut out = main.pixels().clone();
        imageops::replace(&mut out, &sub_pixels, x, y);
        return Ok(main.derive(out));
    }
    let left = x.min(0);
    let top = y.min(0);
    let right = (main.width() as i64).max(x + sub.width() as i64);
    let bottom = (main.height() as i64).max(y + sub.height() as i64);
    let (width, height) = ((right - left) as u64, (bottom - top) as u64);
    if width > u32::MAX as u64 || height > u32::MAX as u64 {
        return Err(ImageRefError::dimension_exceeds_limit(u32::MAX, crate::engine::MAX_DIMENSION));
    }
    let mut out = canvas(main.pixels(), width as u32, height as u32, background)?;
    imageops::replace(&mut out, main.pixels(), -left, -top);
    imageops::replace(&mut out, &sub_pixels, x - left, y - top);
    Ok(main.derive(out))
}

/// Join two images side by side or one above the other. The shorter edge
/// is padded with black.
pub(crate) fn join(
    first: &NativeImage,
    second: &NativeImage,
    direction: Direction,
) -> EngineResult<NativeImage> {
    let across = match direction {
        Direction::Horizontal => 2,
        Direction::Vertical => 1,
    };
    array_join(&[first, second], across)
}

/// Lay images out on a grid `across` cells wide, filling rows first. Every
/// cell is the size of the largest input; images sit at a cell's top-left.
pub(crate) fn array_join(images: &[&NativeImage], across: u32) -> EngineResult<NativeImage> {
    let first = images
        .first()
        .ok_or_else(|| ImageRefError::invalid_argument("array_join", "0 images", "need at least one image"))?;
    if across == 0 {
        return Err(ImageRefError::invalid_argument(
            "across",
            "0",
            "must be at least 1",
        ));
    }
    let (layout, format) = common_target(images.iter().copied());
    let cell_w = images.iter().map(|i| i.width()).max().unwrap_or(0);
    let cell_h = images.iter().map(|i| i.height()).max().unwrap_or(0);
    let count = images.len() as u32;
    let columns = across.min(count);
    let rows = count.div_ceil(across);
    let (width, height) = (cell_w as u64 * columns as u64, cell_h as u64 * rows as u64);
    if width > u32::MAX as u64 || height > u32::MAX as u64 {
        return Err(ImageRefError::dimension_exceeds_limit(u32::MAX, crate::engine::MAX_DIMENSION));
    }
    let template = conform(first, layout, format);
    let mut out = canvas(&template, width as u32, height as u32, ColorRgba::default())?;
    for (i, img) in images.iter().enumerate() {
        let i = i as u32;
        let x = (i % across) * cell_w;
        let y = (i / across) * cell_h;
        imageops::replace(&mut out, &conform(img, layout, format), x as i64, y as i64);
    }
    let interpretation = result_interpretation(first, layout);
    Ok(first
        .derive(out)
        .with_page_height(height as u32)
        .with_interpretation(interpretation))
}

fn draw_rect_buf<P>(
    buf: &Buffer<P>,
    ink: P,
    left: i64,
    top: i64,
    width: i64,
    height: i64,
    fill: bool,
) -> Buffer<P>
where
    P: Pixel,
    P::Subpixel: Sample,
{
    let mut out = buf.clone();
    let (w, h) = (out.width() as i64, out.height() as i64);
    let x0 = left.max(0);
    let y0 = top.max(0);
    let x1 = (left + width).min(w);
    let y1 = (top + height).min(h);
    for y in y0..y1 {
        for x in x0..x1 {
            let edge = x == left || y == top || x == left + width - 1 || y == top + height - 1;
            if fill || edge {
                out.put_pixel(x as u32, y as u32, ink);
            }
        }
    }
    out
}

/// Draw a rectangle, clipped to the image. Without `fill`, only the
/// one-pixel outline is painted.
pub(crate) fn draw_rect(
    img: &NativeImage,
    ink: ColorRgba,
    left: i32,
    top: i32,
    width: u32,
    height: u32,
    fill: bool,
) -> EngineResult<NativeImage> {
    if width == 0 || height == 0 {
        return Err(ImageRefError::invalid_argument(
            "draw_rect size",
            format!("{width}x{height}"),
            "rectangle must be at least 1x1",
        ));
    }
    let (left, top, width, height) = (left as i64, top as i64, width as i64, height as i64);
    let pixels = dynamic_map!(img.pixels(), |buf| draw_rect_buf(
        buf,
        fill_pixel(ink),
        left,
        top,
        width,
        height,
        fill
    ))?;
    Ok(img.derive(pixels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    fn rgb(w: u32, h: u32, c: [u8; 3]) -> NativeImage {
        NativeImage::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb(c))))
    }

    fn rgba(w: u32, h: u32, c: [u8; 4]) -> NativeImage {
        NativeImage::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(w, h, Rgba(c))))
    }

    #[test]
    fn composite_over_opaque() {
        let base = rgb(4, 4, [0, 0, 255]);
        let overlay = rgba(2, 2, [255, 0, 0, 255]);
        let out = composite(&base, &overlay, BlendMode::Over, 1, 1).unwrap();
        assert!(out.has_alpha());
        let px = out.pixels().to_rgba8();
        assert_eq!(px.get_pixel(0, 0).0, [0, 0, 255, 255]);
        assert_eq!(px.get_pixel(1, 1).0, [255, 0, 0, 255]);
        assert_eq!(px.get_pixel(3, 3).0, [0, 0, 255, 255]);
    }

    #[test]
    fn composite_half_transparent_and_multiply() {
        let base = rgb(1, 1, [0, 0, 0]);
        let overlay = rgba(1, 1, [255, 255, 255, 128]);
        let out = composite(&base, &overlay, BlendMode::Over, 0, 0).unwrap();
        let [r, _, _, a] = out.pixels().to_rgba8().get_pixel(0, 0).0;
        assert!((r as i32 - 128).abs() <= 1);
        assert_eq!(a, 255);

        let base = rgb(1, 1, [200, 100, 50]);
        let overlay = rgba(1, 1, [128, 255, 0, 255]);
        let out = composite(&base, &overlay, BlendMode::Multiply, 0, 0).unwrap();
        let [r, g, b, _] = out.pixels().to_rgba8().get_pixel(0, 0).0;
        assert!((r as i32 - 100).abs() <= 1);
        assert_eq!(g, 100);
        assert_eq!(b, 0);
    }

    #[test]
    fn insert_with_and_without_expand() {
        let main = rgb(4, 4, [10, 10, 10]);
        let sub = rgb(2, 2, [200, 200, 200]);
        let inside = insert(&main, &sub, 1, 1, false, ColorRgba::default()).unwrap();
        assert_eq!(inside.pixels().dimensions(), (4, 4));
        assert_eq!(inside.pixels().to_rgb8().get_pixel(2, 2).0, [200, 200, 200]);

        let grown = insert(
            &main,
            &sub,
            3,
            -1,
            true,
            ColorRgba {
                r: 0,
                g: 255,
                b: 0,
                a: 255,
            },
        )
        .unwrap();
        assert_eq!(grown.pixels().dimensions(), (5, 5));
        let px = grown.pixels().to_rgb8();
        assert_eq!(px.get_pixel(0, 0).0, [0, 255, 0]);
        assert_eq!(px.get_pixel(0, 1).0, [10, 10, 10]);
        assert_eq!(px.get_pixel(4, 0).0, [200, 200, 200]);
    }

    #[test]
    fn join_pads_and_promotes() {
        let grey = NativeImage::new(DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 3, Luma([50]))));
        let colour = rgb(3, 2, [1, 2, 3]);
        let h = join(&grey, &colour, Direction::Horizontal).unwrap();
        assert_eq!(h.pixels().dimensions(), (6, 3));
        assert_eq!(h.bands(), 3);
        let v = join(&grey, &colour, Direction::Vertical).unwrap();
        assert_eq!(v.pixels().dimensions(), (3, 6));
        assert_eq!(v.pixels().to_rgb8().get_pixel(0, 3).0, [1, 2, 3]);
    }

    #[test]
    fn array_join_wraps_rows() {
        let tiles: Vec<NativeImage> = (0..5).map(|i| rgb(2, 2, [i * 10, 0, 0])).collect();
        let refs: Vec<&NativeImage> = tiles.iter().collect();
        let out = array_join(&refs, 2).unwrap();
        assert_eq!(out.pixels().dimensions(), (4, 6));
        let px = out.pixels().to_rgb8();
        assert_eq!(px.get_pixel(2, 0).0[0], 10);
        assert_eq!(px.get_pixel(0, 4).0[0], 40);
        assert_eq!(px.get_pixel(3, 5).0, [0, 0, 0]);
        assert!(array_join(&[], 2).is_err());
    }

    #[test]
    fn draw_rect_outline_and_fill() {
        let img = rgb(5, 5, [0, 0, 0]);
        let ink = ColorRgba {
            r: 255,
            g: 255,
            b: 255,
            a: 255,
        };
        let outline = draw_rect(&img, ink, 1, 1, 3, 3, false).unwrap();
        let px = outline.pixels().to_rgb8();
        assert_eq!(px.get_pixel(1, 1).0, [255, 255, 255]);
        assert_eq!(px.get_pixel(2, 2).0, [0, 0, 0]);
        let filled = draw_rect(&img, ink, 3, 3, 10, 10, true).unwrap();
        let px = filled.pixels().to_rgb8();
        assert_eq!(px.get_pixel(4, 4).0, [255, 255, 255]);
        assert_eq!(px.get_pixel(2, 2).0, [0, 0, 0]);
        assert_eq!(img.pixels().to_rgb8().get_pixel(4, 4).0, [0, 0, 0]);
    }
}
