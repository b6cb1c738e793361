// src/engine/primitives/geometry.rs
//
// Geometry primitives: resampling, cropping, embedding, rotation and tiling.

use super::map_frames;
use crate::engine::common::EngineResult;
use crate::engine::decoder::check_dimensions;
use crate::engine::native::{
    blank_like, cast_pixels, dynamic_map, fill_pixel, Layout, NativeImage,
};
use crate::engine::resample::{resize_exact, scaled};
use crate::error::ImageRefError;
use crate::ops::{Angle, ColorRgba, Direction, ExtendStrategy, Interesting, Kernel, Size};
use image::{imageops, DynamicImage, GenericImageView, ImageBuffer, Rgba, Rgba32FImage};

fn check_scale(name: &'static str, value: f64) -> EngineResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ImageRefError::invalid_argument(
            name,
            value.to_string(),
            "scale must be a positive finite number",
        ));
    }
    Ok(())
}

/// Scale by `hscale` horizontally and `vscale` vertically. A non-positive
/// `vscale` means "same as horizontal".
///
/// Multi-page images are resampled page by page, so the page height stays
/// a divisor of the height.
pub(crate) fn resize(
    img: &NativeImage,
    hscale: f64,
    vscale: f64,
    kernel: Kernel,
) -> EngineResult<NativeImage> {
    check_scale("hscale", hscale)?;
    let vscale = if vscale > 0.0 { vscale } else { hscale };
    check_scale("vscale", vscale)?;
    map_frames(img, |frame| {
        let (w, h) = frame.dimensions();
        resize_exact(frame, scaled(w, hscale), scaled(h, vscale), kernel)
    })
}

/// Resample to an exact size. Multi-page images get `height` per page.
pub(crate) fn resize_to(
    img: &NativeImage,
    width: u32,
    height: u32,
    kernel: Kernel,
) -> EngineResult<NativeImage> {
    map_frames(img, |frame| resize_exact(frame, width, height, kernel))
}

fn check_area(
    frame_width: u32,
    frame_height: u32,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
) -> EngineResult<()> {
    let fits = width > 0
        && height > 0
        && left.checked_add(width).is_some_and(|r| r <= frame_width)
        && top.checked_add(height).is_some_and(|b| b <= frame_height);
    if fits {
        Ok(())
    } else {
        Err(ImageRefError::invalid_area(
            left,
            top,
            width,
            height,
            frame_width,
            frame_height,
        ))
    }
}

/// Crop every page to the same area.
pub(crate) fn extract_area(
    img: &NativeImage,
    left: u32,
    top: u32,
    width: u32,
    height: u32,
) -> EngineResult<NativeImage> {
    let frame_height = if img.is_multi_page() {
        img.page_height()
    } else {
        img.height()
    };
    check_area(img.width(), frame_height, left, top, width, height)?;
    map_frames(img, |frame| Ok(frame.crop_imm(left, top, width, height)))
}

fn mirror(coord: i64, size: i64) -> u32 {
    let period = size * 2;
    let m = coord.rem_euclid(period);
    (if m >= size { period - 1 - m } else { m }) as u32
}

/// Place every page on a `width` x `height` canvas at (`left`, `top`) and
/// generate the uncovered pixels with `extend`.
pub(crate) fn embed(
    img: &NativeImage,
    left: i32,
    top: i32,
    width: u32,
    height: u32,
    extend: ExtendStrategy,
) -> EngineResult<NativeImage> {
    if width == 0 || height == 0 {
        return Err(ImageRefError::invalid_argument(
            "embed size",
            format!("{width}x{height}"),
            "canvas must be at least 1x1",
        ));
    }
    let pages = img.pages() as u64;
    if (height as u64) * pages > crate::engine::MAX_DIMENSION as u64 {
        return Err(ImageRefError::dimension_exceeds_limit(
            ((height as u64) * pages).min(u32::MAX as u64) as u32,
            crate::engine::MAX_DIMENSION,
        ));
    }
    check_dimensions(width, height)?;
    let fill = match extend {
        ExtendStrategy::Black => Some(ColorRgba::default()),
        ExtendStrategy::White => Some(ColorRgba {
            r: 255,
            g: 255,
            b: 255,
            a: 255,
        }),
        ExtendStrategy::Background(color) => Some(color),
        ExtendStrategy::Copy | ExtendStrategy::Repeat | ExtendStrategy::Mirror => None,
    };
    let (left, top) = (left as i64, top as i64);
    map_frames(img, |frame| {
        let (fw, fh) = (frame.width() as i64, frame.height() as i64);
        match fill {
            Some(color) => dynamic_map!(frame, |buf| {
                let mut out = ImageBuffer::from_pixel(width, height, fill_pixel(color));
                imageops::replace(&mut out, buf, left, top);
                out
            }),
            None => {
                let map = |x: u32, y: u32| -> (u32, u32) {
                    let sx = x as i64 - left;
                    let sy = y as i64 - top;
                    match extend {
                        ExtendStrategy::Repeat => {
                            (sx.rem_euclid(fw) as u32, sy.rem_euclid(fh) as u32)
                        }
                        ExtendStrategy::Mirror => (mirror(sx, fw), mirror(sy, fh)),
                        _ => (sx.clamp(0, fw - 1) as u32, sy.clamp(0, fh - 1) as u32),
                    }
                };
                dynamic_map!(frame, |buf| ImageBuffer::from_fn(width, height, |x, y| {
                    let (sx, sy) = map(x, y);
                    *buf.get_pixel(sx, sy)
                }))
            }
        }
    })
}

/// Rotate by a multiple of 90 degrees. Multi-page reshaping is the
/// caller's job; this rotates the whole pixel grid.
pub(crate) fn rotate(img: &NativeImage, angle: Angle) -> EngineResult<NativeImage> {
    let pixels = img.pixels();
    Ok(match angle {
        Angle::D0 => img.derive(pixels.clone()),
        Angle::D90 => img.derive(pixels.rotate90()),
        Angle::D180 => img.derive(pixels.rotate180()),
        Angle::D270 => img.derive(pixels.rotate270()),
    })
}

/// Rotate each page by 180 degrees in place, keeping page order.
pub(crate) fn rotate_pages_180(img: &NativeImage) -> EngineResult<NativeImage> {
    map_frames(img, |frame| Ok(frame.rotate180()))
}

pub(crate) fn flip(img: &NativeImage, direction: Direction) -> EngineResult<NativeImage> {
    let pixels = img.pixels();
    Ok(img.derive(match direction {
        Direction::Horizontal => pixels.fliph(),
        Direction::Vertical => pixels.flipv(),
    }))
}

/// Undo the EXIF orientation and mark the result upright.
pub(crate) fn auto_rotate(img: &NativeImage) -> EngineResult<NativeImage> {
    let mut pixels = img.pixels().clone();
    if let Some(orientation) = img
        .orientation()
        .and_then(|o| u8::try_from(o).ok())
        .and_then(image::metadata::Orientation::from_exif)
    {
        pixels.apply_orientation(orientation);
    }
    let mut out = img.derive(pixels);
    out.orientation = Some(1);
    Ok(out)
}

/// Integer nearest-neighbour enlargement.
pub(crate) fn zoom(img: &NativeImage, xfac: u32, yfac: u32) -> EngineResult<NativeImage> {
    if xfac == 0 || yfac == 0 {
        return Err(ImageRefError::invalid_argument(
            "zoom",
            format!("{xfac}x{yfac}"),
            "factors must be at least 1",
        ));
    }
    let width = img.width() as u64 * xfac as u64;
    let height = img.height() as u64 * yfac as u64;
    if width > u32::MAX as u64 || height > u32::MAX as u64 {
        return Err(ImageRefError::dimension_exceeds_limit(u32::MAX, crate::engine::MAX_DIMENSION));
    }
    check_dimensions(width as u32, height as u32)?;
    let pixels = dynamic_map!(img.pixels(), |buf| ImageBuffer::from_fn(
        width as u32,
        height as u32,
        |x, y| *buf.get_pixel(x / xfac, y / yfac)
    ))?;
    let page_height = img.page_height().saturating_mul(yfac);
    Ok(img.derive(pixels).with_page_height(page_height))
}

/// Tile the image `across` times horizontally and `down` times vertically.
pub(crate) fn replicate(img: &NativeImage, across: u32, down: u32) -> EngineResult<NativeImage> {
    if across == 0 || down == 0 {
        return Err(ImageRefError::invalid_argument(
            "replicate",
            format!("{across}x{down}"),
            "counts must be at least 1",
        ));
    }
    let (w, h) = (img.width(), img.height());
    let width = w as u64 * across as u64;
    let height = h as u64 * down as u64;
    if width > u32::MAX as u64 || height > u32::MAX as u64 {
        return Err(ImageRefError::dimension_exceeds_limit(u32::MAX, crate::engine::MAX_DIMENSION));
    }
    check_dimensions(width as u32, height as u32)?;
    let pixels = dynamic_map!(img.pixels(), |buf| ImageBuffer::from_fn(
        width as u32,
        height as u32,
        |x, y| *buf.get_pixel(x % w, y % h)
    ))?;
    let page_height = if img.is_multi_page() {
        img.page_height()
    } else {
        h
    };
    Ok(img.derive(pixels).with_page_height(page_height))
}

/// Chop a tall strip of `tile_height` tiles into a grid `across` tiles wide
/// and `down` tiles high, filling rows first.
pub(crate) fn grid(
    img: &NativeImage,
    tile_height: u32,
    across: u32,
    down: u32,
) -> EngineResult<NativeImage> {
    if tile_height == 0 || across == 0 || down == 0 {
        return Err(ImageRefError::invalid_argument(
            "grid",
            format!("{tile_height}/{across}x{down}"),
            "tile height and counts must be at least 1",
        ));
    }
    let tiles = img.height() / tile_height;
    if img.height() % tile_height != 0 || tiles < across.saturating_mul(down) {
        return Err(ImageRefError::operation_failed(
            "grid",
            format!(
                "height {} does not hold {}x{} tiles of height {tile_height}",
                img.height(),
                across,
                down
            ),
        ));
    }
    let w = img.width();
    let out_width = w
        .checked_mul(across)
        .ok_or_else(|| ImageRefError::dimension_exceeds_limit(u32::MAX, crate::engine::MAX_DIMENSION))?;
    let out_height = tile_height
        .checked_mul(down)
        .ok_or_else(|| ImageRefError::dimension_exceeds_limit(u32::MAX, crate::engine::MAX_DIMENSION))?;
    check_dimensions(out_width, out_height)?;

    let src = img.pixels();
    let mut out = blank_like(src, out_width, out_height);
    for index in 0..across * down {
        let tile = src.crop_imm(0, index * tile_height, w, tile_height);
        let x = (index % across) * w;
        let y = (index / across) * tile_height;
        imageops::replace(&mut out, &tile, x as i64, y as i64);
    }
    Ok(img.derive(out).with_page_height(out_height))
}

/// Shannon entropy of the luma histogram inside a window.
fn window_entropy(luma: &image::GrayImage, left: u32, top: u32, width: u32, height: u32) -> f64 {
    let mut histogram = [0u32; 256];
    for y in top..top + height {
        for x in left..left + width {
            histogram[luma.get_pixel(x, y).0[0] as usize] += 1;
        }
    }
    let total = (width as f64) * (height as f64);
    histogram
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Sum of absolute luma gradients inside a window.
fn window_detail(luma: &image::GrayImage, left: u32, top: u32, width: u32, height: u32) -> f64 {
    let mut sum = 0u64;
    for y in top..top + height {
        for x in left..left + width {
            let here = luma.get_pixel(x, y).0[0] as i32;
            if x + 1 < luma.width() {
                sum += (here - luma.get_pixel(x + 1, y).0[0] as i32).unsigned_abs() as u64;
            }
            if y + 1 < luma.height() {
                sum += (here - luma.get_pixel(x, y + 1).0[0] as i32).unsigned_abs() as u64;
            }
        }
    }
    sum as f64
}

/// Pick the top-left corner of the `width` x `height` window to keep.
fn crop_origin(frame: &DynamicImage, width: u32, height: u32, interesting: Interesting) -> (u32, u32) {
    let (fw, fh) = frame.dimensions();
    let (max_left, max_top) = (fw - width, fh - height);
    match interesting {
        Interesting::Low => (0, 0),
        Interesting::High => (max_left, max_top),
        Interesting::None | Interesting::Centre | Interesting::All => (max_left / 2, max_top / 2),
        Interesting::Entropy | Interesting::Attention => {
            let luma = frame.to_luma8();
            let steps = 8u32;
            let xs = (max_left / steps).max(1);
            let ys = (max_top / steps).max(1);
            let mut best = (max_left / 2, max_top / 2);
            let mut best_score = f64::MIN;
            let mut top = 0;
            while top <= max_top {
                let mut left = 0;
                while left <= max_left {
                    let score = if interesting == Interesting::Entropy {
                        window_entropy(&luma, left, top, width, height)
                    } else {
                        window_detail(&luma, left, top, width, height)
                    };
                    if score > best_score {
                        best_score = score;
                        best = (left, top);
                    }
                    left += xs;
                }
                top += ys;
            }
            best
        }
    }
}

/// Crop to `width` x `height`, choosing the window with `interesting`.
/// Sizes larger than the image are clamped to it.
pub(crate) fn smart_crop(
    img: &NativeImage,
    width: u32,
    height: u32,
    interesting: Interesting,
) -> EngineResult<NativeImage> {
    if width == 0 || height == 0 {
        return Err(ImageRefError::invalid_area(0, 0, width, height, img.width(), img.height()));
    }
    map_frames(img, |frame| {
        let width = width.min(frame.width());
        let height = height.min(frame.height());
        let (left, top) = crop_origin(frame, width, height, interesting);
        Ok(frame.crop_imm(left, top, width, height))
    })
}

/// Fit inside (or, when cropping, cover) a `width` x `height` box.
pub(crate) fn thumbnail(
    img: &NativeImage,
    width: u32,
    height: u32,
    crop: Interesting,
    size: Size,
) -> EngineResult<NativeImage> {
    if width == 0 || height == 0 {
        return Err(ImageRefError::invalid_argument(
            "thumbnail size",
            format!("{width}x{height}"),
            "box must be at least 1x1",
        ));
    }
    map_frames(img, |frame| {
        let (fw, fh) = frame.dimensions();
        if size == Size::Force {
            return resize_exact(frame, width, height, Kernel::Auto);
        }
        let hs = width as f64 / fw as f64;
        let vs = height as f64 / fh as f64;
        let mut scale = if crop == Interesting::None {
            hs.min(vs)
        } else {
            hs.max(vs)
        };
        match size {
            Size::Down if scale > 1.0 => scale = 1.0,
            Size::Up if scale < 1.0 => scale = 1.0,
            _ => {}
        }
        let resized = resize_exact(frame, scaled(fw, scale), scaled(fh, scale), Kernel::Auto)?;
        if crop == Interesting::None {
            return Ok(resized);
        }
        let cw = width.min(resized.width());
        let ch = height.min(resized.height());
        let (left, top) = crop_origin(&resized, cw, ch, crop);
        Ok(resized.crop_imm(left, top, cw, ch))
    })
}

fn sample_bilinear(src: &Rgba32FImage, x: f64, y: f64) -> Option<[f32; 4]> {
    let (w, h) = (src.width() as f64, src.height() as f64);
    if x < -0.5 || y < -0.5 || x > w - 0.5 || y > h - 0.5 {
        return None;
    }
    let x = x.clamp(0.0, w - 1.0);
    let y = y.clamp(0.0, h - 1.0);
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(src.width() - 1), (y0 + 1).min(src.height() - 1));
    let (fx, fy) = ((x - x0 as f64) as f32, (y - y0 as f64) as f32);
    let p = |x, y| src.get_pixel(x, y).0;
    let (a, b, c, d) = (p(x0, y0), p(x1, y0), p(x0, y1), p(x1, y1));
    let mut out = [0f32; 4];
    for i in 0..4 {
        let top = a[i] + (b[i] - a[i]) * fx;
        let bottom = c[i] + (d[i] - c[i]) * fx;
        out[i] = top + (bottom - top) * fy;
    }
    Some(out)
}

/// Parameters of a similarity transform.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Similarity {
    pub scale: f64,
    /// Degrees, clockwise.
    pub angle: f64,
    pub background: ColorRgba,
    pub idx: f64,
    pub idy: f64,
    pub odx: f64,
    pub ody: f64,
}

/// Scale and rotate about the origin, sizing the output to the bounding box
/// of the transformed image. Uncovered pixels take the background colour.
pub(crate) fn similarity(img: &NativeImage, params: Similarity) -> EngineResult<NativeImage> {
    check_scale("scale", params.scale)?;
    let theta = params.angle.to_radians();
    let (sin, cos) = theta.sin_cos();
    let (a, b, c, d) = (
        params.scale * cos,
        -params.scale * sin,
        params.scale * sin,
        params.scale * cos,
    );
    let (w, h) = (img.width() as f64, img.height() as f64);
    let corners = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)];
    let mapped: Vec<(f64, f64)> = corners
        .iter()
        .map(|&(x, y)| (a * x + b * y, c * x + d * y))
        .collect();
    let min_x = mapped.iter().map(|p| p.0).fold(f64::MAX, f64::min);
    let max_x = mapped.iter().map(|p| p.0).fold(f64::MIN, f64::max);
    let min_y = mapped.iter().map(|p| p.1).fold(f64::MAX, f64::min);
    let max_y = mapped.iter().map(|p| p.1).fold(f64::MIN, f64::max);
    let out_w = ((max_x - min_x).round() as u32).max(1);
    let out_h = ((max_y - min_y).round() as u32).max(1);
    check_dimensions(out_w, out_h)?;

    let det = a * d - b * c;
    let src = img.pixels().to_rgba32f();
    let bg = params.background;
    let bg = [
        bg.r as f32 / 255.0,
        bg.g as f32 / 255.0,
        bg.b as f32 / 255.0,
        bg.a as f32 / 255.0,
    ];
    let out = Rgba32FImage::from_fn(out_w, out_h, |x, y| {
        let u = x as f64 + 0.5 + min_x - params.odx;
        let v = y as f64 + 0.5 + min_y - params.ody;
        let sx = (d * u - b * v) / det - params.idx - 0.5;
        let sy = (-c * u + a * v) / det - params.idy - 0.5;
        Rgba(sample_bilinear(&src, sx, sy).unwrap_or(bg))
    });

    let pixels = cast_pixels(
        &DynamicImage::ImageRgba32F(out),
        Layout::of(img),
        img.band_format(),
    );
    Ok(img.derive(pixels))
}
