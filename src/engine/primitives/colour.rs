// src/engine/primitives/colour.rs
//
// Band and colour primitives: format casts, colour space conversion,
// per-band arithmetic, filters and pixel queries.

use crate::engine::common::EngineResult;
use crate::engine::native::{
    cast_pixels, dynamic_map, dynamic_read, Buffer, Layout, NativeImage, Sample,
};
use crate::error::ImageRefError;
use crate::ops::{BandFormat, Color, Interpretation};
use image::{DynamicImage, GenericImageView, Pixel, Rgb, Rgb32FImage, Rgba32FImage};

/// Change the numeric format of every band. Values are rescaled to the
/// new range; the interpretation is kept.
pub(crate) fn cast(img: &NativeImage, format: BandFormat) -> EngineResult<NativeImage> {
    let pixels = cast_pixels(img.pixels(), Layout::of(img), format);
    Ok(img.derive(pixels))
}

// D65 white point
const XN: f32 = 0.950_47;
const YN: f32 = 1.0;
const ZN: f32 = 1.088_83;

fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.040_45 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn linear_to_srgb(v: f32) -> f32 {
    let v = v.max(0.0);
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

fn linear_to_lab([r, g, b]: [f32; 3]) -> [f32; 3] {
    let x = (0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b) / XN;
    let y = (0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b) / YN;
    let z = (0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b) / ZN;
    let f = |t: f32| {
        if t > 216.0 / 24389.0 {
            t.cbrt()
        } else {
            (24389.0 / 27.0 * t + 16.0) / 116.0
        }
    };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

fn lab_to_linear([l, a, b]: [f32; 3]) -> [f32; 3] {
    let fy = (l + 16.0) / 116.0;
    let fx = fy + a / 500.0;
    let fz = fy - b / 200.0;
    let finv = |t: f32| {
        let t3 = t * t * t;
        if t3 > 216.0 / 24389.0 {
            t3
        } else {
            (116.0 * t - 16.0) * 27.0 / 24389.0
        }
    };
    let (x, y, z) = (finv(fx) * XN, finv(fy) * YN, finv(fz) * ZN);
    [
        3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z,
        -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z,
        0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z,
    ]
}

fn lab_to_lch([l, a, b]: [f32; 3]) -> [f32; 3] {
    let c = (a * a + b * b).sqrt();
    let h = b.atan2(a).to_degrees().rem_euclid(360.0);
    [l, c, h]
}

fn lch_to_lab([l, c, h]: [f32; 3]) -> [f32; 3] {
    let (sin, cos) = h.to_radians().sin_cos();
    [l, c * cos, c * sin]
}

fn srgb_to_hsv([r, g, b]: [f32; 3]) -> [f32; 3] {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let h = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        60.0 * ((g - b) / delta).rem_euclid(6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max <= f32::EPSILON { 0.0 } else { delta / max };
    [h, s, max]
}

fn hsv_to_srgb([h, s, v]: [f32; 3]) -> [f32; 3] {
    let h = h.rem_euclid(360.0);
    let s = s.clamp(0.0, 1.0);
    let v = v.clamp(0.0, 1.0);
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0).rem_euclid(2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match (h / 60.0) as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    [r + m, g + m, b + m]
}

/// Gamma-encoded sRGB in 0..1 plus alpha, whatever the source space.
fn to_srgb_float(img: &NativeImage) -> EngineResult<Rgba32FImage> {
    let mut rgba = img.pixels().to_rgba32f();
    let decode: fn([f32; 3]) -> [f32; 3] = match img.interpretation() {
        Interpretation::Multiband
        | Interpretation::BW
        | Interpretation::Grey16
        | Interpretation::Srgb
        | Interpretation::Rgb
        | Interpretation::Rgb16 => return Ok(rgba),
        Interpretation::ScRgb => |c| c.map(linear_to_srgb),
        Interpretation::Hsv => hsv_to_srgb,
        Interpretation::Lab => |c| lab_to_linear(c).map(linear_to_srgb),
        Interpretation::Lch => |c| lab_to_linear(lch_to_lab(c)).map(linear_to_srgb),
        Interpretation::Cmyk => {
            return Err(ImageRefError::operation_failed(
                "colourspace",
                "CMYK conversion needs a colour-managed transform",
            ))
        }
    };
    for px in rgba.pixels_mut() {
        let [r, g, b] = decode([px.0[0], px.0[1], px.0[2]]);
        px.0 = [r.clamp(0.0, 1.0), g.clamp(0.0, 1.0), b.clamp(0.0, 1.0), px.0[3]];
    }
    Ok(rgba)
}

/// Convert to another interpretation.
///
/// Display spaces come back as integer images (8-bit for sRGB and B-W,
/// 16-bit for RGB16 and GREY16). scRGB, HSV, Lab and LCh are float images
/// holding raw channel values.
pub(crate) fn to_color_space(
    img: &NativeImage,
    target: Interpretation,
) -> EngineResult<NativeImage> {
    if img.interpretation() == target {
        return Ok(img.derive(img.pixels().clone()));
    }
    let alpha = img.has_alpha();
    let srgb = to_srgb_float(img)?;
    let rgba = DynamicImage::ImageRgba32F(srgb.clone());
    let integer = |grey: bool, format: BandFormat| cast_pixels(&rgba, Layout { grey, alpha }, format);
    let encoded = |encode: fn([f32; 3]) -> [f32; 3]| {
        let mut out = srgb.clone();
        for px in out.pixels_mut() {
            let [a, b, c] = encode([px.0[0], px.0[1], px.0[2]]);
            px.0 = [a, b, c, px.0[3]];
        }
        let out = DynamicImage::ImageRgba32F(out);
        if alpha {
            out
        } else {
            DynamicImage::ImageRgb32F(out.to_rgb32f())
        }
    };
    let pixels = match target {
        Interpretation::Srgb | Interpretation::Rgb => integer(false, BandFormat::UChar),
        Interpretation::Rgb16 => integer(false, BandFormat::UShort),
        Interpretation::BW => integer(true, BandFormat::UChar),
        Interpretation::Grey16 => integer(true, BandFormat::UShort),
        Interpretation::ScRgb => encoded(|c| c.map(srgb_to_linear)),
        Interpretation::Hsv => encoded(srgb_to_hsv),
        Interpretation::Lab => encoded(|c| linear_to_lab(c.map(srgb_to_linear))),
        Interpretation::Lch => encoded(|c| lab_to_lch(linear_to_lab(c.map(srgb_to_linear)))),
        Interpretation::Multiband => img.pixels().clone(),
        Interpretation::Cmyk => {
            return Err(ImageRefError::operation_failed(
                "colourspace",
                "CMYK conversion needs a colour-managed transform",
            ))
        }
    };
    Ok(img.derive(pixels).with_interpretation(target))
}

fn linear_buf<P>(buf: &Buffer<P>, coefficients: &[(f32, f32)]) -> Buffer<P>
where
    P: Pixel,
    P::Subpixel: Sample,
{
    let mut out = buf.clone();
    for px in out.pixels_mut() {
        for (value, (a, b)) in px.channels_mut().iter_mut().zip(coefficients) {
            *value = <P::Subpixel as Sample>::from_f32(value.into_f32() * a + b);
        }
    }
    out
}

/// Map each logical band to its storage channels.
fn storage_channels(img: &NativeImage) -> Vec<usize> {
    let storage = img.pixels().color().channel_count() as usize;
    let layout = Layout::of(img);
    (0..storage)
        .map(|channel| {
            if layout.grey && storage >= 3 {
                if channel < 3 {
                    0
                } else {
                    1
                }
            } else {
                channel
            }
        })
        .collect()
}

/// `out = in * a + b` per band. Integer images are computed on raw sample
/// values and clamped to the format's range.
pub(crate) fn linear(img: &NativeImage, a: &[f64], b: &[f64]) -> EngineResult<NativeImage> {
    if a.len() != b.len() {
        return Err(ImageRefError::length_mismatch(a.len(), b.len()));
    }
    let bands = img.bands() as usize;
    if a.is_empty() || (a.len() != 1 && a.len() != bands) {
        return Err(ImageRefError::invalid_argument(
            "linear",
            format!("{} coefficients", a.len()),
            format!("expected 1 or {bands}"),
        ));
    }
    let coefficients: Vec<(f32, f32)> = storage_channels(img)
        .into_iter()
        .map(|band| {
            let i = if a.len() == 1 { 0 } else { band };
            (a[i] as f32, b[i] as f32)
        })
        .collect();
    let pixels = dynamic_map!(img.pixels(), |buf| linear_buf(buf, &coefficients))?;
    Ok(img.derive(pixels))
}

/// Apply `f` to the raw values of one pixel in a given colour space, then
/// return to the starting interpretation.
fn adjust_in(
    img: &NativeImage,
    space: Interpretation,
    a: [f64; 3],
    b: [f64; 3],
) -> EngineResult<NativeImage> {
    let original = img.interpretation();
    let working = to_color_space(img, space)?;
    let (mut a, mut b) = (a.to_vec(), b.to_vec());
    if working.has_alpha() {
        a.push(1.0);
        b.push(0.0);
    }
    let adjusted = linear(&working, &a, &b)?;
    let back = match original {
        Interpretation::Rgb => Interpretation::Srgb,
        other => other,
    };
    to_color_space(&adjusted, back)
}

/// Brightness and saturation multipliers, hue rotation in degrees. Works
/// in LCh.
pub(crate) fn modulate(
    img: &NativeImage,
    brightness: f64,
    saturation: f64,
    hue: f64,
) -> EngineResult<NativeImage> {
    adjust_in(
        img,
        Interpretation::Lch,
        [brightness, saturation, 1.0],
        [0.0, 0.0, hue],
    )
}

/// Like `modulate`, but in HSV.
pub(crate) fn modulate_hsv(
    img: &NativeImage,
    brightness: f64,
    saturation: f64,
    hue: f64,
) -> EngineResult<NativeImage> {
    adjust_in(
        img,
        Interpretation::Hsv,
        [1.0, saturation, brightness],
        [hue, 0.0, 0.0],
    )
}

pub(crate) fn invert(img: &NativeImage) -> EngineResult<NativeImage> {
    let mut pixels = img.pixels().clone();
    pixels.invert();
    Ok(img.derive(pixels))
}

pub(crate) fn gaussian_blur(img: &NativeImage, sigma: f64) -> EngineResult<NativeImage> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(ImageRefError::invalid_argument(
            "sigma",
            sigma.to_string(),
            "must be a positive number",
        ));
    }
    Ok(img.derive(img.pixels().blur(sigma as f32)))
}

/// Unsharp mask. `x1` is the flat/jaggy threshold in raw sample units.
/// `m2` (jaggy-area slope) has no counterpart in the mask and is ignored.
pub(crate) fn sharpen(img: &NativeImage, sigma: f64, x1: f64, _m2: f64) -> EngineResult<NativeImage> {
    if !(sigma.is_finite() && sigma > 0.0) {
        return Err(ImageRefError::invalid_argument(
            "sigma",
            sigma.to_string(),
            "must be a positive number",
        ));
    }
    Ok(img.derive(img.pixels().unsharpen(sigma as f32, x1.round() as i32)))
}

fn rank_buf<P>(buf: &Buffer<P>, width: u32, height: u32, index: usize) -> Buffer<P>
where
    P: Pixel,
    P::Subpixel: Sample,
{
    let (w, h) = buf.dimensions();
    let (rx, ry) = ((width / 2) as i64, (height / 2) as i64);
    let channels = P::CHANNEL_COUNT as usize;
    let mut window: Vec<P::Subpixel> = Vec::with_capacity(width as usize * height as usize);
    let mut out = buf.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        for c in 0..channels {
            window.clear();
            for dy in -ry..(height as i64 - ry) {
                for dx in -rx..(width as i64 - rx) {
                    let sx = (x as i64 + dx).clamp(0, w as i64 - 1) as u32;
                    let sy = (y as i64 + dy).clamp(0, h as i64 - 1) as u32;
                    window.push(buf.get_pixel(sx, sy).channels()[c]);
                }
            }
            window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            px.channels_mut()[c] = window[index];
        }
    }
    out
}

/// Rank filter: each output sample is the `index`-th smallest value in the
/// `width` x `height` window around it. The middle index gives a median.
pub(crate) fn rank(
    img: &NativeImage,
    width: u32,
    height: u32,
    index: u32,
) -> EngineResult<NativeImage> {
    if width == 0 || height == 0 || index >= width.saturating_mul(height) {
        return Err(ImageRefError::invalid_argument(
            "rank",
            format!("{width}x{height} index {index}"),
            "index must address a sample inside a non-empty window",
        ));
    }
    let area = width as u64 * height as u64;
    if area > crate::engine::MAX_PIXELS {
        return Err(ImageRefError::pixel_count_exceeds_limit(
            area,
            crate::engine::MAX_PIXELS,
        ));
    }
    let pixels = dynamic_map!(img.pixels(), |buf| rank_buf(
        buf,
        width,
        height,
        index as usize
    ))?;
    Ok(img.derive(pixels))
}

/// Blend alpha onto a solid background and drop the alpha band.
pub(crate) fn flatten(img: &NativeImage, background: Color) -> EngineResult<NativeImage> {
    let layout = Layout::of(img);
    if !layout.alpha {
        return Ok(img.derive(img.pixels().clone()));
    }
    let rgba = img.pixels().to_rgba32f();
    let bg = [
        background.r as f32 / 255.0,
        background.g as f32 / 255.0,
        background.b as f32 / 255.0,
    ];
    let out = Rgb32FImage::from_fn(img.width(), img.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        Rgb([
            r * a + bg[0] * (1.0 - a),
            g * a + bg[1] * (1.0 - a),
            b * a + bg[2] * (1.0 - a),
        ])
    });
    let pixels = cast_pixels(
        &DynamicImage::ImageRgb32F(out),
        Layout {
            alpha: false,
            ..layout
        },
        img.band_format(),
    );
    Ok(img.derive(pixels))
}

/// Append an opaque alpha band.
pub(crate) fn add_alpha(img: &NativeImage) -> EngineResult<NativeImage> {
    let layout = Layout::of(img);
    if layout.alpha {
        return Ok(img.derive(img.pixels().clone()));
    }
    let pixels = cast_pixels(
        img.pixels(),
        Layout {
            alpha: true,
            ..layout
        },
        img.band_format(),
    );
    Ok(img.derive(pixels))
}

fn channel_sums<P>(buf: &Buffer<P>) -> Vec<f64>
where
    P: Pixel,
    P::Subpixel: Sample,
{
    let mut sums = vec![0f64; P::CHANNEL_COUNT as usize];
    for px in buf.pixels() {
        for (sum, v) in sums.iter_mut().zip(px.channels()) {
            *sum += v.into_f32() as f64;
        }
    }
    sums
}

fn raw_channels<P>(buf: &Buffer<P>, x: u32, y: u32) -> Vec<f64>
where
    P: Pixel,
    P::Subpixel: Sample,
{
    buf.get_pixel(x, y)
        .channels()
        .iter()
        .map(|v| v.into_f32() as f64)
        .collect()
}

/// Drop the duplicated storage channels of grey float images.
fn logical(img: &NativeImage, storage: Vec<f64>) -> Vec<f64> {
    let layout = Layout::of(img);
    if layout.grey && storage.len() >= 3 {
        let mut out = vec![storage[0]];
        if layout.alpha {
            out.push(storage[3]);
        }
        out
    } else {
        storage
    }
}

/// Mean of every band of every pixel, in raw sample units.
pub(crate) fn average(img: &NativeImage) -> EngineResult<f64> {
    let sums = dynamic_read!(img.pixels(), |buf| channel_sums(buf))?;
    let pixels = img.width() as f64 * img.height() as f64;
    let means = logical(img, sums.into_iter().map(|s| s / pixels).collect());
    Ok(means.iter().sum::<f64>() / means.len() as f64)
}

/// Raw band values at one pixel.
pub(crate) fn get_point(img: &NativeImage, x: u32, y: u32) -> EngineResult<Vec<f64>> {
    if x >= img.width() || y >= img.height() {
        return Err(ImageRefError::invalid_area(x, y, 1, 1, img.width(), img.height()));
    }
    let values = dynamic_read!(img.pixels(), |buf| raw_channels(buf, x, y))?;
    Ok(logical(img, values))
}
