// src/engine/decoder.rs
//
// Decoder operations: JPEG (mozjpeg), PNG (zune), WebP (libwebp), GIF and
// animated WebP frames, multi-page TIFF, BMP. Produces a NativeImage with
// pages stacked vertically plus the metadata found in the container.

use crate::engine::common::{run_with_panic_policy, EngineResult};
use crate::engine::io::{extract_exif, extract_icc_profile, sniff_format};
use crate::engine::native::{stack_frames, NativeImage};
use crate::engine::orientation::{detect_exif_orientation, read_orientation};
use crate::engine::params::ImportParams;
use crate::engine::primitives::geometry;
use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::ImageRefError;
use crate::ops::{ImageType, Interesting, Size};
use image::codecs::gif::GifDecoder;
use image::codecs::webp::WebPDecoder as AnimatedWebPDecoder;
use image::{
    AnimationDecoder, DynamicImage, Frames, GrayAlphaImage, GrayImage, ImageBuffer, ImageFormat,
    ImageReader, Luma, LumaA, Rgb, RgbImage, Rgba, RgbaImage,
};
use mozjpeg::Decompress;
use std::io::Cursor;
use std::sync::Arc;
use tiff::decoder::{Decoder as TiffDecoder, DecodingResult};
use tiff::ColorType as TiffColorType;
use tracing::{debug, warn};
use webp::{BitstreamFeatures, Decoder as WebPDecoder};
use zune_core::colorspace::ColorSpace;
use zune_core::bytestream::ZCursor;
use zune_core::options::DecoderOptions;
use zune_png::PngDecoder;

type DecoderResult<T> = EngineResult<T>;

/// Result of decoding a buffer.
#[derive(Debug)]
pub(crate) struct Decoded {
    pub image: NativeImage,
    /// Format the handle reports from now on
    pub format: ImageType,
    /// Format the bytes were actually in
    pub original_format: ImageType,
}

/// Decoded pages before page selection, with per-page delays in ms.
struct Pages {
    frames: Vec<DynamicImage>,
    delays: Vec<u32>,
}

impl Pages {
    fn single(img: DynamicImage) -> Self {
        Self {
            frames: vec![img],
            delays: Vec::new(),
        }
    }
}

/// Decode JPEG using mozjpeg (backed by libjpeg-turbo). `shrink` (1, 2, 4
/// or 8) is applied by the IDCT, so the full-size image is never built.
fn decode_jpeg_mozjpeg(data: &[u8], strict: bool, shrink: u32) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:mozjpeg", || {
        if strict && !data.windows(2).any(|pair| pair == [0xFF, 0xD9]) {
            return Err(ImageRefError::decode_failed(
                "mozjpeg: missing JPEG EOI marker",
            ));
        }

        let mut decompress = Decompress::new_mem(data).map_err(|e| {
            ImageRefError::decode_failed(format!("mozjpeg decompress init failed: {e:?}"))
        })?;
        if shrink > 1 {
            decompress.scale((8 / shrink) as u8);
        }

        let mut decompress = decompress.rgb().map_err(|e| {
            ImageRefError::decode_failed(format!("mozjpeg rgb conversion failed: {e:?}"))
        })?;

        let width = decompress.width();
        let height = decompress.height();
        if width > MAX_DIMENSION as usize || height > MAX_DIMENSION as usize {
            return Err(ImageRefError::dimension_exceeds_limit(
                width.max(height).min(u32::MAX as usize) as u32,
                MAX_DIMENSION,
            ));
        }
        let width_u32 = width as u32;
        let height_u32 = height as u32;
        check_dimensions(width_u32, height_u32)?;

        let pixels: Vec<[u8; 3]> = decompress.read_scanlines().map_err(|e| {
            ImageRefError::decode_failed(format!("mozjpeg: failed to read scanlines: {e:?}"))
        })?;
        if let Err(e) = decompress.finish() {
            if strict {
                return Err(ImageRefError::decode_failed(format!(
                    "mozjpeg: failed to finish decompression: {e}"
                )));
            }
            warn!(target: "image_ref::engine", error = %e, "mozjpeg: incomplete JPEG stream");
        }
        let flat_pixels: Vec<u8> = pixels.into_iter().flatten().collect();

        let rgb_image =
            RgbImage::from_raw(width_u32, height_u32, flat_pixels).ok_or_else(|| {
                ImageRefError::decode_failed("mozjpeg: failed to create image from raw data")
            })?;

        Ok(DynamicImage::ImageRgb8(rgb_image))
    })
}

/// Match the IDCT-scaled size, `ceil(dim / shrink)`, when the fallback
/// decoder had to produce the full image.
fn shrink_fallback(img: DynamicImage, shrink: u32) -> DynamicImage {
    if shrink <= 1 {
        return img;
    }
    let width = img.width().div_ceil(shrink);
    let height = img.height().div_ceil(shrink);
    img.resize_exact(width, height, image::imageops::FilterType::Triangle)
}

/// Decode with the image crate under the global panic policy.
fn decode_with_image_crate(data: &[u8], format: ImageFormat) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:image", || {
        image::load_from_memory_with_format(data, format)
            .map_err(|e| ImageRefError::decode_failed(format!("decode failed: {e}")))
    })
}

/// Decode PNG using zune-png. 16-bit input is stripped to 8 bits. Strict
/// mode verifies chunk CRCs and zlib checksums.
fn decode_png_zune(data: &[u8], strict: bool) -> DecoderResult<DynamicImage> {
    run_with_panic_policy("decode:png", || {
        let options = DecoderOptions::default()
            .png_set_strip_to_8bit(true)
            .set_strict_mode(strict);
        let mut decoder = PngDecoder::new_with_options(ZCursor::new(data), options);
        let pixels = decoder
            .decode()
            .map_err(|e| ImageRefError::decode_failed(format!("png: decode failed: {e}")))?;

        let info = decoder
            .info()
            .ok_or_else(|| ImageRefError::decode_failed("png: missing header info"))?;

        let width = info.width as u32;
        let height = info.height as u32;
        check_dimensions(width, height)?;

        let buf = match pixels {
            zune_core::result::DecodingResult::U8(v) => v,
            _ => {
                return Err(ImageRefError::decode_failed(
                    "png: unexpected non-U8 pixel buffer",
                ))
            }
        };

        let colorspace = decoder
            .colorspace()
            .ok_or_else(|| ImageRefError::decode_failed("png: missing colorspace"))?;

        let built = match colorspace {
            ColorSpace::RGB => RgbImage::from_raw(width, height, buf).map(DynamicImage::ImageRgb8),
            ColorSpace::RGBA => {
                RgbaImage::from_raw(width, height, buf).map(DynamicImage::ImageRgba8)
            }
            ColorSpace::Luma => {
                GrayImage::from_raw(width, height, buf).map(DynamicImage::ImageLuma8)
            }
            ColorSpace::LumaA => {
                GrayAlphaImage::from_raw(width, height, buf).map(DynamicImage::ImageLumaA8)
            }
            other => {
                return Err(ImageRefError::decode_failed(format!(
                    "png: unsupported colorspace {other:?}"
                )))
            }
        };
        built.ok_or_else(|| ImageRefError::decode_failed("png: pixel buffer size mismatch"))
    })
}

/// Decode WebP using libwebp. Animated files go through the image crate's
/// frame decoder.
fn decode_webp(data: &[u8], strict: bool) -> DecoderResult<Pages> {
    run_with_panic_policy("decode:webp", || {
        // Parse header first to avoid allocating huge buffers on malformed files
        let features = BitstreamFeatures::new(data).ok_or_else(|| {
            ImageRefError::decode_failed("webp: failed to read bitstream features")
        })?;
        check_dimensions(features.width(), features.height())?;

        if features.has_animation() {
            let decoder = AnimatedWebPDecoder::new(Cursor::new(data)).map_err(|e| {
                ImageRefError::decode_failed(format!("webp (animated) decode failed: {e}"))
            })?;
            return collect_frames(decoder.into_frames(), "webp", strict);
        }

        let decoded = WebPDecoder::new(data)
            .decode()
            .ok_or_else(|| ImageRefError::decode_failed("webp: decode failed"))?;
        check_dimensions(decoded.width(), decoded.height())?;
        Ok(Pages::single(decoded.to_image()))
    })
}

fn decode_gif(data: &[u8], strict: bool) -> DecoderResult<Pages> {
    run_with_panic_policy("decode:gif", || {
        let decoder = GifDecoder::new(Cursor::new(data))
            .map_err(|e| ImageRefError::decode_failed(format!("gif: {e}")))?;
        collect_frames(decoder.into_frames(), "gif", strict)
    })
}

/// Gather animation frames. A broken frame fails the decode in strict
/// mode; otherwise the frames before it are kept.
fn collect_frames(frames: Frames<'_>, codec: &'static str, strict: bool) -> DecoderResult<Pages> {
    let mut pages = Pages {
        frames: Vec::new(),
        delays: Vec::new(),
    };
    for frame in frames {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if strict || pages.frames.is_empty() => {
                return Err(ImageRefError::decode_failed(format!("{codec}: {e}")))
            }
            Err(e) => {
                warn!(
                    target: "image_ref::engine",
                    codec,
                    kept = pages.frames.len(),
                    error = %e,
                    "truncated animation, keeping decoded frames"
                );
                break;
            }
        };
        let (numer, denom) = frame.delay().numer_denom_ms();
        pages.delays.push(if denom == 0 { 0 } else { numer / denom });
        let buffer = frame.into_buffer();
        check_dimensions(buffer.width(), buffer.height())?;
        pages.frames.push(DynamicImage::ImageRgba8(buffer));
    }
    if pages.frames.is_empty() {
        return Err(ImageRefError::decode_failed(format!("{codec}: no frames")));
    }
    Ok(pages)
}

/// Every directory of a TIFF file, one page each. Outside strict mode a
/// page that fails to decode ends the stack instead of failing the load.
fn decode_tiff(data: &[u8], strict: bool) -> DecoderResult<Pages> {
    run_with_panic_policy("decode:tiff", || {
        let tiff_err = |e: tiff::TiffError| ImageRefError::decode_failed(format!("tiff: {e}"));
        let mut decoder = TiffDecoder::new(Cursor::new(data)).map_err(tiff_err)?;
        let mut frames = Vec::new();
        loop {
            let (width, height) = decoder.dimensions().map_err(tiff_err)?;
            check_dimensions(width, height)?;
            let colortype = decoder.colortype().map_err(tiff_err)?;
            let pixels = match decoder.read_image() {
                Ok(pixels) => pixels,
                Err(e) if strict || frames.is_empty() => return Err(tiff_err(e)),
                Err(e) => {
                    warn!(target: "image_ref::engine", kept = frames.len(), error = %e, "tiff: unreadable page, keeping earlier pages");
                    break;
                }
            };
            match tiff_page(width, height, colortype, pixels) {
                Some(page) => frames.push(page),
                // first page in a layout we do not map: let the image crate try
                None if frames.is_empty() => {
                    return decode_with_image_crate(data, ImageFormat::Tiff).map(Pages::single)
                }
                None => break,
            }
            if !decoder.more_images() {
                break;
            }
            decoder.next_image().map_err(tiff_err)?;
        }
        Ok(Pages {
            frames,
            delays: Vec::new(),
        })
    })
}

fn tiff_page(
    width: u32,
    height: u32,
    colortype: TiffColorType,
    pixels: DecodingResult,
) -> Option<DynamicImage> {
    match (colortype, pixels) {
        (TiffColorType::Gray(8), DecodingResult::U8(v)) => {
            GrayImage::from_raw(width, height, v).map(DynamicImage::ImageLuma8)
        }
        (TiffColorType::GrayA(8), DecodingResult::U8(v)) => {
            GrayAlphaImage::from_raw(width, height, v).map(DynamicImage::ImageLumaA8)
        }
        (TiffColorType::RGB(8), DecodingResult::U8(v)) => {
            RgbImage::from_raw(width, height, v).map(DynamicImage::ImageRgb8)
        }
        (TiffColorType::RGBA(8), DecodingResult::U8(v)) => {
            RgbaImage::from_raw(width, height, v).map(DynamicImage::ImageRgba8)
        }
        (TiffColorType::Gray(16), DecodingResult::U16(v)) => {
            ImageBuffer::<Luma<u16>, _>::from_raw(width, height, v).map(DynamicImage::ImageLuma16)
        }
        (TiffColorType::GrayA(16), DecodingResult::U16(v)) => {
            ImageBuffer::<LumaA<u16>, _>::from_raw(width, height, v)
                .map(DynamicImage::ImageLumaA16)
        }
        (TiffColorType::RGB(16), DecodingResult::U16(v)) => {
            ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, v).map(DynamicImage::ImageRgb16)
        }
        (TiffColorType::RGBA(16), DecodingResult::U16(v)) => {
            ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, v).map(DynamicImage::ImageRgba16)
        }
        _ => None,
    }
}

/// Check if image dimensions are within safe limits.
/// Returns an error if the image is too large (potential decompression bomb).
pub fn check_dimensions(width: u32, height: u32) -> DecoderResult<()> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(ImageRefError::dimension_exceeds_limit(
            width.max(height),
            MAX_DIMENSION,
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(ImageRefError::pixel_count_exceeds_limit(pixels, MAX_PIXELS));
    }
    Ok(())
}

/// Inspect encoded bytes and ensure the image dimensions are safe before decoding.
pub fn ensure_dimensions_safe(bytes: &[u8]) -> DecoderResult<()> {
    let cursor = Cursor::new(bytes);
    if let Ok(reader) = ImageReader::new(cursor).with_guessed_format() {
        if let Ok((width, height)) = reader.into_dimensions() {
            return check_dimensions(width, height);
        }
    }
    Ok(())
}

/// Pick `n` pages starting at `page`. `n == -1` takes the rest.
fn select_pages(pages: Pages, page: u32, n: i32) -> DecoderResult<Pages> {
    let available = pages.frames.len();
    let start = page as usize;
    if start >= available {
        return Err(ImageRefError::decode_failed(format!(
            "page {page} out of range, image has {available} page(s)"
        )));
    }
    let count = match n {
        -1 => available - start,
        n if n >= 1 => n as usize,
        other => {
            return Err(ImageRefError::invalid_argument(
                "n",
                other.to_string(),
                "page count must be -1 or at least 1",
            ))
        }
    };
    if start + count > available {
        return Err(ImageRefError::decode_failed(format!(
            "requested {count} page(s) from page {page}, image has {available}"
        )));
    }
    let end = start + count;
    let delays = if pages.delays.is_empty() {
        Vec::new()
    } else {
        pages.delays[start..end].to_vec()
    };
    Ok(Pages {
        frames: pages.frames[start..end].to_vec(),
        delays,
    })
}

/// Reject options this build cannot honour for `format`. Density only
/// means something to vector loaders, and none are built in.
fn check_format_options(params: &ImportParams, format: ImageType) -> DecoderResult<()> {
    if let Some(dpi) = params.density {
        return Err(ImageRefError::invalid_argument(
            "density",
            dpi.to_string(),
            format!("density applies to vector input, not {format}"),
        ));
    }
    if params.heif_thumbnail == Some(true) {
        warn!(target: "image_ref::engine", %format, "heif_thumbnail ignored for non-HEIF input");
    }
    if params.svg_unlimited == Some(true) {
        warn!(target: "image_ref::engine", %format, "svg_unlimited ignored for non-SVG input");
    }
    Ok(())
}

fn check_shrink(factor: u32) -> DecoderResult<()> {
    if matches!(factor, 1 | 2 | 4 | 8) {
        Ok(())
    } else {
        Err(ImageRefError::invalid_argument(
            "jpeg_shrink_factor",
            factor.to_string(),
            "shrink must be 1, 2, 4 or 8",
        ))
    }
}

/// Largest JPEG shrink-on-load factor that still leaves the decoded image
/// at least as large as a `width` x `height` thumbnail needs. Other formats,
/// and boxes that need no reduction, decode at full size.
pub(crate) fn thumbnail_shrink(
    bytes: &[u8],
    width: u32,
    height: u32,
    crop: Interesting,
    size: Size,
) -> u32 {
    if sniff_format(bytes) != ImageType::Jpeg || size == Size::Up || width == 0 || height == 0 {
        return 1;
    }
    let Some((mut fw, mut fh)) = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
    else {
        return 1;
    };
    // the thumbnail is taken after auto-rotation
    if detect_exif_orientation(bytes).is_some_and(|o| o >= 5) {
        std::mem::swap(&mut fw, &mut fh);
    }
    let hs = width as f64 / fw as f64;
    let vs = height as f64 / fh as f64;
    let scale = if crop == Interesting::None && size != Size::Force {
        hs.min(vs)
    } else {
        hs.max(vs)
    };
    [8, 4, 2]
        .into_iter()
        .find(|&shrink| shrink as f64 * scale <= 1.0)
        .unwrap_or(1)
}

/// Unified decode entrypoint:
/// - Detect format once (magic bytes)
/// - Route each format to its decoder
/// - Select pages, attach ICC/EXIF/orientation, apply load-time options
pub(crate) fn decode(bytes: &[u8], params: &ImportParams) -> DecoderResult<Decoded> {
    let original_format = sniff_format(bytes);
    match original_format {
        ImageType::Jpeg
        | ImageType::Png
        | ImageType::Webp
        | ImageType::Gif
        | ImageType::Tiff
        | ImageType::Bmp => {}
        other => return Err(ImageRefError::unsupported_format(other.name())),
    }
    if let Some(shrink) = params.jpeg_shrink_factor {
        check_shrink(shrink)?;
    }
    check_format_options(params, original_format)?;
    ensure_dimensions_safe(bytes)?;

    let strict = params.strict();
    let pages = match original_format {
        ImageType::Jpeg => {
            let shrink = params.jpeg_shrink_factor.unwrap_or(1);
            let img = match decode_jpeg_mozjpeg(bytes, strict, shrink) {
                Ok(img) => img,
                Err(err) if !strict => {
                    warn!(target: "image_ref::engine", error = %err, "mozjpeg failed, retrying with image crate");
                    let full = decode_with_image_crate(bytes, ImageFormat::Jpeg)?;
                    shrink_fallback(full, shrink)
                }
                Err(err) => return Err(err),
            };
            Pages::single(img)
        }
        ImageType::Png => Pages::single(decode_png_zune(bytes, strict)?),
        ImageType::Webp => decode_webp(bytes, strict)?,
        ImageType::Gif => decode_gif(bytes, strict)?,
        ImageType::Tiff => decode_tiff(bytes, strict)?,
        _ => Pages::single(decode_with_image_crate(bytes, ImageFormat::Bmp)?),
    };

    let pages = select_pages(pages, params.page.unwrap_or(0), params.n.unwrap_or(1))?;
    let frame_height = pages.frames[0].height();
    let pixels = stack_frames(&pages.frames)?;
    check_dimensions(pixels.width(), pixels.height())?;

    let mut image = NativeImage::new(pixels).with_page_height(frame_height);
    image.delays = pages.delays;
    image.icc = extract_icc_profile(bytes).map(Arc::new);
    let exif = extract_exif(bytes);
    image.orientation = exif
        .as_deref()
        .and_then(read_orientation)
        .or_else(|| detect_exif_orientation(bytes));
    image.exif = exif.map(Arc::new);

    if params.auto_rotate == Some(true) {
        image = geometry::auto_rotate(&image)?;
    }

    debug!(
        target: "image_ref::engine",
        format = %original_format,
        width = image.width(),
        height = image.height(),
        pages = image.pages(),
        options = %params.option_string(),
        "decoded"
    );

    // BMP has no encoder here; the handle reports PNG from now on
    let format = if original_format == ImageType::Bmp {
        ImageType::Png
    } else {
        original_format
    };
    Ok(Decoded {
        image,
        format,
        original_format,
    })
}
