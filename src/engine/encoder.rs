// src/engine/encoder.rs
//
// Encoder operations: JPEG (mozjpeg), PNG (image + oxipng), WebP (libwebp),
// TIFF (tiff), GIF (image), AVIF (libavif). Each takes a resolved
// codec-specific parameter set; metadata travels alongside as raw bytes.

use crate::codecs::avif;
use crate::engine::common::{run_with_panic_policy, EngineResult};
use crate::engine::native::NativeImage;
use crate::engine::orientation::stamp_orientation;
use crate::engine::params::{
    CodecParams, GifExportParams, JpegExportParams, PngExportParams, PngFilter, SubsampleMode,
    TiffCompression, TiffExportParams, WebpExportParams,
};
use crate::engine::MAX_DIMENSION;
use crate::error::ImageRefError;
use crate::ops::ImageType;
use image::codecs::gif::{GifEncoder, Repeat};
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, Delay, Frame, ImageEncoder};
use img_parts::{jpeg::Jpeg, webp::WebP, Bytes, ImageEXIF, ImageICC};
use mozjpeg::{ColorSpace, Compress, ScanMode};
use std::borrow::Cow;
use std::io::{Cursor, Seek, Write};
use tiff::encoder::colortype::{self, ColorType as TiffColorType};
use tiff::encoder::compression::{Compression, Deflate, Lzw, Packbits, Uncompressed};
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;
use tracing::{debug, warn};

type EncoderResult<T> = EngineResult<T>;

/// TIFF tag holding an embedded ICC profile.
const TIFF_TAG_ICC_PROFILE: u16 = 34675;

/// Metadata written next to the pixels. `None` fields are not written.
/// `orientation` is stamped into the EXIF of JPEG, PNG and WebP output.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Attachments<'a> {
    pub icc: Option<&'a [u8]>,
    pub exif: Option<&'a [u8]>,
    pub orientation: Option<u16>,
}

fn with_orientation_tag(
    encoded: Vec<u8>,
    format: ImageType,
    orientation: Option<u16>,
) -> EncoderResult<Vec<u8>> {
    match orientation {
        Some(orientation) => run_with_panic_policy("encode:orientation", || {
            stamp_orientation(encoded, format, orientation)
        }),
        None => Ok(encoded),
    }
}

/// Quality-derived WebP tuning, in the bands used for lossy encodes:
/// - High (>=85): visual quality first
/// - Balanced (70-84)
/// - Fast (<70)
#[derive(Debug, Clone, Copy)]
pub struct QualitySettings {
    quality: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QualityBand {
    High,
    Balanced,
    Fast,
}

impl QualitySettings {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.min(100) as f32,
        }
    }

    fn band(&self) -> QualityBand {
        if self.quality >= 85.0 {
            QualityBand::High
        } else if self.quality >= 70.0 {
            QualityBand::Balanced
        } else {
            QualityBand::Fast
        }
    }

    pub fn webp_sns_strength(&self) -> i32 {
        match self.band() {
            QualityBand::High => 50,
            QualityBand::Balanced => 70,
            QualityBand::Fast => 80,
        }
    }

    pub fn webp_filter_strength(&self) -> i32 {
        if self.quality >= 80.0 {
            20
        } else if self.quality >= 60.0 {
            30
        } else {
            40
        }
    }

    pub fn webp_filter_sharpness(&self) -> i32 {
        match self.band() {
            QualityBand::High => 2,
            QualityBand::Balanced | QualityBand::Fast => 0,
        }
    }

    /// JPEG smoothing: none at high quality, more as quality drops.
    pub fn jpeg_smoothing(&self) -> u8 {
        if self.quality >= 90.0 {
            0
        } else if self.quality >= 70.0 {
            5
        } else if self.quality >= 60.0 {
            10
        } else {
            18
        }
    }
}

/// Encode `img` with `params`. HEIF and JPEG 2000 have parameter sets but
/// no encoder in this build.
pub(crate) fn encode(
    img: &NativeImage,
    params: &CodecParams,
    attachments: Attachments<'_>,
) -> EncoderResult<Vec<u8>> {
    match params {
        CodecParams::Jpeg(p) => encode_jpeg(img.pixels(), p, attachments),
        CodecParams::Png(p) => encode_png(img.pixels(), p, attachments),
        CodecParams::Webp(p) => encode_webp(img.pixels(), p, attachments),
        CodecParams::Tiff(p) => encode_tiff(img, p, attachments),
        CodecParams::Gif(p) => encode_gif(img, p),
        CodecParams::Avif(p) => run_with_panic_policy("encode:avif", || {
            avif::encode(img.pixels(), p, attachments.icc, attachments.exif)
        }),
        CodecParams::Heif(_) | CodecParams::Jp2k(_) => Err(
            ImageRefError::unsupported_export_format(params.format().name()),
        ),
    }
}

fn chroma_subsampled(params: &JpegExportParams) -> bool {
    match params.subsample_mode {
        SubsampleMode::On => true,
        SubsampleMode::Off => false,
        SubsampleMode::Auto => params.quality < 90,
    }
}

/// Encode to JPEG using mozjpeg.
///
/// Progressive output always uses optimized Huffman tables; baseline output
/// only when `optimize_coding` is set.
pub fn encode_jpeg(
    img: &DynamicImage,
    params: &JpegExportParams,
    attachments: Attachments<'_>,
) -> EncoderResult<Vec<u8>> {
    let encoded = run_with_panic_policy("encode:jpeg", || {
        let quality = params.quality.min(100);

        // Zero-copy if already RGB8
        let rgb: Cow<'_, image::RgbImage> = match img {
            DynamicImage::ImageRgb8(rgb_img) => Cow::Borrowed(rgb_img),
            _ => Cow::Owned(img.to_rgb8()),
        };
        let (w, h) = rgb.dimensions();
        let pixels: &[u8] = rgb.as_raw();

        if w == 0 || h == 0 {
            return Err(ImageRefError::encode_failed(
                "jpeg",
                "width or height is zero",
            ));
        }
        if w > MAX_DIMENSION || h > MAX_DIMENSION {
            return Err(ImageRefError::dimension_exceeds_limit(
                w.max(h),
                MAX_DIMENSION,
            ));
        }
        if pixels.len() != (w as usize) * (h as usize) * 3 {
            return Err(ImageRefError::corrupted_image());
        }

        let mut comp = Compress::new(ColorSpace::JCS_RGB);
        if !params.interlace {
            // mozjpeg defaults to progressive; this resets to baseline
            comp.set_fastest_defaults();
        }
        comp.set_size(w as usize, h as usize);
        comp.set_color_space(ColorSpace::JCS_YCbCr);
        comp.set_quality(quality as f32);

        if chroma_subsampled(params) {
            comp.set_chroma_sampling_pixel_sizes((2, 2), (2, 2));
        } else {
            comp.set_chroma_sampling_pixel_sizes((1, 1), (1, 1));
        }

        if params.interlace {
            comp.set_progressive_mode();
            comp.set_optimize_coding(true);
            comp.set_optimize_scans(params.optimize_scans);
            if params.optimize_scans {
                comp.set_scan_optimization_mode(ScanMode::AllComponentsTogether);
            }
        } else {
            comp.set_optimize_coding(params.optimize_coding);
        }
        comp.set_smoothing_factor(QualitySettings::new(quality).jpeg_smoothing());

        let estimated_size = (w as usize * h as usize * 3 / 10).max(4096);
        let mut output = Vec::with_capacity(estimated_size);
        {
            let mut writer = comp.start_compress(&mut output).map_err(|e| {
                ImageRefError::encode_failed(
                    "jpeg",
                    format!("mozjpeg: failed to start compress: {e:?}"),
                )
            })?;

            let stride = w as usize * 3;
            for row in pixels.chunks(stride) {
                writer.write_scanlines(row).map_err(|e| {
                    ImageRefError::encode_failed(
                        "jpeg",
                        format!("mozjpeg: failed to write scanlines: {e:?}"),
                    )
                })?;
            }

            writer.finish().map_err(|e| {
                ImageRefError::encode_failed("jpeg", format!("mozjpeg: failed to finish: {e:?}"))
            })?;
        }
        Ok(output)
    })?;

    if params.strip_metadata {
        return Ok(encoded);
    }
    let embedded = embed_jpeg_metadata(encoded, attachments)?;
    with_orientation_tag(embedded, ImageType::Jpeg, attachments.orientation)
}

/// Embed ICC profile (APP2) and EXIF (APP1) into JPEG using img-parts
pub fn embed_jpeg_metadata(
    jpeg_data: Vec<u8>,
    attachments: Attachments<'_>,
) -> EncoderResult<Vec<u8>> {
    if attachments.icc.is_none() && attachments.exif.is_none() {
        return Ok(jpeg_data);
    }
    run_with_panic_policy("encode:jpeg:embed", || {
        let mut jpeg = Jpeg::from_bytes(Bytes::from(jpeg_data)).map_err(|e| {
            ImageRefError::encode_failed("jpeg", format!("failed to parse JPEG for metadata: {e}"))
        })?;
        if let Some(icc) = attachments.icc {
            jpeg.set_icc_profile(Some(Bytes::copy_from_slice(icc)));
        }
        if let Some(exif) = attachments.exif {
            jpeg.set_exif(Some(Bytes::copy_from_slice(exif)));
        }
        let mut output = Vec::new();
        jpeg.encoder().write_to(&mut output).map_err(|e| {
            ImageRefError::encode_failed("jpeg", format!("failed to write JPEG metadata: {e}"))
        })?;
        Ok(output)
    })
}

fn png_filter(filter: PngFilter) -> FilterType {
    match filter {
        PngFilter::None => FilterType::NoFilter,
        PngFilter::Sub => FilterType::Sub,
        PngFilter::Up => FilterType::Up,
        PngFilter::Avg => FilterType::Avg,
        PngFilter::Paeth => FilterType::Paeth,
        PngFilter::All => FilterType::Adaptive,
    }
}

/// PNG stores 8 or 16 bits per sample. `bitdepth` 0 keeps 16-bit data and
/// narrows float data to 16 bits.
fn png_pixels(img: &DynamicImage, bitdepth: u8) -> Cow<'_, DynamicImage> {
    let alpha = img.color().has_alpha();
    let grey = matches!(
        img,
        DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageLumaA8(_)
            | DynamicImage::ImageLuma16(_)
            | DynamicImage::ImageLumaA16(_)
    );
    let sixteen = match bitdepth {
        8 => false,
        16 => true,
        _ => img.color().bytes_per_pixel() / img.color().channel_count() > 1,
    };
    let wanted = match (grey, alpha, sixteen) {
        (true, false, false) => image::ColorType::L8,
        (true, true, false) => image::ColorType::La8,
        (true, false, true) => image::ColorType::L16,
        (true, true, true) => image::ColorType::La16,
        (false, false, false) => image::ColorType::Rgb8,
        (false, true, false) => image::ColorType::Rgba8,
        (false, false, true) => image::ColorType::Rgb16,
        (false, true, true) => image::ColorType::Rgba16,
    };
    if img.color() == wanted {
        return Cow::Borrowed(img);
    }
    Cow::Owned(match wanted {
        image::ColorType::L8 => DynamicImage::ImageLuma8(img.to_luma8()),
        image::ColorType::La8 => DynamicImage::ImageLumaA8(img.to_luma_alpha8()),
        image::ColorType::L16 => DynamicImage::ImageLuma16(img.to_luma16()),
        image::ColorType::La16 => DynamicImage::ImageLumaA16(img.to_luma_alpha16()),
        image::ColorType::Rgb8 => DynamicImage::ImageRgb8(img.to_rgb8()),
        image::ColorType::Rgba8 => DynamicImage::ImageRgba8(img.to_rgba8()),
        image::ColorType::Rgb16 => DynamicImage::ImageRgb16(img.to_rgb16()),
        _ => DynamicImage::ImageRgba16(img.to_rgba16()),
    })
}

/// Encode to PNG using the image crate. Interlaced output is produced by an
/// oxipng pass, which keeps every ancillary chunk.
pub fn encode_png(
    img: &DynamicImage,
    params: &PngExportParams,
    attachments: Attachments<'_>,
) -> EncoderResult<Vec<u8>> {
    let encoded = run_with_panic_policy("encode:png", || {
        let compression = match params.compression.min(9) {
            0 => CompressionType::Uncompressed,
            level => CompressionType::Level(level),
        };
        let mut buf = Vec::new();
        let mut encoder =
            PngEncoder::new_with_quality(&mut buf, compression, png_filter(params.filter));
        if !params.strip_metadata {
            if let Some(icc) = attachments.icc {
                if let Err(e) = encoder.set_icc_profile(icc.to_vec()) {
                    warn!(target: "image_ref::export", error = %e, "PNG encoder rejected ICC profile");
                }
            }
            if let Some(exif) = attachments.exif {
                if let Err(e) = encoder.set_exif_metadata(exif.to_vec()) {
                    warn!(target: "image_ref::export", error = %e, "PNG encoder rejected EXIF block");
                }
            }
        }
        png_pixels(img, params.bitdepth)
            .write_with_encoder(encoder)
            .map_err(|e| ImageRefError::encode_failed("png", format!("PNG encode failed: {e}")))?;

        if !params.interlace {
            return Ok(buf);
        }
        let preset = params.compression.min(9) * 6 / 9;
        let mut options = oxipng::Options::from_preset(preset);
        options.strip = oxipng::StripChunks::None;
        options.interlace = Some(true);
        oxipng::optimize_from_memory(&buf, &options).map_err(|e| {
            ImageRefError::encode_failed("png", format!("oxipng interlacing failed: {e}"))
        })
    })?;

    if params.strip_metadata {
        return Ok(encoded);
    }
    with_orientation_tag(encoded, ImageType::Png, attachments.orientation)
}

/// Encode to WebP with libwebp. Alpha is kept only when the image has it.
pub fn encode_webp(
    img: &DynamicImage,
    params: &WebpExportParams,
    attachments: Attachments<'_>,
) -> EncoderResult<Vec<u8>> {
    let encoded = run_with_panic_policy("encode:webp", || {
        let (w, h) = (img.width(), img.height());
        let rgba;
        let rgb;
        let encoder = if img.color().has_alpha() {
            rgba = img.to_rgba8();
            webp::Encoder::from_rgba(rgba.as_raw(), w, h)
        } else {
            rgb = img.to_rgb8();
            webp::Encoder::from_rgb(rgb.as_raw(), w, h)
        };

        let mut config = webp::WebPConfig::new()
            .map_err(|_| ImageRefError::internal_panic("failed to create WebPConfig"))?;
        let settings = QualitySettings::new(params.quality);
        config.quality = settings.quality;
        config.method = params.reduction_effort.min(6) as i32;
        if params.lossless {
            config.lossless = 1;
        } else if params.near_lossless {
            config.lossless = 1;
            config.near_lossless = params.quality.min(100) as i32;
        } else {
            config.sns_strength = settings.webp_sns_strength();
            config.autofilter = 1;
            config.filter_strength = settings.webp_filter_strength();
            config.filter_sharpness = settings.webp_filter_sharpness();
        }

        let mem = encoder.encode_advanced(&config).map_err(|e| {
            ImageRefError::encode_failed("webp", format!("WebP encode failed: {e:?}"))
        })?;
        Ok(mem.to_vec())
    })?;

    if params.strip_metadata {
        return Ok(encoded);
    }
    let icc = params.icc_profile.as_deref().or(attachments.icc);
    let embedded = embed_webp_metadata(
        encoded,
        Attachments {
            icc,
            ..attachments
        },
    )?;
    with_orientation_tag(embedded, ImageType::Webp, attachments.orientation)
}

/// Embed ICC profile and EXIF into WebP using img-parts
pub fn embed_webp_metadata(
    webp_data: Vec<u8>,
    attachments: Attachments<'_>,
) -> EncoderResult<Vec<u8>> {
    if attachments.icc.is_none() && attachments.exif.is_none() {
        return Ok(webp_data);
    }
    run_with_panic_policy("encode:webp:embed", || {
        let mut webp = WebP::from_bytes(Bytes::from(webp_data)).map_err(|e| {
            ImageRefError::encode_failed("webp", format!("failed to parse WebP for metadata: {e}"))
        })?;
        if let Some(icc) = attachments.icc {
            webp.set_icc_profile(Some(Bytes::copy_from_slice(icc)));
        }
        if let Some(exif) = attachments.exif {
            webp.set_exif(Some(Bytes::copy_from_slice(exif)));
        }
        let mut output = Vec::new();
        webp.encoder().write_to(&mut output).map_err(|e| {
            ImageRefError::encode_failed("webp", format!("failed to write WebP metadata: {e}"))
        })?;
        Ok(output)
    })
}

fn tiff_error(e: tiff::TiffError) -> ImageRefError {
    ImageRefError::encode_failed("tiff", e.to_string())
}

/// Encode every page as its own TIFF directory.
pub(crate) fn encode_tiff(
    img: &NativeImage,
    params: &TiffExportParams,
    attachments: Attachments<'_>,
) -> EncoderResult<Vec<u8>> {
    let icc = if params.strip_metadata {
        None
    } else {
        attachments.icc
    };
    run_with_panic_policy("encode:tiff", || match params.compression {
        TiffCompression::None => write_tiff(img, Uncompressed::default(), icc),
        TiffCompression::Deflate => write_tiff(img, Deflate::default(), icc),
        TiffCompression::Packbits => write_tiff(img, Packbits::default(), icc),
        TiffCompression::Lzw => write_tiff(img, Lzw::default(), icc),
        other => {
            debug!(
                target: "image_ref::export",
                compression = ?other,
                "tiff compression not available, using lzw"
            );
            write_tiff(img, Lzw::default(), icc)
        }
    })
}

fn write_tiff<D: Compression + Clone>(
    img: &NativeImage,
    compression: D,
    icc: Option<&[u8]>,
) -> EncoderResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut out).map_err(tiff_error)?;
        for frame in img.frames() {
            let (w, h) = (frame.width(), frame.height());
            let c = compression.clone();
            match &frame {
                DynamicImage::ImageLuma8(b) => {
                    write_page::<colortype::Gray8, _, _>(&mut encoder, w, h, b.as_raw(), c, icc)?
                }
                DynamicImage::ImageRgb8(b) => {
                    write_page::<colortype::RGB8, _, _>(&mut encoder, w, h, b.as_raw(), c, icc)?
                }
                DynamicImage::ImageLuma16(b) => {
                    write_page::<colortype::Gray16, _, _>(&mut encoder, w, h, b.as_raw(), c, icc)?
                }
                DynamicImage::ImageRgb16(b) => {
                    write_page::<colortype::RGB16, _, _>(&mut encoder, w, h, b.as_raw(), c, icc)?
                }
                DynamicImage::ImageRgba16(b) => {
                    write_page::<colortype::RGBA16, _, _>(&mut encoder, w, h, b.as_raw(), c, icc)?
                }
                DynamicImage::ImageLumaA16(_) => {
                    let b = frame.to_rgba16();
                    write_page::<colortype::RGBA16, _, _>(&mut encoder, w, h, b.as_raw(), c, icc)?
                }
                DynamicImage::ImageRgb32F(b) => write_page::<colortype::RGB32Float, _, _>(
                    &mut encoder,
                    w,
                    h,
                    b.as_raw(),
                    c,
                    icc,
                )?,
                DynamicImage::ImageRgba32F(b) => write_page::<colortype::RGBA32Float, _, _>(
                    &mut encoder,
                    w,
                    h,
                    b.as_raw(),
                    c,
                    icc,
                )?,
                _ => {
                    let b = frame.to_rgba8();
                    write_page::<colortype::RGBA8, _, _>(&mut encoder, w, h, b.as_raw(), c, icc)?
                }
            }
        }
    }
    Ok(out.into_inner())
}

fn write_page<C, D, W>(
    encoder: &mut TiffEncoder<W>,
    width: u32,
    height: u32,
    data: &[C::Inner],
    compression: D,
    icc: Option<&[u8]>,
) -> EncoderResult<()>
where
    C: TiffColorType,
    [C::Inner]: TiffValue,
    D: Compression,
    W: Write + Seek,
{
    let mut image = encoder
        .new_image_with_compression::<C, D>(width, height, compression)
        .map_err(tiff_error)?;
    if let Some(icc) = icc {
        image
            .encoder()
            .write_tag(Tag::Unknown(TIFF_TAG_ICC_PROFILE), icc)
            .map_err(tiff_error)?;
    }
    image.write_data(data).map_err(tiff_error)
}

/// Quantizer speed from effort: effort 1 is fastest, 10 slowest.
fn gif_speed(effort: u8) -> i32 {
    (11 - effort.clamp(1, 10) as i32) * 3
}

/// Encode to GIF. Multi-page images become an animation using the page
/// delays and loop count.
pub(crate) fn encode_gif(img: &NativeImage, params: &GifExportParams) -> EncoderResult<Vec<u8>> {
    run_with_panic_policy("encode:gif", || {
        let mut buf = Vec::new();
        {
            let mut encoder = GifEncoder::new_with_speed(&mut buf, gif_speed(params.effort));
            let frames = img.frames();
            if frames.len() > 1 {
                let repeat = match img.loop_count {
                    0 => Repeat::Infinite,
                    n => Repeat::Finite(n.min(u16::MAX as u32) as u16),
                };
                encoder.set_repeat(repeat).map_err(|e| {
                    ImageRefError::encode_failed("gif", format!("failed to set loop: {e}"))
                })?;
            }
            for (i, frame) in frames.into_iter().enumerate() {
                let delay = img.delays.get(i).copied().unwrap_or(0);
                let frame = Frame::from_parts(
                    frame.to_rgba8(),
                    0,
                    0,
                    Delay::from_numer_denom_ms(delay, 1),
                );
                encoder.encode_frame(frame).map_err(|e| {
                    ImageRefError::encode_failed("gif", format!("GIF encode failed: {e}"))
                })?;
            }
        }
        Ok(buf)
    })
}
