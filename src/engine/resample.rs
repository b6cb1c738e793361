// src/engine/resample.rs
//
// Resampling through fast_image_resize, with the image crate as fallback.
// Works on every pixel layout the engine stores (u8, u16 and f32 samples,
// one to four channels). Alpha is never premultiplied here: the handle
// brackets resizes with its own premultiply tracker.

use crate::engine::common::EngineResult;
use crate::error::ImageRefError;
use crate::ops::Kernel;
use fast_image_resize::{self as fir, ImageBufferError, PixelType, ResizeAlg, ResizeOptions};
use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageBuffer};
use tracing::debug;

fn resize_alg(kernel: Kernel) -> ResizeAlg {
    match kernel {
        Kernel::Nearest => ResizeAlg::Nearest,
        Kernel::Linear => ResizeAlg::Convolution(fir::FilterType::Bilinear),
        Kernel::Cubic => ResizeAlg::Convolution(fir::FilterType::CatmullRom),
        Kernel::Mitchell => ResizeAlg::Convolution(fir::FilterType::Mitchell),
        // fir has no two-lobe Lanczos
        Kernel::Auto | Kernel::Lanczos2 | Kernel::Lanczos3 => {
            ResizeAlg::Convolution(fir::FilterType::Lanczos3)
        }
    }
}

fn fallback_filter(kernel: Kernel) -> FilterType {
    match kernel {
        Kernel::Nearest => FilterType::Nearest,
        Kernel::Linear => FilterType::Triangle,
        Kernel::Cubic | Kernel::Mitchell => FilterType::CatmullRom,
        Kernel::Auto | Kernel::Lanczos2 | Kernel::Lanczos3 => FilterType::Lanczos3,
    }
}

fn pixel_type_of(img: &DynamicImage) -> EngineResult<PixelType> {
    Ok(match img {
        DynamicImage::ImageLuma8(_) => PixelType::U8,
        DynamicImage::ImageLumaA8(_) => PixelType::U8x2,
        DynamicImage::ImageRgb8(_) => PixelType::U8x3,
        DynamicImage::ImageRgba8(_) => PixelType::U8x4,
        DynamicImage::ImageLuma16(_) => PixelType::U16,
        DynamicImage::ImageLumaA16(_) => PixelType::U16x2,
        DynamicImage::ImageRgb16(_) => PixelType::U16x3,
        DynamicImage::ImageRgba16(_) => PixelType::U16x4,
        DynamicImage::ImageRgb32F(_) => PixelType::F32x3,
        DynamicImage::ImageRgba32F(_) => PixelType::F32x4,
        other => {
            return Err(ImageRefError::operation_failed(
                "resize",
                format!("unsupported pixel layout {:?}", other.color()),
            ))
        }
    })
}

/// Output size for a scale factor: rounded, never below one pixel.
pub(crate) fn scaled(size: u32, scale: f64) -> u32 {
    ((size as f64 * scale).round() as u32).max(1)
}

/// Resample `img` to exactly `width` x `height`.
pub(crate) fn resize_exact(
    img: &DynamicImage,
    width: u32,
    height: u32,
    kernel: Kernel,
) -> EngineResult<DynamicImage> {
    let (src_width, src_height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(ImageRefError::resize_failed(
            (src_width, src_height),
            (width, height),
            "target dimensions must be non-zero",
        ));
    }
    if (width, height) == (src_width, src_height) {
        return Ok(img.clone());
    }
    crate::engine::decoder::check_dimensions(width, height)?;

    let pixel_type = pixel_type_of(img)?;
    match resize_with_fir(img, pixel_type, width, height, kernel) {
        Ok(out) => Ok(out),
        Err(err) => {
            debug!(
                target: "image_ref::ops",
                error = %err,
                "fir resize failed, falling back to image crate"
            );
            Ok(img.resize_exact(width, height, fallback_filter(kernel)))
        }
    }
}

fn resize_with_fir(
    img: &DynamicImage,
    pixel_type: PixelType,
    dst_width: u32,
    dst_height: u32,
    kernel: Kernel,
) -> std::result::Result<DynamicImage, String> {
    let (src_width, src_height) = img.dimensions();
    let mut src_bytes = img.as_bytes().to_vec();
    let required_bytes = (src_width as usize)
        .checked_mul(src_height as usize)
        .and_then(|n| n.checked_mul(pixel_type.size()))
        .ok_or_else(|| "image buffer size overflow during resize".to_string())?;
    if src_bytes.len() < required_bytes {
        return Err(format!(
            "source buffer too small: expected {required_bytes} bytes, got {}",
            src_bytes.len()
        ));
    }

    let options = ResizeOptions::new()
        .resize_alg(resize_alg(kernel))
        .use_alpha(false);
    let mut dst_image = fir::images::Image::new(dst_width, dst_height, pixel_type);
    let mut resizer = fir::Resizer::new();

    match fir::images::Image::from_slice_u8(
        src_width,
        src_height,
        src_bytes.as_mut_slice(),
        pixel_type,
    ) {
        Ok(src_image) => resizer
            .resize(&src_image, &mut dst_image, &options)
            .map_err(|e| format!("fir resize error: {e:?}"))?,
        Err(ImageBufferError::InvalidBufferAlignment) => {
            // u16 and f32 samples need an aligned buffer
            let mut aligned = fir::images::Image::new(src_width, src_height, pixel_type);
            aligned
                .buffer_mut()
                .copy_from_slice(&src_bytes[..required_bytes]);
            resizer
                .resize(&aligned, &mut dst_image, &options)
                .map_err(|e| format!("fir resize error: {e:?}"))?
        }
        Err(other) => return Err(format!("fir source image error: {other:?}")),
    }

    from_ne_bytes(img, dst_width, dst_height, &dst_image.into_vec())
}

/// Rebuild an image with the variant of `template` from native-endian bytes.
pub(crate) fn from_ne_bytes(
    template: &DynamicImage,
    width: u32,
    height: u32,
    bytes: &[u8],
) -> std::result::Result<DynamicImage, String> {
    let u16s = || -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|c| u16::from_ne_bytes([c[0], c[1]]))
            .collect()
    };
    let f32s = || -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    };
    let mismatch = || "buffer size does not match dimensions".to_string();
    Ok(match template {
        DynamicImage::ImageLuma8(_) => DynamicImage::ImageLuma8(
            ImageBuffer::from_raw(width, height, bytes.to_vec()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageLumaA8(_) => DynamicImage::ImageLumaA8(
            ImageBuffer::from_raw(width, height, bytes.to_vec()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageRgb8(_) => DynamicImage::ImageRgb8(
            ImageBuffer::from_raw(width, height, bytes.to_vec()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageRgba8(_) => DynamicImage::ImageRgba8(
            ImageBuffer::from_raw(width, height, bytes.to_vec()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageLuma16(_) => DynamicImage::ImageLuma16(
            ImageBuffer::from_raw(width, height, u16s()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageLumaA16(_) => DynamicImage::ImageLumaA16(
            ImageBuffer::from_raw(width, height, u16s()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageRgb16(_) => DynamicImage::ImageRgb16(
            ImageBuffer::from_raw(width, height, u16s()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageRgba16(_) => DynamicImage::ImageRgba16(
            ImageBuffer::from_raw(width, height, u16s()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb32F(
            ImageBuffer::from_raw(width, height, f32s()).ok_or_else(mismatch)?,
        ),
        DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba32F(
            ImageBuffer::from_raw(width, height, f32s()).ok_or_else(mismatch)?,
        ),
        _ => return Err("unsupported pixel layout".to_string()),
    })
}
