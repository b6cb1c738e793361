// src/codecs/avif.rs
//
// AVIF encoding through libavif (rav1e). RAII wrappers keep every raw
// pointer inside this file; `encode` is the only entry point the engine uses.
#![deny(unsafe_op_in_unsafe_fn)]

use crate::engine::common::EngineResult;
use crate::engine::params::AvifExportParams;
use crate::engine::{MAX_DIMENSION, MAX_PIXELS};
use crate::error::ImageRefError;
use image::DynamicImage;
use libavif_sys::*;
use std::borrow::Cow;
use std::ptr::NonNull;
#[cfg(test)]
use std::{cell::Cell, thread_local};

#[cfg(test)]
thread_local! {
    static TRACK_DROPS: Cell<bool> = const { Cell::new(false) };
    static LIVE_OBJECTS: Cell<isize> = const { Cell::new(0) };
}

#[cfg(test)]
fn track(delta: isize) {
    TRACK_DROPS.with(|flag| {
        if flag.get() {
            LIVE_OBJECTS.with(|c| c.set(c.get() + delta));
        }
    });
}

/// MatrixCoefficients 0 (identity, GBR), required for lossless.
const MATRIX_IDENTITY: u16 = 0;
const QUALITY_LOSSLESS: i32 = 100;

fn avif_error(message: impl Into<Cow<'static, str>>) -> ImageRefError {
    ImageRefError::encode_failed("avif", message)
}

fn check(result: avifResult, what: &str) -> EngineResult<()> {
    if result == AVIF_RESULT_OK {
        Ok(())
    } else {
        Err(avif_error(format!("{what}: {result:?}")))
    }
}

fn validate_dimensions(width: u32, height: u32) -> EngineResult<()> {
    if width == 0 || height == 0 {
        return Err(avif_error("width and height must be greater than 0"));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(avif_error(format!(
            "dimensions {width}x{height} exceed MAX_DIMENSION {MAX_DIMENSION}"
        )));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(avif_error(format!(
            "pixel count {pixels} exceeds MAX_PIXELS {MAX_PIXELS}"
        )));
    }
    Ok(())
}

/// Owned `avifImage`.
struct AvifImage {
    ptr: NonNull<avifImage>,
}

impl AvifImage {
    fn new(width: u32, height: u32, pixel_format: avifPixelFormat) -> EngineResult<Self> {
        validate_dimensions(width, height)?;
        let raw = unsafe { avifImageCreate(width, height, 8, pixel_format) };
        let ptr = NonNull::new(raw).ok_or_else(|| avif_error("failed to create image"))?;
        #[cfg(test)]
        track(1);
        Ok(Self { ptr })
    }

    fn set_color_properties(&mut self, matrix: u16, range: avifRange) {
        // Safety: ptr is a live image owned by self.
        unsafe {
            let raw = self.ptr.as_ptr();
            (*raw).colorPrimaries = AVIF_COLOR_PRIMARIES_BT709 as u16;
            (*raw).transferCharacteristics = AVIF_TRANSFER_CHARACTERISTICS_SRGB as u16;
            (*raw).matrixCoefficients = matrix;
            (*raw).yuvRange = range;
        }
    }

    fn set_icc_profile(&mut self, icc: &[u8]) -> EngineResult<()> {
        let result = unsafe { avifImageSetProfileICC(self.ptr.as_ptr(), icc.as_ptr(), icc.len()) };
        check(result, "failed to set ICC profile")
    }

    fn set_exif(&mut self, exif: &[u8]) -> EngineResult<()> {
        let result =
            unsafe { avifImageSetMetadataExif(self.ptr.as_ptr(), exif.as_ptr(), exif.len()) };
        check(result, "failed to set EXIF")
    }

    fn allocate_planes(&mut self, planes: u32) -> EngineResult<()> {
        let result = unsafe { avifImageAllocatePlanes(self.ptr.as_ptr(), planes) };
        check(result, "failed to allocate planes")
    }

    /// Convert tightly packed RGBA8 pixels into the image's YUV planes.
    fn fill_from_rgba(&mut self, pixels: &[u8], width: u32, height: u32) -> EngineResult<()> {
        let row_bytes = width
            .checked_mul(4)
            .ok_or_else(|| avif_error("row bytes overflow"))?;
        if pixels.len() != row_bytes as usize * height as usize {
            return Err(avif_error("pixel buffer does not match dimensions"));
        }
        let mut rgb: avifRGBImage = unsafe { std::mem::zeroed() };
        // Safety: rgb only borrows `pixels` for the duration of the conversion
        // call below; libavif reads from it and never frees it.
        let result = unsafe {
            avifRGBImageSetDefaults(&mut rgb, self.ptr.as_ptr());
            rgb.format = AVIF_RGB_FORMAT_RGBA;
            rgb.depth = 8;
            rgb.pixels = pixels.as_ptr() as *mut u8;
            rgb.rowBytes = row_bytes;
            avifImageRGBToYUV(self.ptr.as_ptr(), &rgb)
        };
        check(result, "failed to convert RGB to YUV")
    }

    /// Copy the alpha channel of RGBA8 pixels into the (allocated) alpha plane.
    fn fill_alpha(&mut self, pixels: &[u8], width: u32, height: u32) -> EngineResult<()> {
        // Safety: the alpha plane spans alphaRowBytes * height bytes once
        // allocated, and self is borrowed mutably for the whole copy.
        unsafe {
            let raw = self.ptr.as_ptr();
            let plane = NonNull::new((*raw).alphaPlane)
                .ok_or_else(|| avif_error("alpha plane is not allocated"))?;
            let row_bytes = (*raw).alphaRowBytes as usize;
            let dst = std::slice::from_raw_parts_mut(plane.as_ptr(), row_bytes * height as usize);
            for (y, row) in pixels.chunks_exact(width as usize * 4).enumerate() {
                for (x, px) in row.chunks_exact(4).enumerate() {
                    dst[y * row_bytes + x] = px[3];
                }
            }
        }
        Ok(())
    }
}

impl Drop for AvifImage {
    fn drop(&mut self) {
        unsafe { avifImageDestroy(self.ptr.as_ptr()) };
        #[cfg(test)]
        track(-1);
    }
}

/// Owned `avifEncoder`.
struct AvifEncoder {
    ptr: NonNull<avifEncoder>,
}

impl AvifEncoder {
    fn new() -> EngineResult<Self> {
        let raw = unsafe { avifEncoderCreate() };
        let ptr = NonNull::new(raw).ok_or_else(|| avif_error("failed to create encoder"))?;
        #[cfg(test)]
        track(1);
        Ok(Self { ptr })
    }

    fn configure(&mut self, quality: i32, speed: i32, max_threads: i32) {
        unsafe {
            let raw = self.ptr.as_ptr();
            (*raw).quality = quality;
            (*raw).qualityAlpha = quality;
            (*raw).speed = speed;
            (*raw).maxThreads = max_threads;
        }
    }

    fn write(&mut self, image: &mut AvifImage) -> EngineResult<Vec<u8>> {
        let result = unsafe {
            avifEncoderAddImage(
                self.ptr.as_ptr(),
                image.ptr.as_ptr(),
                1,
                AVIF_ADD_IMAGE_FLAG_SINGLE,
            )
        };
        check(result, "failed to add image")?;
        let mut output = AvifOutput::new();
        let result = unsafe { avifEncoderFinish(self.ptr.as_ptr(), &mut output.data) };
        check(result, "failed to finish encoding")?;
        Ok(output.as_slice().to_vec())
    }
}

impl Drop for AvifEncoder {
    fn drop(&mut self) {
        unsafe { avifEncoderDestroy(self.ptr.as_ptr()) };
        #[cfg(test)]
        track(-1);
    }
}

/// Owned `avifRWData` output buffer.
struct AvifOutput {
    data: avifRWData,
}

impl AvifOutput {
    fn new() -> Self {
        #[cfg(test)]
        track(1);
        Self {
            data: unsafe { std::mem::zeroed() },
        }
    }

    fn as_slice(&self) -> &[u8] {
        if self.data.data.is_null() || self.data.size == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.data.data, self.data.size) }
        }
    }
}

impl Drop for AvifOutput {
    fn drop(&mut self) {
        unsafe { avifRWDataFree(&mut self.data) };
        #[cfg(test)]
        track(-1);
    }
}

fn encoder_threads() -> i32 {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    cpus.clamp(2, 8) as i32
}

/// Encode a still image. Lossless output uses 4:4:4 with the identity matrix.
pub(crate) fn encode(
    img: &DynamicImage,
    params: &AvifExportParams,
    icc: Option<&[u8]>,
    exif: Option<&[u8]>,
) -> EngineResult<Vec<u8>> {
    let rgba: Cow<'_, image::RgbaImage> = match img {
        DynamicImage::ImageRgba8(rgba) => Cow::Borrowed(rgba),
        _ => Cow::Owned(img.to_rgba8()),
    };
    let (width, height) = rgba.dimensions();
    let pixels = rgba.as_raw();

    let (pixel_format, matrix, quality) = if params.lossless {
        (
            AVIF_PIXEL_FORMAT_YUV444,
            MATRIX_IDENTITY,
            QUALITY_LOSSLESS,
        )
    } else {
        (
            AVIF_PIXEL_FORMAT_YUV420,
            AVIF_MATRIX_COEFFICIENTS_BT709 as u16,
            params.quality.min(100) as i32,
        )
    };

    let mut image = AvifImage::new(width, height, pixel_format)?;
    image.set_color_properties(matrix, AVIF_RANGE_FULL);
    if let Some(icc) = icc {
        image.set_icc_profile(icc)?;
    }
    if let Some(exif) = exif {
        image.set_exif(exif)?;
    }
    image.allocate_planes(AVIF_PLANES_YUV)?;
    image.fill_from_rgba(pixels, width, height)?;
    if img.color().has_alpha() {
        image.allocate_planes(AVIF_PLANES_A)?;
        image.fill_alpha(pixels, width, height)?;
    }

    let mut encoder = AvifEncoder::new()?;
    encoder.configure(quality, params.speed.min(10) as i32, encoder_threads());
    encoder.write(&mut image)
}
