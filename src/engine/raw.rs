// src/engine/raw.rs
//
// Raw serialization: a self-describing dump of the pixels and the metadata
// needed to rebuild the native image, and its inverse.
//
// Layout (little-endian):
//   0..8    magic "IMGREF02"
//   8..12   width
//   12..16  height
//   16      bands (1..=4; 2 and 4 carry alpha)
//   17      band format code
//   18      interpretation code
//   19..23  page height
//   23..25  orientation, 0 when unset
//   25..29  loop count
//   29..37  horizontal resolution, f64 pixels per millimetre
//   37..45  vertical resolution
//   45..49  page delay count
//   49..53  ICC profile length
//   53..57  EXIF length
//   57..65  payload length
//   65..    page delays (u32 ms each), ICC bytes, EXIF bytes, then the
//           zlib-compressed samples, row-major, bands interleaved

use crate::engine::api::ImageRef;
use crate::engine::common::EngineResult;
use crate::engine::decoder::check_dimensions;
use crate::engine::native::NativeImage;
use crate::error::{ImageRefError, Result};
use crate::ops::{BandFormat, ImageType, Interpretation};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::{
    DynamicImage, GrayAlphaImage, GrayImage, ImageBuffer, Luma, LumaA, Rgb, Rgb32FImage,
    RgbImage, Rgba, Rgba32FImage, RgbaImage,
};
use std::io::{Read, Write};
use std::sync::Arc;

const MAGIC: &[u8; 8] = b"IMGREF02";
const HEADER_LEN: usize = 65;

fn logical_channels(bands: u8) -> &'static [usize] {
    match bands {
        1 => &[0],
        2 => &[0, 3],
        3 => &[0, 1, 2],
        _ => &[0, 1, 2, 3],
    }
}

fn sample_size(format: BandFormat) -> usize {
    match format {
        BandFormat::UChar => 1,
        BandFormat::UShort => 2,
        BandFormat::Float => 4,
    }
}

/// Logical samples as little-endian bytes.
fn samples(img: &NativeImage) -> Vec<u8> {
    let channels = logical_channels(img.bands() as u8);
    let count = img.width() as usize * img.height() as usize * channels.len();
    let mut out = Vec::with_capacity(count * sample_size(img.band_format()));
    match img.band_format() {
        BandFormat::UChar => {
            for px in img.pixels().to_rgba8().pixels() {
                out.extend(channels.iter().map(|&c| px.0[c]));
            }
        }
        BandFormat::UShort => {
            for px in img.pixels().to_rgba16().pixels() {
                for &c in channels {
                    out.extend_from_slice(&px.0[c].to_le_bytes());
                }
            }
        }
        BandFormat::Float => {
            for px in img.pixels().to_rgba32f().pixels() {
                for &c in channels {
                    out.extend_from_slice(&px.0[c].to_le_bytes());
                }
            }
        }
    }
    out
}

fn malformed(reason: impl Into<std::borrow::Cow<'static, str>>) -> ImageRefError {
    ImageRefError::decode_failed(reason)
}

/// Bounds-checked little-endian reader over a raw stream.
struct Fields<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Fields<'a> {
    fn take(&mut self, len: usize) -> EngineResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| malformed("raw stream truncated"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> EngineResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> EngineResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> EngineResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> EngineResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn u64(&mut self) -> EngineResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    fn f64(&mut self) -> EngineResult<f64> {
        self.array().map(f64::from_le_bytes)
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}

fn blob_len(blob: Option<&[u8]>) -> EngineResult<u32> {
    u32::try_from(blob.map_or(0, <[u8]>::len))
        .map_err(|_| ImageRefError::encode_failed("raw", "metadata block exceeds 4 GiB"))
}

/// Build pixels of the given layout from logical samples.
fn pixels_from_samples(
    width: u32,
    height: u32,
    bands: u8,
    format: BandFormat,
    data: Vec<u8>,
) -> EngineResult<DynamicImage> {
    let bad_len = || malformed("raw payload length does not match the header");
    let pixels = match format {
        BandFormat::UChar => match bands {
            1 => GrayImage::from_raw(width, height, data).map(DynamicImage::ImageLuma8),
            2 => GrayAlphaImage::from_raw(width, height, data).map(DynamicImage::ImageLumaA8),
            3 => RgbImage::from_raw(width, height, data).map(DynamicImage::ImageRgb8),
            _ => RgbaImage::from_raw(width, height, data).map(DynamicImage::ImageRgba8),
        },
        BandFormat::UShort => {
            let values: Vec<u16> = data
                .chunks_exact(2)
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
                .collect();
            match bands {
                1 => ImageBuffer::<Luma<u16>, _>::from_raw(width, height, values)
                    .map(DynamicImage::ImageLuma16),
                2 => ImageBuffer::<LumaA<u16>, _>::from_raw(width, height, values)
                    .map(DynamicImage::ImageLumaA16),
                3 => ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, values)
                    .map(DynamicImage::ImageRgb16),
                _ => ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, values)
                    .map(DynamicImage::ImageRgba16),
            }
        }
        BandFormat::Float => {
            let values: Vec<f32> = data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            // grey floats are stored as equal colour channels
            let expanded: Vec<f32> = match bands {
                1 => values.iter().flat_map(|&v| [v, v, v]).collect(),
                2 => values
                    .chunks_exact(2)
                    .flat_map(|p| [p[0], p[0], p[0], p[1]])
                    .collect(),
                _ => values,
            };
            match bands {
                1 | 3 => Rgb32FImage::from_raw(width, height, expanded).map(DynamicImage::ImageRgb32F),
                _ => Rgba32FImage::from_raw(width, height, expanded).map(DynamicImage::ImageRgba32F),
            }
        }
    };
    pixels.ok_or_else(bad_len)
}

impl ImageRef {
    /// Serialize pixels and the metadata attached to them: geometry, page
    /// delays, loop count, resolution, ICC profile and EXIF. See
    /// [`ImageRef::from_raw_bytes`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let img = self.snapshot()?;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        encoder
            .write_all(&samples(&img))
            .map_err(|e| ImageRefError::encode_failed("raw", e.to_string()))?;
        let payload = encoder
            .finish()
            .map_err(|e| ImageRefError::encode_failed("raw", e.to_string()))?;

        let delay_count = u32::try_from(img.delays.len())
            .map_err(|_| ImageRefError::encode_failed("raw", "too many page delays"))?;
        let (icc, exif) = (img.icc_profile(), img.exif());
        let mut out = Vec::with_capacity(
            HEADER_LEN
                + img.delays.len() * 4
                + icc.map_or(0, <[u8]>::len)
                + exif.map_or(0, <[u8]>::len)
                + payload.len(),
        );
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&img.width().to_le_bytes());
        out.extend_from_slice(&img.height().to_le_bytes());
        out.push(img.bands() as u8);
        out.push(img.band_format().code());
        out.push(img.interpretation().code());
        out.extend_from_slice(&img.page_height().to_le_bytes());
        out.extend_from_slice(&img.orientation().unwrap_or(0).to_le_bytes());
        out.extend_from_slice(&img.loop_count.to_le_bytes());
        out.extend_from_slice(&img.xres.to_le_bytes());
        out.extend_from_slice(&img.yres.to_le_bytes());
        out.extend_from_slice(&delay_count.to_le_bytes());
        out.extend_from_slice(&blob_len(icc)?.to_le_bytes());
        out.extend_from_slice(&blob_len(exif)?.to_le_bytes());
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        for delay in &img.delays {
            out.extend_from_slice(&delay.to_le_bytes());
        }
        out.extend_from_slice(icc.unwrap_or_default());
        out.extend_from_slice(exif.unwrap_or_default());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Rebuild a handle from [`ImageRef::to_bytes`] output.
    pub fn from_raw_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return Err(malformed("not an image-ref raw stream"));
        }
        let mut fields = Fields { bytes, pos: 8 };
        let width = fields.u32()?;
        let height = fields.u32()?;
        let bands = fields.u8()?;
        let format_code = fields.u8()?;
        let format = BandFormat::from_code(format_code)
            .ok_or_else(|| malformed(format!("unknown band format code {format_code}")))?;
        let interpretation_code = fields.u8()?;
        let interpretation = Interpretation::from_code(interpretation_code).ok_or_else(|| {
            malformed(format!("unknown interpretation code {interpretation_code}"))
        })?;
        let page_height = fields.u32()?;
        let orientation = fields.u16()?;
        let loop_count = fields.u32()?;
        let xres = fields.f64()?;
        let yres = fields.f64()?;
        let delay_count = fields.u32()? as usize;
        let icc_len = fields.u32()? as usize;
        let exif_len = fields.u32()? as usize;
        let payload_len = fields.u64()?;

        if !(1..=4).contains(&bands) {
            return Err(malformed(format!("invalid band count {bands}")));
        }
        check_dimensions(width, height)?;
        if !(xres.is_finite() && xres > 0.0 && yres.is_finite() && yres > 0.0) {
            return Err(malformed("raw resolution must be positive"));
        }

        let delays = fields
            .take(delay_count.saturating_mul(4))?
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let icc = fields.take(icc_len)?;
        let exif = fields.take(exif_len)?;
        let payload = Some(fields.rest())
            .filter(|p| p.len() as u64 == payload_len)
            .ok_or_else(|| malformed("raw payload truncated"))?;

        let expected =
            width as u64 * height as u64 * bands as u64 * sample_size(format) as u64;
        let mut data = Vec::with_capacity(expected as usize);
        ZlibDecoder::new(payload)
            .take(expected + 1)
            .read_to_end(&mut data)
            .map_err(|e| malformed(format!("raw payload: {e}")))?;
        if data.len() as u64 != expected {
            return Err(malformed("raw payload length does not match the header"));
        }

        let pixels = pixels_from_samples(width, height, bands, format, data)?;
        let page_height = if page_height == 0 || page_height > height {
            height
        } else {
            page_height
        };
        let mut native = NativeImage::new(pixels)
            .with_interpretation(interpretation)
            .with_page_height(page_height);
        native.orientation = (orientation != 0).then_some(orientation);
        native.delays = delays;
        native.loop_count = loop_count;
        native.xres = xres;
        native.yres = yres;
        native.icc = (!icc.is_empty()).then(|| Arc::new(icc.to_vec()));
        native.exif = (!exif.is_empty()).then(|| Arc::new(exif.to_vec()));
        Ok(Self::from_native(native, ImageType::Unknown))
    }

    /// A copy of the current pixels.
    pub fn to_image(&self) -> Result<DynamicImage> {
        Ok(self.snapshot()?.pixels().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::native::stack_frames;

    fn handle(pixels: DynamicImage) -> ImageRef {
        ImageRef::from_native(NativeImage::new(pixels), ImageType::Png)
    }

    #[test]
    fn rgb_round_trip() {
        let img = handle(DynamicImage::ImageRgb8(RgbImage::from_fn(5, 3, |x, y| {
            Rgb([x as u8 * 10, y as u8 * 20, 7])
        })));
        let bytes = img.to_bytes().unwrap();
        assert_eq!(&bytes[..8], MAGIC);
        let back = ImageRef::from_raw_bytes(&bytes).unwrap();
        assert_eq!(back.to_image().unwrap(), img.to_image().unwrap());
        assert_eq!(back.interpretation(), Some(Interpretation::Srgb));
    }

    #[test]
    fn grey_float_keeps_one_band() {
        let img = handle(DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([128]))));
        img.cast(BandFormat::Float).unwrap();
        let back = ImageRef::from_raw_bytes(&img.to_bytes().unwrap()).unwrap();
        assert_eq!(back.bands(), 1);
        assert_eq!(back.band_format(), Some(BandFormat::Float));
        let v = back.get_point(1, 1).unwrap();
        assert_eq!(v.len(), 1);
    }

    #[test]
    fn page_height_and_orientation_survive() {
        let frames = vec![DynamicImage::ImageRgba8(RgbaImage::new(6, 4)); 3];
        let native = NativeImage::new(stack_frames(&frames).unwrap()).with_page_height(4);
        let img = ImageRef::from_native(native, ImageType::Gif);
        img.set_orientation(8).unwrap();
        let back = ImageRef::from_raw_bytes(&img.to_bytes().unwrap()).unwrap();
        assert_eq!(back.pages(), 3);
        assert_eq!(back.page_height(), 4);
        assert_eq!(back.orientation(), Some(8));
        assert!(back.has_alpha());
    }

    #[test]
    fn delays_loop_resolution_and_profiles_survive() {
        let frames = vec![DynamicImage::ImageRgb8(RgbImage::new(3, 2)); 2];
        let mut native = NativeImage::new(stack_frames(&frames).unwrap()).with_page_height(2);
        native.delays = vec![40, 120];
        native.loop_count = 3;
        native.xres = 11.811;
        native.yres = 5.0;
        native.icc = Some(Arc::new(crate::engine::profile::ProfileId::Srgb.bytes().to_vec()));
        native.exif = Some(Arc::new(b"II*\0\x08\0\0\0\0\0\0\0\0\0".to_vec()));
        let img = ImageRef::from_native(native, ImageType::Gif);

        let back = ImageRef::from_raw_bytes(&img.to_bytes().unwrap()).unwrap();
        assert_eq!(back.page_delay(), vec![40, 120]);
        assert_eq!(back.loop_count(), 3);
        assert_eq!(back.resolution_x(), 11.811);
        assert_eq!(back.resolution_y(), 5.0);
        let icc = back.snapshot().unwrap().icc_profile().map(<[u8]>::to_vec);
        assert_eq!(icc.as_deref(), Some(crate::engine::profile::ProfileId::Srgb.bytes()));
        assert!(back.has_exif());
        assert_eq!(back.to_image().unwrap(), img.to_image().unwrap());
    }

    #[test]
    fn plain_images_carry_no_profiles() {
        let img = handle(DynamicImage::ImageRgb8(RgbImage::new(2, 2)));
        let back = ImageRef::from_raw_bytes(&img.to_bytes().unwrap()).unwrap();
        assert!(!back.has_icc_profile());
        assert!(!back.has_exif());
        assert!(back.page_delay().is_empty());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(ImageRef::from_raw_bytes(b"nope").is_err());
        let img = handle(DynamicImage::ImageRgb8(RgbImage::new(2, 2)));
        let mut bytes = img.to_bytes().unwrap();
        bytes[16] = 9;
        assert!(ImageRef::from_raw_bytes(&bytes).is_err());
        let mut bytes = img.to_bytes().unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(ImageRef::from_raw_bytes(&bytes).is_err());
        // ICC length pointing past the end of the stream
        let mut bytes = img.to_bytes().unwrap();
        bytes[49..53].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(ImageRef::from_raw_bytes(&bytes).is_err());
    }
}
