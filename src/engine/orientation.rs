// src/engine/orientation.rs
//
// EXIF orientation: read with kamadak-exif, written into encoded output
// with little_exif.

use crate::engine::common::EngineResult;
use crate::error::ImageRefError;
use crate::ops::ImageType;
use little_exif::exif_tag::ExifTag;
use little_exif::filetype::FileExtension;
use little_exif::metadata::Metadata;
use std::io::Cursor;

/// Extract EXIF Orientation tag (1-8) from an encoded container.
/// Returns None if missing or invalid.
pub fn detect_exif_orientation(bytes: &[u8]) -> Option<u16> {
    let mut cursor = Cursor::new(bytes);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;
    orientation_of(&exif)
}

/// Orientation from a raw EXIF block (TIFF header first).
pub fn read_orientation(raw: &[u8]) -> Option<u16> {
    let exif = exif::Reader::new().read_raw(raw.to_vec()).ok()?;
    orientation_of(&exif)
}

fn orientation_of(exif: &exif::Exif) -> Option<u16> {
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    // exif crate can represent as Short/Long; use get_uint for safety
    let orientation = field.value.get_uint(0)? as u16;
    (1..=8).contains(&orientation).then_some(orientation)
}

/// Containers little_exif can rewrite.
fn file_extension(format: ImageType) -> Option<FileExtension> {
    match format {
        ImageType::Jpeg => Some(FileExtension::JPEG),
        ImageType::Png => Some(FileExtension::PNG {
            as_zTXt_chunk: false,
        }),
        ImageType::Webp => Some(FileExtension::WEBP),
        _ => None,
    }
}

/// Set the Orientation tag in already encoded JPEG, PNG or WebP bytes,
/// keeping any EXIF tags the container already carries. Other formats are
/// returned unchanged.
pub(crate) fn stamp_orientation(
    encoded: Vec<u8>,
    format: ImageType,
    orientation: u16,
) -> EngineResult<Vec<u8>> {
    let (Some(read_as), Some(write_as)) = (file_extension(format), file_extension(format)) else {
        return Ok(encoded);
    };
    let mut metadata = Metadata::new_from_vec(&encoded, read_as).unwrap_or_else(|_| Metadata::new());
    metadata.set_tag(ExifTag::Orientation(vec![orientation]));
    let mut out = encoded;
    metadata.write_to_vec(&mut out, write_as).map_err(|e| {
        ImageRefError::encode_failed(format.name(), format!("failed to write EXIF orientation: {e}"))
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    fn encoded(format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 4, Rgb([10, 20, 30])));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), format).unwrap();
        out
    }

    #[test]
    fn stamps_jpeg_without_exif() {
        let out = stamp_orientation(encoded(ImageFormat::Jpeg), ImageType::Jpeg, 6).unwrap();
        assert_eq!(detect_exif_orientation(&out), Some(6));
        assert!(image::load_from_memory(&out).is_ok());
    }

    #[test]
    fn restamps_existing_orientation() {
        let once = stamp_orientation(encoded(ImageFormat::Png), ImageType::Png, 8).unwrap();
        let twice = stamp_orientation(once, ImageType::Png, 3).unwrap();
        assert_eq!(detect_exif_orientation(&twice), Some(3));
    }

    #[test]
    fn other_containers_pass_through() {
        let gif = encoded(ImageFormat::Gif);
        assert_eq!(stamp_orientation(gif.clone(), ImageType::Gif, 6).unwrap(), gif);
    }
}
