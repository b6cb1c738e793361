// src/engine/io.rs
//
// I/O: the source buffer a handle retains, file mapping, format sniffing,
// and ICC/EXIF extraction from encoded containers.

use crate::error::ImageRefError;
use crate::ops::ImageType;
use image::ImageFormat;
use img_parts::{DynImage, ImageEXIF, ImageICC};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

/// Encoded bytes a handle was built from, retained until close.
#[derive(Clone, Debug)]
pub enum SourceBuffer {
    /// In-memory image data
    Memory(Arc<[u8]>),
    /// Memory-mapped file (zero-copy access)
    Mapped(Arc<Mmap>),
}

impl SourceBuffer {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SourceBuffer::Memory(data) => data,
            SourceBuffer::Mapped(mmap) => mmap.as_ref(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Map a file into memory.
pub(crate) fn map_file(path: &Path) -> Result<SourceBuffer, ImageRefError> {
    let display = path.to_string_lossy().to_string();
    let file =
        File::open(path).map_err(|e| ImageRefError::file_read_failed(display.clone(), e))?;
    // Safety: the file is assumed not to be truncated while the handle is alive.
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| ImageRefError::mmap_failed(display, e))?;
    Ok(SourceBuffer::Mapped(Arc::new(mmap)))
}

/// Check if data is AVIF format (ISOBMFF with 'avif' brand)
pub(crate) fn is_avif_data(data: &[u8]) -> bool {
    has_ftyp_brand(data, &[b"avif", b"avis"])
}

fn is_heif_data(data: &[u8]) -> bool {
    has_ftyp_brand(data, &[b"heic", b"heix", b"hevc", b"hevx", b"mif1", b"msf1"])
}

fn has_ftyp_brand(data: &[u8], brands: &[&[u8; 4]]) -> bool {
    if data.len() < 12 || &data[4..8] != b"ftyp" {
        return false;
    }
    let ftyp_size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if ftyp_size > data.len() || ftyp_size < 12 {
        return false;
    }
    let matches = |brand: &[u8]| brands.iter().any(|b| b.as_slice() == brand);
    if matches(&data[8..12]) {
        return true;
    }
    // compatible brands follow the minor version
    let mut offset = 16;
    while offset + 4 <= ftyp_size {
        if matches(&data[offset..offset + 4]) {
            return true;
        }
        offset += 4;
    }
    false
}

fn is_svg_data(data: &[u8]) -> bool {
    let head = &data[..data.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    (trimmed.starts_with("<?xml") || trimmed.starts_with("<svg")) && text.contains("<svg")
}

/// Detect the container format from magic bytes. Raster containers are
/// recognised by the image crate; HEIF brands, PDF, JPEG 2000 and SVG have
/// no decoder there and are checked here.
pub fn sniff_format(data: &[u8]) -> ImageType {
    let guessed = match image::guess_format(data) {
        Ok(ImageFormat::Jpeg) => Some(ImageType::Jpeg),
        Ok(ImageFormat::Png) => Some(ImageType::Png),
        Ok(ImageFormat::WebP) => Some(ImageType::Webp),
        Ok(ImageFormat::Gif) => Some(ImageType::Gif),
        Ok(ImageFormat::Tiff) => Some(ImageType::Tiff),
        Ok(ImageFormat::Bmp) => Some(ImageType::Bmp),
        Ok(ImageFormat::Avif) => Some(ImageType::Avif),
        _ => None,
    };
    if let Some(format) = guessed {
        return format;
    }
    if is_avif_data(data) {
        ImageType::Avif
    } else if is_heif_data(data) {
        ImageType::Heif
    } else if data.starts_with(b"%PDF") {
        ImageType::Pdf
    } else if data.starts_with(&[0, 0, 0, 0x0C, b'j', b'P', b' ', b' '])
        || data.starts_with(&[0xFF, 0x4F, 0xFF, 0x51])
    {
        ImageType::Jp2k
    } else if is_svg_data(data) {
        ImageType::Svg
    } else {
        ImageType::Unknown
    }
}

/// Validate ICC profile header
/// ICC profiles must start with a 128-byte header containing specific fields
pub(crate) fn validate_icc_profile(icc_data: &[u8]) -> bool {
    if icc_data.len() < 128 {
        return false;
    }
    let profile_size =
        u32::from_be_bytes([icc_data[0], icc_data[1], icc_data[2], icc_data[3]]) as usize;
    if profile_size != icc_data.len() {
        return false;
    }
    // Major version is typically 2, 4 or 5
    if icc_data[8] > 10 {
        return false;
    }
    // CMM type, profile class, colour space and PCS signatures are ASCII
    let ascii = |range: std::ops::Range<usize>| {
        icc_data[range]
            .iter()
            .all(|&b| (32..=126).contains(&b) || b == 0)
    };
    ascii(4..8) && ascii(12..16) && ascii(16..20) && ascii(20..24)
}

fn container(data: &[u8]) -> Option<DynImage> {
    DynImage::from_bytes(data.to_vec().into()).ok().flatten()
}

/// Extract ICC profile from JPEG (APP2), PNG (iCCP) or WebP (ICCP) data.
pub fn extract_icc_profile(data: &[u8]) -> Option<Vec<u8>> {
    let icc = container(data)?.icc_profile()?.to_vec();
    validate_icc_profile(&icc).then_some(icc)
}

/// Extract the raw EXIF block (TIFF structure, no "Exif\0\0" prefix).
pub fn extract_exif(data: &[u8]) -> Option<Vec<u8>> {
    let exif = container(data)?.exif()?;
    let bytes = exif.strip_prefix(b"Exif\0\0").unwrap_or(&exif);
    (!bytes.is_empty()).then(|| bytes.to_vec())
}
