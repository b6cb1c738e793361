// src/ops.rs
//
// Vocabulary shared by the handle, the primitives and the export layer.
// These are plain values: cheap to copy, no references, no lifetimes.

use bitflags::bitflags;
use std::fmt;

/// Encoding of an image buffer, detected on load or chosen on export.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageType {
    Unknown,
    Jpeg,
    Png,
    Webp,
    Gif,
    Tiff,
    Bmp,
    Avif,
    Heif,
    Jp2k,
    Svg,
    Pdf,
}

impl ImageType {
    /// Lower-case name, as used in error messages and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
            Self::Bmp => "bmp",
            Self::Avif => "avif",
            Self::Heif => "heif",
            Self::Jp2k => "jp2k",
            Self::Svg => "svg",
            Self::Pdf => "pdf",
        }
    }

    /// Formats this build can write.
    pub fn is_encodable(&self) -> bool {
        matches!(
            self,
            Self::Jpeg | Self::Png | Self::Webp | Self::Tiff | Self::Gif | Self::Avif
        )
    }

    pub fn from_str(format: &str) -> Result<Self, String> {
        match format.to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            "gif" => Ok(Self::Gif),
            "tiff" | "tif" => Ok(Self::Tiff),
            "bmp" => Ok(Self::Bmp),
            "avif" => Ok(Self::Avif),
            "heif" | "heic" => Ok(Self::Heif),
            "jp2k" | "jp2" => Ok(Self::Jp2k),
            "svg" => Ok(Self::Svg),
            "pdf" => Ok(Self::Pdf),
            other => Err(format!("unsupported format: {other}")),
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric format of every band in the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BandFormat {
    UChar,
    UShort,
    Float,
}

impl BandFormat {
    pub(crate) fn code(&self) -> u8 {
        match self {
            Self::UChar => 0,
            Self::UShort => 1,
            Self::Float => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::UChar),
            1 => Some(Self::UShort),
            2 => Some(Self::Float),
            _ => None,
        }
    }
}

/// How the bands of an image should be read.
///
/// Float images in `Srgb`, `ScRgb` or `BW` hold values in `0.0..=1.0`.
/// `Hsv`, `Lab` and `Lch` hold raw channel values: hue in degrees,
/// lightness in `0..=100`, saturation and value in `0.0..=1.0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Interpretation {
    Multiband,
    BW,
    Grey16,
    Srgb,
    Rgb,
    Rgb16,
    ScRgb,
    Hsv,
    Lab,
    Lch,
    Cmyk,
}

impl Interpretation {
    pub(crate) fn is_grey(&self) -> bool {
        matches!(self, Self::BW | Self::Grey16)
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            Self::Multiband => 0,
            Self::BW => 1,
            Self::Grey16 => 2,
            Self::Srgb => 3,
            Self::Rgb => 4,
            Self::Rgb16 => 5,
            Self::ScRgb => 6,
            Self::Hsv => 7,
            Self::Lab => 8,
            Self::Lch => 9,
            Self::Cmyk => 10,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Multiband,
            1 => Self::BW,
            2 => Self::Grey16,
            3 => Self::Srgb,
            4 => Self::Rgb,
            5 => Self::Rgb16,
            6 => Self::ScRgb,
            7 => Self::Hsv,
            8 => Self::Lab,
            9 => Self::Lch,
            10 => Self::Cmyk,
            _ => return None,
        })
    }
}

/// Resampling kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Kernel {
    #[default]
    Auto,
    Nearest,
    Linear,
    Cubic,
    Mitchell,
    Lanczos2,
    Lanczos3,
}

/// Rotation in multiples of 90 degrees, clockwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Angle {
    D0,
    D90,
    D180,
    D270,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Horizontal,
    Vertical,
}

/// Strategy for choosing the window kept by smart crops and cropping thumbnails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Interesting {
    /// Thumbnails: fit inside the box, never crop.
    #[default]
    None,
    Centre,
    Entropy,
    Attention,
    Low,
    High,
    All,
}

/// Which way a thumbnail may change size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Size {
    #[default]
    Both,
    Up,
    Down,
    Force,
}

/// How new pixels are generated when embedding into a larger canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtendStrategy {
    Black,
    Copy,
    Repeat,
    Mirror,
    White,
    Background(ColorRgba),
}

/// Blend modes understood by `composite`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlendMode {
    Clear,
    Source,
    Over,
    Dest,
    DestOver,
    Add,
    Multiply,
    Screen,
    Darken,
    Lighten,
    Difference,
    Exclusion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ColorRgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl From<Color> for ColorRgba {
    fn from(c: Color) -> Self {
        Self {
            r: c.r,
            g: c.g,
            b: c.b,
            a: 255,
        }
    }
}

bitflags! {
    /// Metadata kept by `remove_metadata`.
    ///
    /// The ICC profile, orientation and page height always survive: later
    /// operations need them to display and split the image correctly.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct KeepMetadata: u8 {
        const EXIF = 0b0001;
        const RESOLUTION = 0b0010;
        const ANIMATION = 0b0100;
    }
}

/// Rotation encoded by an EXIF orientation value, plus whether the image is
/// also mirrored.
///
/// Orientations outside `1..=8` are treated as upright.
pub fn rotation_angle_from_exif(orientation: u16) -> (Angle, bool) {
    match orientation {
        0..=2 => (Angle::D0, orientation == 2),
        3 | 4 => (Angle::D180, orientation == 4),
        5 | 8 => (Angle::D90, orientation == 5),
        6 | 7 => (Angle::D270, orientation == 7),
        _ => (Angle::D0, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_type_from_str_accepts_aliases() {
        assert_eq!(ImageType::from_str("JPG"), Ok(ImageType::Jpeg));
        assert_eq!(ImageType::from_str("tif"), Ok(ImageType::Tiff));
        assert_eq!(ImageType::from_str("heic"), Ok(ImageType::Heif));
        assert!(ImageType::from_str("psd").is_err());
    }

    #[test]
    fn encodable_set_excludes_heif_and_jp2k() {
        assert!(ImageType::Avif.is_encodable());
        assert!(ImageType::Gif.is_encodable());
        assert!(!ImageType::Heif.is_encodable());
        assert!(!ImageType::Jp2k.is_encodable());
        assert!(!ImageType::Unknown.is_encodable());
        assert!(!ImageType::Bmp.is_encodable());
    }

    #[test]
    fn exif_orientation_table() {
        assert_eq!(rotation_angle_from_exif(1), (Angle::D0, false));
        assert_eq!(rotation_angle_from_exif(2), (Angle::D0, true));
        assert_eq!(rotation_angle_from_exif(3), (Angle::D180, false));
        assert_eq!(rotation_angle_from_exif(4), (Angle::D180, true));
        assert_eq!(rotation_angle_from_exif(5), (Angle::D90, true));
        assert_eq!(rotation_angle_from_exif(6), (Angle::D270, false));
        assert_eq!(rotation_angle_from_exif(7), (Angle::D270, true));
        assert_eq!(rotation_angle_from_exif(8), (Angle::D90, false));
        assert_eq!(rotation_angle_from_exif(42), (Angle::D0, false));
    }

    #[test]
    fn codes_round_trip() {
        for f in [BandFormat::UChar, BandFormat::UShort, BandFormat::Float] {
            assert_eq!(BandFormat::from_code(f.code()), Some(f));
        }
        assert_eq!(Interpretation::from_code(9), Some(Interpretation::Lch));
        assert_eq!(Interpretation::from_code(200), None);
    }
}
