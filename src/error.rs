// src/error.rs
//
// Unified error handling for image-ref
// Uses thiserror for simple, type-safe error handling
//
// Error Taxonomy:
// - Decode: malformed or unsupported input at load time
// - Primitive: an operation rejected its input or parameters
// - Parameter: caller asked for something invalid (checked before any primitive runs)
// - Resource: allocation, I/O or encoder failures

use std::borrow::Cow;
use thiserror::Error;

/// Error taxonomy.
///
/// A failed mutation never changes the handle, whatever the category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCategory {
    /// Malformed or unsupported input at load time
    Decode,
    /// An operation primitive rejected its input
    Primitive,
    /// Invalid request, detected before any primitive runs
    Parameter,
    /// Allocation, I/O, encoder or internal failures
    Resource,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Decode => "Decode",
            ErrorCategory::Primitive => "Primitive",
            ErrorCategory::Parameter => "Parameter",
            ErrorCategory::Resource => "Resource",
        }
    }
}

/// image-ref error types
#[derive(Debug, Error)]
pub enum ImageRefError {
    // File I/O Errors
    #[error("Failed to read file '{path}': {source}")]
    FileReadFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to memory-map file '{path}': {source}")]
    MmapFailed {
        path: Cow<'static, str>,
        #[source]
        source: std::io::Error,
    },

    // Decode Errors
    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: Cow<'static, str> },

    #[error("Failed to decode image: {message}")]
    DecodeFailed { message: Cow<'static, str> },

    #[error("Corrupted image data")]
    CorruptedImage,

    // Size Limit Errors
    #[error("Image dimension {dimension} exceeds maximum {max}")]
    DimensionExceedsLimit { dimension: u32, max: u32 },

    #[error("Image pixel count {pixels} exceeds maximum {max}")]
    PixelCountExceedsLimit { pixels: u64, max: u64 },

    // Primitive Errors
    #[error("Area ({left}+{width}, {top}+{height}) exceeds image dimensions ({img_width}x{img_height})")]
    InvalidArea {
        left: u32,
        top: u32,
        width: u32,
        height: u32,
        img_width: u32,
        img_height: u32,
    },

    #[error("Resize failed ({source_width}x{source_height} -> {target_width}x{target_height}): {message}")]
    ResizeFailed {
        source_width: u32,
        source_height: u32,
        target_width: u32,
        target_height: u32,
        message: Cow<'static, str>,
    },

    #[error("{operation} failed: {message}")]
    OperationFailed {
        operation: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Parameter Errors
    #[error("Cannot export to {format}: format is not encodable")]
    UnsupportedExportFormat { format: Cow<'static, str> },

    #[error("Invalid value for {name}: {value}. {reason}")]
    InvalidArgument {
        name: Cow<'static, str>,
        value: Cow<'static, str>,
        reason: Cow<'static, str>,
    },

    #[error("Argument lengths differ: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },

    #[error("Image handle is closed")]
    ImageClosed,

    // Encode Errors
    #[error("Failed to encode as {format}: {message}")]
    EncodeFailed {
        format: Cow<'static, str>,
        message: Cow<'static, str>,
    },

    // Internal Errors
    #[error("Internal error: {message}")]
    InternalPanic { message: Cow<'static, str> },
}

// Constructor Helpers
impl ImageRefError {
    pub fn file_read_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            source,
        }
    }

    pub fn mmap_failed(path: impl Into<Cow<'static, str>>, source: std::io::Error) -> Self {
        Self::MmapFailed {
            path: path.into(),
            source,
        }
    }

    pub fn unsupported_format(format: impl Into<Cow<'static, str>>) -> Self {
        Self::UnsupportedFormat {
            format: format.into(),
        }
    }

    pub fn decode_failed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::DecodeFailed {
            message: message.into(),
        }
    }

    pub fn corrupted_image() -> Self {
        Self::CorruptedImage
    }

    pub fn dimension_exceeds_limit(dimension: u32, max: u32) -> Self {
        Self::DimensionExceedsLimit { dimension, max }
    }

    pub fn pixel_count_exceeds_limit(pixels: u64, max: u64) -> Self {
        Self::PixelCountExceedsLimit { pixels, max }
    }

    pub fn invalid_area(
        left: u32,
        top: u32,
        width: u32,
        height: u32,
        img_width: u32,
        img_height: u32,
    ) -> Self {
        Self::InvalidArea {
            left,
            top,
            width,
            height,
            img_width,
            img_height,
        }
    }

    pub fn resize_failed(
        source_dims: (u32, u32),
        target_dims: (u32, u32),
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::ResizeFailed {
            source_width: source_dims.0,
            source_height: source_dims.1,
            target_width: target_dims.0,
            target_height: target_dims.1,
            message: message.into(),
        }
    }

    pub fn operation_failed(
        operation: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn unsupported_export_format(format: impl Into<Cow<'static, str>>) -> Self {
        Self::UnsupportedExportFormat {
            format: format.into(),
        }
    }

    pub fn invalid_argument(
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
        reason: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn length_mismatch(left: usize, right: usize) -> Self {
        Self::LengthMismatch { left, right }
    }

    pub fn image_closed() -> Self {
        Self::ImageClosed
    }

    pub fn encode_failed(
        format: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self::EncodeFailed {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn internal_panic(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InternalPanic {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (caller can fix it)
    ///
    /// Parameter and Resource errors are recoverable: pick another format,
    /// fix the arguments, free memory. Decode and Primitive errors depend on
    /// the input pixels and will fail the same way on retry.
    pub fn is_recoverable(&self) -> bool {
        match self.category() {
            ErrorCategory::Parameter | ErrorCategory::Resource => true,
            ErrorCategory::Decode | ErrorCategory::Primitive => false,
        }
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnsupportedFormat { .. } | Self::DecodeFailed { .. } | Self::CorruptedImage => {
                ErrorCategory::Decode
            }

            Self::InvalidArea { .. }
            | Self::ResizeFailed { .. }
            | Self::OperationFailed { .. } => ErrorCategory::Primitive,

            Self::UnsupportedExportFormat { .. }
            | Self::InvalidArgument { .. }
            | Self::LengthMismatch { .. }
            | Self::ImageClosed => ErrorCategory::Parameter,

            // File errors count as resource errors: they usually mean disk or
            // permission trouble that the caller can fix.
            Self::FileReadFailed { .. }
            | Self::MmapFailed { .. }
            | Self::DimensionExceedsLimit { .. }
            | Self::PixelCountExceedsLimit { .. }
            | Self::EncodeFailed { .. }
            | Self::InternalPanic { .. } => ErrorCategory::Resource,
        }
    }
}

// Result type alias
pub type Result<T> = std::result::Result<T, ImageRefError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ImageRefError::unsupported_export_format("heif");
        assert!(err.to_string().contains("heif"));
        let err = ImageRefError::length_mismatch(3, 4);
        assert_eq!(err.to_string(), "Argument lengths differ: 3 vs 4");
    }

    #[test]
    fn test_error_recoverable() {
        assert!(ImageRefError::image_closed().is_recoverable());
        assert!(ImageRefError::invalid_argument("factor", "0.5", "must be >= 1").is_recoverable());
        assert!(ImageRefError::encode_failed("png", "boom").is_recoverable());
        assert!(!ImageRefError::decode_failed("test").is_recoverable());
        assert!(!ImageRefError::invalid_area(0, 0, 100, 100, 50, 50).is_recoverable());
    }

    #[test]
    fn test_error_category_decode() {
        assert_eq!(
            ImageRefError::unsupported_format("svg").category(),
            ErrorCategory::Decode
        );
        assert_eq!(
            ImageRefError::decode_failed("test").category(),
            ErrorCategory::Decode
        );
        assert_eq!(
            ImageRefError::corrupted_image().category(),
            ErrorCategory::Decode
        );
    }

    #[test]
    fn test_error_category_primitive() {
        assert_eq!(
            ImageRefError::invalid_area(0, 0, 100, 100, 50, 50).category(),
            ErrorCategory::Primitive
        );
        assert_eq!(
            ImageRefError::resize_failed((100, 100), (0, 50), "zero").category(),
            ErrorCategory::Primitive
        );
        assert_eq!(
            ImageRefError::operation_failed("rank", "window too large").category(),
            ErrorCategory::Primitive
        );
    }

    #[test]
    fn test_error_category_parameter() {
        assert_eq!(
            ImageRefError::unsupported_export_format("jp2k").category(),
            ErrorCategory::Parameter
        );
        assert_eq!(
            ImageRefError::length_mismatch(1, 2).category(),
            ErrorCategory::Parameter
        );
        assert_eq!(
            ImageRefError::image_closed().category(),
            ErrorCategory::Parameter
        );
    }

    #[test]
    fn test_error_category_resource() {
        assert_eq!(
            ImageRefError::dimension_exceeds_limit(40000, 32768).category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            ImageRefError::file_read_failed(
                "test.jpg",
                std::io::Error::from(std::io::ErrorKind::NotFound)
            )
            .category(),
            ErrorCategory::Resource
        );
        assert_eq!(
            ImageRefError::internal_panic("test").category(),
            ErrorCategory::Resource
        );
    }

    #[test]
    fn test_error_category_as_str() {
        assert_eq!(ErrorCategory::Decode.as_str(), "Decode");
        assert_eq!(ErrorCategory::Parameter.as_str(), "Parameter");
    }
}
