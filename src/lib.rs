// lib.rs
//
// image-ref: a thread-safe handle over reference-counted, immutable images
//
// Design goals:
// - One native object per handle, swapped atomically on every mutation
// - A failed operation never leaves a half-applied change behind
// - Derived state (premultiplication, pages, orientation) stays consistent
//   across arbitrarily long mutation chains
// - Format-aware export with per-codec parameter sets

// Memory allocator optimization - jemalloc for better performance
// Note: jemalloc is not supported on Windows/MSVC, so we exclude it on that platform
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod codecs;
pub mod engine;
pub mod error;
pub mod ops;

pub use engine::{pixelate, ExportParams, ImageMetadata, ImageRef, ImportParams};
pub use error::{ImageRefError, Result};
pub use ops::ImageType;

/// Get library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Formats the decoder accepts.
pub fn supported_input_formats() -> Vec<ImageType> {
    vec![
        ImageType::Jpeg,
        ImageType::Png,
        ImageType::Webp,
        ImageType::Gif,
        ImageType::Tiff,
        ImageType::Bmp,
    ]
}

/// Formats the export dispatcher can write.
pub fn supported_output_formats() -> Vec<ImageType> {
    vec![
        ImageType::Jpeg,
        ImageType::Png,
        ImageType::Webp,
        ImageType::Tiff,
        ImageType::Gif,
        ImageType::Avif,
    ]
}
