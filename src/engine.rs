// src/engine.rs
//
// The core of image-ref. A handle over an immutable native image that:
// 1. Decodes once into a reference-counted native object
// 2. Runs every mutation on a draft and swaps the result in atomically
// 3. Exports snapshots through per-format parameter sets
//
// This file is a facade over the modules in engine/

use once_cell::sync::OnceCell;
use tracing::debug;

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height).
/// Images larger than 32768x32768 are rejected to prevent decompression bombs.
/// This is the same limit used by libvips/sharp.
pub const MAX_DIMENSION: u32 = 32768;

/// Maximum allowed total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA. Beyond this is likely malicious.
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULE DECOMPOSITION
// =============================================================================

mod api;
pub(crate) mod common;
mod decoder;
mod encoder;
mod export;
mod io;
mod native;
mod orientation;
pub(crate) mod params;
mod premultiply;
mod primitives;
mod profile;
mod raw;
mod resample;
mod state;
mod transform;

pub use api::ImageRef;
pub use common::EngineResult;
pub use decoder::check_dimensions;
pub use export::ImageMetadata;
pub use io::{sniff_format, SourceBuffer};
pub use native::{NativeImage, NativeRef};
pub use params::{
    map_generic, AvifExportParams, CodecParams, ExportParams, GifExportParams,
    HeifExportParams, ImportParams, Jp2kExportParams, JpegExportParams, PngExportParams,
    PngFilter, SubsampleMode, TiffCompression, TiffExportParams, TiffPredictor,
    WebpExportParams,
};
pub use premultiply::PremultiplyState;
pub use profile::ProfileId;
pub use transform::{pixelate, ImageComposite};

// =============================================================================
// STARTUP
// =============================================================================

static STARTED: OnceCell<()> = OnceCell::new();

/// One-time engine initialization. Safe to call any number of times from
/// any thread; handle constructors call it for you.
pub fn startup() {
    STARTED.get_or_init(|| {
        debug!(
            target: "image_ref::engine",
            version = env!("CARGO_PKG_VERSION"),
            rayon_threads = rayon::current_num_threads(),
            outputs = ?crate::supported_output_formats(),
            "engine started"
        );
    });
}

/// Whether `startup` has run.
pub fn is_started() -> bool {
    STARTED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_is_idempotent() {
        startup();
        startup();
        assert!(is_started());
    }

    #[test]
    fn constructors_start_the_engine() {
        let _img = ImageRef::black(2, 2).unwrap();
        assert!(is_started());
    }

    #[test]
    fn limits_are_consistent() {
        assert!((MAX_DIMENSION as u64) * (MAX_DIMENSION as u64) > MAX_PIXELS);
        assert!(check_dimensions(MAX_DIMENSION, 1).is_ok());
        assert!(check_dimensions(MAX_DIMENSION + 1, 1).is_err());
        assert!(check_dimensions(20_000, 20_000).is_err());
    }
}
