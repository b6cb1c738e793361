// src/engine/common.rs
//
// Common utilities shared across engine modules.

use crate::error::ImageRefError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Result type used throughout the engine.
pub type EngineResult<T> = std::result::Result<T, ImageRefError>;

/// Run a codec call, turning a panic into `InternalPanic`.
///
/// mozjpeg reports libjpeg errors by unwinding, and the image/zune codecs
/// may panic on hostile input. Neither may take the handle lock down with it.
pub(crate) fn run_with_panic_policy<T, F>(context: &'static str, f: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            warn!(target: "image_ref::engine", context, %message, "codec panicked");
            Err(ImageRefError::internal_panic(format!("{context}: {message}")))
        }
    }
}
