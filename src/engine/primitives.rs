// src/engine/primitives.rs
//
// Operation primitives. Each takes a native image by reference and builds a
// new one; the input is never modified, so a failed primitive leaves the
// caller's state untouched.

pub(crate) mod bands;
pub(crate) mod colour;
pub(crate) mod compose;
pub(crate) mod geometry;
pub(crate) mod icc;

use crate::engine::common::EngineResult;
use crate::engine::native::{stack_frames, NativeImage};
use image::DynamicImage;
use rayon::prelude::*;

/// Apply `f` to every page and restack. Single-page images go straight
/// through `f`. The result's page height is the new frame height.
pub(crate) fn map_frames<F>(img: &NativeImage, f: F) -> EngineResult<NativeImage>
where
    F: Fn(&DynamicImage) -> EngineResult<DynamicImage> + Sync,
{
    if !img.is_multi_page() {
        let out = f(img.pixels())?;
        return Ok(img.derive(out));
    }
    let frames = img
        .frames()
        .par_iter()
        .map(&f)
        .collect::<EngineResult<Vec<_>>>()?;
    let frame_height = frames.first().map(|f| f.height()).unwrap_or(0);
    let stacked = stack_frames(&frames)?;
    Ok(img.derive(stacked).with_page_height(frame_height))
}
