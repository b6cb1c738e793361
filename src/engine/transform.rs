// src/engine/transform.rs
//
// Mutation methods of ImageRef. Each one runs primitives on a draft of the
// handle state and commits only if every step succeeded.

use crate::engine::api::ImageRef;
use crate::engine::common::EngineResult;
use crate::engine::native::{NativeImage, NativeRef, DEFAULT_RESOLUTION};
use crate::engine::primitives::geometry::{self, Similarity};
use crate::engine::primitives::bands::{self, Arithmetic};
use crate::engine::primitives::{colour, compose, icc};
use crate::engine::profile::ProfileId;
use crate::error::{ImageRefError, Result};
use crate::ops::{
    rotation_angle_from_exif, Angle, BandFormat, BlendMode, Color, ColorRgba, Direction,
    ExtendStrategy, Interesting, Interpretation, KeepMetadata, Kernel, Size,
};
use std::sync::Arc;

/// Rotate a multi-page image by 90 or 270 degrees, keeping every page
/// upright relative to its neighbours and the page order intact.
fn rotate_multi_page(img: &NativeImage, angle: Angle) -> EngineResult<NativeImage> {
    let (width, page_height, pages) = (img.width(), img.page_height(), img.pages());
    let mut strip = img.clone();
    if angle == Angle::D270 {
        strip = geometry::flip(&strip, Direction::Horizontal)?;
    }
    strip = geometry::grid(&strip, page_height, pages, 1)?;
    if angle == Angle::D270 {
        strip = geometry::flip(&strip, Direction::Horizontal)?;
    }
    let rotated = geometry::rotate(&strip, angle)?;
    Ok(rotated.with_page_height(width))
}

impl ImageRef {
    // =========================================================================
    // METADATA
    // =========================================================================

    /// Set the EXIF orientation (1..=8). The pixels are not touched; the tag
    /// is written into the EXIF of exported JPEG, PNG and WebP files.
    pub fn set_orientation(&self, orientation: u16) -> Result<()> {
        if !(1..=8).contains(&orientation) {
            return Err(ImageRefError::invalid_argument(
                "orientation",
                orientation.to_string(),
                "EXIF orientation must be in 1..=8",
            ));
        }
        self.mutate("set_orientation", |draft| {
            draft.edit(|img| img.orientation = Some(orientation));
            Ok(())
        })
    }

    /// Forget the orientation. Exports carrying EXIF mark the image upright.
    pub fn remove_orientation(&self) -> Result<()> {
        self.mutate("remove_orientation", |draft| {
            draft.edit(|img| img.orientation = None);
            Ok(())
        })
    }

    /// Declare the image a stack of pages `page_height` rows tall.
    pub fn set_page_height(&self, page_height: u32) -> Result<()> {
        self.mutate("set_page_height", |draft| {
            let height = draft.image.height();
            if page_height == 0 || page_height > height || height % page_height != 0 {
                return Err(ImageRefError::invalid_argument(
                    "page_height",
                    page_height.to_string(),
                    format!("must divide the image height {height}"),
                ));
            }
            draft.edit(|img| img.page_height = page_height);
            Ok(())
        })
    }

    /// Split the image into `pages` equal pages.
    pub fn set_pages(&self, pages: u32) -> Result<()> {
        self.mutate("set_pages", |draft| {
            let height = draft.image.height();
            if pages == 0 || height % pages != 0 {
                return Err(ImageRefError::invalid_argument(
                    "pages",
                    pages.to_string(),
                    format!("must divide the image height {height}"),
                ));
            }
            draft.edit(|img| img.page_height = height / pages);
            Ok(())
        })
    }

    /// Set per-page delays in milliseconds, one per page.
    pub fn set_page_delay(&self, delays: &[u32]) -> Result<()> {
        self.mutate("set_page_delay", |draft| {
            let pages = draft.image.pages() as usize;
            if delays.len() != pages {
                return Err(ImageRefError::length_mismatch(delays.len(), pages));
            }
            draft.edit(|img| img.delays = delays.to_vec());
            Ok(())
        })
    }

    pub fn remove_icc_profile(&self) -> Result<()> {
        self.mutate("remove_icc_profile", |draft| {
            draft.edit(|img| img.icc = None);
            draft.optimized_profile = None;
            Ok(())
        })
    }

    /// Strip metadata except what `keep` names. The ICC profile, the
    /// orientation and the page height always survive.
    pub fn remove_metadata(&self, keep: KeepMetadata) -> Result<()> {
        self.mutate("remove_metadata", |draft| {
            draft.edit(|img| {
                if !keep.contains(KeepMetadata::EXIF) {
                    img.exif = None;
                }
                if !keep.contains(KeepMetadata::RESOLUTION) {
                    img.xres = DEFAULT_RESOLUTION;
                    img.yres = DEFAULT_RESOLUTION;
                }
                if !keep.contains(KeepMetadata::ANIMATION) {
                    img.delays.clear();
                    img.loop_count = 0;
                }
            });
            Ok(())
        })
    }

    /// Convert the pixels from the embedded profile (sRGB when there is
    /// none) into a compact sRGB profile, or sGray for one or two bands, and
    /// remember which one was used.
    ///
    /// Images without a profile are left alone unless they are CMYK, which
    /// then fails: there is no default CMYK profile to convert from.
    pub fn optimize_icc_profile(&self) -> Result<()> {
        self.mutate("optimize_icc_profile", |draft| {
            let has_profile = draft.image.icc_profile().is_some();
            if !has_profile && draft.image.interpretation() != Interpretation::Cmyk {
                return Ok(());
            }
            let profile = if draft.image.bands() <= 2 {
                ProfileId::Sgray
            } else {
                ProfileId::Srgb
            };
            draft.apply(|img| icc::transform(img, profile.bytes()))?;
            draft.optimized_profile = Some(profile);
            Ok(())
        })
    }

    /// Convert the pixels into the colour space described by
    /// `output_profile` (ICC bytes) and embed it. Without an embedded
    /// profile the input is taken to be sRGB.
    pub fn transform_icc_profile(&self, output_profile: &[u8]) -> Result<()> {
        self.mutate("transform_icc_profile", |draft| {
            draft.apply(|img| icc::transform(img, output_profile))?;
            draft.optimized_profile = None;
            Ok(())
        })
    }

    // =========================================================================
    // GEOMETRY
    // =========================================================================

    pub fn resize(&self, scale: f64, kernel: Kernel) -> Result<()> {
        self.resize_with_vscale(scale, -1.0, kernel)
    }

    /// Scale by `hscale` horizontally and `vscale` vertically; a
    /// non-positive `vscale` reuses `hscale`. Alpha is premultiplied for
    /// the resample and restored afterwards.
    pub fn resize_with_vscale(&self, hscale: f64, vscale: f64, kernel: Kernel) -> Result<()> {
        self.mutate("resize", |draft| {
            let multi_page = draft.image.is_multi_page();
            let page_height = draft.image.page_height();
            draft.premultiply()?;
            draft.apply(|img| geometry::resize(img, hscale, vscale, kernel))?;
            draft.unpremultiply()?;
            if multi_page {
                let v = if vscale > 0.0 { vscale } else { hscale };
                let scaled = (page_height as f64 * v).round().max(1.0) as u32;
                draft.edit(|img| img.page_height = scaled);
            }
            Ok(())
        })
    }

    /// Fit inside `width` x `height`, cropping with `interesting` when it is
    /// not `None`.
    pub fn thumbnail(&self, width: u32, height: u32, interesting: Interesting) -> Result<()> {
        self.thumbnail_with_size(width, height, interesting, Size::Both)
    }

    pub fn thumbnail_with_size(
        &self,
        width: u32,
        height: u32,
        interesting: Interesting,
        size: Size,
    ) -> Result<()> {
        self.mutate("thumbnail", |draft| {
            draft.apply(|img| geometry::thumbnail(img, width, height, interesting, size))
        })
    }

    /// Crop every page to the same rectangle.
    pub fn extract_area(&self, left: u32, top: u32, width: u32, height: u32) -> Result<()> {
        self.mutate("extract_area", |draft| {
            draft.apply(|img| geometry::extract_area(img, left, top, width, height))
        })
    }

    pub fn smart_crop(&self, width: u32, height: u32, interesting: Interesting) -> Result<()> {
        self.mutate("smart_crop", |draft| {
            draft.apply(|img| geometry::smart_crop(img, width, height, interesting))
        })
    }

    pub fn embed(
        &self,
        left: i32,
        top: i32,
        width: u32,
        height: u32,
        extend: ExtendStrategy,
    ) -> Result<()> {
        self.mutate("embed", |draft| {
            draft.apply(|img| geometry::embed(img, left, top, width, height, extend))
        })
    }

    pub fn embed_background(
        &self,
        left: i32,
        top: i32,
        width: u32,
        height: u32,
        background: ColorRgba,
    ) -> Result<()> {
        self.embed(left, top, width, height, ExtendStrategy::Background(background))
    }

    /// Rotate clockwise. Each page of a multi-page image is rotated on its
    /// own and the page height follows.
    pub fn rotate(&self, angle: Angle) -> Result<()> {
        self.mutate("rotate", |draft| {
            let multi_page = draft.image.is_multi_page();
            match angle {
                Angle::D0 => Ok(()),
                Angle::D180 if multi_page => draft.apply(geometry::rotate_pages_180),
                Angle::D90 | Angle::D270 if multi_page => {
                    draft.apply(|img| rotate_multi_page(img, angle))
                }
                _ => draft.apply(|img| geometry::rotate(img, angle)),
            }
        })
    }

    pub fn flip(&self, direction: Direction) -> Result<()> {
        self.mutate("flip", |draft| {
            draft.apply(|img| geometry::flip(img, direction))
        })
    }

    /// Apply the EXIF orientation to the pixels and mark the image upright.
    pub fn auto_rotate(&self) -> Result<()> {
        self.mutate("auto_rotate", |draft| draft.apply(geometry::auto_rotate))
    }

    pub fn zoom(&self, xfac: u32, yfac: u32) -> Result<()> {
        self.mutate("zoom", |draft| {
            draft.apply(|img| geometry::zoom(img, xfac, yfac))
        })
    }

    pub fn replicate(&self, across: u32, down: u32) -> Result<()> {
        self.mutate("replicate", |draft| {
            draft.apply(|img| geometry::replicate(img, across, down))
        })
    }

    /// Rearrange a strip of `tile_height` tiles into `across` x `down`.
    pub fn grid(&self, tile_height: u32, across: u32, down: u32) -> Result<()> {
        self.mutate("grid", |draft| {
            draft.apply(|img| geometry::grid(img, tile_height, across, down))
        })
    }

    /// Rotation (and mirroring) the current EXIF orientation asks for.
    pub fn get_rotation_angle_from_exif(&self) -> (Angle, bool) {
        rotation_angle_from_exif(self.orientation().unwrap_or(1))
    }

    /// Scale by `scale` and rotate by `angle` degrees about the centre. The
    /// canvas grows to hold the result; new pixels are `background`.
    pub fn similarity(&self, scale: f64, angle: f64, background: ColorRgba) -> Result<()> {
        let params = Similarity {
            scale,
            angle,
            background,
            idx: 0.0,
            idy: 0.0,
            odx: 0.0,
            ody: 0.0,
        };
        self.mutate("similarity", |draft| {
            draft.apply(|img| geometry::similarity(img, params))
        })
    }

    // =========================================================================
    // COLOUR AND BANDS
    // =========================================================================

    /// Composite alpha over `background` and drop the alpha band.
    pub fn flatten(&self, background: Color) -> Result<()> {
        self.mutate("flatten", |draft| {
            draft.apply(|img| colour::flatten(img, background))
        })
    }

    /// Append an opaque alpha band. No-op when alpha is present.
    pub fn add_alpha(&self) -> Result<()> {
        self.mutate("add_alpha", |draft| {
            if draft.image.has_alpha() {
                return Ok(());
            }
            draft.apply(colour::add_alpha)
        })
    }

    /// Multiply colour bands by alpha. No-op without alpha or when already
    /// premultiplied.
    pub fn premultiply_alpha(&self) -> Result<()> {
        self.mutate("premultiply_alpha", |draft| draft.premultiply())
    }

    /// Reverse `premultiply_alpha`, restoring the band format it started
    /// from. No-op when not premultiplied.
    pub fn unpremultiply_alpha(&self) -> Result<()> {
        self.mutate("unpremultiply_alpha", |draft| draft.unpremultiply())
    }

    pub fn cast(&self, format: BandFormat) -> Result<()> {
        self.mutate("cast", |draft| draft.apply(|img| colour::cast(img, format)))
    }

    pub fn to_color_space(&self, interpretation: Interpretation) -> Result<()> {
        self.mutate("to_color_space", |draft| {
            draft.apply(|img| colour::to_color_space(img, interpretation))
        })
    }

    pub fn invert(&self) -> Result<()> {
        self.mutate("invert", |draft| draft.apply(colour::invert))
    }

    pub fn gaussian_blur(&self, sigma: f64) -> Result<()> {
        self.mutate("gaussian_blur", |draft| {
            draft.apply(|img| colour::gaussian_blur(img, sigma))
        })
    }

    pub fn sharpen(&self, sigma: f64, x1: f64, m2: f64) -> Result<()> {
        self.mutate("sharpen", |draft| {
            draft.apply(|img| colour::sharpen(img, sigma, x1, m2))
        })
    }

    /// Multiply brightness and saturation, rotate hue by `hue` degrees.
    pub fn modulate(&self, brightness: f64, saturation: f64, hue: f64) -> Result<()> {
        self.mutate("modulate", |draft| {
            draft.apply(|img| colour::modulate(img, brightness, saturation, hue))
        })
    }

    /// Like `modulate`, computed in HSV.
    pub fn modulate_hsv(&self, brightness: f64, saturation: f64, hue: f64) -> Result<()> {
        self.mutate("modulate_hsv", |draft| {
            draft.apply(|img| colour::modulate_hsv(img, brightness, saturation, hue))
        })
    }

    /// `out = in * a + b`, one coefficient pair per band. A single pair
    /// applies to every band.
    pub fn linear(&self, a: &[f64], b: &[f64]) -> Result<()> {
        if a.len() != b.len() {
            return Err(ImageRefError::length_mismatch(a.len(), b.len()));
        }
        self.mutate("linear", |draft| draft.apply(|img| colour::linear(img, a, b)))
    }

    pub fn linear1(&self, a: f64, b: f64) -> Result<()> {
        self.linear(&[a], &[b])
    }

    /// Rank filter over a `width` x `height` window; `index` picks the
    /// sorted position (half the window size gives a median).
    pub fn rank(&self, width: u32, height: u32, index: u32) -> Result<()> {
        self.mutate("rank", |draft| {
            draft.apply(|img| colour::rank(img, width, height, index))
        })
    }

    // =========================================================================
    // BANDS AND ARITHMETIC
    // =========================================================================

    /// Keep `n` bands starting at `band`.
    pub fn extract_band(&self, band: u32, n: u32) -> Result<()> {
        self.mutate("extract_band", |draft| {
            draft.apply(|img| bands::extract_band(img, band, n))
        })
    }

    /// Append the bands of `others` after this image's bands. The images
    /// must have the same size and at most four bands in total.
    pub fn band_join(&self, others: &[&ImageRef]) -> Result<()> {
        let others = others
            .iter()
            .map(|image| image.snapshot())
            .collect::<Result<Vec<NativeRef>>>()?;
        self.mutate("band_join", |draft| {
            draft.apply(|img| {
                let others: Vec<&NativeImage> = others.iter().map(|other| &**other).collect();
                bands::band_join(img, &others)
            })
        })
    }

    /// Append one constant band per value, in sample units.
    pub fn band_join_const(&self, constants: &[f64]) -> Result<()> {
        self.mutate("band_join_const", |draft| {
            draft.apply(|img| bands::band_join_const(img, constants))
        })
    }

    pub fn add(&self, addend: &ImageRef) -> Result<()> {
        self.arithmetic(addend, Arithmetic::Add, "add")
    }

    pub fn multiply(&self, multiplier: &ImageRef) -> Result<()> {
        self.arithmetic(multiplier, Arithmetic::Multiply, "multiply")
    }

    /// Divide band by band. The result is float; division by zero gives 0.
    pub fn divide(&self, denominator: &ImageRef) -> Result<()> {
        self.arithmetic(denominator, Arithmetic::Divide, "divide")
    }

    fn arithmetic(&self, other: &ImageRef, op: Arithmetic, name: &'static str) -> Result<()> {
        let other = other.snapshot()?;
        self.mutate(name, |draft| {
            draft.apply(|img| bands::arithmetic(img, &other, op))
        })
    }

    /// Map every sample through the lookup table `lut`.
    pub fn maplut(&self, lut: &ImageRef) -> Result<()> {
        let lut = lut.snapshot()?;
        self.mutate("maplut", |draft| draft.apply(|img| bands::maplut(img, &lut)))
    }

    // =========================================================================
    // COMPOSITING
    // =========================================================================

    /// Blend `overlay` onto this image with its top-left corner at (x, y).
    pub fn composite(&self, overlay: &ImageRef, mode: BlendMode, x: i32, y: i32) -> Result<()> {
        let overlay = overlay.snapshot()?;
        self.mutate("composite", |draft| {
            draft.apply(|img| compose::composite(img, &overlay, mode, x, y))
        })
    }

    /// Paste `sub` at (x, y). With `expand` the canvas grows to hold it and
    /// new pixels are `background`.
    pub fn insert(
        &self,
        sub: &ImageRef,
        x: i32,
        y: i32,
        expand: bool,
        background: ColorRgba,
    ) -> Result<()> {
        let sub = sub.snapshot()?;
        self.mutate("insert", |draft| {
            draft.apply(|img| compose::insert(img, &sub, x, y, expand, background))
        })
    }

    /// Place `other` to the right of (horizontal) or below (vertical) this
    /// image.
    pub fn join(&self, other: &ImageRef, direction: Direction) -> Result<()> {
        let other = other.snapshot()?;
        self.mutate("join", |draft| {
            draft.apply(|img| compose::join(img, &other, direction))
        })
    }

    /// Lay this image and `others` out in a grid `across` images wide,
    /// this image first.
    pub fn array_join(&self, others: &[&ImageRef], across: u32) -> Result<()> {
        let others = others
            .iter()
            .map(|image| image.snapshot())
            .collect::<Result<Vec<NativeRef>>>()?;
        self.mutate("array_join", |draft| {
            draft.apply(|img| {
                let mut images: Vec<&NativeImage> = Vec::with_capacity(others.len() + 1);
                images.push(img);
                images.extend(others.iter().map(|other| &**other));
                compose::array_join(&images, across)
            })
        })
    }

    /// Blend several overlays in order, each with its own mode and
    /// position, as one mutation.
    pub fn composite_multi(&self, overlays: &[ImageComposite<'_>]) -> Result<()> {
        let layers = overlays
            .iter()
            .map(|layer| Ok((layer.image.snapshot()?, layer.mode, layer.x, layer.y)))
            .collect::<Result<Vec<(NativeRef, BlendMode, i32, i32)>>>()?;
        self.mutate("composite_multi", |draft| {
            for (overlay, mode, x, y) in &layers {
                draft.apply(|img| compose::composite(img, overlay, *mode, *x, *y))?;
            }
            Ok(())
        })
    }

    pub fn draw_rect(
        &self,
        ink: ColorRgba,
        left: i32,
        top: i32,
        width: u32,
        height: u32,
        fill: bool,
    ) -> Result<()> {
        self.mutate("draw_rect", |draft| {
            draft.apply(|img| compose::draw_rect(img, ink, left, top, width, height, fill))
        })
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Mean of every band of every pixel.
    pub fn average(&self) -> Result<f64> {
        colour::average(&*self.snapshot()?)
    }

    /// Bounding box `(left, top, width, height)` of the content that
    /// differs from `background` by more than `threshold`.
    pub fn find_trim(&self, threshold: f64, background: Color) -> Result<(u32, u32, u32, u32)> {
        bands::find_trim(&*self.snapshot()?, threshold, background)
    }

    /// Band values at (x, y).
    pub fn get_point(&self, x: u32, y: u32) -> Result<Vec<f64>> {
        colour::get_point(&*self.snapshot()?, x, y)
    }
}

/// One overlay of `ImageRef::composite_multi`.
pub struct ImageComposite<'a> {
    pub image: &'a ImageRef,
    pub mode: BlendMode,
    pub x: i32,
    pub y: i32,
}

/// Pixelate by shrinking `factor` times and enlarging back with nearest
/// neighbour, as a single mutation.
pub fn pixelate(image: &ImageRef, factor: f64) -> Result<()> {
    if !factor.is_finite() || factor < 1.0 {
        return Err(ImageRefError::invalid_argument(
            "factor",
            factor.to_string(),
            "pixelate factor must be at least 1",
        ));
    }
    image.mutate("pixelate", |draft| {
        let width = draft.image.width();
        let frame_height = if draft.image.is_multi_page() {
            draft.image.page_height()
        } else {
            draft.image.height()
        };
        draft.premultiply()?;
        draft.apply(|img| geometry::resize(img, 1.0 / factor, 1.0 / factor, Kernel::Linear))?;
        draft.apply(|img| geometry::resize_to(img, width, frame_height, Kernel::Nearest))?;
        draft.unpremultiply()
    })
}
