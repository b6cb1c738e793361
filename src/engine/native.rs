// src/engine/native.rs
//
// The native image object: decoded pixels plus the metadata the engine
// attaches to them. A NativeImage is never modified after construction;
// primitives build a new one and the handle swaps references.

use crate::engine::common::EngineResult;
use crate::error::ImageRefError;
use crate::ops::{BandFormat, ColorRgba, ImageType, Interpretation};
use image::{DynamicImage, GenericImageView, ImageBuffer, Pixel, Primitive};
use std::sync::Arc;

/// vips-style default resolution: 72 dpi in pixels per millimetre.
pub(crate) const DEFAULT_RESOLUTION: f64 = 72.0 / 25.4;

/// Decoded pixels and attached metadata.
#[derive(Clone, Debug)]
pub struct NativeImage {
    pub(crate) pixels: DynamicImage,
    pub(crate) interpretation: Interpretation,
    /// Height of one page. Equal to the full height for single-page images.
    pub(crate) page_height: u32,
    /// Per-page delay in milliseconds. Empty when not animated.
    pub(crate) delays: Vec<u32>,
    pub(crate) loop_count: u32,
    pub(crate) orientation: Option<u16>,
    pub(crate) icc: Option<Arc<Vec<u8>>>,
    pub(crate) exif: Option<Arc<Vec<u8>>>,
    pub(crate) xres: f64,
    pub(crate) yres: f64,
}

impl NativeImage {
    pub fn new(pixels: DynamicImage) -> Self {
        let interpretation = infer_interpretation(&pixels);
        let page_height = pixels.height();
        Self {
            pixels,
            interpretation,
            page_height,
            delays: Vec::new(),
            loop_count: 0,
            orientation: None,
            icc: None,
            exif: None,
            xres: DEFAULT_RESOLUTION,
            yres: DEFAULT_RESOLUTION,
        }
    }

    /// New object with the same metadata and different pixels.
    ///
    /// Single-page images stay single-page; multi-page callers must set the
    /// page height themselves.
    pub(crate) fn derive(&self, pixels: DynamicImage) -> Self {
        let page_height = if self.is_multi_page() {
            self.page_height
        } else {
            pixels.height()
        };
        Self {
            pixels,
            interpretation: self.interpretation,
            page_height,
            delays: self.delays.clone(),
            loop_count: self.loop_count,
            orientation: self.orientation,
            icc: self.icc.clone(),
            exif: self.exif.clone(),
            xres: self.xres,
            yres: self.yres,
        }
    }

    pub(crate) fn with_page_height(mut self, page_height: u32) -> Self {
        self.page_height = page_height;
        self
    }

    pub(crate) fn with_interpretation(mut self, interpretation: Interpretation) -> Self {
        self.interpretation = interpretation;
        self
    }

    pub fn pixels(&self) -> &DynamicImage {
        &self.pixels
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Logical band count. Grey images promoted to float keep reporting
    /// one band (two with alpha).
    pub fn bands(&self) -> u32 {
        let layout = Layout::of(self);
        match (layout.grey, layout.alpha) {
            (true, false) => 1,
            (true, true) => 2,
            (false, false) => 3,
            (false, true) => 4,
        }
    }

    pub fn band_format(&self) -> BandFormat {
        band_format_of(&self.pixels)
    }

    pub fn interpretation(&self) -> Interpretation {
        self.interpretation
    }

    pub fn has_alpha(&self) -> bool {
        self.pixels.color().has_alpha()
    }

    pub fn page_height(&self) -> u32 {
        self.page_height
    }

    pub fn is_multi_page(&self) -> bool {
        let height = self.height();
        self.page_height > 0 && height > self.page_height && height % self.page_height == 0
    }

    pub fn pages(&self) -> u32 {
        if self.is_multi_page() {
            self.height() / self.page_height
        } else {
            1
        }
    }

    /// Page count as reported for a handle in `format`. JPEG 2000 is
    /// always one page.
    pub(crate) fn reported_pages(&self, format: ImageType) -> u32 {
        match format {
            ImageType::Jp2k => 1,
            _ => self.pages(),
        }
    }

    /// The interpretation when it names a colour space, otherwise a guess
    /// from the band count.
    pub fn color_space(&self) -> Interpretation {
        match self.interpretation {
            Interpretation::Multiband if self.bands() <= 2 => Interpretation::BW,
            Interpretation::Multiband => Interpretation::Srgb,
            other => other,
        }
    }

    pub fn orientation(&self) -> Option<u16> {
        self.orientation
    }

    pub fn icc_profile(&self) -> Option<&[u8]> {
        self.icc.as_deref().map(|v| v.as_slice())
    }

    pub fn exif(&self) -> Option<&[u8]> {
        self.exif.as_deref().map(|v| v.as_slice())
    }

    pub(crate) fn frames(&self) -> Vec<DynamicImage> {
        let pages = self.pages();
        let ph = if pages > 1 {
            self.page_height
        } else {
            self.height()
        };
        (0..pages)
            .map(|i| self.pixels.crop_imm(0, i * ph, self.width(), ph))
            .collect()
    }
}

/// One counted reference to a native image object.
///
/// Cloning acquires a fresh reference; dropping releases it. Two references
/// are the same object when `same_object` says so, regardless of content.
#[derive(Clone, Debug)]
pub struct NativeRef(Arc<NativeImage>);

impl NativeRef {
    pub fn new(image: NativeImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn same_object(&self, other: &NativeRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live references to this object.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl std::ops::Deref for NativeRef {
    type Target = NativeImage;

    fn deref(&self) -> &NativeImage {
        &self.0
    }
}

/// Channel layout, independent of the numeric band format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Layout {
    pub grey: bool,
    pub alpha: bool,
}

impl Layout {
    pub(crate) fn of(image: &NativeImage) -> Self {
        let color = image.pixels.color();
        let luma_buffer = matches!(
            image.pixels,
            DynamicImage::ImageLuma8(_)
                | DynamicImage::ImageLumaA8(_)
                | DynamicImage::ImageLuma16(_)
                | DynamicImage::ImageLumaA16(_)
        );
        Self {
            grey: luma_buffer || image.interpretation.is_grey(),
            alpha: color.has_alpha(),
        }
    }
}

pub(crate) fn band_format_of(pixels: &DynamicImage) -> BandFormat {
    match pixels {
        DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_)
        | DynamicImage::ImageRgb16(_)
        | DynamicImage::ImageRgba16(_) => BandFormat::UShort,
        DynamicImage::ImageRgb32F(_) | DynamicImage::ImageRgba32F(_) => BandFormat::Float,
        _ => BandFormat::UChar,
    }
}

pub(crate) fn infer_interpretation(pixels: &DynamicImage) -> Interpretation {
    match pixels {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageLumaA8(_) => Interpretation::BW,
        DynamicImage::ImageLuma16(_) | DynamicImage::ImageLumaA16(_) => Interpretation::Grey16,
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgba16(_) => Interpretation::Rgb16,
        _ => Interpretation::Srgb,
    }
}

/// Convert pixels to `format`, keeping the channel layout.
///
/// Float has no grey buffer in `image`, so grey floats are stored as
/// equal RGB channels and tracked through the interpretation.
pub(crate) fn cast_pixels(pixels: &DynamicImage, layout: Layout, format: BandFormat) -> DynamicImage {
    match (format, layout.grey, layout.alpha) {
        (BandFormat::UChar, true, false) => DynamicImage::ImageLuma8(pixels.to_luma8()),
        (BandFormat::UChar, true, true) => DynamicImage::ImageLumaA8(pixels.to_luma_alpha8()),
        (BandFormat::UChar, false, false) => DynamicImage::ImageRgb8(pixels.to_rgb8()),
        (BandFormat::UChar, false, true) => DynamicImage::ImageRgba8(pixels.to_rgba8()),
        (BandFormat::UShort, true, false) => DynamicImage::ImageLuma16(pixels.to_luma16()),
        (BandFormat::UShort, true, true) => DynamicImage::ImageLumaA16(pixels.to_luma_alpha16()),
        (BandFormat::UShort, false, false) => DynamicImage::ImageRgb16(pixels.to_rgb16()),
        (BandFormat::UShort, false, true) => DynamicImage::ImageRgba16(pixels.to_rgba16()),
        (BandFormat::Float, _, false) => DynamicImage::ImageRgb32F(pixels.to_rgb32f()),
        (BandFormat::Float, _, true) => DynamicImage::ImageRgba32F(pixels.to_rgba32f()),
    }
}

/// Sample types the engine stores: u8, u16 and f32.
pub(crate) trait Sample: Primitive + Send + Sync {
    /// Largest value of a "full" sample (255, 65535, 1.0).
    const FULL: f32;

    fn into_f32(self) -> f32;
    fn from_f32(value: f32) -> Self;
}

impl Sample for u8 {
    const FULL: f32 = 255.0;

    fn into_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, 255.0) as u8
    }
}

impl Sample for u16 {
    const FULL: f32 = 65535.0;

    fn into_f32(self) -> f32 {
        self as f32
    }

    fn from_f32(value: f32) -> Self {
        value.round().clamp(0.0, 65535.0) as u16
    }
}

impl Sample for f32 {
    const FULL: f32 = 1.0;

    fn into_f32(self) -> f32 {
        self
    }

    fn from_f32(value: f32) -> Self {
        value
    }
}

pub(crate) type Buffer<P> = ImageBuffer<P, Vec<<P as Pixel>::Subpixel>>;

/// A pixel of type `P` painted with `color`, scaled to the sample range.
pub(crate) fn fill_pixel<P>(color: ColorRgba) -> P
where
    P: Pixel,
    P::Subpixel: Sample,
{
    let full = <P::Subpixel as Sample>::FULL;
    let s = |v: u8| <P::Subpixel as Sample>::from_f32(v as f32 / 255.0 * full);
    let luma = (0.2126 * color.r as f32 + 0.7152 * color.g as f32 + 0.0722 * color.b as f32)
        .round()
        .clamp(0.0, 255.0) as u8;
    let channels: Vec<P::Subpixel> = match P::CHANNEL_COUNT {
        1 => vec![s(luma)],
        2 => vec![s(luma), s(color.a)],
        3 => vec![s(color.r), s(color.g), s(color.b)],
        _ => vec![s(color.r), s(color.g), s(color.b), s(color.a)],
    };
    *P::from_slice(&channels)
}

/// Apply a generic buffer transform to every supported pixel layout,
/// keeping the variant.
macro_rules! dynamic_map {
    ($img:expr, |$buf:ident| $body:expr) => {
        match $img {
            image::DynamicImage::ImageLuma8($buf) => Ok(image::DynamicImage::ImageLuma8($body)),
            image::DynamicImage::ImageLumaA8($buf) => Ok(image::DynamicImage::ImageLumaA8($body)),
            image::DynamicImage::ImageRgb8($buf) => Ok(image::DynamicImage::ImageRgb8($body)),
            image::DynamicImage::ImageRgba8($buf) => Ok(image::DynamicImage::ImageRgba8($body)),
            image::DynamicImage::ImageLuma16($buf) => Ok(image::DynamicImage::ImageLuma16($body)),
            image::DynamicImage::ImageLumaA16($buf) => {
                Ok(image::DynamicImage::ImageLumaA16($body))
            }
            image::DynamicImage::ImageRgb16($buf) => Ok(image::DynamicImage::ImageRgb16($body)),
            image::DynamicImage::ImageRgba16($buf) => Ok(image::DynamicImage::ImageRgba16($body)),
            image::DynamicImage::ImageRgb32F($buf) => Ok(image::DynamicImage::ImageRgb32F($body)),
            image::DynamicImage::ImageRgba32F($buf) => {
                Ok(image::DynamicImage::ImageRgba32F($body))
            }
            other => Err($crate::error::ImageRefError::operation_failed(
                "pixel access",
                format!("unsupported pixel layout {:?}", other.color()),
            )),
        }
    };
}

/// Apply a generic buffer reader to every supported pixel layout.
macro_rules! dynamic_read {
    ($img:expr, |$buf:ident| $body:expr) => {
        match $img {
            image::DynamicImage::ImageLuma8($buf) => Ok($body),
            image::DynamicImage::ImageLumaA8($buf) => Ok($body),
            image::DynamicImage::ImageRgb8($buf) => Ok($body),
            image::DynamicImage::ImageRgba8($buf) => Ok($body),
            image::DynamicImage::ImageLuma16($buf) => Ok($body),
            image::DynamicImage::ImageLumaA16($buf) => Ok($body),
            image::DynamicImage::ImageRgb16($buf) => Ok($body),
            image::DynamicImage::ImageRgba16($buf) => Ok($body),
            image::DynamicImage::ImageRgb32F($buf) => Ok($body),
            image::DynamicImage::ImageRgba32F($buf) => Ok($body),
            other => Err($crate::error::ImageRefError::operation_failed(
                "pixel access",
                format!("unsupported pixel layout {:?}", other.color()),
            )),
        }
    };
}

pub(crate) use dynamic_map;
pub(crate) use dynamic_read;

/// Stack equally sized frames vertically into one tall image.
///
/// The output takes the pixel layout of the first frame.
pub(crate) fn stack_frames(frames: &[DynamicImage]) -> EngineResult<DynamicImage> {
    let first = frames
        .first()
        .ok_or_else(|| ImageRefError::operation_failed("stack frames", "no frames"))?;
    let (w, h) = first.dimensions();
    if frames.iter().any(|f| f.dimensions() != (w, h)) {
        return Err(ImageRefError::operation_failed(
            "stack frames",
            "frames differ in size",
        ));
    }
    if frames.len() == 1 {
        return Ok(first.clone());
    }
    let total = (h as u64) * frames.len() as u64;
    if total > crate::engine::MAX_DIMENSION as u64 {
        return Err(ImageRefError::dimension_exceeds_limit(
            total.min(u32::MAX as u64) as u32,
            crate::engine::MAX_DIMENSION,
        ));
    }
    let total = total as u32;
    let layout = Layout {
        grey: matches!(
            first,
            DynamicImage::ImageLuma8(_)
                | DynamicImage::ImageLumaA8(_)
                | DynamicImage::ImageLuma16(_)
                | DynamicImage::ImageLumaA16(_)
        ),
        alpha: first.color().has_alpha(),
    };
    let format = band_format_of(first);
    let mut out = blank_like(first, w, total);
    for (i, frame) in frames.iter().enumerate() {
        let frame = if std::mem::discriminant(frame) == std::mem::discriminant(first) {
            frame.clone()
        } else {
            cast_pixels(frame, layout, format)
        };
        image::imageops::replace(&mut out, &frame, 0, i as i64 * h as i64);
    }
    Ok(out)
}

/// A zeroed image with the variant of `template`.
pub(crate) fn blank_like(template: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    match template {
        DynamicImage::ImageLuma8(_) => DynamicImage::new_luma8(width, height),
        DynamicImage::ImageLumaA8(_) => DynamicImage::new_luma_a8(width, height),
        DynamicImage::ImageLuma16(_) => DynamicImage::new_luma16(width, height),
        DynamicImage::ImageLumaA16(_) => DynamicImage::new_luma_a16(width, height),
        DynamicImage::ImageRgb16(_) => DynamicImage::new_rgb16(width, height),
        DynamicImage::ImageRgba16(_) => DynamicImage::new_rgba16(width, height),
        DynamicImage::ImageRgb32F(_) => DynamicImage::new_rgb32f(width, height),
        DynamicImage::ImageRgba32F(_) => DynamicImage::new_rgba32f(width, height),
        DynamicImage::ImageRgba8(_) => DynamicImage::new_rgba8(width, height),
        _ => DynamicImage::new_rgb8(width, height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, Rgb, RgbImage, RgbaImage};

    fn rgb(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }))
    }

    #[test]
    fn new_image_is_single_page() {
        let img = NativeImage::new(rgb(10, 30));
        assert_eq!(img.page_height(), 30);
        assert_eq!(img.pages(), 1);
        assert!(!img.is_multi_page());
        assert_eq!(img.bands(), 3);
        assert_eq!(img.interpretation(), Interpretation::Srgb);
    }

    #[test]
    fn page_height_must_divide_height() {
        let img = NativeImage::new(rgb(10, 30)).with_page_height(10);
        assert_eq!(img.pages(), 3);
        let odd = NativeImage::new(rgb(10, 30)).with_page_height(7);
        assert_eq!(odd.pages(), 1);
    }

    #[test]
    fn derive_tracks_single_page_height() {
        let img = NativeImage::new(rgb(10, 30));
        let derived = img.derive(rgb(5, 15));
        assert_eq!(derived.page_height(), 15);

        let multi = NativeImage::new(rgb(10, 30)).with_page_height(10);
        let derived = multi.derive(rgb(10, 30));
        assert_eq!(derived.page_height(), 10);
    }

    #[test]
    fn native_ref_identity() {
        let a = NativeRef::new(NativeImage::new(rgb(2, 2)));
        let b = a.clone();
        let c = NativeRef::new(NativeImage::new(rgb(2, 2)));
        assert!(a.same_object(&b));
        assert!(!a.same_object(&c));
        assert_eq!(a.ref_count(), 2);
        drop(b);
        assert_eq!(a.ref_count(), 1);
    }

    #[test]
    fn grey_float_keeps_logical_bands() {
        let grey = DynamicImage::ImageLumaA8(GrayAlphaImage::new(4, 4));
        let img = NativeImage::new(grey);
        let layout = Layout::of(&img);
        let float = cast_pixels(&img.pixels, layout, BandFormat::Float);
        let promoted = img.derive(float);
        assert_eq!(promoted.band_format(), BandFormat::Float);
        assert_eq!(promoted.bands(), 2);
        let back = cast_pixels(&promoted.pixels, Layout::of(&promoted), BandFormat::UChar);
        assert!(matches!(back, DynamicImage::ImageLumaA8(_)));
    }

    #[test]
    fn fill_pixel_scales_to_sample_range() {
        let px: image::Rgba<u16> = fill_pixel(ColorRgba {
            r: 255,
            g: 0,
            b: 0,
            a: 255,
        });
        assert_eq!(px.0, [65535, 0, 0, 65535]);
        let px: image::Rgb<f32> = fill_pixel(ColorRgba {
            r: 255,
            g: 255,
            b: 0,
            a: 0,
        });
        assert_eq!(px.0, [1.0, 1.0, 0.0]);
    }

    #[test]
    fn stack_frames_builds_tall_strip() {
        let a = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, image::Rgba([1, 2, 3, 4])));
        let b = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, image::Rgba([5, 6, 7, 8])));
        let stacked = stack_frames(&[a, b]).unwrap();
        assert_eq!(stacked.dimensions(), (3, 4));
        let rgba = stacked.to_rgba8();
        assert_eq!(rgba.get_pixel(0, 0).0, [1, 2, 3, 4]);
        assert_eq!(rgba.get_pixel(2, 3).0, [5, 6, 7, 8]);
    }
}
