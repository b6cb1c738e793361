// src/engine/params.rs
//
// Import options and export parameter sets. Every struct here is plain data
// with a `Default` carrying the documented codec defaults.

use crate::ops::ImageType;
use tracing::debug;

/// Options applied while decoding.
///
/// `None` fields leave the decoder's choice in place.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportParams {
    pub auto_rotate: Option<bool>,
    pub fail_on_error: Option<bool>,
    /// First page to load
    pub page: Option<u32>,
    /// Number of pages to load, -1 for all
    pub n: Option<i32>,
    pub density: Option<u32>,
    pub jpeg_shrink_factor: Option<u32>,
    pub heif_thumbnail: Option<bool>,
    pub svg_unlimited: Option<bool>,
}

impl Default for ImportParams {
    fn default() -> Self {
        Self {
            auto_rotate: None,
            fail_on_error: Some(true),
            page: None,
            n: None,
            density: None,
            jpeg_shrink_factor: None,
            heif_thumbnail: None,
            svg_unlimited: None,
        }
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "TRUE"
    } else {
        "FALSE"
    }
}

impl ImportParams {
    /// Render the set options as a `key=value,...` list.
    pub fn option_string(&self) -> String {
        let mut values = Vec::new();
        if let Some(n) = self.n {
            values.push(format!("n={n}"));
        }
        if let Some(page) = self.page {
            values.push(format!("page={page}"));
        }
        if let Some(dpi) = self.density {
            values.push(format!("dpi={dpi}"));
        }
        if let Some(fail) = self.fail_on_error {
            values.push(format!("fail={}", bool_str(fail)));
        }
        if let Some(shrink) = self.jpeg_shrink_factor {
            values.push(format!("shrink={shrink}"));
        }
        if let Some(rotate) = self.auto_rotate {
            values.push(format!("autorotate={}", bool_str(rotate)));
        }
        if let Some(unlimited) = self.svg_unlimited {
            values.push(format!("unlimited={}", bool_str(unlimited)));
        }
        if let Some(thumbnail) = self.heif_thumbnail {
            values.push(format!("thumbnail={}", bool_str(thumbnail)));
        }
        values.join(",")
    }

    pub(crate) fn strict(&self) -> bool {
        self.fail_on_error.unwrap_or(true)
    }
}

/// Chroma subsampling for JPEG and JPEG 2000.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SubsampleMode {
    #[default]
    Auto,
    On,
    Off,
}

/// Generic export parameters, translated per codec by [`map_generic`].
#[derive(Clone, Debug, PartialEq)]
pub struct ExportParams {
    /// `Unknown` exports in the handle's current format
    pub format: ImageType,
    pub quality: u8,
    pub compression: u8,
    pub interlaced: bool,
    pub lossless: bool,
    pub effort: u8,
    pub strip_metadata: bool,
    pub optimize_coding: bool,
    pub subsample_mode: SubsampleMode,
    pub trellis_quant: bool,
    pub overshoot_deringing: bool,
    pub optimize_scans: bool,
    pub quant_table: u8,
    pub speed: u8,
}

impl Default for ExportParams {
    fn default() -> Self {
        Self {
            format: ImageType::Unknown,
            quality: 80,
            compression: 6,
            interlaced: true,
            lossless: false,
            effort: 4,
            strip_metadata: false,
            optimize_coding: false,
            subsample_mode: SubsampleMode::Auto,
            trellis_quant: false,
            overshoot_deringing: false,
            optimize_scans: false,
            quant_table: 0,
            speed: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct JpegExportParams {
    pub strip_metadata: bool,
    pub quality: u8,
    /// Progressive encoding
    pub interlace: bool,
    pub optimize_coding: bool,
    pub subsample_mode: SubsampleMode,
    pub trellis_quant: bool,
    pub overshoot_deringing: bool,
    pub optimize_scans: bool,
    pub quant_table: u8,
}

impl Default for JpegExportParams {
    fn default() -> Self {
        Self {
            strip_metadata: false,
            quality: 80,
            interlace: true,
            optimize_coding: false,
            subsample_mode: SubsampleMode::Auto,
            trellis_quant: false,
            overshoot_deringing: false,
            optimize_scans: false,
            quant_table: 0,
        }
    }
}

/// PNG row filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PngFilter {
    #[default]
    None,
    Sub,
    Up,
    Avg,
    Paeth,
    All,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PngExportParams {
    pub strip_metadata: bool,
    /// zlib level, 0..=9
    pub compression: u8,
    pub filter: PngFilter,
    pub interlace: bool,
    pub quality: u8,
    pub palette: bool,
    pub dither: f64,
    pub bitdepth: u8,
    pub profile: Option<String>,
}

impl Default for PngExportParams {
    fn default() -> Self {
        Self {
            strip_metadata: false,
            compression: 6,
            filter: PngFilter::None,
            interlace: false,
            quality: 0,
            palette: false,
            dither: 0.0,
            bitdepth: 0,
            profile: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WebpExportParams {
    pub strip_metadata: bool,
    pub quality: u8,
    pub lossless: bool,
    pub near_lossless: bool,
    /// libwebp `method`, 0..=6
    pub reduction_effort: u8,
    /// Replaced by the handle's optimized profile at export time.
    pub icc_profile: Option<Vec<u8>>,
}

impl Default for WebpExportParams {
    fn default() -> Self {
        Self {
            strip_metadata: false,
            quality: 75,
            lossless: false,
            near_lossless: false,
            reduction_effort: 4,
            icc_profile: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TiffCompression {
    None,
    Jpeg,
    Deflate,
    Packbits,
    Ccittfax4,
    #[default]
    Lzw,
    Webp,
    Zstd,
    Jp2k,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TiffPredictor {
    None,
    #[default]
    Horizontal,
    Float,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TiffExportParams {
    pub strip_metadata: bool,
    pub quality: u8,
    pub compression: TiffCompression,
    pub predictor: TiffPredictor,
}

impl Default for TiffExportParams {
    fn default() -> Self {
        Self {
            strip_metadata: false,
            quality: 80,
            compression: TiffCompression::Lzw,
            predictor: TiffPredictor::Horizontal,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GifExportParams {
    pub strip_metadata: bool,
    pub quality: u8,
    pub dither: f64,
    /// Quantizer effort, 1..=10
    pub effort: u8,
    pub bitdepth: u8,
}

impl Default for GifExportParams {
    fn default() -> Self {
        Self {
            strip_metadata: false,
            quality: 75,
            dither: 0.0,
            effort: 7,
            bitdepth: 8,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AvifExportParams {
    pub strip_metadata: bool,
    pub quality: u8,
    pub lossless: bool,
    /// rav1e speed, 0 (slowest) ..= 10
    pub speed: u8,
}

impl Default for AvifExportParams {
    fn default() -> Self {
        Self {
            strip_metadata: false,
            quality: 80,
            lossless: false,
            speed: 5,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HeifExportParams {
    pub quality: u8,
    pub lossless: bool,
}

impl Default for HeifExportParams {
    fn default() -> Self {
        Self {
            quality: 80,
            lossless: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Jp2kExportParams {
    pub quality: u8,
    pub lossless: bool,
    pub tile_width: u32,
    pub tile_height: u32,
    pub subsample_mode: SubsampleMode,
}

impl Default for Jp2kExportParams {
    fn default() -> Self {
        Self {
            quality: 80,
            lossless: false,
            tile_width: 512,
            tile_height: 512,
            subsample_mode: SubsampleMode::Auto,
        }
    }
}

/// A fully resolved, codec-specific parameter set.
#[derive(Clone, Debug, PartialEq)]
pub enum CodecParams {
    Jpeg(JpegExportParams),
    Png(PngExportParams),
    Webp(WebpExportParams),
    Tiff(TiffExportParams),
    Gif(GifExportParams),
    Avif(AvifExportParams),
    Heif(HeifExportParams),
    Jp2k(Jp2kExportParams),
}

impl CodecParams {
    /// The format-specific defaults for `format`. Anything without its own
    /// parameter set gets JPEG's.
    pub fn defaults_for(format: ImageType) -> Self {
        match format {
            ImageType::Png => Self::Png(PngExportParams::default()),
            ImageType::Webp => Self::Webp(WebpExportParams::default()),
            ImageType::Tiff => Self::Tiff(TiffExportParams::default()),
            ImageType::Gif => Self::Gif(GifExportParams::default()),
            ImageType::Avif => Self::Avif(AvifExportParams::default()),
            ImageType::Heif => Self::Heif(HeifExportParams::default()),
            ImageType::Jp2k => Self::Jp2k(Jp2kExportParams::default()),
            _ => Self::Jpeg(JpegExportParams::default()),
        }
    }

    pub fn format(&self) -> ImageType {
        match self {
            Self::Jpeg(_) => ImageType::Jpeg,
            Self::Png(_) => ImageType::Png,
            Self::Webp(_) => ImageType::Webp,
            Self::Tiff(_) => ImageType::Tiff,
            Self::Gif(_) => ImageType::Gif,
            Self::Avif(_) => ImageType::Avif,
            Self::Heif(_) => ImageType::Heif,
            Self::Jp2k(_) => ImageType::Jp2k,
        }
    }
}

/// Translate generic parameters for `format`.
///
/// Only the fields the target codec understands are carried over. The rest
/// take the zero value of the codec struct, not its defaults. Formats without
/// a mapping of their own (JP2K, BMP, ...) go through the JPEG row.
pub fn map_generic(params: &ExportParams, format: ImageType) -> CodecParams {
    let mapped = match format {
        ImageType::Gif => CodecParams::Gif(GifExportParams {
            strip_metadata: false,
            quality: params.quality,
            dither: 0.0,
            effort: 0,
            bitdepth: 0,
        }),
        ImageType::Webp => CodecParams::Webp(WebpExportParams {
            strip_metadata: params.strip_metadata,
            quality: params.quality,
            lossless: params.lossless,
            near_lossless: false,
            reduction_effort: params.effort,
            icc_profile: None,
        }),
        ImageType::Png => CodecParams::Png(PngExportParams {
            strip_metadata: params.strip_metadata,
            compression: params.compression,
            filter: PngFilter::None,
            interlace: params.interlaced,
            quality: 0,
            palette: false,
            dither: 0.0,
            bitdepth: 0,
            profile: None,
        }),
        ImageType::Tiff => CodecParams::Tiff(TiffExportParams {
            strip_metadata: params.strip_metadata,
            quality: params.quality,
            compression: if params.lossless {
                TiffCompression::None
            } else {
                TiffCompression::Lzw
            },
            predictor: TiffPredictor::None,
        }),
        ImageType::Heif => CodecParams::Heif(HeifExportParams {
            quality: params.quality,
            lossless: params.lossless,
        }),
        ImageType::Avif => CodecParams::Avif(AvifExportParams {
            strip_metadata: params.strip_metadata,
            quality: params.quality,
            lossless: params.lossless,
            speed: params.speed,
        }),
        _ => CodecParams::Jpeg(JpegExportParams {
            strip_metadata: params.strip_metadata,
            quality: params.quality,
            interlace: params.interlaced,
            optimize_coding: params.optimize_coding,
            subsample_mode: params.subsample_mode,
            trellis_quant: params.trellis_quant,
            overshoot_deringing: params.overshoot_deringing,
            optimize_scans: params.optimize_scans,
            quant_table: params.quant_table,
        }),
    };
    let dropped = dropped_fields(params, mapped.format());
    if !dropped.is_empty() {
        debug!(
            target: "image_ref::export",
            format = %mapped.format(),
            dropped = ?dropped,
            "generic export fields ignored by target codec"
        );
    }
    mapped
}

/// Generic fields set away from their defaults that `format` has no use for.
fn dropped_fields(params: &ExportParams, format: ImageType) -> Vec<&'static str> {
    let defaults = ExportParams::default();
    let mut changed = Vec::new();
    if params.compression != defaults.compression {
        changed.push("compression");
    }
    if params.lossless != defaults.lossless {
        changed.push("lossless");
    }
    if params.effort != defaults.effort {
        changed.push("effort");
    }
    if params.speed != defaults.speed {
        changed.push("speed");
    }
    if params.strip_metadata != defaults.strip_metadata {
        changed.push("strip_metadata");
    }
    if params.interlaced != defaults.interlaced {
        changed.push("interlaced");
    }
    if params.optimize_coding
        || params.trellis_quant
        || params.overshoot_deringing
        || params.optimize_scans
        || params.quant_table != 0
        || params.subsample_mode != SubsampleMode::Auto
    {
        changed.push("jpeg options");
    }
    let used: &[&str] = match format {
        ImageType::Gif => &[],
        ImageType::Webp => &["strip_metadata", "lossless", "effort"],
        ImageType::Png => &["strip_metadata", "compression", "interlaced"],
        ImageType::Tiff => &["strip_metadata", "lossless"],
        ImageType::Heif => &["lossless"],
        ImageType::Avif => &["strip_metadata", "lossless", "speed"],
        _ => &["strip_metadata", "interlaced", "jpeg options"],
    };
    changed.retain(|field| !used.contains(field));
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn import_defaults_only_set_fail() {
        let params = ImportParams::default();
        assert_eq!(params.fail_on_error, Some(true));
        assert_eq!(params.option_string(), "fail=TRUE");
        assert!(params.strict());
    }

    #[test]
    fn option_string_order() {
        let params = ImportParams {
            auto_rotate: Some(true),
            fail_on_error: Some(false),
            page: Some(2),
            n: Some(-1),
            density: Some(300),
            jpeg_shrink_factor: Some(4),
            heif_thumbnail: Some(false),
            svg_unlimited: Some(true),
        };
        assert_eq!(
            params.option_string(),
            "n=-1,page=2,dpi=300,fail=FALSE,shrink=4,autorotate=TRUE,unlimited=TRUE,thumbnail=FALSE"
        );
    }

    #[test]
    fn codec_defaults() {
        assert_eq!(JpegExportParams::default().quality, 80);
        assert!(JpegExportParams::default().interlace);
        assert_eq!(PngExportParams::default().compression, 6);
        assert!(!PngExportParams::default().interlace);
        assert_eq!(WebpExportParams::default().quality, 75);
        assert_eq!(WebpExportParams::default().reduction_effort, 4);
        let tiff = TiffExportParams::default();
        assert_eq!(tiff.compression, TiffCompression::Lzw);
        assert_eq!(tiff.predictor, TiffPredictor::Horizontal);
        let gif = GifExportParams::default();
        assert_eq!((gif.quality, gif.effort, gif.bitdepth), (75, 7, 8));
        assert_eq!(AvifExportParams::default().speed, 5);
        let jp2k = Jp2kExportParams::default();
        assert_eq!((jp2k.tile_width, jp2k.tile_height), (512, 512));
    }

    #[test]
    fn generic_tiff_maps_lossless_to_uncompressed() {
        let params = ExportParams {
            lossless: true,
            ..Default::default()
        };
        match map_generic(&params, ImageType::Tiff) {
            CodecParams::Tiff(tiff) => assert_eq!(tiff.compression, TiffCompression::None),
            other => panic!("unexpected {other:?}"),
        }
        match map_generic(&ExportParams::default(), ImageType::Tiff) {
            CodecParams::Tiff(tiff) => assert_eq!(tiff.compression, TiffCompression::Lzw),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn generic_gif_carries_quality_only() {
        let params = ExportParams {
            quality: 40,
            effort: 9,
            strip_metadata: true,
            ..Default::default()
        };
        assert_eq!(
            map_generic(&params, ImageType::Gif),
            CodecParams::Gif(GifExportParams {
                strip_metadata: false,
                quality: 40,
                dither: 0.0,
                effort: 0,
                bitdepth: 0,
            })
        );
        assert_eq!(dropped_fields(&params, ImageType::Gif), vec!["effort", "strip_metadata"]);
    }

    #[test]
    fn unmapped_formats_use_jpeg_row() {
        let params = ExportParams {
            quality: 55,
            ..Default::default()
        };
        match map_generic(&params, ImageType::Jp2k) {
            CodecParams::Jpeg(jpeg) => {
                assert_eq!(jpeg.quality, 55);
                assert!(jpeg.interlace);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn defaults_for_formats() {
        assert_eq!(CodecParams::defaults_for(ImageType::Png).format(), ImageType::Png);
        assert_eq!(CodecParams::defaults_for(ImageType::Bmp).format(), ImageType::Jpeg);
        assert_eq!(CodecParams::defaults_for(ImageType::Jp2k).format(), ImageType::Jp2k);
    }
}
