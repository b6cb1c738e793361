// src/engine/api.rs
//
// ImageRef: the managed handle over a native image object.
// This is the main public API of the crate. Mutations live in transform.rs,
// export in export.rs and raw serialization in raw.rs.

use crate::engine::common::EngineResult;
use crate::engine::decoder::{self, check_dimensions};
use crate::engine::io::{map_file, SourceBuffer};
use crate::engine::native::{NativeImage, NativeRef};
use crate::engine::params::ImportParams;
use crate::engine::primitives::{bands, geometry};
use crate::engine::profile::ProfileId;
use crate::engine::state::{Draft, HandleState};
use crate::error::Result;
use crate::ops::{BandFormat, ImageType, Interesting, Interpretation, Size};
use image::{DynamicImage, GrayImage};
use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, trace};

/// A handle over one decoded image.
///
/// Usage:
/// ```no_run
/// use image_ref::{ImageRef, ops::Kernel};
///
/// let bytes = std::fs::read("photo.jpg")?;
/// let image = ImageRef::new(&bytes)?;
/// image.resize(0.5, Kernel::Lanczos3)?;
/// let jpeg = image.export_jpeg(None)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
/// Every mutation replaces the underlying native object; a failed mutation
/// leaves the handle exactly as it was. Calls on one handle serialize on an
/// internal lock, so the handle can be shared across threads.
pub struct ImageRef {
    pub(crate) state: Mutex<HandleState>,
}

impl ImageRef {
    // =========================================================================
    // CONSTRUCTORS
    // =========================================================================

    /// Decode an encoded buffer with default import options.
    pub fn new(bytes: &[u8]) -> Result<Self> {
        Self::load_with(bytes, &ImportParams::default())
    }

    /// Decode an encoded buffer. The bytes are copied and retained until
    /// the handle is closed.
    pub fn load_with(bytes: &[u8], params: &ImportParams) -> Result<Self> {
        Self::from_source(SourceBuffer::Memory(Arc::from(bytes)), params)
    }

    /// Decode a file.
    /// **ZERO-COPY MEMORY MAPPING**: the file is mapped, not read, and the
    /// mapping is kept until the handle is closed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_file_with(path, &ImportParams::default())
    }

    pub fn from_file_with(path: impl AsRef<Path>, params: &ImportParams) -> Result<Self> {
        let source = map_file(path.as_ref())?;
        Self::from_source(source, params)
    }

    fn from_source(source: SourceBuffer, params: &ImportParams) -> Result<Self> {
        crate::engine::startup();
        let decoded = decoder::decode(source.as_bytes(), params)?;
        debug!(
            target: "image_ref::lifecycle",
            format = %decoded.original_format,
            width = decoded.image.width(),
            height = decoded.image.height(),
            pages = decoded.image.pages(),
            options = %params.option_string(),
            "handle created"
        );
        Ok(Self::from_state(HandleState::new(
            NativeRef::new(decoded.image),
            Some(source),
            decoded.format,
            decoded.original_format,
        )))
    }

    /// Decode and reduce to a thumbnail in one step. JPEG input is shrunk
    /// while decoding when the box allows it; the image is auto-rotated
    /// before fitting.
    pub fn thumbnail_from_buffer(
        bytes: &[u8],
        width: u32,
        height: u32,
        crop: Interesting,
    ) -> Result<Self> {
        Self::thumbnail_from_buffer_with(bytes, width, height, crop, Size::Both, &ImportParams::default())
    }

    pub fn thumbnail_from_buffer_with(
        bytes: &[u8],
        width: u32,
        height: u32,
        crop: Interesting,
        size: Size,
        params: &ImportParams,
    ) -> Result<Self> {
        let source = SourceBuffer::Memory(Arc::from(bytes));
        Self::thumbnail_from_source(source, width, height, crop, size, params)
    }

    pub fn thumbnail_from_file(
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        crop: Interesting,
    ) -> Result<Self> {
        Self::thumbnail_from_file_with(path, width, height, crop, Size::Both, &ImportParams::default())
    }

    pub fn thumbnail_from_file_with(
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        crop: Interesting,
        size: Size,
        params: &ImportParams,
    ) -> Result<Self> {
        let source = map_file(path.as_ref())?;
        Self::thumbnail_from_source(source, width, height, crop, size, params)
    }

    fn thumbnail_from_source(
        source: SourceBuffer,
        width: u32,
        height: u32,
        crop: Interesting,
        size: Size,
        params: &ImportParams,
    ) -> Result<Self> {
        crate::engine::startup();
        let bytes = source.as_bytes();
        let shrink = params
            .jpeg_shrink_factor
            .unwrap_or_else(|| decoder::thumbnail_shrink(bytes, width, height, crop, size));
        let load = ImportParams {
            auto_rotate: Some(true),
            jpeg_shrink_factor: Some(shrink),
            ..params.clone()
        };
        let decoded = decoder::decode(bytes, &load)?;
        let image = geometry::thumbnail(&decoded.image, width, height, crop, size)?;
        debug!(
            target: "image_ref::lifecycle",
            format = %decoded.original_format,
            shrink,
            width = image.width(),
            height = image.height(),
            "thumbnail handle created"
        );
        // the handle reports the loaded format as its original one too
        Ok(Self::from_state(HandleState::new(
            NativeRef::new(image),
            Some(source),
            decoded.format,
            decoded.format,
        )))
    }

    /// Wrap an already built native image. Used by factories that do not
    /// decode anything.
    pub(crate) fn from_native(image: NativeImage, format: ImageType) -> Self {
        crate::engine::startup();
        debug!(
            target: "image_ref::lifecycle",
            width = image.width(),
            height = image.height(),
            "handle created from pixels"
        );
        Self::from_state(HandleState::new(NativeRef::new(image), None, format, format))
    }

    fn from_state(state: HandleState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// A one-band, 8-bit, all-zero image.
    pub fn black(width: u32, height: u32) -> Result<Self> {
        check_dimensions(width, height)?;
        let image = NativeImage::new(DynamicImage::ImageLuma8(GrayImage::new(width, height)));
        Ok(Self::from_native(image, ImageType::Unknown))
    }

    /// A lookup table whose entries equal their index: 256 x 1 8-bit, or
    /// 65536 x 1 16-bit with `ushort`. Mapping through it with `maplut`
    /// leaves an image unchanged.
    pub fn identity(ushort: bool) -> Result<Self> {
        Ok(Self::from_native(bands::identity(ushort), ImageType::Unknown))
    }

    /// A two-band 16-bit image holding each pixel's x and y coordinates.
    pub fn xyz(width: u32, height: u32) -> Result<Self> {
        Ok(Self::from_native(bands::xyz(width, height)?, ImageType::Unknown))
    }

    /// An independent handle over the same native object.
    ///
    /// The object itself is immutable, so sharing it is safe: the first
    /// mutation on either handle builds a new object for that handle only.
    pub fn copy(&self) -> Result<Self> {
        let state = self.state.lock();
        let native = state.native()?.clone();
        let copied = HandleState {
            native: Some(native),
            source: state.source.clone(),
            format: state.format,
            original_format: state.original_format,
            premultiplication: state.premultiplication,
            optimized_profile: state.optimized_profile,
        };
        debug!(target: "image_ref::lifecycle", "handle copied");
        Ok(Self::from_state(copied))
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Release the native object and the retained source buffer.
    ///
    /// Idempotent: returns `true` only for the call that released.
    pub fn close(&self) -> bool {
        let released = self.state.lock().release();
        if released {
            debug!(target: "image_ref::lifecycle", "handle closed");
        }
        released
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_closed()
    }

    // =========================================================================
    // INTERNAL PLUMBING
    // =========================================================================

    /// Run `steps` on a draft of the handle state and commit it if every
    /// step succeeded. The lock is held for the whole sequence.
    pub(crate) fn mutate<F>(&self, operation: &'static str, steps: F) -> Result<()>
    where
        F: FnOnce(&mut Draft) -> EngineResult<()>,
    {
        let mut state = self.state.lock();
        let mut draft = state.draft()?;
        steps(&mut draft)?;
        let (width, height, pages) = (draft.image.width(), draft.image.height(), draft.image.pages());
        state.commit(draft);
        trace!(target: "image_ref::ops", operation, width, height, pages, "committed");
        Ok(())
    }

    /// A counted reference to the current native object, taken under the
    /// lock. Work on it can run without holding the lock.
    pub(crate) fn snapshot(&self) -> Result<NativeRef> {
        Ok(self.state.lock().native()?.clone())
    }

    /// Query the native object, or `T::default()` once closed.
    fn query<T: Default>(&self, f: impl FnOnce(&NativeImage) -> T) -> T {
        let state = self.state.lock();
        state.native.as_deref().map(f).unwrap_or_default()
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    pub fn width(&self) -> u32 {
        self.query(|img| img.width())
    }

    /// Full height, all pages included.
    pub fn height(&self) -> u32 {
        self.query(|img| img.height())
    }

    pub fn bands(&self) -> u32 {
        self.query(|img| img.bands())
    }

    pub fn band_format(&self) -> Option<BandFormat> {
        self.query(|img| Some(img.band_format()))
    }

    /// The interpretation recorded on the image.
    pub fn interpretation(&self) -> Option<Interpretation> {
        self.query(|img| Some(img.interpretation()))
    }

    /// The colour space the image would be displayed in: the recorded
    /// interpretation when it is a colour space, otherwise a guess from
    /// the band count.
    pub fn color_space(&self) -> Option<Interpretation> {
        self.query(|img| Some(img.color_space()))
    }

    /// Format the handle reports: the decoded format, `Png` for BMP input,
    /// `Unknown` for images built from pixels.
    pub fn format(&self) -> ImageType {
        self.state.lock().format
    }

    pub fn original_format(&self) -> ImageType {
        self.state.lock().original_format
    }

    pub fn has_alpha(&self) -> bool {
        self.query(|img| img.has_alpha())
    }

    pub fn has_icc_profile(&self) -> bool {
        self.query(|img| img.icc_profile().is_some())
    }

    pub fn has_exif(&self) -> bool {
        self.query(|img| img.exif().is_some())
    }

    pub fn orientation(&self) -> Option<u16> {
        self.query(|img| img.orientation())
    }

    /// Page count. Handles in JPEG 2000 format always report one page.
    pub fn pages(&self) -> u32 {
        let state = self.state.lock();
        state
            .native
            .as_deref()
            .map_or(0, |img| img.reported_pages(state.format))
    }

    pub fn page_height(&self) -> u32 {
        self.query(|img| img.page_height())
    }

    /// Per-page delays in milliseconds; empty when not animated.
    pub fn page_delay(&self) -> Vec<u32> {
        self.query(|img| img.delays.clone())
    }

    /// Animation loop count, 0 meaning forever.
    pub fn loop_count(&self) -> u32 {
        self.query(|img| img.loop_count)
    }

    /// Horizontal resolution in pixels per millimetre.
    pub fn resolution_x(&self) -> f64 {
        self.query(|img| img.xres)
    }

    /// Vertical resolution in pixels per millimetre.
    pub fn resolution_y(&self) -> f64 {
        self.query(|img| img.yres)
    }

    pub fn is_premultiplied(&self) -> bool {
        self.state.lock().premultiplication.is_active()
    }

    /// Profile recorded by the last `optimize_icc_profile`.
    pub fn optimized_profile(&self) -> Option<ProfileId> {
        self.state.lock().optimized_profile
    }
}

impl Drop for ImageRef {
    fn drop(&mut self) {
        if self.state.get_mut().release() {
            debug!(target: "image_ref::lifecycle", "handle dropped");
        }
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let mut s = f.debug_struct("ImageRef");
        match state.native.as_deref() {
            Some(img) => s
                .field("width", &img.width())
                .field("height", &img.height())
                .field("bands", &img.bands())
                .field("format", &state.format),
            None => s.field("closed", &true),
        };
        s.finish()
    }
}
