// src/engine/state.rs
//
// Mutable state behind a handle's lock, and the draft/commit protocol that
// makes multi-step mutations all-or-nothing.

use crate::engine::common::EngineResult;
use crate::engine::io::SourceBuffer;
use crate::engine::native::{NativeImage, NativeRef};
use crate::engine::premultiply::{self, PremultiplyState};
use crate::engine::profile::ProfileId;
use crate::error::ImageRefError;
use crate::ops::ImageType;
use tracing::debug;

/// Everything a handle owns.
#[derive(Debug)]
pub(crate) struct HandleState {
    /// `None` only after close.
    pub native: Option<NativeRef>,
    /// Encoded input, kept alive until close.
    pub source: Option<SourceBuffer>,
    pub format: ImageType,
    pub original_format: ImageType,
    pub premultiplication: PremultiplyState,
    pub optimized_profile: Option<ProfileId>,
}

impl HandleState {
    pub fn new(
        native: NativeRef,
        source: Option<SourceBuffer>,
        format: ImageType,
        original_format: ImageType,
    ) -> Self {
        Self {
            native: Some(native),
            source,
            format,
            original_format,
            premultiplication: PremultiplyState::Inactive,
            optimized_profile: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.native.is_none()
    }

    /// The current native object, or `ImageClosed`.
    pub fn native(&self) -> EngineResult<&NativeRef> {
        self.native.as_ref().ok_or_else(ImageRefError::image_closed)
    }

    /// Swap in `next`, releasing the previous reference.
    ///
    /// Installing the object already held is a no-op. Returns whether a
    /// reference was released.
    pub fn install(&mut self, next: NativeRef) -> bool {
        if let Some(current) = &self.native {
            if current.same_object(&next) {
                return false;
            }
        }
        let released = self.native.replace(next).is_some();
        if released {
            debug!(target: "image_ref::lifecycle", "released previous native reference");
        }
        released
    }

    /// Drop the native reference and the source buffer. Returns `true` only
    /// when something was released.
    pub fn release(&mut self) -> bool {
        self.source = None;
        self.premultiplication = PremultiplyState::Inactive;
        self.native.take().is_some()
    }

    /// Start a mutation. The draft holds its own reference, so the handle
    /// stays valid until `commit`.
    pub fn draft(&self) -> EngineResult<Draft> {
        Ok(Draft {
            image: self.native()?.clone(),
            premultiplication: self.premultiplication,
            optimized_profile: self.optimized_profile,
        })
    }

    /// Install a finished draft. Returns whether a reference was released.
    pub fn commit(&mut self, draft: Draft) -> bool {
        self.premultiplication = draft.premultiplication;
        self.optimized_profile = draft.optimized_profile;
        self.install(draft.image)
    }
}

/// Working copy of the handle state.
///
/// Every step of a mutation runs against the draft; nothing reaches the
/// handle until the whole sequence succeeded.
#[derive(Debug)]
pub(crate) struct Draft {
    pub image: NativeRef,
    pub premultiplication: PremultiplyState,
    pub optimized_profile: Option<ProfileId>,
}

impl Draft {
    /// Replace the draft image with the output of `step`.
    pub fn apply<F>(&mut self, step: F) -> EngineResult<()>
    where
        F: FnOnce(&NativeImage) -> EngineResult<NativeImage>,
    {
        let next = step(&self.image)?;
        self.image = NativeRef::new(next);
        Ok(())
    }

    /// Edit a private copy of the image's metadata.
    pub fn edit<F>(&mut self, edit: F)
    where
        F: FnOnce(&mut NativeImage),
    {
        let mut next = (*self.image).clone();
        edit(&mut next);
        self.image = NativeRef::new(next);
    }

    pub fn premultiply(&mut self) -> EngineResult<()> {
        if self.premultiplication.is_active() || !self.image.has_alpha() {
            return Ok(());
        }
        let format = self.image.band_format();
        self.apply(premultiply::premultiply)?;
        self.premultiplication = PremultiplyState::Active(format);
        Ok(())
    }

    pub fn unpremultiply(&mut self) -> EngineResult<()> {
        let PremultiplyState::Active(format) = self.premultiplication else {
            return Ok(());
        };
        self.apply(|img| premultiply::unpremultiply(img, format))?;
        self.premultiplication = PremultiplyState::Inactive;
        Ok(())
    }
}
