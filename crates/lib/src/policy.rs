//! Whether an image may be copied at all.
//!
//! The check runs against the image actually selected for copying (for a
//! manifest list, the chosen instance) before anything is written.

use std::fmt::Debug;

use crate::transport::{ImageReference, UnparsedManifest};

/// The image was not allowed by policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Source image {image} rejected by policy: {reason}")]
pub struct PolicyError {
    /// The rejected image.
    pub image: String,
    /// Why.
    pub reason: String,
}

/// Decides whether an image may be copied.
pub trait PolicyContext: Debug {
    /// Check `manifest`, read from `source` with the given signatures.
    fn is_image_allowed(
        &self,
        source: &ImageReference,
        manifest: &UnparsedManifest,
        signatures: &[Vec<u8>],
    ) -> Result<(), PolicyError>;
}

/// Accept every image. Not recommended outside of local testing.
#[derive(Debug, Default, Clone, Copy)]
pub struct InsecureAcceptAnything;

impl PolicyContext for InsecureAcceptAnything {
    fn is_image_allowed(
        &self,
        _source: &ImageReference,
        _manifest: &UnparsedManifest,
        _signatures: &[Vec<u8>],
    ) -> Result<(), PolicyError> {
        Ok(())
    }
}

/// Accept only images which carry at least one signature.
///
/// This does not verify the signatures cryptographically; it only ensures
/// unsigned images are not copied by accident.
#[derive(Debug, Default, Clone, Copy)]
pub struct RequireSignatures;

impl PolicyContext for RequireSignatures {
    fn is_image_allowed(
        &self,
        source: &ImageReference,
        manifest: &UnparsedManifest,
        signatures: &[Vec<u8>],
    ) -> Result<(), PolicyError> {
        if signatures.iter().any(|s| !s.is_empty()) {
            return Ok(());
        }
        Err(PolicyError {
            image: source.to_string(),
            reason: format!("no signatures found for {}", manifest.digest()),
        })
    }
}
