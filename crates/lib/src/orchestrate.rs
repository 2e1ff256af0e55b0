//! # Storing a manifest with format fallback
//!
//! Walks the candidates of a plan in order, converting the manifest as
//! needed, until the destination accepts one. Destinations only get a
//! [`PutManifestError::Rejected`] to say "not this format"; anything else
//! they report stops the loop.
//!
//! Attempts are strictly sequential: a rejected attempt may still have been
//! partially visible at the destination, so two formats must never race
//! for the same reference.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::convert::{ConversionError, ManifestConverter};
use crate::digest::Digest;
use crate::list::ListConversionPlan;
use crate::mime;
use crate::plan::ManifestConversionPlan;
use crate::transport::{ImageDestination, PutManifestError, UnparsedManifest};

/// Anything that yields manifest types to try, most preferred first.
pub trait CandidateFormats {
    /// The types to try, in order; never contains duplicates.
    fn candidate_formats(&self) -> Vec<&str>;
}

impl CandidateFormats for ManifestConversionPlan {
    fn candidate_formats(&self) -> Vec<&str> {
        std::iter::once(self.preferred_format.as_str())
            .chain(self.fallback_formats.iter().map(String::as_str))
            .collect()
    }
}

impl CandidateFormats for ListConversionPlan {
    fn candidate_formats(&self) -> Vec<&str> {
        std::iter::once(self.selected_format.as_str())
            .chain(self.other_candidates.iter().map(String::as_str))
            .collect()
    }
}

/// Why a candidate format did not work out.
#[derive(Debug)]
pub enum AttemptFailure {
    /// The manifest could not be converted to the format.
    Conversion(ConversionError),
    /// The destination rejected the format.
    Rejected(String),
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversion(e) => write!(f, "{e}"),
            Self::Rejected(r) => f.write_str(r),
        }
    }
}

/// One failed attempt.
#[derive(Debug)]
pub struct Attempt {
    /// The format tried.
    pub media_type: String,
    /// What went wrong.
    pub failure: AttemptFailure,
}

fn format_attempts(attempts: &[Attempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.media_type, a.failure))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors from [`store_with_fallback`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Every candidate was rejected or could not be produced.
    #[error(
        "Uploading manifest failed, attempted the following formats: {}",
        format_attempts(attempts)
    )]
    Exhausted {
        /// Every attempt, in order.
        attempts: Vec<Attempt>,
    },
    /// The destination failed for a reason unrelated to the format.
    #[error(transparent)]
    Fatal(anyhow::Error),
    /// The caller asked us to stop.
    #[error("Operation cancelled")]
    Cancelled,
}

/// A manifest as accepted by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredManifest {
    /// The type it was stored as.
    pub media_type: String,
    /// False if these are the source bytes, unmodified.
    pub converted: bool,
    /// The bytes stored.
    pub manifest: Vec<u8>,
    /// Digest of [`Self::manifest`].
    pub digest: Digest,
}

/// Store `manifest` at `destination`, trying each of the plan's candidate
/// formats in turn.
///
/// With `as_instance`, the manifest is stored as an instance of a list,
/// addressed by the digest of whatever bytes are being stored.
pub fn store_with_fallback(
    plan: &dyn CandidateFormats,
    manifest: &UnparsedManifest,
    destination: &mut dyn ImageDestination,
    converter: &dyn ManifestConverter,
    as_instance: bool,
    cancel: &CancellationToken,
) -> Result<StoredManifest, StoreError> {
    let source_format = mime::normalized_mime_type(&manifest.media_type);
    let mut attempts = Vec::new();
    for candidate in plan.candidate_formats() {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let converted = candidate != source_format;
        let bytes = if converted {
            tracing::debug!("Converting manifest from {source_format} to {candidate}");
            match converter.convert(&manifest.bytes, source_format, candidate) {
                Ok(b) => b,
                Err(e) => {
                    tracing::debug!("Cannot use {candidate}: {e}");
                    attempts.push(Attempt {
                        media_type: candidate.to_owned(),
                        failure: AttemptFailure::Conversion(e),
                    });
                    continue;
                }
            }
        } else {
            manifest.bytes.clone()
        };
        tracing::debug!("Trying to store manifest as {candidate}");
        let digest = Digest::of(&bytes);
        let instance = as_instance.then_some(&digest);
        match destination.put_manifest(&bytes, candidate, instance) {
            Ok(()) => {
                return Ok(StoredManifest {
                    media_type: candidate.to_owned(),
                    converted,
                    manifest: bytes,
                    digest,
                });
            }
            Err(PutManifestError::Rejected { reason }) => {
                tracing::info!(
                    "Destination {} rejected {candidate}: {reason}",
                    destination.reference()
                );
                attempts.push(Attempt {
                    media_type: candidate.to_owned(),
                    failure: AttemptFailure::Rejected(reason),
                });
            }
            Err(PutManifestError::Fatal(e)) => return Err(StoreError::Fatal(e)),
        }
    }
    Err(StoreError::Exhausted { attempts })
}
