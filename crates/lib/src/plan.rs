//! # Manifest format negotiation
//!
//! Decides which manifest format to write to a destination, and in which
//! order to try alternatives if the destination rejects the first one.
//!
//! The set of types a destination advertises is a static guess; a
//! particular registry may still only accept a subset of them. So rather
//! than picking a single type, we build a list of candidates in order of
//! decreasing preference and let [`crate::orchestrate`] walk it.
//!
//! Keeping the original manifest byte-for-byte is always preferred, since
//! any conversion changes the manifest digest.

use std::collections::HashSet;

use serde::Serialize;

use crate::mime;
use crate::ordered_set::OrderedSet;

/// Manifest MIME types in order of our preference, if we can't use the
/// original manifest and need to convert.
///
/// v2s2 is preferred to v2s1 because v2s2 does not need to be changed when
/// uploading to a different location. Signed v2s1 is included but not unsigned
/// v2s1, because docker/distribution requires a signature even if the
/// unsigned MIME type is used.
pub const PREFERRED_MANIFEST_TYPES: &[&str] =
    &[mime::DOCKER_V2_SCHEMA2, mime::DOCKER_V2_SCHEMA1_SIGNED];

/// Errors from format negotiation. Planners never return partial plans.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NegotiationError {
    /// Filtering left no usable format.
    #[error("destination does not support any supported {kind} types ({})", .known.join(", "))]
    NoEligibleFormat {
        /// What we were looking for, e.g. `manifest list`.
        kind: &'static str,
        /// The formats which would have been acceptable.
        known: Vec<String>,
    },
    /// A state the algorithm should make impossible.
    #[error("Internal error: {0}")]
    InternalInconsistency(&'static str),
}

/// A record of a decision made during negotiation. These are returned as part
/// of plans rather than logged directly; see [`crate::copy`] for where they
/// end up in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum NegotiationEvent {
    /// The source MIME type is treated as a different, canonical one.
    SourceNormalized {
        /// The declared type.
        from: String,
        /// The type used for comparisons.
        to: String,
    },
    /// Nothing constrains the destination; the original is used as is.
    Unconstrained {
        /// The (normalized) source type.
        format: String,
    },
    /// The manifest cannot be modified, so no conversion is attempted.
    CannotModify {
        /// Why it cannot be modified.
        reason: String,
    },
    /// The computed candidate list for a single image.
    Candidates {
        /// The (normalized) source type.
        source: String,
        /// Candidates, most preferred first.
        candidates: Vec<String>,
    },
    /// The first candidate is the original manifest, unmodified.
    UsingOriginal {
        /// The (normalized) source type.
        format: String,
    },
    /// The computed candidate list for a manifest list.
    ListCandidates {
        /// The current list type.
        current: String,
        /// The list types supported by the destination.
        supported: Vec<String>,
    },
    /// The list will be converted before the first attempt.
    ListConverting {
        /// The first type tried.
        selected: String,
        /// Remaining candidates.
        others: Vec<String>,
    },
    /// The list's original type is tried first.
    ListUsingOriginal {
        /// Remaining candidates.
        others: Vec<String>,
    },
}

impl std::fmt::Display for NegotiationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SourceNormalized { from, to } => {
                write!(f, "Source manifest MIME type {from}, treating it as {to}")
            }
            Self::Unconstrained { format } => {
                write!(f, "Destination is unconstrained; using {format} unmodified")
            }
            Self::CannotModify { reason } => {
                write!(f, "We can't modify the manifest ({reason}), hoping for the best...")
            }
            Self::Candidates { source, candidates } => write!(
                f,
                "Manifest has MIME type {source}, ordered candidate list [{}]",
                candidates.join(", ")
            ),
            Self::UsingOriginal { .. } => {
                f.write_str("... will first try using the original manifest unmodified")
            }
            Self::ListCandidates { current, supported } => write!(
                f,
                "Manifest list has MIME type {current}, ordered candidate list [{}]",
                supported.join(", ")
            ),
            Self::ListConverting { selected, others } => write!(
                f,
                "... will convert to {selected} first, and then try [{}]",
                others.join(", ")
            ),
            Self::ListUsingOriginal { others } => write!(
                f,
                "... will use the original manifest list type, and then try [{}]",
                others.join(", ")
            ),
        }
    }
}

/// The inputs for [`plan_manifest_conversion`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ManifestConversionInputs<'a> {
    /// MIME type of the input manifest, as declared.
    pub source_format: &'a str,
    /// MIME types supported by the destination, per
    /// [`crate::transport::ImageDestination::supported_manifest_types`].
    /// Empty means "anything".
    pub destination_supported_formats: &'a [String],
    /// User's choice of forced manifest MIME type.
    pub forced_format: Option<&'a str>,
    /// Restrict to manifest formats that can support encrypted layers.
    pub requires_encryption: bool,
    /// The reason the manifest cannot be modified, if it can't.
    pub cannot_modify_reason: Option<&'a str>,
}

/// The decisions made by [`plan_manifest_conversion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ManifestConversionPlan {
    /// The normalized source MIME type.
    pub source_format: String,
    /// The format to try first, whether we are converting to it or using it unmodified.
    pub preferred_format: String,
    /// True if using `preferred_format` requires a conversion step.
    pub preferred_needs_conversion: bool,
    /// Other possible alternatives, in order.
    pub fallback_formats: Vec<String>,
    /// What was decided, and why.
    pub events: Vec<NegotiationEvent>,
}

impl ManifestConversionPlan {
    /// A plan using the source as is, with nothing to fall back to.
    fn unmodified(source: &str, events: Vec<NegotiationEvent>) -> Self {
        Self {
            source_format: source.to_owned(),
            preferred_format: source.to_owned(),
            preferred_needs_conversion: false,
            fallback_formats: Vec::new(),
            events,
        }
    }
}

/// Returns a plan for what formats, and possibly conversions, to use.
pub fn plan_manifest_conversion(
    inputs: &ManifestConversionInputs<'_>,
) -> Result<ManifestConversionPlan, NegotiationError> {
    let mut events = Vec::new();
    let src = mime::normalized_mime_type(inputs.source_format);
    if src != inputs.source_format {
        events.push(NegotiationEvent::SourceNormalized {
            from: inputs.source_format.to_owned(),
            to: src.to_owned(),
        });
    }

    let dest: Vec<&str> = match inputs.forced_format.filter(|f| !f.is_empty()) {
        Some(forced) => vec![forced],
        None => inputs
            .destination_supported_formats
            .iter()
            .map(String::as_str)
            .collect(),
    };
    let encryption_ok = |t: &str| !inputs.requires_encryption || mime::supports_encryption(t);

    if dest.is_empty() && encryption_ok(src) {
        // Anything goes; just use the original as is, do not try any conversions.
        events.push(NegotiationEvent::Unconstrained {
            format: src.to_owned(),
        });
        return Ok(ManifestConversionPlan::unmodified(src, events));
    }
    let eligible: HashSet<&str> = dest.iter().copied().filter(|t| encryption_ok(t)).collect();

    let mut prioritized = OrderedSet::new();
    // First of all, prefer to keep the original manifest unmodified.
    if eligible.contains(src) {
        prioritized.append(src);
    }
    if let Some(reason) = inputs.cannot_modify_reason.filter(|r| !r.is_empty()) {
        // Take our chances; whether this is acceptable is up to the destination.
        events.push(NegotiationEvent::CannotModify {
            reason: reason.to_owned(),
        });
        return Ok(ManifestConversionPlan::unmodified(src, events));
    }
    // Then use our list of preferred types.
    for t in PREFERRED_MANIFEST_TYPES {
        if eligible.contains(t) {
            prioritized.append(t);
        }
    }
    // Finally, try anything else the destination supports. This deliberately
    // ignores the encryption filter.
    for t in dest.iter() {
        prioritized.append(t);
    }

    events.push(NegotiationEvent::Candidates {
        source: src.to_owned(),
        candidates: prioritized.contents().to_vec(),
    });
    let mut candidates = prioritized.into_vec().into_iter();
    let Some(preferred_format) = candidates.next() else {
        if dest.is_empty() {
            // The only way to get here with an empty destination set.
            return Err(NegotiationError::NoEligibleFormat {
                kind: "encryption-capable manifest",
                known: vec![mime::OCI_MANIFEST.to_owned()],
            });
        }
        return Err(NegotiationError::InternalInconsistency(
            "no candidate MIME types",
        ));
    };
    let preferred_needs_conversion = preferred_format != src;
    if !preferred_needs_conversion {
        events.push(NegotiationEvent::UsingOriginal {
            format: src.to_owned(),
        });
    }
    Ok(ManifestConversionPlan {
        source_format: src.to_owned(),
        preferred_format,
        preferred_needs_conversion,
        fallback_formats: candidates.collect(),
        events,
    })
}
