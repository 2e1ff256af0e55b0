//! Format negotiation for manifest lists (multi-architecture images).
//!
//! This is deliberately thinner than [`crate::plan`]: there is no encryption
//! filter, no "cannot modify" short-circuit and no global ranking. We keep
//! the current type if the destination accepts it, and otherwise take
//! whichever list types the destination advertises, in its own order.

use serde::Serialize;

use crate::mime;
use crate::ordered_set::OrderedSet;
use crate::plan::{NegotiationError, NegotiationEvent};

/// The decisions made by [`plan_list_conversion`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListConversionPlan {
    /// The type of the list as read from the source.
    pub current_format: String,
    /// The type to try first, whether converting to it or using it unmodified.
    pub selected_format: String,
    /// Other list types which might be supported by the destination.
    pub other_candidates: Vec<String>,
    /// What was decided.
    pub events: Vec<NegotiationEvent>,
}

impl ListConversionPlan {
    /// True if the first attempt requires converting the list.
    pub fn selected_needs_conversion(&self) -> bool {
        self.selected_format != self.current_format
    }
}

/// Given the current MIME type of a list of manifests, the MIME types
/// supported by a destination and a possible forced value, return the type
/// to which we should convert the list first, and the other list types the
/// destination might accept.
pub fn plan_list_conversion(
    current_format: &str,
    destination_supported_formats: &[String],
    forced_format: Option<&str>,
) -> Result<ListConversionPlan, NegotiationError> {
    let mut supported: Vec<&str> = destination_supported_formats
        .iter()
        .map(String::as_str)
        .collect();
    // If there's no list of supported types, then anything we support is
    // expected to be supported.
    if supported.is_empty() {
        supported = mime::SUPPORTED_LIST_TYPES.to_vec();
    }
    if let Some(forced) = forced_format.filter(|f| !f.is_empty()) {
        supported = vec![forced];
    }

    let mut prioritized = OrderedSet::new();
    // The current type is preferred if it's in the list, since that lets us
    // avoid a conversion that isn't strictly necessary.
    if let Some(t) = supported.iter().find(|t| **t == current_format) {
        prioritized.append(t);
    }
    for t in supported.iter().filter(|t| mime::is_multi_image(t)) {
        prioritized.append(t);
    }

    let mut events = vec![NegotiationEvent::ListCandidates {
        current: current_format.to_owned(),
        supported: supported.iter().map(|t| t.to_string()).collect(),
    }];
    let mut candidates = prioritized.into_vec().into_iter();
    let Some(selected_format) = candidates.next() else {
        return Err(NegotiationError::NoEligibleFormat {
            kind: "manifest list",
            known: mime::SUPPORTED_LIST_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect(),
        });
    };
    let other_candidates: Vec<String> = candidates.collect();
    if selected_format != current_format {
        events.push(NegotiationEvent::ListConverting {
            selected: selected_format.clone(),
            others: other_candidates.clone(),
        });
    } else {
        events.push(NegotiationEvent::ListUsingOriginal {
            others: other_candidates.clone(),
        });
    }
    Ok(ListConversionPlan {
        current_format: current_format.to_owned(),
        selected_format,
        other_candidates,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::*;

    fn s(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_keep_current() {
        let p = plan_list_conversion(OCI_INDEX, &s(&[OCI_INDEX, DOCKER_V2_LIST]), None).unwrap();
        assert_eq!(p.selected_format, OCI_INDEX);
        assert_eq!(p.other_candidates, s(&[DOCKER_V2_LIST]));
        assert!(!p.selected_needs_conversion());

        // Current type comes first even if advertised later
        let p = plan_list_conversion(OCI_INDEX, &s(&[DOCKER_V2_LIST, OCI_INDEX]), None).unwrap();
        assert_eq!(p.selected_format, OCI_INDEX);
        assert_eq!(p.other_candidates, s(&[DOCKER_V2_LIST]));
    }

    #[test]
    fn test_convert() {
        let p = plan_list_conversion(
            DOCKER_V2_LIST,
            &s(&[OCI_MANIFEST, OCI_INDEX, DOCKER_V2_SCHEMA2]),
            None,
        )
        .unwrap();
        assert_eq!(p.selected_format, OCI_INDEX);
        assert!(p.other_candidates.is_empty());
        assert!(p.selected_needs_conversion());
        assert!(matches!(
            p.events.last(),
            Some(NegotiationEvent::ListConverting { .. })
        ));
    }

    #[test]
    fn test_unconstrained() {
        let p = plan_list_conversion(OCI_INDEX, &[], None).unwrap();
        assert_eq!(p.selected_format, OCI_INDEX);
        assert_eq!(p.other_candidates, s(&[DOCKER_V2_LIST]));
        let p = plan_list_conversion(DOCKER_V2_LIST, &[], None).unwrap();
        assert_eq!(p.selected_format, DOCKER_V2_LIST);
        assert_eq!(p.other_candidates, s(&[OCI_INDEX]));
    }

    #[test]
    fn test_forced() {
        let p = plan_list_conversion(
            OCI_INDEX,
            &s(&[OCI_INDEX, DOCKER_V2_LIST]),
            Some(DOCKER_V2_LIST),
        )
        .unwrap();
        assert_eq!(p.selected_format, DOCKER_V2_LIST);
        assert!(p.other_candidates.is_empty());

        // Forcing a non-list type leaves nothing usable
        assert!(plan_list_conversion(OCI_INDEX, &[], Some(OCI_MANIFEST)).is_err());
    }

    #[test]
    fn test_no_list_support() {
        let e = plan_list_conversion(OCI_INDEX, &s(&[DOCKER_V2_SCHEMA2]), None).unwrap_err();
        similar_asserts::assert_eq!(
            e,
            NegotiationError::NoEligibleFormat {
                kind: "manifest list",
                known: s(SUPPORTED_LIST_TYPES),
            }
        );
        let msg = e.to_string();
        for t in SUPPORTED_LIST_TYPES {
            assert!(msg.contains(t), "{msg}");
        }
    }

    #[test]
    fn test_idempotent() {
        let dest = s(&[DOCKER_V2_LIST, OCI_INDEX]);
        assert_eq!(
            plan_list_conversion(OCI_INDEX, &dest, None),
            plan_list_conversion(OCI_INDEX, &dest, None)
        );
    }
}
