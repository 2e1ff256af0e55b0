//! # Manifest MIME types
//!
//! Classification of manifest media types: normalization, whether a type
//! describes a list of images, and whether it can carry encrypted layers.
//! Everything here is static and side-effect free.

use anyhow::{Result, anyhow};

/// Docker image manifest, schema version 1 (unsigned).
pub const DOCKER_V2_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Docker image manifest, schema version 1, with JWS signatures.
pub const DOCKER_V2_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Docker image manifest, schema version 2.
pub const DOCKER_V2_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Docker manifest list (multi-architecture).
pub const DOCKER_V2_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
/// OCI image manifest.
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
/// OCI image index (multi-architecture).
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// The manifest list types we know how to handle, in the order used when a
/// destination does not advertise anything.
pub const SUPPORTED_LIST_TYPES: &[&str] = &[DOCKER_V2_LIST, OCI_INDEX];

/// Every manifest type we know about; used e.g. for `Accept` headers.
pub const ALL_MANIFEST_TYPES: &[&str] = &[
    OCI_MANIFEST,
    DOCKER_V2_SCHEMA2,
    OCI_INDEX,
    DOCKER_V2_LIST,
    DOCKER_V2_SCHEMA1_SIGNED,
    DOCKER_V2_SCHEMA1,
];

/// Docker v2s2 image config.
pub(crate) const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// OCI image config.
pub(crate) const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
/// Docker v2s2 gzip layer.
pub(crate) const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
/// Docker v2s2 uncompressed layer.
pub(crate) const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
/// Docker v2s2 foreign (non-distributable) gzip layer.
pub(crate) const DOCKER_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
/// OCI uncompressed layer.
pub(crate) const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
/// OCI gzip layer.
pub(crate) const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
/// OCI non-distributable gzip layer.
pub(crate) const OCI_NONDISTRIBUTABLE_LAYER_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
/// Suffix used by ocicrypt for encrypted layers.
pub(crate) const ENCRYPTED_SUFFIX: &str = "+encrypted";

/// Map a manifest MIME type to the identifier we use for comparisons.
///
/// Known types map to themselves. `application/json` is a valid schema1 value,
/// and registries are known to return nonsense such as `text/plain` for
/// schema1 content, so anything unrecognized is treated as signed schema1.
pub fn normalized_mime_type(input: &str) -> &str {
    match input {
        DOCKER_V2_SCHEMA1 | DOCKER_V2_SCHEMA1_SIGNED | OCI_MANIFEST | OCI_INDEX
        | DOCKER_V2_SCHEMA2 | DOCKER_V2_LIST => input,
        _ => DOCKER_V2_SCHEMA1_SIGNED,
    }
}

/// Returns true if the type describes a list of per-platform images.
pub fn is_multi_image(mime_type: &str) -> bool {
    matches!(mime_type, DOCKER_V2_LIST | OCI_INDEX)
}

/// Returns true if manifests of this type can reference encrypted layers.
pub fn supports_encryption(mime_type: &str) -> bool {
    mime_type == OCI_MANIFEST
}

/// Parse a user-provided single-image manifest format: one of the short names
/// `oci`, `v2s2`, `v2s1`, or a full MIME type we know about.
pub fn parse_manifest_format(s: &str) -> Result<&'static str> {
    let r = match s {
        "oci" => OCI_MANIFEST,
        "v2s2" => DOCKER_V2_SCHEMA2,
        // The registry requires a signature even with the unsigned type.
        "v2s1" => DOCKER_V2_SCHEMA1_SIGNED,
        o => ALL_MANIFEST_TYPES
            .iter()
            .copied()
            .find(|t| *t == o && !is_multi_image(t))
            .ok_or_else(|| anyhow!("Unknown manifest format '{o}' (expected oci, v2s2 or v2s1)"))?,
    };
    Ok(r)
}

/// Parse a user-provided manifest list format: `oci-index`, `v2list`, or a
/// full list MIME type.
pub fn parse_list_format(s: &str) -> Result<&'static str> {
    let r = match s {
        "oci" | "oci-index" => OCI_INDEX,
        "v2list" | "v2s2" => DOCKER_V2_LIST,
        o => SUPPORTED_LIST_TYPES
            .iter()
            .copied()
            .find(|t| *t == o)
            .ok_or_else(|| {
                anyhow!("Unknown manifest list format '{o}' (expected oci-index or v2list)")
            })?,
    };
    Ok(r)
}

/// Guess the MIME type of a manifest from its contents, for transports which
/// do not record it.
pub fn guess_mime_type(manifest: &[u8]) -> Option<&'static str> {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Probe {
        media_type: Option<String>,
        schema_version: Option<u32>,
        signatures: Option<serde_json::Value>,
        config: Option<serde_json::Value>,
        manifests: Option<serde_json::Value>,
    }
    let probe: Probe = serde_json::from_slice(manifest).ok()?;
    if let Some(mt) = probe.media_type.as_deref() {
        if let Some(known) = ALL_MANIFEST_TYPES.iter().copied().find(|t| *t == mt) {
            return Some(known);
        }
    }
    match probe.schema_version? {
        1 if probe.signatures.is_some() => Some(DOCKER_V2_SCHEMA1_SIGNED),
        1 => Some(DOCKER_V2_SCHEMA1),
        2 if probe.manifests.is_some() => Some(OCI_INDEX),
        2 if probe.config.is_some() => Some(OCI_MANIFEST),
        _ => None,
    }
}

/// Returns true if a layer media type denotes ocicrypt-encrypted content.
pub(crate) fn is_encrypted_layer(mime_type: &str) -> bool {
    mime_type.ends_with(ENCRYPTED_SUFFIX)
}

/// Short human-readable name for a manifest type, used in log output.
pub fn short_name(mime_type: &str) -> &str {
    match mime_type {
        OCI_MANIFEST => "oci",
        OCI_INDEX => "oci-index",
        DOCKER_V2_SCHEMA2 => "v2s2",
        DOCKER_V2_LIST => "v2list",
        DOCKER_V2_SCHEMA1_SIGNED => "v2s1-signed",
        DOCKER_V2_SCHEMA1 => "v2s1",
        o => o,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        for t in ALL_MANIFEST_TYPES {
            assert_eq!(normalized_mime_type(t), *t);
        }
        assert_eq!(
            normalized_mime_type("application/json"),
            DOCKER_V2_SCHEMA1_SIGNED
        );
        assert_eq!(normalized_mime_type("text/plain"), DOCKER_V2_SCHEMA1_SIGNED);
        assert_eq!(normalized_mime_type(""), DOCKER_V2_SCHEMA1_SIGNED);
    }

    #[test]
    fn test_classify() {
        assert!(is_multi_image(OCI_INDEX));
        assert!(is_multi_image(DOCKER_V2_LIST));
        assert!(!is_multi_image(OCI_MANIFEST));
        assert!(!is_multi_image(DOCKER_V2_SCHEMA1));
        assert!(supports_encryption(OCI_MANIFEST));
        for t in [DOCKER_V2_SCHEMA2, DOCKER_V2_SCHEMA1, OCI_INDEX, DOCKER_V2_LIST] {
            assert!(!supports_encryption(t), "{t}");
        }
        for t in SUPPORTED_LIST_TYPES {
            assert!(is_multi_image(t));
        }
        assert!(is_encrypted_layer(
            "application/vnd.oci.image.layer.v1.tar+gzip+encrypted"
        ));
        assert!(!is_encrypted_layer(OCI_LAYER_GZIP));
    }

    #[test]
    fn test_guess() {
        let cases: &[(&str, Option<&str>)] = &[
            (r#"{"schemaVersion": 2, "mediaType": "application/vnd.docker.distribution.manifest.v2+json"}"#, Some(DOCKER_V2_SCHEMA2)),
            (r#"{"schemaVersion": 2, "config": {}, "layers": []}"#, Some(OCI_MANIFEST)),
            (r#"{"schemaVersion": 2, "manifests": []}"#, Some(OCI_INDEX)),
            (r#"{"schemaVersion": 1, "fsLayers": [], "signatures": []}"#, Some(DOCKER_V2_SCHEMA1_SIGNED)),
            (r#"{"schemaVersion": 1, "fsLayers": []}"#, Some(DOCKER_V2_SCHEMA1)),
            (r#"{"schemaVersion": 3}"#, None),
            ("not json", None),
        ];
        for (manifest, expected) in cases {
            assert_eq!(guess_mime_type(manifest.as_bytes()), *expected, "{manifest}");
        }
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!(parse_manifest_format("oci").unwrap(), OCI_MANIFEST);
        assert_eq!(parse_manifest_format("v2s2").unwrap(), DOCKER_V2_SCHEMA2);
        assert_eq!(
            parse_manifest_format("v2s1").unwrap(),
            DOCKER_V2_SCHEMA1_SIGNED
        );
        assert_eq!(
            parse_manifest_format(DOCKER_V2_SCHEMA1).unwrap(),
            DOCKER_V2_SCHEMA1
        );
        assert!(parse_manifest_format(OCI_INDEX).is_err());
        assert!(parse_manifest_format("blah").is_err());

        assert_eq!(parse_list_format("oci-index").unwrap(), OCI_INDEX);
        assert_eq!(parse_list_format("v2list").unwrap(), DOCKER_V2_LIST);
        assert_eq!(parse_list_format(DOCKER_V2_LIST).unwrap(), DOCKER_V2_LIST);
        assert!(parse_list_format(OCI_MANIFEST).is_err());
    }
}
