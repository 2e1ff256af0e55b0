//! # Manifest conversion
//!
//! Converts between the OCI and Docker schema 2 representations of an image
//! or an image list. Both describe the same content with different media
//! types, so conversion is a rewrite of the JSON document; fields we do not
//! touch keep their values and their order.
//!
//! Schema 1 manifests embed layer history in a format we do not generate,
//! so any conversion involving them is unsupported.

use std::fmt::Debug;

use serde_json::{Map, Value};

use crate::mime;

/// Why a manifest could not be converted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    /// We do not know how to convert between these types at all.
    #[error("Converting from {from} to {to} is not supported")]
    Unsupported {
        /// Source type.
        from: String,
        /// Requested type.
        to: String,
    },
    /// This particular manifest uses something the target type cannot express.
    #[error("{what} cannot be represented in {to}")]
    Unrepresentable {
        /// The offending field or media type.
        what: String,
        /// Requested type.
        to: String,
    },
    /// The input is not a manifest.
    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

/// Converts a manifest to a different MIME type.
pub trait ManifestConverter: Debug {
    /// Convert `manifest`, of type `from`, to type `to`.
    ///
    /// Converting to the same (normalized) type returns the input bytes.
    fn convert(&self, manifest: &[u8], from: &str, to: &str) -> Result<Vec<u8>, ConversionError>;
}

/// The converter used by default.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonManifestConverter;

type Rewrite = fn(&mut Map<String, Value>, &str) -> Result<(), ConversionError>;

impl ManifestConverter for JsonManifestConverter {
    fn convert(&self, manifest: &[u8], from: &str, to: &str) -> Result<Vec<u8>, ConversionError> {
        let from = mime::normalized_mime_type(from);
        let to = mime::normalized_mime_type(to);
        if from == to {
            return Ok(manifest.to_vec());
        }
        let rewrite: Rewrite = match (from, to) {
            (mime::OCI_MANIFEST, mime::DOCKER_V2_SCHEMA2) => oci_to_schema2,
            (mime::DOCKER_V2_SCHEMA2, mime::OCI_MANIFEST) => schema2_to_oci,
            (mime::OCI_INDEX, mime::DOCKER_V2_LIST) => index_to_list,
            (mime::DOCKER_V2_LIST, mime::OCI_INDEX) => list_to_index,
            _ => {
                return Err(ConversionError::Unsupported {
                    from: from.to_owned(),
                    to: to.to_owned(),
                });
            }
        };
        let mut root = match serde_json::from_slice(manifest) {
            Ok(Value::Object(o)) => o,
            Ok(_) => return Err(ConversionError::Invalid("not a JSON object".into())),
            Err(e) => return Err(ConversionError::Invalid(e.to_string())),
        };
        rewrite(&mut root, to)?;
        serde_json::to_vec(&root).map_err(|e| ConversionError::Invalid(e.to_string()))
    }
}

fn unrepresentable(what: impl Into<String>, to: &str) -> ConversionError {
    ConversionError::Unrepresentable {
        what: what.into(),
        to: to.to_owned(),
    }
}

fn media_type(o: &Map<String, Value>) -> &str {
    o.get("mediaType").and_then(Value::as_str).unwrap_or_default()
}

fn set_media_type(o: &mut Map<String, Value>, t: &str) {
    o.insert("mediaType".into(), Value::String(t.to_owned()));
}

/// Fail if any of `fields` is present.
fn reject_fields(o: &Map<String, Value>, fields: &[&str], to: &str) -> Result<(), ConversionError> {
    match fields.iter().find(|f| o.contains_key(**f)) {
        Some(f) => Err(unrepresentable(*f, to)),
        None => Ok(()),
    }
}

/// Apply `map` to the media type of every descriptor in the array `key`.
fn map_descriptors(
    root: &mut Map<String, Value>,
    key: &str,
    to: &str,
    drop_annotations: bool,
    map: impl Fn(&str) -> Option<&'static str>,
) -> Result<(), ConversionError> {
    let Some(descriptors) = root.get_mut(key) else {
        return Ok(());
    };
    let descriptors = descriptors
        .as_array_mut()
        .ok_or_else(|| ConversionError::Invalid(format!("{key} is not an array")))?;
    for d in descriptors {
        let d = d
            .as_object_mut()
            .ok_or_else(|| ConversionError::Invalid(format!("invalid entry in {key}")))?;
        map_descriptor(d, to, drop_annotations, &map)?;
    }
    Ok(())
}

fn map_descriptor(
    d: &mut Map<String, Value>,
    to: &str,
    drop_annotations: bool,
    map: impl Fn(&str) -> Option<&'static str>,
) -> Result<(), ConversionError> {
    let current = media_type(d);
    if mime::is_encrypted_layer(current) {
        return Err(unrepresentable(format!("Encrypted layer {current}"), to));
    }
    let mapped = map(current).ok_or_else(|| unrepresentable(current.to_owned(), to))?;
    set_media_type(d, mapped);
    if drop_annotations {
        d.shift_remove("annotations");
    }
    Ok(())
}

fn oci_to_schema2(root: &mut Map<String, Value>, to: &str) -> Result<(), ConversionError> {
    reject_fields(root, &["subject", "artifactType"], to)?;
    set_media_type(root, mime::DOCKER_V2_SCHEMA2);
    root.shift_remove("annotations");
    let config = root
        .get_mut("config")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ConversionError::Invalid("missing config".into()))?;
    map_descriptor(config, to, true, |t| {
        (t == mime::OCI_CONFIG).then_some(mime::DOCKER_CONFIG)
    })?;
    map_descriptors(root, "layers", to, true, |t| match t {
        mime::OCI_LAYER_GZIP => Some(mime::DOCKER_LAYER_GZIP),
        mime::OCI_LAYER => Some(mime::DOCKER_LAYER),
        mime::OCI_NONDISTRIBUTABLE_LAYER_GZIP => Some(mime::DOCKER_FOREIGN_LAYER_GZIP),
        // Docker has no zstd type
        _ => None,
    })
}

fn schema2_to_oci(root: &mut Map<String, Value>, to: &str) -> Result<(), ConversionError> {
    set_media_type(root, mime::OCI_MANIFEST);
    let config = root
        .get_mut("config")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| ConversionError::Invalid("missing config".into()))?;
    map_descriptor(config, to, false, |t| {
        (t == mime::DOCKER_CONFIG).then_some(mime::OCI_CONFIG)
    })?;
    map_descriptors(root, "layers", to, false, |t| match t {
        mime::DOCKER_LAYER_GZIP => Some(mime::OCI_LAYER_GZIP),
        mime::DOCKER_LAYER => Some(mime::OCI_LAYER),
        mime::DOCKER_FOREIGN_LAYER_GZIP => Some(mime::OCI_NONDISTRIBUTABLE_LAYER_GZIP),
        _ => None,
    })
}

/// Instance descriptors keep their media types; the instances themselves are
/// not converted here.
fn keep_instance_type(t: &str) -> Option<&'static str> {
    [mime::OCI_MANIFEST, mime::DOCKER_V2_SCHEMA2, mime::OCI_INDEX, mime::DOCKER_V2_LIST]
        .into_iter()
        .find(|k| *k == t)
}

fn index_to_list(root: &mut Map<String, Value>, to: &str) -> Result<(), ConversionError> {
    reject_fields(root, &["subject", "artifactType", "annotations"], to)?;
    let instances = root.get("manifests").and_then(Value::as_array);
    for d in instances.into_iter().flatten().filter_map(Value::as_object) {
        reject_fields(d, &["annotations"], to)?;
    }
    set_media_type(root, mime::DOCKER_V2_LIST);
    map_descriptors(root, "manifests", to, false, keep_instance_type)
}

fn list_to_index(root: &mut Map<String, Value>, to: &str) -> Result<(), ConversionError> {
    set_media_type(root, mime::OCI_INDEX);
    map_descriptors(root, "manifests", to, false, keep_instance_type)
}
