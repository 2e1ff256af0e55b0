//! Just enough manifest parsing for the copy pipeline: layer types, list
//! instances, and platform selection.
//!
//! Rewrites go through [`serde_json::Value`] so that fields we do not know
//! about survive, in their original order.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::Digest;

/// An operating system and CPU architecture, using the OCI/Go names
/// (`linux`, `amd64`, `arm64`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Platform {
    /// e.g. `linux`
    pub os: String,
    /// e.g. `amd64`
    pub architecture: String,
    /// e.g. `v8` for `arm64`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// The platform this process runs on.
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "x86" => "386",
            "aarch64" => "arm64",
            "loongarch64" => "loong64",
            o => o,
        };
        Self {
            os: std::env::consts::OS.to_owned(),
            architecture: architecture.to_owned(),
            variant: None,
        }
    }

    fn matches(&self, other: &ListPlatform) -> bool {
        self.os == other.os
            && self.architecture == other.architecture
            && self
                .variant
                .as_ref()
                .is_none_or(|v| other.variant.as_ref() == Some(v))
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = self.variant.as_deref() {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Platform {
    type Err = anyhow::Error;

    /// Parse `os/arch[/variant]`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split('/');
        let (Some(os), Some(architecture)) = (parts.next(), parts.next()) else {
            anyhow::bail!("Invalid platform '{s}' (expected os/arch[/variant])");
        };
        let variant = parts.next().map(ToOwned::to_owned);
        if os.is_empty() || architecture.is_empty() || parts.next().is_some() {
            anyhow::bail!("Invalid platform '{s}' (expected os/arch[/variant])");
        }
        Ok(Self {
            os: os.to_owned(),
            architecture: architecture.to_owned(),
            variant,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ListPlatform {
    os: String,
    architecture: String,
    #[serde(default)]
    variant: Option<String>,
}

/// An entry of a manifest list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Instance {
    #[serde(default)]
    pub(crate) media_type: String,
    pub(crate) digest: Digest,
    #[serde(default)]
    platform: Option<ListPlatform>,
}

#[derive(Debug, Deserialize)]
struct List {
    manifests: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Layer {
    #[serde(default, rename = "mediaType")]
    media_type: String,
}

#[derive(Debug, Deserialize)]
struct Layers {
    #[serde(default)]
    layers: Vec<Layer>,
}

/// Media types of the layers of a single-image manifest. Schema1 manifests
/// have none that we can see.
pub(crate) fn layer_media_types(manifest: &[u8]) -> Result<Vec<String>> {
    let layers: Layers = serde_json::from_slice(manifest).context("Parsing manifest")?;
    Ok(layers.layers.into_iter().map(|l| l.media_type).collect())
}

/// The instances of a manifest list, in order.
pub(crate) fn list_instances(list: &[u8]) -> Result<Vec<Instance>> {
    let list: List = serde_json::from_slice(list).context("Parsing manifest list")?;
    Ok(list.manifests)
}

/// The first instance of a list which runs on `platform`.
pub(crate) fn choose_instance(list: &[u8], platform: &Platform) -> Result<Instance> {
    list_instances(list)?
        .into_iter()
        .find(|i| i.platform.as_ref().is_some_and(|p| platform.matches(p)))
        .ok_or_else(|| anyhow!("No image found in manifest list for platform {platform}"))
}

/// A changed list entry: the instance formerly known as `from` is now
/// `to`, with the given type and size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstanceUpdate {
    pub(crate) from: Digest,
    pub(crate) to: Digest,
    pub(crate) media_type: String,
    pub(crate) size: u64,
}

/// Rewrite the descriptors of the given instances, leaving everything else
/// untouched. Returns the input unchanged if there is nothing to do.
pub(crate) fn update_list_instances(list: &[u8], updates: &[InstanceUpdate]) -> Result<Vec<u8>> {
    if updates.is_empty() {
        return Ok(list.to_vec());
    }
    let mut v: Value = serde_json::from_slice(list).context("Parsing manifest list")?;
    let manifests = v
        .get_mut("manifests")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| anyhow!("Manifest list has no instances"))?;
    for update in updates {
        let entry = manifests
            .iter_mut()
            .filter_map(Value::as_object_mut)
            .find(|m| m.get("digest").and_then(Value::as_str) == Some(update.from.as_str()))
            .ok_or_else(|| anyhow!("Instance {} not found in manifest list", update.from))?;
        entry.insert("mediaType".into(), update.media_type.clone().into());
        entry.insert("digest".into(), update.to.to_string().into());
        entry.insert("size".into(), update.size.into());
    }
    Ok(serde_json::to_vec(&v)?)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;
    use crate::mime;

    const LIST: &str = indoc! {r#"
        {
          "schemaVersion": 2,
          "mediaType": "application/vnd.oci.image.index.v1+json",
          "manifests": [
            {
              "mediaType": "application/vnd.oci.image.manifest.v1+json",
              "size": 100,
              "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
              "platform": { "architecture": "amd64", "os": "linux" }
            },
            {
              "mediaType": "application/vnd.oci.image.manifest.v1+json",
              "size": 200,
              "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
              "platform": { "architecture": "arm64", "os": "linux", "variant": "v8" },
              "annotations": { "x": "y" }
            }
          ]
        }
    "#};

    fn platform(arch: &str, variant: Option<&str>) -> Platform {
        Platform {
            os: "linux".into(),
            architecture: arch.into(),
            variant: variant.map(Into::into),
        }
    }

    #[test]
    fn test_choose_instance() -> Result<()> {
        let amd64 = choose_instance(LIST.as_bytes(), &platform("amd64", None))?;
        assert!(amd64.digest.hex().starts_with("1111"));
        assert_eq!(amd64.media_type, mime::OCI_MANIFEST);
        let arm = choose_instance(LIST.as_bytes(), &platform("arm64", None))?;
        assert!(arm.digest.hex().starts_with("2222"));
        assert!(choose_instance(LIST.as_bytes(), &platform("arm64", Some("v8"))).is_ok());
        let e = choose_instance(LIST.as_bytes(), &platform("arm64", Some("v7"))).unwrap_err();
        assert!(e.to_string().contains("linux/arm64/v7"), "{e}");
        assert!(choose_instance(LIST.as_bytes(), &platform("s390x", None)).is_err());
        Ok(())
    }

    #[test]
    fn test_update_list_instances() -> Result<()> {
        let instances = list_instances(LIST.as_bytes())?;
        let update = InstanceUpdate {
            from: instances[1].digest.clone(),
            to: Digest::of(b"converted"),
            media_type: mime::DOCKER_V2_SCHEMA2.into(),
            size: 42,
        };
        assert_eq!(update_list_instances(LIST.as_bytes(), &[])?, LIST.as_bytes());
        let updated = update_list_instances(LIST.as_bytes(), &[update.clone()])?;
        let instances = list_instances(&updated)?;
        assert_eq!(instances[0].media_type, mime::OCI_MANIFEST);
        assert_eq!(instances[1].digest, update.to);
        assert_eq!(instances[1].media_type, mime::DOCKER_V2_SCHEMA2);
        // Other fields and their order survive
        let text = String::from_utf8(updated)?;
        assert!(text.find("\"mediaType\"").unwrap() < text.find("\"manifests\"").unwrap());
        assert!(text.contains("\"annotations\":{\"x\":\"y\"}"));

        let missing = InstanceUpdate {
            from: Digest::of(b"nope"),
            ..update
        };
        assert!(update_list_instances(LIST.as_bytes(), &[missing]).is_err());
        Ok(())
    }

    #[test]
    fn test_layer_media_types() -> Result<()> {
        let m = br#"{"schemaVersion":2,"layers":[{"mediaType":"a"},{"mediaType":"b+encrypted"}]}"#;
        assert_eq!(layer_media_types(m)?, ["a", "b+encrypted"]);
        assert!(layer_media_types(br#"{"schemaVersion":1}"#)?.is_empty());
        assert!(layer_media_types(b"[").is_err());
        Ok(())
    }

    #[test]
    fn test_parse_platform() {
        for s in ["linux/amd64", "linux/arm64/v8"] {
            assert_eq!(s.parse::<Platform>().unwrap().to_string(), s);
        }
        for s in ["linux", "linux/", "/amd64", "a/b/c/d", ""] {
            assert!(s.parse::<Platform>().is_err(), "{s}");
        }
    }

    #[test]
    fn test_host_platform() {
        let p = Platform::host();
        assert!(!p.os.is_empty());
        assert_ne!(p.architecture, "x86_64");
        assert_ne!(p.architecture, "aarch64");
    }
}
