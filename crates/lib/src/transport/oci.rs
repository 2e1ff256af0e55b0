//! The `oci:` transport: an [OCI image layout] directory.
//!
//! References are `path[:tag]`. On commit the top-level manifest is recorded
//! in `index.json`, replacing any previous entry with the same tag.
//!
//! [OCI image layout]: https://github.com/opencontainers/image-spec/blob/main/image-layout.md

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use super::{
    ImageDestination, ImageReference, ImageSource, ImageTransport, PutManifestError, Transport,
    TransportOptions, UnparsedManifest, split_path_reference,
};
use crate::digest::Digest;
use crate::mime;

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS: &str = "blobs/sha256";
const LAYOUT_VERSION: &str = "1.0.0";
/// Annotation holding the tag of an entry in `index.json`.
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciLayout {
    image_layout_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciIndex {
    schema_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    manifests: Vec<OciDescriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
}

impl Default for OciIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(mime::OCI_INDEX.to_owned()),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OciDescriptor {
    media_type: String,
    digest: Digest,
    size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    platform: Option<serde_json::Value>,
}

impl OciDescriptor {
    fn ref_name(&self) -> Option<&str> {
        self.annotations.get(REF_NAME_ANNOTATION).map(|s| s.as_str())
    }
}

fn blob_path(digest: &Digest) -> String {
    format!("{BLOBS}/{}", digest.hex())
}

fn read_index(dir: &Dir) -> Result<Option<OciIndex>> {
    let Some(f) = dir.open_optional(INDEX_FILE)? else {
        return Ok(None);
    };
    let index = serde_json::from_reader(std::io::BufReader::new(f))
        .with_context(|| format!("Parsing {INDEX_FILE}"))?;
    Ok(Some(index))
}

/// The `oci:` transport.
#[derive(Debug)]
pub(crate) struct OciTransport;

impl ImageTransport for OciTransport {
    fn transport(&self) -> Transport {
        Transport::OciDir
    }

    fn open_source(
        &self,
        imgref: &ImageReference,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn ImageSource>> {
        Ok(Box::new(OciImageSource::open(imgref)?))
    }

    fn open_destination(
        &self,
        imgref: &ImageReference,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        Ok(Box::new(OciImageDestination::create(imgref)?))
    }
}

#[derive(Debug)]
pub(crate) struct OciImageSource {
    imgref: ImageReference,
    dir: Dir,
    /// The descriptor of the top-level manifest, from `index.json`.
    root: OciDescriptor,
}

impl OciImageSource {
    #[context("Opening {imgref}")]
    pub(crate) fn open(imgref: &ImageReference) -> Result<Self> {
        let (path, tag) = split_path_reference(&imgref.name);
        let dir = Dir::open_ambient_dir(Utf8Path::new(path), cap_std::ambient_authority())?;
        let index = read_index(&dir)?.ok_or_else(|| anyhow!("Missing {INDEX_FILE}"))?;
        let root = match tag {
            Some(tag) => index
                .manifests
                .into_iter()
                .find(|d| d.ref_name() == Some(tag))
                .ok_or_else(|| anyhow!("No image tagged {tag}"))?,
            None => {
                let n = index.manifests.len();
                let mut manifests = index.manifests.into_iter();
                match (manifests.next(), n) {
                    (Some(d), 1) => d,
                    (None, _) => anyhow::bail!("No images in {INDEX_FILE}"),
                    _ => anyhow::bail!("Found {n} images; a tag must be specified"),
                }
            }
        };
        Ok(Self {
            imgref: imgref.clone(),
            dir,
            root,
        })
    }
}

impl ImageSource for OciImageSource {
    fn reference(&self) -> &ImageReference {
        &self.imgref
    }

    fn get_manifest(&mut self, instance: Option<&Digest>) -> Result<UnparsedManifest> {
        let digest = instance.unwrap_or(&self.root.digest);
        let path = blob_path(digest);
        let bytes = self
            .dir
            .read(&path)
            .with_context(|| format!("Reading {path}"))?;
        let media_type = match instance {
            None => self.root.media_type.clone(),
            Some(_) => mime::guess_mime_type(&bytes)
                .unwrap_or(mime::OCI_MANIFEST)
                .to_owned(),
        };
        Ok(UnparsedManifest::new(bytes, media_type))
    }
}

#[derive(Debug)]
pub(crate) struct OciImageDestination {
    imgref: ImageReference,
    dir: Dir,
    tag: Option<String>,
    /// Set by storing the top-level manifest; recorded in `index.json` on commit.
    root: Option<OciDescriptor>,
}

impl OciImageDestination {
    #[context("Creating {imgref}")]
    pub(crate) fn create(imgref: &ImageReference) -> Result<Self> {
        let (path, tag) = split_path_reference(&imgref.name);
        let path = Utf8Path::new(path);
        std::fs::create_dir_all(path)?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        if !dir.try_exists(LAYOUT_FILE)? {
            let layout = OciLayout {
                image_layout_version: LAYOUT_VERSION.to_owned(),
            };
            dir.atomic_write(LAYOUT_FILE, serde_json::to_vec(&layout)?)?;
        }
        dir.create_dir_all(BLOBS)?;
        Ok(Self {
            imgref: imgref.clone(),
            dir,
            tag: tag.map(ToOwned::to_owned),
            root: None,
        })
    }
}

impl ImageDestination for OciImageDestination {
    fn reference(&self) -> &ImageReference {
        &self.imgref
    }

    fn supported_manifest_types(&self) -> Vec<String> {
        [mime::OCI_MANIFEST, mime::OCI_INDEX]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect()
    }

    fn put_manifest(
        &mut self,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&Digest>,
    ) -> std::result::Result<(), PutManifestError> {
        if !matches!(media_type, mime::OCI_MANIFEST | mime::OCI_INDEX) {
            return Err(PutManifestError::rejected(format!(
                "OCI layouts cannot store {media_type}"
            )));
        }
        let digest = Digest::of(manifest);
        let path = blob_path(&digest);
        self.dir
            .atomic_write(&path, manifest)
            .with_context(|| format!("Writing {path}"))?;
        if instance.is_none() {
            let annotations = self
                .tag
                .iter()
                .map(|t| (REF_NAME_ANNOTATION.to_owned(), t.clone()))
                .collect();
            self.root = Some(OciDescriptor {
                media_type: media_type.to_owned(),
                digest,
                size: manifest.len() as u64,
                annotations,
                platform: None,
            });
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            imgref, dir, root, ..
        } = *self;
        let root = root.ok_or_else(|| anyhow!("Committing {imgref}: no manifest was stored"))?;
        let mut index = read_index(&dir)?.unwrap_or_default();
        // An untagged image replaces nothing, a tagged one replaces the previous holder of the tag
        if let Some(tag) = root.ref_name() {
            index.manifests.retain(|d| d.ref_name() != Some(tag));
        }
        index.manifests.push(root);
        dir.atomic_write(INDEX_FILE, serde_json::to_vec(&index)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imgref(td: &tempfile::TempDir, tag: &str) -> ImageReference {
        ImageReference {
            transport: Transport::OciDir,
            name: format!("{}:{tag}", td.path().join("layout").to_str().unwrap()),
        }
    }

    #[test]
    fn test_roundtrip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let manifest = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{},"layers":[]}"#;

        for tag in ["v1", "v2", "v1"] {
            let mut dest = Box::new(OciImageDestination::create(&imgref(&td, tag))?);
            dest.put_manifest(manifest, mime::OCI_MANIFEST, None)?;
            dest.commit()?;
        }
        let dir = Dir::open_ambient_dir(td.path().join("layout"), cap_std::ambient_authority())?;
        let index = read_index(&dir)?.unwrap();
        let tags: Vec<_> = index.manifests.iter().filter_map(|d| d.ref_name()).collect();
        assert_eq!(tags, ["v2", "v1"]);
        assert!(dir.try_exists(LAYOUT_FILE)?);

        let mut src = OciImageSource::open(&imgref(&td, "v1"))?;
        let m = src.get_manifest(None)?;
        assert_eq!(m.bytes, manifest);
        assert_eq!(m.media_type, mime::OCI_MANIFEST);
        let by_digest = src.get_manifest(Some(&Digest::of(manifest)))?;
        assert_eq!(by_digest.media_type, mime::OCI_MANIFEST);

        assert!(OciImageSource::open(&imgref(&td, "nope")).is_err());
        Ok(())
    }

    #[test]
    fn test_rejects_docker_types() -> Result<()> {
        let td = tempfile::tempdir()?;
        let mut dest = OciImageDestination::create(&imgref(&td, "latest"))?;
        assert_eq!(
            dest.supported_manifest_types(),
            [mime::OCI_MANIFEST, mime::OCI_INDEX]
        );
        let r = dest.put_manifest(b"{}", mime::DOCKER_V2_SCHEMA2, None);
        assert!(matches!(r, Err(PutManifestError::Rejected { .. })));
        // Nothing stored, nothing to commit
        assert!(Box::new(dest).commit().is_err());
        Ok(())
    }
}
