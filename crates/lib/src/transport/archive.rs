//! The `docker-archive:` transport: the tarball format of `docker save`.
//!
//! References are `path[:repo:tag]`. Only Docker schema 2 manifests can be
//! represented; the archive's `manifest.json` is derived from the stored
//! manifest and written on commit.
//!
//! Blobs are not copied: the archive names the config and layers but does
//! not contain them, so it is only loadable where they already exist.

use std::io::{BufWriter, Write};

use anyhow::{Context, Result, anyhow};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use super::{
    ImageDestination, ImageReference, ImageSource, ImageTransport, PutManifestError, Transport,
    TransportOptions, split_path_reference,
};
use crate::digest::Digest;
use crate::mime;

const ARCHIVE_MANIFEST: &str = "manifest.json";

/// One element of the top-level array in an archive's `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ArchiveManifestEntry {
    pub(crate) config: String,
    pub(crate) repo_tags: Vec<String>,
    pub(crate) layers: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Schema2Descriptor {
    digest: Digest,
}

#[derive(Debug, Deserialize)]
struct Schema2Manifest {
    config: Schema2Descriptor,
    layers: Vec<Schema2Descriptor>,
}

/// Default the tag to `latest` as `docker` does.
pub(crate) fn normalize_tag(name: &str) -> String {
    let last = name.rsplit('/').next().unwrap_or(name);
    if last.contains(':') || name.contains('@') {
        name.to_owned()
    } else {
        format!("{name}:latest")
    }
}

/// Accumulates what is needed to write an archive.
///
/// Shared with `docker-daemon:`, which loads the same format.
#[derive(Debug)]
pub(crate) struct ArchiveBuilder {
    repo_tags: Vec<String>,
    entry: Option<ArchiveManifestEntry>,
}

impl ArchiveBuilder {
    pub(crate) fn new(tag: Option<&str>) -> Self {
        Self {
            repo_tags: tag.map(normalize_tag).into_iter().collect(),
            entry: None,
        }
    }

    pub(crate) fn put_manifest(
        &mut self,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&Digest>,
    ) -> std::result::Result<(), PutManifestError> {
        if instance.is_some() {
            return Err(PutManifestError::rejected(
                "Docker archives contain a single image",
            ));
        }
        if media_type != mime::DOCKER_V2_SCHEMA2 {
            return Err(PutManifestError::rejected(format!(
                "Docker archives only support {}, not {media_type}",
                mime::DOCKER_V2_SCHEMA2
            )));
        }
        let parsed: Schema2Manifest =
            serde_json::from_slice(manifest).context("Parsing schema2 manifest")?;
        self.entry = Some(ArchiveManifestEntry {
            config: format!("{}.json", parsed.config.digest.hex()),
            repo_tags: self.repo_tags.clone(),
            layers: parsed
                .layers
                .iter()
                .map(|l| format!("{}.tar", l.digest.hex()))
                .collect(),
        });
        Ok(())
    }

    /// Write the archive, returning the writer.
    pub(crate) fn write_to<W: Write>(&self, w: W) -> Result<W> {
        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| anyhow!("No manifest was stored"))?;
        let data = serde_json::to_vec(&[entry])?;
        let mut builder = tar::Builder::new(w);
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, ARCHIVE_MANIFEST, data.as_slice())?;
        Ok(builder.into_inner()?)
    }
}

/// The `docker-archive:` transport.
#[derive(Debug)]
pub(crate) struct ArchiveTransport;

impl ImageTransport for ArchiveTransport {
    fn transport(&self) -> Transport {
        Transport::DockerArchive
    }

    fn open_source(
        &self,
        imgref: &ImageReference,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn ImageSource>> {
        anyhow::bail!("Reading from {imgref} is not supported")
    }

    fn open_destination(
        &self,
        imgref: &ImageReference,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        let (path, tag) = split_path_reference(&imgref.name);
        Ok(Box::new(ArchiveImageDestination {
            imgref: imgref.clone(),
            path: path.into(),
            builder: ArchiveBuilder::new(tag),
        }))
    }
}

#[derive(Debug)]
struct ArchiveImageDestination {
    imgref: ImageReference,
    path: Utf8PathBuf,
    builder: ArchiveBuilder,
}

impl ImageDestination for ArchiveImageDestination {
    fn reference(&self) -> &ImageReference {
        &self.imgref
    }

    fn supported_manifest_types(&self) -> Vec<String> {
        vec![mime::DOCKER_V2_SCHEMA2.to_owned()]
    }

    fn put_manifest(
        &mut self,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&Digest>,
    ) -> std::result::Result<(), PutManifestError> {
        self.builder.put_manifest(manifest, media_type, instance)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let f = std::fs::File::create(&self.path)
            .with_context(|| format!("Creating {}", self.path))?;
        let w = self.builder.write_to(BufWriter::new(f))?;
        w.into_inner()
            .map_err(|e| e.into_error())?
            .sync_all()?;
        tracing::debug!("Wrote {}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    const SCHEMA2: &str = indoc! {r#"
        {
          "schemaVersion": 2,
          "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
          "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 7023,
            "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7"
          },
          "layers": [
            {
              "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
              "size": 32654,
              "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f"
            }
          ]
        }
    "#};

    #[test]
    fn test_normalize_tag() {
        assert_eq!(normalize_tag("foo"), "foo:latest");
        assert_eq!(normalize_tag("quay.io/foo:v1"), "quay.io/foo:v1");
        assert_eq!(normalize_tag("localhost:5000/foo"), "localhost:5000/foo:latest");
    }

    #[test]
    fn test_write_archive() -> Result<()> {
        let td = tempfile::tempdir()?;
        let path = td.path().join("out.tar");
        let imgref = ImageReference {
            transport: Transport::DockerArchive,
            name: format!("{}:example.com/foo:v1", path.to_str().unwrap()),
        };
        let mut dest = ArchiveTransport.open_destination(&imgref, &Default::default())?;
        let r = dest.put_manifest(b"{}", mime::OCI_MANIFEST, None);
        assert!(matches!(r, Err(PutManifestError::Rejected { .. })));
        let r = dest.put_manifest(SCHEMA2.as_bytes(), mime::DOCKER_V2_SCHEMA2, Some(&Digest::of(b"x")));
        assert!(matches!(r, Err(PutManifestError::Rejected { .. })));
        dest.put_manifest(SCHEMA2.as_bytes(), mime::DOCKER_V2_SCHEMA2, None)?;
        dest.commit()?;

        let mut archive = tar::Archive::new(std::fs::File::open(&path)?);
        let mut entries = archive.entries()?;
        let entry = entries.next().unwrap()?;
        assert_eq!(entry.path()?.to_str(), Some(ARCHIVE_MANIFEST));
        let parsed: Vec<ArchiveManifestEntry> = serde_json::from_reader(entry)?;
        similar_asserts::assert_eq!(
            parsed,
            vec![ArchiveManifestEntry {
                config: "b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7.json"
                    .into(),
                repo_tags: vec!["example.com/foo:v1".into()],
                layers: vec![
                    "e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f.tar".into()
                ],
            }]
        );
        assert!(entries.next().is_none());
        Ok(())
    }

    #[test]
    fn test_no_source() {
        let imgref: ImageReference = "docker-archive:/nonexistent.tar".parse().unwrap();
        assert!(ArchiveTransport.open_source(&imgref, &Default::default()).is_err());
    }
}
