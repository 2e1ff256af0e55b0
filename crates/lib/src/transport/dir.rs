//! The `dir:` transport: an image stored as plain files in a directory.
//!
//! Layout:
//! - `version`: format marker
//! - `manifest.json`: the top-level manifest
//! - `<hex>.manifest.json`: instances of a manifest list
//! - `signature-<n>` / `<hex>.signature-<n>`: signatures, numbered from 1
//!
//! This is the only local transport which stores signatures, and it accepts
//! any manifest type.

use std::io::Read;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use super::{
    ImageDestination, ImageReference, ImageSource, ImageTransport, PutManifestError, Transport,
    TransportOptions, UnparsedManifest,
};
use crate::digest::Digest;
use crate::mime;

const VERSION_FILE: &str = "version";
const VERSION: &str = "Directory Transport Version: 1.1\n";

fn manifest_path(instance: Option<&Digest>) -> String {
    match instance {
        Some(d) => format!("{}.manifest.json", d.hex()),
        None => "manifest.json".to_owned(),
    }
}

/// `n` is 1-based.
fn signature_path(n: usize, instance: Option<&Digest>) -> String {
    match instance {
        Some(d) => format!("{}.signature-{n}", d.hex()),
        None => format!("signature-{n}"),
    }
}

/// The `dir:` transport.
#[derive(Debug)]
pub(crate) struct DirTransport;

impl ImageTransport for DirTransport {
    fn transport(&self) -> Transport {
        Transport::Dir
    }

    fn open_source(
        &self,
        imgref: &ImageReference,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn ImageSource>> {
        Ok(Box::new(DirImageSource::open(imgref)?))
    }

    fn open_destination(
        &self,
        imgref: &ImageReference,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        Ok(Box::new(DirImageDestination::create(imgref)?))
    }
}

#[derive(Debug)]
pub(crate) struct DirImageSource {
    imgref: ImageReference,
    dir: Dir,
}

impl DirImageSource {
    #[context("Opening {imgref}")]
    pub(crate) fn open(imgref: &ImageReference) -> Result<Self> {
        let path = Utf8Path::new(&imgref.name);
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        Ok(Self {
            imgref: imgref.clone(),
            dir,
        })
    }
}

impl ImageSource for DirImageSource {
    fn reference(&self) -> &ImageReference {
        &self.imgref
    }

    fn get_manifest(&mut self, instance: Option<&Digest>) -> Result<UnparsedManifest> {
        let path = manifest_path(instance);
        let bytes = self
            .dir
            .read(&path)
            .with_context(|| format!("Reading {path}"))?;
        // The directory format does not record the type.
        let media_type = mime::guess_mime_type(&bytes).unwrap_or_default();
        Ok(UnparsedManifest::new(bytes, media_type))
    }

    fn get_signatures(&mut self, instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        let mut r = Vec::new();
        for n in 1.. {
            let path = signature_path(n, instance);
            let Some(mut f) = self.dir.open_optional(&path)? else {
                break;
            };
            let mut buf = Vec::new();
            f.read_to_end(&mut buf)
                .with_context(|| format!("Reading {path}"))?;
            r.push(buf);
        }
        Ok(r)
    }
}

#[derive(Debug)]
pub(crate) struct DirImageDestination {
    imgref: ImageReference,
    dir: Dir,
}

impl DirImageDestination {
    #[context("Creating {imgref}")]
    pub(crate) fn create(imgref: &ImageReference) -> Result<Self> {
        let path = Utf8Path::new(&imgref.name);
        std::fs::create_dir_all(path)?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())?;
        let is_image = dir.try_exists(VERSION_FILE)?;
        if !is_image && dir.entries()?.next().is_some() {
            anyhow::bail!("Refusing to overwrite non-empty directory {path} which is not an image");
        }
        dir.atomic_write(VERSION_FILE, VERSION)?;
        Ok(Self {
            imgref: imgref.clone(),
            dir,
        })
    }
}

impl ImageDestination for DirImageDestination {
    fn reference(&self) -> &ImageReference {
        &self.imgref
    }

    fn supported_manifest_types(&self) -> Vec<String> {
        Vec::new()
    }

    fn supports_signatures(&self) -> bool {
        true
    }

    fn put_manifest(
        &mut self,
        manifest: &[u8],
        _media_type: &str,
        instance: Option<&Digest>,
    ) -> std::result::Result<(), PutManifestError> {
        let path = manifest_path(instance);
        self.dir
            .atomic_write(&path, manifest)
            .with_context(|| format!("Writing {path}"))?;
        Ok(())
    }

    fn put_signatures(&mut self, signatures: &[Vec<u8>], instance: Option<&Digest>) -> Result<()> {
        for (i, sig) in signatures.iter().enumerate() {
            let path = signature_path(i + 1, instance);
            self.dir
                .atomic_write(&path, sig)
                .with_context(|| format!("Writing {path}"))?;
        }
        // Drop any stale signatures from a previous copy
        for n in signatures.len() + 1.. {
            let path = signature_path(n, instance);
            if !self.dir.remove_file_optional(&path)? {
                break;
            }
        }
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn imgref(td: &tempfile::TempDir) -> ImageReference {
        ImageReference {
            transport: Transport::Dir,
            name: td.path().join("img").to_str().unwrap().to_owned(),
        }
    }

    #[test]
    fn test_roundtrip() -> Result<()> {
        let td = tempfile::tempdir()?;
        let imgref = imgref(&td);
        let manifest = br#"{"schemaVersion": 2, "mediaType": "application/vnd.docker.distribution.manifest.v2+json"}"#;
        let instance = Digest::of(b"instance");

        let mut dest: Box<dyn ImageDestination> = Box::new(DirImageDestination::create(&imgref)?);
        assert!(dest.supported_manifest_types().is_empty());
        assert!(dest.supports_signatures());
        dest.put_manifest(manifest, mime::DOCKER_V2_SCHEMA2, None)?;
        dest.put_manifest(b"{}", mime::OCI_MANIFEST, Some(&instance))?;
        dest.put_signatures(&[b"sig1".to_vec(), b"sig2".to_vec()], None)?;
        dest.commit()?;

        let mut src = DirImageSource::open(&imgref)?;
        let m = src.get_manifest(None)?;
        assert_eq!(m.bytes, manifest);
        assert_eq!(m.media_type, mime::DOCKER_V2_SCHEMA2);
        assert_eq!(src.get_manifest(Some(&instance))?.bytes, b"{}");
        assert_eq!(
            src.get_signatures(None)?,
            vec![b"sig1".to_vec(), b"sig2".to_vec()]
        );
        assert!(src.get_signatures(Some(&instance))?.is_empty());

        // Rewriting with fewer signatures drops the stale ones
        let mut dest = DirImageDestination::create(&imgref)?;
        dest.put_signatures(&[b"only".to_vec()], None)?;
        assert_eq!(src.get_signatures(None)?, vec![b"only".to_vec()]);
        Ok(())
    }

    #[test]
    fn test_refuse_non_image() -> Result<()> {
        let td = tempfile::tempdir()?;
        let imgref = imgref(&td);
        std::fs::create_dir(&imgref.name)?;
        std::fs::write(format!("{}/precious", imgref.name), "data")?;
        assert!(DirImageDestination::create(&imgref).is_err());
        Ok(())
    }
}
