//! # Copying images
//!
//! Ties together the planners, the store loop and the transports: read the
//! source manifest, decide what to do with lists, gate on policy and
//! signatures, then store with format fallback.
//!
//! Only manifests and signatures are copied; layer and config blobs are
//! expected to be transferred separately.

use anyhow::{Context, Result};
use fn_error_context::context;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::convert::JsonManifestConverter;
use crate::digest::Digest;
use crate::list::plan_list_conversion;
use crate::manifest::{self, InstanceUpdate, Platform};
use crate::mime;
use crate::orchestrate::{CandidateFormats, StoreError, StoredManifest, store_with_fallback};
use crate::plan::{ManifestConversionInputs, NegotiationEvent, plan_manifest_conversion};
use crate::policy::PolicyContext;
use crate::transport::{
    ImageDestination, ImageReference, ImageSource, TransportOptions, TransportRegistry,
    UnparsedManifest,
};

/// Why a signed manifest is never converted.
const SIGNATURES_REASON: &str = "Would invalidate signatures";

/// What to do when the source is a manifest list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ImageListSelection {
    /// Copy only the image for the configured platform, as a single image.
    #[default]
    CopySystemImage,
    /// Copy every image and the list itself.
    CopyAllImages,
}

/// Options for [`copy_image`].
#[derive(Debug, Default, Clone)]
pub struct CopyOptions {
    /// Store single images as this type.
    pub forced_manifest_type: Option<String>,
    /// Store manifest lists as this type.
    pub forced_list_type: Option<String>,
    /// Do not copy signatures.
    pub remove_signatures: bool,
    /// How to handle manifest lists.
    pub image_list_selection: ImageListSelection,
    /// The layers will be encrypted, so the manifest must support that.
    pub encrypt_layers: bool,
    /// The platform to pick from a manifest list; the host if unset.
    pub platform: Option<Platform>,
    /// Passed to the transports.
    pub transport: TransportOptions,
}

/// The outcome for one instance of a manifest list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceResult {
    /// Digest of the instance in the source list.
    pub source_digest: Digest,
    /// The type stored.
    pub media_type: String,
    /// Whether the instance was converted.
    pub converted: bool,
    /// Digest of the stored instance.
    pub digest: Digest,
}

/// The outcome of a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CopyResult {
    /// Type of the top-level manifest as stored.
    pub media_type: String,
    /// Whether the top-level manifest was converted.
    pub converted: bool,
    /// Digest of the top-level manifest as stored.
    pub digest: Digest,
    /// Per-instance results, when copying a whole list.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<InstanceResult>,
}

fn log_events(events: &[NegotiationEvent]) {
    for e in events {
        tracing::debug!("{e}");
    }
}

#[derive(Debug)]
struct Copier<'a> {
    policy: &'a dyn PolicyContext,
    source: &'a mut dyn ImageSource,
    dest: &'a mut dyn ImageDestination,
    options: &'a CopyOptions,
    converter: JsonManifestConverter,
    cancel: &'a CancellationToken,
}

impl Copier<'_> {
    fn signatures(&mut self, instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        if self.options.remove_signatures {
            return Ok(Vec::new());
        }
        let sigs = self.source.get_signatures(instance)?;
        if !sigs.is_empty() && !self.dest.supports_signatures() {
            anyhow::bail!(
                "Cannot copy signatures to {}: destination does not support signatures \
                 (use --remove-signatures to drop them)",
                self.dest.reference()
            );
        }
        Ok(sigs)
    }

    fn store(
        &mut self,
        plan: &dyn CandidateFormats,
        manifest: &UnparsedManifest,
        as_instance: bool,
    ) -> Result<StoredManifest, StoreError> {
        store_with_fallback(
            plan,
            manifest,
            &mut *self.dest,
            &self.converter,
            as_instance,
            self.cancel,
        )
    }

    /// Copy one image. `source_instance` selects the signatures; the manifest
    /// is stored at the top level unless `as_instance`.
    fn copy_single(
        &mut self,
        manifest: &UnparsedManifest,
        source_instance: Option<&Digest>,
        as_instance: bool,
    ) -> Result<StoredManifest> {
        let sigs = self.signatures(source_instance)?;
        if !as_instance {
            self.policy
                .is_image_allowed(self.source.reference(), manifest, &sigs)?;
        }
        let encrypted_source = manifest::layer_media_types(&manifest.bytes)?
            .iter()
            .any(|t| mime::is_encrypted_layer(t));
        let supported = self.dest.supported_manifest_types();
        let plan = plan_manifest_conversion(&ManifestConversionInputs {
            source_format: &manifest.media_type,
            destination_supported_formats: &supported,
            forced_format: self.options.forced_manifest_type.as_deref(),
            requires_encryption: self.options.encrypt_layers || encrypted_source,
            cannot_modify_reason: (!sigs.is_empty()).then_some(SIGNATURES_REASON),
        })?;
        log_events(&plan.events);
        let stored = self.store(&plan, manifest, as_instance)?;
        let instance = as_instance.then_some(&stored.digest);
        self.dest.put_signatures(&sigs, instance)?;
        Ok(stored)
    }

    fn copy_all(&mut self, list: &UnparsedManifest) -> Result<CopyResult> {
        let sigs = self.signatures(None)?;
        self.policy
            .is_image_allowed(self.source.reference(), list, &sigs)?;
        let mut updates = Vec::new();
        let mut instances = Vec::new();
        for entry in manifest::list_instances(&list.bytes)? {
            if self.cancel.is_cancelled() {
                return Err(StoreError::Cancelled.into());
            }
            tracing::info!("Copying instance {}", entry.digest);
            let mut m = self.source.get_manifest(Some(&entry.digest))?;
            if m.media_type.is_empty() {
                m.media_type = entry.media_type.clone();
            }
            let stored = self
                .copy_single(&m, Some(&entry.digest), true)
                .with_context(|| format!("Copying instance {}", entry.digest))?;
            if stored.digest != entry.digest || stored.media_type != entry.media_type {
                updates.push(InstanceUpdate {
                    from: entry.digest.clone(),
                    to: stored.digest.clone(),
                    media_type: stored.media_type.clone(),
                    size: stored.manifest.len() as u64,
                });
            }
            instances.push(InstanceResult {
                source_digest: entry.digest,
                media_type: stored.media_type,
                converted: stored.converted,
                digest: stored.digest,
            });
        }

        let keep_signatures = !sigs.is_empty();
        if keep_signatures && !updates.is_empty() {
            anyhow::bail!(
                "Manifest list must be updated for converted instances: {SIGNATURES_REASON}"
            );
        }
        let bytes = manifest::update_list_instances(&list.bytes, &updates)?;
        let current = mime::normalized_mime_type(&list.media_type);
        let mut plan = plan_list_conversion(
            current,
            &self.dest.supported_manifest_types(),
            self.options.forced_list_type.as_deref(),
        )?;
        log_events(&plan.events);
        if keep_signatures {
            if plan.selected_needs_conversion() {
                anyhow::bail!(
                    "Manifest list must be converted to {}: {SIGNATURES_REASON}",
                    plan.selected_format
                );
            }
            plan.other_candidates.clear();
        }
        let updated = UnparsedManifest::new(bytes, current);
        let stored = self.store(&plan, &updated, false)?;
        self.dest.put_signatures(&sigs, None)?;
        Ok(CopyResult {
            media_type: stored.media_type,
            converted: stored.converted || !updates.is_empty(),
            digest: stored.digest,
            instances,
        })
    }
}

/// Copy the image at `source` to `destination`, without committing.
///
/// Use [`copy_image`] to go from references.
pub fn copy(
    policy: &dyn PolicyContext,
    source: &mut dyn ImageSource,
    destination: &mut dyn ImageDestination,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<CopyResult> {
    let mut copier = Copier {
        policy,
        source,
        dest: destination,
        options,
        converter: JsonManifestConverter,
        cancel,
    };
    let top = copier.source.get_manifest(None)?;
    if !mime::is_multi_image(mime::normalized_mime_type(&top.media_type)) {
        let stored = copier.copy_single(&top, None, false)?;
        return Ok(CopyResult {
            media_type: stored.media_type,
            converted: stored.converted,
            digest: stored.digest,
            instances: Vec::new(),
        });
    }
    match options.image_list_selection {
        ImageListSelection::CopySystemImage => {
            let platform = options.platform.clone().unwrap_or_else(Platform::host);
            let chosen = manifest::choose_instance(&top.bytes, &platform)?;
            tracing::info!("Copying image {} for {platform}", chosen.digest);
            let mut m = copier.source.get_manifest(Some(&chosen.digest))?;
            if m.media_type.is_empty() {
                m.media_type = chosen.media_type;
            }
            let stored = copier.copy_single(&m, Some(&chosen.digest), false)?;
            Ok(CopyResult {
                media_type: stored.media_type,
                converted: stored.converted,
                digest: stored.digest,
                instances: Vec::new(),
            })
        }
        ImageListSelection::CopyAllImages => copier.copy_all(&top),
    }
}

/// Copy between two references, and commit the destination.
#[context("Copying {source} to {destination}")]
pub fn copy_image(
    transports: &TransportRegistry,
    policy: &dyn PolicyContext,
    source: &ImageReference,
    destination: &ImageReference,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<CopyResult> {
    let mut src = transports.open_source(source, &options.transport)?;
    let mut dest = transports.open_destination(destination, &options.transport)?;
    let r = copy(policy, &mut *src, &mut *dest, options, cancel)?;
    if cancel.is_cancelled() {
        return Err(StoreError::Cancelled.into());
    }
    dest.commit()?;
    tracing::info!("Stored {} as {}", r.digest, r.media_type);
    Ok(r)
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use indoc::indoc;

    use super::*;
    use crate::policy::{InsecureAcceptAnything, RequireSignatures};

    const OCI: &str = indoc! {r#"
        {
          "schemaVersion": 2,
          "mediaType": "application/vnd.oci.image.manifest.v1+json",
          "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": "sha256:b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7",
            "size": 7023
          },
          "layers": [
            {
              "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
              "digest": "sha256:e692418e4cbaf90ca69d05a66403747baa33ee08806650b51fab815ad7fc331f",
              "size": 32654
            }
          ]
        }
    "#};

    const SCHEMA2: &str = indoc! {r#"
        {
          "schemaVersion": 2,
          "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
          "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": "sha256:3c3a4604a545cdc127456d94e421cd355bca5b528f4a9c1905b15da2eb4a4c6b",
            "size": 1469
          },
          "layers": [
            {
              "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
              "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
              "size": 977
            }
          ]
        }
    "#};

    fn dir_ref(root: &Utf8Path, name: &str) -> ImageReference {
        format!("dir:{root}/{name}").parse().unwrap()
    }

    fn oci_ref(root: &Utf8Path, name: &str) -> ImageReference {
        format!("oci:{root}/{name}:latest").parse().unwrap()
    }

    /// A `dir:` image containing `manifest` and `signatures`.
    fn write_dir_image(path: &Utf8Path, manifest: &str, signatures: &[&str]) {
        std::fs::create_dir_all(path).unwrap();
        std::fs::write(path.join("version"), "Directory Transport Version: 1.1\n").unwrap();
        std::fs::write(path.join("manifest.json"), manifest).unwrap();
        for (i, s) in signatures.iter().enumerate() {
            std::fs::write(path.join(format!("signature-{}", i + 1)), s).unwrap();
        }
    }

    /// A Docker manifest list of a single amd64 schema2 image.
    fn write_dir_list(path: &Utf8Path, signatures: &[&str]) -> Digest {
        let instance = Digest::of(SCHEMA2.as_bytes());
        let list = format!(
            r#"{{"schemaVersion":2,"mediaType":"{}","manifests":[{{"mediaType":"{}","digest":"{instance}","size":{},"platform":{{"architecture":"amd64","os":"linux"}}}}]}}"#,
            mime::DOCKER_V2_LIST,
            mime::DOCKER_V2_SCHEMA2,
            SCHEMA2.len()
        );
        write_dir_image(path, &list, signatures);
        std::fs::write(
            path.join(format!("{}.manifest.json", instance.hex())),
            SCHEMA2,
        )
        .unwrap();
        instance
    }

    fn amd64() -> CopyOptions {
        CopyOptions {
            platform: Some(Platform {
                os: "linux".into(),
                architecture: "amd64".into(),
                variant: None,
            }),
            ..Default::default()
        }
    }

    fn tempdir() -> (tempfile::TempDir, camino::Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let root = camino::Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        (td, root)
    }

    #[test]
    fn test_dir_to_dir_unmodified() -> Result<()> {
        let (_td, root) = tempdir();
        write_dir_image(&root.join("src"), OCI, &["sig"]);
        let r = copy_image(
            &TransportRegistry::with_defaults(),
            &RequireSignatures,
            &dir_ref(&root, "src"),
            &dir_ref(&root, "dest"),
            &CopyOptions::default(),
            &CancellationToken::new(),
        )?;
        assert_eq!(r.media_type, mime::OCI_MANIFEST);
        assert!(!r.converted);
        assert_eq!(r.digest, Digest::of(OCI.as_bytes()));
        assert_eq!(std::fs::read_to_string(root.join("dest/manifest.json"))?, OCI);
        assert_eq!(std::fs::read_to_string(root.join("dest/signature-1"))?, "sig");
        Ok(())
    }

    #[test]
    fn test_schema2_to_oci_layout() -> Result<()> {
        let (_td, root) = tempdir();
        write_dir_image(&root.join("src"), SCHEMA2, &[]);
        let transports = TransportRegistry::with_defaults();
        let cancel = CancellationToken::new();
        let r = copy_image(
            &transports,
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &oci_ref(&root, "dest"),
            &CopyOptions::default(),
            &cancel,
        )?;
        assert_eq!(r.media_type, mime::OCI_MANIFEST);
        assert!(r.converted);
        assert_ne!(r.digest, Digest::of(SCHEMA2.as_bytes()));

        // Unsigned images fail the stricter policy before anything is written
        let e = copy_image(
            &transports,
            &RequireSignatures,
            &dir_ref(&root, "src"),
            &oci_ref(&root, "dest2"),
            &CopyOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(format!("{e:#}").contains("rejected by policy"), "{e:#}");
        assert!(!root.join("dest2/index.json").exists());
        Ok(())
    }

    #[test]
    fn test_signatures() -> Result<()> {
        let (_td, root) = tempdir();
        write_dir_image(&root.join("src"), SCHEMA2, &["sig"]);
        let transports = TransportRegistry::with_defaults();
        let cancel = CancellationToken::new();
        // The OCI layout cannot store signatures
        let e = copy_image(
            &transports,
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &oci_ref(&root, "dest"),
            &CopyOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(format!("{e:#}").contains("does not support signatures"), "{e:#}");
        // Opening the destination already wrote the layout; nothing is rolled back
        assert!(root.join("dest/oci-layout").exists());
        assert!(!root.join("dest/index.json").exists());

        // Signed manifests are never converted, even when forced
        let opts = CopyOptions {
            forced_manifest_type: Some(mime::OCI_MANIFEST.into()),
            ..Default::default()
        };
        let r = copy_image(
            &transports,
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &dir_ref(&root, "dest2"),
            &opts,
            &cancel,
        )?;
        assert_eq!(r.media_type, mime::DOCKER_V2_SCHEMA2);
        assert!(!r.converted);
        assert!(root.join("dest2/signature-1").exists());

        let opts = CopyOptions {
            remove_signatures: true,
            ..opts
        };
        let r = copy_image(
            &transports,
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &dir_ref(&root, "dest3"),
            &opts,
            &cancel,
        )?;
        assert_eq!(r.media_type, mime::OCI_MANIFEST);
        assert!(r.converted);
        assert!(!root.join("dest3/signature-1").exists());
        Ok(())
    }

    #[test]
    fn test_system_image_from_list() -> Result<()> {
        let (_td, root) = tempdir();
        let instance = write_dir_list(&root.join("src"), &[]);
        let r = copy_image(
            &TransportRegistry::with_defaults(),
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &dir_ref(&root, "dest"),
            &amd64(),
            &CancellationToken::new(),
        )?;
        assert_eq!(r.digest, instance);
        assert_eq!(r.media_type, mime::DOCKER_V2_SCHEMA2);
        assert_eq!(std::fs::read_to_string(root.join("dest/manifest.json"))?, SCHEMA2);

        let mut s390x = amd64();
        s390x.platform.as_mut().unwrap().architecture = "s390x".into();
        assert!(
            copy_image(
                &TransportRegistry::with_defaults(),
                &InsecureAcceptAnything,
                &dir_ref(&root, "src"),
                &dir_ref(&root, "dest2"),
                &s390x,
                &CancellationToken::new(),
            )
            .is_err()
        );
        Ok(())
    }

    #[test]
    fn test_all_images_to_oci_layout() -> Result<()> {
        let (_td, root) = tempdir();
        let instance = write_dir_list(&root.join("src"), &[]);
        let opts = CopyOptions {
            image_list_selection: ImageListSelection::CopyAllImages,
            ..Default::default()
        };
        let r = copy_image(
            &TransportRegistry::with_defaults(),
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &oci_ref(&root, "dest"),
            &opts,
            &CancellationToken::new(),
        )?;
        assert_eq!(r.media_type, mime::OCI_INDEX);
        assert!(r.converted);
        assert_eq!(r.instances.len(), 1);
        let i = &r.instances[0];
        assert_eq!(i.source_digest, instance);
        assert_eq!(i.media_type, mime::OCI_MANIFEST);
        assert!(i.converted);

        // The stored index refers to the converted instance
        let index = std::fs::read(root.join(format!("dest/blobs/sha256/{}", r.digest.hex())))?;
        let entries = manifest::list_instances(&index)?;
        assert_eq!(entries[0].digest, i.digest);
        assert_eq!(entries[0].media_type, mime::OCI_MANIFEST);
        assert!(root.join(format!("dest/blobs/sha256/{}", i.digest.hex())).exists());
        Ok(())
    }

    #[test]
    fn test_signed_list_cannot_change() -> Result<()> {
        let (_td, root) = tempdir();
        write_dir_list(&root.join("src"), &["sig"]);
        let opts = CopyOptions {
            image_list_selection: ImageListSelection::CopyAllImages,
            forced_list_type: Some(mime::OCI_INDEX.into()),
            ..Default::default()
        };
        let e = copy_image(
            &TransportRegistry::with_defaults(),
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &dir_ref(&root, "dest"),
            &opts,
            &CancellationToken::new(),
        )
        .unwrap_err();
        assert!(format!("{e:#}").contains(SIGNATURES_REASON), "{e:#}");

        // Unforced, everything stays as it was
        let opts = CopyOptions {
            forced_list_type: None,
            ..opts
        };
        let r = copy_image(
            &TransportRegistry::with_defaults(),
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &dir_ref(&root, "dest2"),
            &opts,
            &CancellationToken::new(),
        )?;
        assert_eq!(r.media_type, mime::DOCKER_V2_LIST);
        assert!(!r.converted);
        assert!(root.join("dest2/signature-1").exists());
        Ok(())
    }

    #[test]
    fn test_cancelled() {
        let (_td, root) = tempdir();
        write_dir_image(&root.join("src"), OCI, &[]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let e = copy_image(
            &TransportRegistry::with_defaults(),
            &InsecureAcceptAnything,
            &dir_ref(&root, "src"),
            &dir_ref(&root, "dest"),
            &CopyOptions::default(),
            &cancel,
        )
        .unwrap_err();
        assert!(
            matches!(
                e.root_cause().downcast_ref::<StoreError>(),
                Some(StoreError::Cancelled)
            ),
            "{e:#}"
        );
    }
}
