//! # Configuration files
//!
//! TOML fragments named `imgcopy/*.toml` are read from the usual systemd
//! locations and merged in order; later values override earlier ones.
//! Command line flags override both.

use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::copy::{CopyOptions, ImageListSelection};
use crate::manifest::Platform;
use crate::mime;
use crate::transport::TransportOptions;

/// Where configuration fragments are looked up, lowest priority first.
const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];
/// The directory under each base holding our fragments.
const CONFIG_DIR: &str = "imgcopy";

/// The toplevel of a configuration fragment.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Configuration {
    /// The `[copy]` section.
    #[serde(default)]
    pub copy: CopyConfiguration,
    /// The `[transport]` section.
    #[serde(default)]
    pub transport: TransportOptions,
}

/// The serialized `[copy]` section
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CopyConfiguration {
    /// Store single images in this format (`oci`, `v2s2`, `v2s1` or a MIME type).
    pub manifest_format: Option<String>,
    /// Store manifest lists in this format (`oci-index`, `v2list` or a MIME type).
    pub list_format: Option<String>,
    /// Do not copy signatures.
    pub remove_signatures: Option<bool>,
    /// Copy every image of a manifest list, not just the one for this platform.
    pub all_images: Option<bool>,
    /// Layers will be encrypted.
    pub encrypt_layers: Option<bool>,
    /// The platform to select from manifest lists.
    pub platform: Option<Platform>,
}

fn merge_basic<T>(s: &mut Option<T>, o: Option<T>) {
    if let Some(o) = o {
        *s = Some(o);
    }
}

trait Mergeable {
    fn merge(&mut self, other: Self)
    where
        Self: Sized;
}

impl Mergeable for CopyConfiguration {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.manifest_format, other.manifest_format);
        merge_basic(&mut self.list_format, other.list_format);
        merge_basic(&mut self.remove_signatures, other.remove_signatures);
        merge_basic(&mut self.all_images, other.all_images);
        merge_basic(&mut self.encrypt_layers, other.encrypt_layers);
        // The platform is replaced as a whole; mixing os from one file and
        // architecture from another makes no sense.
        merge_basic(&mut self.platform, other.platform);
    }
}

impl Mergeable for TransportOptions {
    /// Apply any values in other, overriding any existing values in `self`.
    fn merge(&mut self, other: Self) {
        merge_basic(&mut self.daemon_host, other.daemon_host);
        merge_basic(&mut self.daemon_cert_path, other.daemon_cert_path);
        merge_basic(
            &mut self.daemon_insecure_skip_tls_verify,
            other.daemon_insecure_skip_tls_verify,
        );
        merge_basic(&mut self.proxy, other.proxy);
        merge_basic(&mut self.registry_insecure, other.registry_insecure);
        merge_basic(&mut self.registry_username, other.registry_username);
        merge_basic(&mut self.registry_password, other.registry_password);
    }
}

impl Mergeable for Configuration {
    fn merge(&mut self, other: Self) {
        self.copy.merge(other.copy);
        self.transport.merge(other.transport);
    }
}

impl Configuration {
    /// Parse one fragment, warning about keys we do not know.
    pub fn parse(buf: &str, origin: &str) -> Result<Self> {
        let de = toml::Deserializer::parse(buf).with_context(|| format!("Parsing {origin}"))?;
        let mut unused = Vec::new();
        let c: Self = serde_ignored::deserialize(de, |path| {
            unused.push(path.to_string());
        })
        .with_context(|| format!("Parsing {origin}"))?;
        for key in unused {
            tracing::warn!("{origin}: Unknown key {key}");
        }
        Ok(c)
    }

    /// The copy options described by this configuration.
    pub fn copy_options(&self) -> Result<CopyOptions> {
        let c = &self.copy;
        let forced_manifest_type = c
            .manifest_format
            .as_deref()
            .map(mime::parse_manifest_format)
            .transpose()
            .context("copy.manifest-format")?;
        let forced_list_type = c
            .list_format
            .as_deref()
            .map(mime::parse_list_format)
            .transpose()
            .context("copy.list-format")?;
        let image_list_selection = if c.all_images.unwrap_or_default() {
            ImageListSelection::CopyAllImages
        } else {
            ImageListSelection::CopySystemImage
        };
        Ok(CopyOptions {
            forced_manifest_type: forced_manifest_type.map(ToOwned::to_owned),
            forced_list_type: forced_list_type.map(ToOwned::to_owned),
            remove_signatures: c.remove_signatures.unwrap_or_default(),
            image_list_selection,
            encrypt_layers: c.encrypt_layers.unwrap_or_default(),
            platform: c.platform.clone(),
            transport: self.transport.clone(),
        })
    }
}

/// Load and merge the fragments found under `bases`.
#[context("Loading configuration")]
pub(crate) fn load_config_from<P: AsRef<Path>>(bases: &[P]) -> Result<Configuration> {
    let fragments = liboverdrop::scan(
        bases.iter().map(AsRef::as_ref),
        CONFIG_DIR,
        &["toml"],
        true,
    );
    let mut config = Configuration::default();
    for (_name, path) in fragments {
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {path:?}"))?;
        let c = Configuration::parse(&buf, &path.to_string_lossy())?;
        tracing::debug!("Merging config from {path:?}: {c:?}");
        config.merge(c);
    }
    Ok(config)
}

/// Load the configuration, merging all found configuration files.
pub fn load_config() -> Result<Configuration> {
    load_config_from(SYSTEMD_CONVENTIONAL_BASES)
}
