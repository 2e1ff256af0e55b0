//! The `docker-daemon:` transport.
//!
//! The image is assembled as a `docker-archive:` tarball in a temporary file
//! and handed to `docker load` on commit.
//!
//! Only manifests are copied, so the tarball holds no config or layer blobs;
//! `docker load` succeeds only when the daemon already has them.

use std::process::Command;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use imgcopy_utils::CommandRunExt;

use super::archive::ArchiveBuilder;
use super::{
    ImageDestination, ImageReference, ImageSource, ImageTransport, PutManifestError, Transport,
    TransportOptions,
};
use crate::digest::Digest;
use crate::mime;

pub(crate) const DEFAULT_HOST: &str = "unix:///var/run/docker.sock";

/// Global `docker` options selecting and securing the daemon connection.
#[context("Parsing daemon options")]
fn daemon_args(opts: &TransportOptions) -> Result<Vec<String>> {
    let host = opts.daemon_host.as_deref().unwrap_or(DEFAULT_HOST);
    let (scheme, rest) = host
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("Invalid daemon host {host}: missing scheme"))?;
    let host = match scheme {
        "unix" | "tcp" => host.to_owned(),
        // The CLI only speaks tcp; TLS is controlled separately.
        "http" | "https" => format!("tcp://{rest}"),
        o => anyhow::bail!("Unsupported daemon host scheme {o}"),
    };
    let mut r = vec!["--host".to_owned(), host];
    let insecure = opts.daemon_insecure_skip_tls_verify.unwrap_or_default();
    if let Some(certs) = opts.daemon_cert_path.as_deref() {
        let certs = Utf8Path::new(certs);
        if insecure {
            r.push("--tls".into());
        } else {
            r.push("--tlsverify".into());
            r.push(format!("--tlscacert={}", certs.join("ca.pem")));
        }
        r.push(format!("--tlscert={}", certs.join("cert.pem")));
        r.push(format!("--tlskey={}", certs.join("key.pem")));
    } else if scheme == "https" {
        let flag = if insecure { "--tls" } else { "--tlsverify" };
        r.push(flag.into());
    }
    Ok(r)
}

/// The `docker-daemon:` transport.
#[derive(Debug)]
pub(crate) struct DaemonTransport;

impl ImageTransport for DaemonTransport {
    fn transport(&self) -> Transport {
        Transport::DockerDaemon
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
        opts: &TransportOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        if imgref.name.contains('@') {
            anyhow::bail!("Cannot write to {imgref}: a tag is required, not a digest");
        }
        Ok(Box::new(DaemonImageDestination {
            imgref: imgref.clone(),
            args: daemon_args(opts)?,
            proxy: opts.proxy.clone(),
            builder: ArchiveBuilder::new(Some(&imgref.name)),
        }))
    }
}

#[derive(Debug)]
struct DaemonImageDestination {
    imgref: ImageReference,
    args: Vec<String>,
    proxy: Option<String>,
    builder: ArchiveBuilder,
}

impl ImageDestination for DaemonImageDestination {
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

    #[context("Loading into docker daemon")]
    fn commit(self: Box<Self>) -> Result<()> {
        let tmp = tempfile::NamedTempFile::new()?;
        let tmp = self
            .builder
            .write_to(tmp)
            .context("Writing temporary archive")?;
        let mut cmd = Command::new("docker");
        cmd.args(&self.args).arg("load").arg("-i").arg(tmp.path());
        if let Some(proxy) = self.proxy.as_deref() {
            cmd.env("HTTPS_PROXY", proxy).env("HTTP_PROXY", proxy);
        }
        cmd.log_debug().run_capture_stderr().with_context(|| {
            format!(
                "docker load of {} (the archive carries only the manifest; \
                 the daemon must already have the config and layer blobs)",
                self.imgref
            )
        })
    }
}
