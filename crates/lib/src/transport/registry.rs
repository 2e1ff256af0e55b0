//! The `docker://` transport: a registry speaking the Distribution API v2.
//!
//! Only manifests are transferred. A registry advertises every manifest type
//! we know, but individual registries reject some of them; such rejections
//! are reported as [`PutManifestError::Rejected`] so that the caller can try
//! another format.

use anyhow::{Context, Result, anyhow};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;

use super::{
    ImageDestination, ImageReference, ImageSource, ImageTransport, PutManifestError, Transport,
    TransportOptions, UnparsedManifest,
};
use crate::digest::Digest;
use crate::mime;

const DOCKER_HUB: &str = "registry-1.docker.io";

/// Error codes of a `400` response which mean the manifest format, not the
/// request, is the problem.
const FORMAT_ERROR_CODES: &[&str] = &["MANIFEST_INVALID", "MANIFEST_UNVERIFIED", "UNSUPPORTED"];

/// A parsed `host/repository[:tag|@digest]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RegistryReference {
    pub(crate) host: String,
    pub(crate) repository: String,
    /// A tag or a digest.
    pub(crate) reference: String,
}

impl RegistryReference {
    pub(crate) fn parse(name: &str) -> Result<Self> {
        let (rest, reference) = if let Some((rest, digest)) = name.split_once('@') {
            let digest: Digest = digest.parse()?;
            (rest, digest.to_string())
        } else {
            // A ':' before the last '/' is a registry port.
            let last_slash = name.rfind('/').map_or(0, |i| i + 1);
            match name[last_slash..].rfind(':') {
                Some(i) => {
                    let i = last_slash + i;
                    (&name[..i], name[i + 1..].to_owned())
                }
                None => (name, "latest".to_owned()),
            }
        };
        if rest.is_empty() {
            anyhow::bail!("Invalid empty repository in {name}");
        }
        let (host, repository) = match rest.split_once('/') {
            Some((h, r)) if h.contains(['.', ':']) || h == "localhost" => {
                (h.to_owned(), r.to_owned())
            }
            Some(_) => (DOCKER_HUB.to_owned(), rest.to_owned()),
            None => (DOCKER_HUB.to_owned(), format!("library/{rest}")),
        };
        if repository.is_empty() || reference.is_empty() {
            anyhow::bail!("Invalid registry reference {name}");
        }
        Ok(Self {
            host,
            repository,
            reference,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RegistryErrors {
    #[serde(default)]
    errors: Vec<RegistryError>,
}

#[derive(Debug, Deserialize)]
struct RegistryError {
    code: String,
    #[serde(default)]
    message: String,
}

/// Decide what a response to a manifest `PUT` means.
pub(crate) fn classify_put_response(
    status: StatusCode,
    body: &[u8],
) -> std::result::Result<(), PutManifestError> {
    if status.is_success() {
        return Ok(());
    }
    let body_text = String::from_utf8_lossy(body);
    if status == StatusCode::UNSUPPORTED_MEDIA_TYPE {
        return Err(PutManifestError::rejected(format!("{status}: {body_text}")));
    }
    if status == StatusCode::BAD_REQUEST {
        let errors = serde_json::from_slice::<RegistryErrors>(body)
            .map(|e| e.errors)
            .unwrap_or_default();
        if let Some(e) = errors
            .iter()
            .find(|e| FORMAT_ERROR_CODES.contains(&e.code.as_str()))
        {
            return Err(PutManifestError::rejected(format!(
                "{}: {}",
                e.code, e.message
            )));
        }
    }
    Err(PutManifestError::Fatal(anyhow!(
        "Storing manifest failed: {status}: {body_text}"
    )))
}

/// HTTP access to one repository.
#[derive(Debug)]
struct RegistryClient {
    client: Client,
    base: String,
    credentials: Option<(String, Option<String>)>,
}

impl RegistryClient {
    fn new(r: &RegistryReference, opts: &TransportOptions) -> Result<Self> {
        let insecure = opts.registry_insecure.unwrap_or_default();
        let mut builder = Client::builder()
            .user_agent(concat!("imgcopy/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(insecure);
        if let Some(proxy) = opts.proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy).context("Parsing proxy")?);
        }
        let scheme = if insecure { "http" } else { "https" };
        Ok(Self {
            client: builder.build()?,
            base: format!("{scheme}://{}/v2/{}", r.host, r.repository),
            credentials: opts
                .registry_username
                .clone()
                .map(|u| (u, opts.registry_password.clone())),
        })
    }

    fn manifest_request(&self, method: reqwest::Method, reference: &str) -> RequestBuilder {
        let url = format!("{}/manifests/{reference}", self.base);
        let req = self.client.request(method, url);
        match &self.credentials {
            Some((u, p)) => req.basic_auth(u, p.as_ref()),
            None => req,
        }
    }
}

/// The `docker://` transport.
#[derive(Debug)]
pub(crate) struct RegistryTransport;

impl ImageTransport for RegistryTransport {
    fn transport(&self) -> Transport {
        Transport::Registry
    }

    fn open_source(
        &self,
        imgref: &ImageReference,
        opts: &TransportOptions,
    ) -> Result<Box<dyn ImageSource>> {
        let parsed = RegistryReference::parse(&imgref.name)?;
        let client = RegistryClient::new(&parsed, opts)?;
        Ok(Box::new(RegistryImageSource {
            imgref: imgref.clone(),
            parsed,
            client,
        }))
    }

    fn open_destination(
        &self,
        imgref: &ImageReference,
        opts: &TransportOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        let parsed = RegistryReference::parse(&imgref.name)?;
        let client = RegistryClient::new(&parsed, opts)?;
        Ok(Box::new(RegistryImageDestination {
            imgref: imgref.clone(),
            parsed,
            client,
        }))
    }
}

#[derive(Debug)]
struct RegistryImageSource {
    imgref: ImageReference,
    parsed: RegistryReference,
    client: RegistryClient,
}

impl ImageSource for RegistryImageSource {
    fn reference(&self) -> &ImageReference {
        &self.imgref
    }

    fn get_manifest(&mut self, instance: Option<&Digest>) -> Result<UnparsedManifest> {
        let reference = instance.map(|d| d.as_str()).unwrap_or(&self.parsed.reference);
        let resp = self
            .client
            .manifest_request(reqwest::Method::GET, reference)
            .header(ACCEPT, mime::ALL_MANIFEST_TYPES.join(", "))
            .send()
            .with_context(|| format!("Fetching manifest {reference} from {}", self.imgref))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Fetching manifest {reference} from {}: {status}", self.imgref);
        }
        let media_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .unwrap_or_default()
            .trim()
            .to_owned();
        let bytes = resp.bytes()?.to_vec();
        Ok(UnparsedManifest::new(bytes, media_type))
    }
}

#[derive(Debug)]
struct RegistryImageDestination {
    imgref: ImageReference,
    parsed: RegistryReference,
    client: RegistryClient,
}

impl ImageDestination for RegistryImageDestination {
    fn reference(&self) -> &ImageReference {
        &self.imgref
    }

    fn supported_manifest_types(&self) -> Vec<String> {
        mime::ALL_MANIFEST_TYPES
            .iter()
            .map(|&t| t.to_owned())
            .collect()
    }

    fn put_manifest(
        &mut self,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&Digest>,
    ) -> std::result::Result<(), PutManifestError> {
        let reference = instance.map(|d| d.as_str()).unwrap_or(&self.parsed.reference);
        tracing::debug!("PUT manifest {reference} ({media_type}) to {}", self.imgref);
        let resp = self
            .client
            .manifest_request(reqwest::Method::PUT, reference)
            .header(CONTENT_TYPE, media_type)
            .body(manifest.to_vec())
            .send()
            .with_context(|| format!("Storing manifest to {}", self.imgref))?;
        let status = resp.status();
        let body = resp.bytes().context("Reading response")?;
        classify_put_response(status, &body)
    }

    fn commit(self: Box<Self>) -> Result<()> {
        // Each PUT is visible immediately.
        Ok(())
    }
}
