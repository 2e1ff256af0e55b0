//! # Image transports
//!
//! A transport is a way of reading or writing images: a remote registry, a
//! local directory, a tarball, a daemon. The copy engine only needs two
//! things from a destination: which manifest types it claims to accept, and
//! a way to attempt storing a manifest of a given type. See
//! [`ImageDestination`].
//!
//! Which backends are available is decided when the [`TransportRegistry`] is
//! assembled; backends which are not built in are registered as stubs that
//! fail on use, so references naming them still parse.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;

pub(crate) mod archive;
pub(crate) mod daemon;
pub(crate) mod dir;
pub(crate) mod oci;
pub(crate) mod registry;
pub(crate) mod stub;

/// A backend/transport for OCI/Docker images.
#[derive(Copy, Clone, Hash, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Transport {
    /// A remote Docker/OCI registry (`registry:` or `docker://`)
    Registry,
    /// A local OCI directory (`oci:`)
    OciDir,
    /// A local OCI archive tarball (`oci-archive:`)
    OciArchive,
    /// A local Docker archive tarball (`docker-archive:`)
    DockerArchive,
    /// Local container storage (`containers-storage:`)
    ContainerStorage,
    /// Local directory (`dir:`)
    Dir,
    /// Local Docker daemon (`docker-daemon:`)
    DockerDaemon,
    /// An ostree repository (`ostree:`)
    Ostree,
}

/// Combination of an image name and the transport used to reach it.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ImageReference {
    /// The storage and transport for the image
    pub transport: Transport,
    /// The image name (e.g. `quay.io/somerepo/someimage:latest`)
    pub name: String,
}

impl Transport {
    const OCI_STR: &'static str = "oci";
    const OCI_ARCHIVE_STR: &'static str = "oci-archive";
    const DOCKER_ARCHIVE_STR: &'static str = "docker-archive";
    const CONTAINERS_STORAGE_STR: &'static str = "containers-storage";
    const LOCAL_DIRECTORY_STR: &'static str = "dir";
    const REGISTRY_STR: &'static str = "registry";
    const DOCKER_DAEMON_STR: &'static str = "docker-daemon";
    const OSTREE_STR: &'static str = "ostree";

    /// Retrieve an identifier that can then be re-parsed from [`Transport::try_from::<&str>`].
    pub fn serializable_name(&self) -> &'static str {
        match self {
            Transport::Registry => Self::REGISTRY_STR,
            Transport::OciDir => Self::OCI_STR,
            Transport::OciArchive => Self::OCI_ARCHIVE_STR,
            Transport::DockerArchive => Self::DOCKER_ARCHIVE_STR,
            Transport::ContainerStorage => Self::CONTAINERS_STORAGE_STR,
            Transport::Dir => Self::LOCAL_DIRECTORY_STR,
            Transport::DockerDaemon => Self::DOCKER_DAEMON_STR,
            Transport::Ostree => Self::OSTREE_STR,
        }
    }
}

impl TryFrom<&str> for Transport {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        Ok(match value {
            Self::REGISTRY_STR | "docker" => Self::Registry,
            Self::OCI_STR => Self::OciDir,
            Self::OCI_ARCHIVE_STR => Self::OciArchive,
            Self::DOCKER_ARCHIVE_STR => Self::DockerArchive,
            Self::CONTAINERS_STORAGE_STR => Self::ContainerStorage,
            Self::LOCAL_DIRECTORY_STR => Self::Dir,
            Self::DOCKER_DAEMON_STR => Self::DockerDaemon,
            Self::OSTREE_STR => Self::Ostree,
            o => return Err(anyhow!("Unknown transport '{}'", o)),
        })
    }
}

impl TryFrom<&str> for ImageReference {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        let (transport_name, mut name) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("Missing ':' in {}", value))?;
        let transport: Transport = transport_name.try_into()?;
        if name.is_empty() {
            return Err(anyhow!("Invalid empty name in {}", value));
        }
        if transport_name == "docker" {
            name = name
                .strip_prefix("//")
                .ok_or_else(|| anyhow!("Missing // in docker:// in {}", value))?;
        }
        Ok(Self {
            transport,
            name: name.to_string(),
        })
    }
}

impl FromStr for ImageReference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_from(s)
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry => f.write_str("docker://"),
            o => write!(f, "{}:", o.serializable_name()),
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.transport, self.name)
    }
}

/// Split `path[:suffix]` as used by the local file-based transports.
pub(crate) fn split_path_reference(name: &str) -> (&str, Option<&str>) {
    match name.split_once(':') {
        Some((path, suffix)) if !suffix.is_empty() => (path, Some(suffix)),
        Some((path, _)) => (path, None),
        None => (name, None),
    }
}

/// Settings affecting how transports reach their backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TransportOptions {
    /// Docker daemon address, e.g. `unix:///var/run/docker.sock` or `tcp://host:2376`.
    pub daemon_host: Option<String>,
    /// Directory containing `ca.pem`, `cert.pem` and `key.pem` for the daemon.
    pub daemon_cert_path: Option<String>,
    /// Skip TLS verification when talking to the daemon.
    pub daemon_insecure_skip_tls_verify: Option<bool>,
    /// HTTP(S) proxy used for daemon and registry connections.
    pub proxy: Option<String>,
    /// Use plain HTTP and skip TLS verification for registries.
    pub registry_insecure: Option<bool>,
    /// Registry user name for basic authentication.
    pub registry_username: Option<String>,
    /// Registry password for basic authentication.
    pub registry_password: Option<String>,
}

/// A manifest as read from a source, not parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnparsedManifest {
    /// The raw manifest bytes.
    pub bytes: Vec<u8>,
    /// The MIME type the source declared for it.
    pub media_type: String,
}

impl UnparsedManifest {
    /// Wrap bytes with their declared type.
    pub fn new(bytes: impl Into<Vec<u8>>, media_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            media_type: media_type.into(),
        }
    }

    /// The digest of the raw bytes.
    pub fn digest(&self) -> Digest {
        Digest::of(&self.bytes)
    }
}

/// The failure modes of [`ImageDestination::put_manifest`].
#[derive(Debug, thiserror::Error)]
pub enum PutManifestError {
    /// The destination does not accept this manifest format. The caller may
    /// try again with a different format.
    #[error("manifest type rejected: {reason}")]
    Rejected {
        /// What the destination said.
        reason: String,
    },
    /// Anything else: connectivity, authentication, I/O. Never retried.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl PutManifestError {
    pub(crate) fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Somewhere images can be read from.
pub trait ImageSource: Debug {
    /// The reference used to open this source.
    fn reference(&self) -> &ImageReference;

    /// Fetch the top-level manifest (`None`) or one instance of a list.
    fn get_manifest(&mut self, instance: Option<&Digest>) -> Result<UnparsedManifest>;

    /// Fetch the signatures of the top-level manifest or an instance.
    fn get_signatures(&mut self, _instance: Option<&Digest>) -> Result<Vec<Vec<u8>>> {
        Ok(Vec::new())
    }
}

/// Somewhere images can be written to.
///
/// There are no transactional semantics: data written by
/// [`Self::put_manifest`] may be visible to others before [`Self::commit`].
pub trait ImageDestination: Debug {
    /// The reference used to open this destination.
    fn reference(&self) -> &ImageReference;

    /// Manifest MIME types this destination claims to accept, in its order of
    /// preference. Empty means anything goes. This is a static guess; the
    /// destination may still reject a type it lists.
    fn supported_manifest_types(&self) -> Vec<String>;

    /// Whether [`Self::put_signatures`] can store anything.
    fn supports_signatures(&self) -> bool {
        false
    }

    /// Store a manifest (the top-level one if `instance` is `None`).
    fn put_manifest(
        &mut self,
        manifest: &[u8],
        media_type: &str,
        instance: Option<&Digest>,
    ) -> std::result::Result<(), PutManifestError>;

    /// Store signatures for the top-level manifest or an instance.
    fn put_signatures(&mut self, signatures: &[Vec<u8>], _instance: Option<&Digest>) -> Result<()> {
        if signatures.is_empty() {
            return Ok(());
        }
        anyhow::bail!("Storing signatures to {} is not supported", self.reference())
    }

    /// Mark the image as complete and persist it.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// A backend which can open sources and destinations for its references.
pub trait ImageTransport: Debug + Send + Sync {
    /// The transport this implements.
    fn transport(&self) -> Transport;

    /// True for placeholders of backends which are not built in.
    fn is_stub(&self) -> bool {
        false
    }

    /// Open `imgref` for reading.
    fn open_source(
        &self,
        imgref: &ImageReference,
        opts: &TransportOptions,
    ) -> Result<Box<dyn ImageSource>>;

    /// Open `imgref` for writing.
    fn open_destination(
        &self,
        imgref: &ImageReference,
        opts: &TransportOptions,
    ) -> Result<Box<dyn ImageDestination>>;
}

/// The set of transports available in this process.
#[derive(Debug, Default)]
pub struct TransportRegistry {
    transports: BTreeMap<Transport, Box<dyn ImageTransport>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport we know about; the ones not built in are stubs.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(Box::new(dir::DirTransport));
        r.register(Box::new(oci::OciTransport));
        r.register(Box::new(archive::ArchiveTransport));
        r.register(Box::new(registry::RegistryTransport));
        if cfg!(feature = "docker-daemon-stub") {
            r.register(Box::new(stub::StubTransport(Transport::DockerDaemon)));
        } else {
            r.register(Box::new(daemon::DaemonTransport));
        }
        for t in [
            Transport::OciArchive,
            Transport::ContainerStorage,
            Transport::Ostree,
        ] {
            r.register(Box::new(stub::StubTransport(t)));
        }
        r
    }

    /// Add a transport, replacing any previous one for the same [`Transport`].
    pub fn register(&mut self, t: Box<dyn ImageTransport>) {
        self.transports.insert(t.transport(), t);
    }

    /// Look up the implementation of a transport.
    pub fn get(&self, transport: Transport) -> Result<&dyn ImageTransport> {
        self.transports
            .get(&transport)
            .map(|t| &**t)
            .ok_or_else(|| anyhow!("Transport {} is not registered", transport.serializable_name()))
    }

    /// All registered transports.
    pub fn iter(&self) -> impl Iterator<Item = &dyn ImageTransport> {
        self.transports.values().map(|t| &**t)
    }

    /// Open a reference for reading.
    pub fn open_source(
        &self,
        imgref: &ImageReference,
        opts: &TransportOptions,
    ) -> Result<Box<dyn ImageSource>> {
        self.get(imgref.transport)?.open_source(imgref, opts)
    }

    /// Open a reference for writing.
    pub fn open_destination(
        &self,
        imgref: &ImageReference,
        opts: &TransportOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        self.get(imgref.transport)?.open_destination(imgref, opts)
    }
}
