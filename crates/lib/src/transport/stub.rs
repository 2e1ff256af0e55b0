//! Placeholder for transports which are not built in.

use anyhow::{Result, bail};

use super::{
    ImageDestination, ImageReference, ImageSource, ImageTransport, Transport, TransportOptions,
};

/// A transport that is known by name but not supported in this build.
#[derive(Debug)]
pub(crate) struct StubTransport(pub(crate) Transport);

impl StubTransport {
    fn unsupported<T>(&self) -> Result<T> {
        bail!(
            "{} transport is not supported in this build",
            self.0.serializable_name()
        )
    }
}

impl ImageTransport for StubTransport {
    fn transport(&self) -> Transport {
        self.0
    }

    fn is_stub(&self) -> bool {
        true
    }

    fn open_source(
        &self,
        _imgref: &ImageReference,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn ImageSource>> {
        self.unsupported()
    }

    fn open_destination(
        &self,
        _imgref: &ImageReference,
        _opts: &TransportOptions,
    ) -> Result<Box<dyn ImageDestination>> {
        self.unsupported()
    }
}
