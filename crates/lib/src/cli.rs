//! # Command line interface
//!
//! Parsing of arguments and dispatch to the library.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::config;
use crate::copy::{CopyOptions, ImageListSelection, copy_image};
use crate::list::plan_list_conversion;
use crate::manifest::Platform;
use crate::mime;
use crate::plan::{ManifestConversionInputs, plan_manifest_conversion};
use crate::policy::{InsecureAcceptAnything, PolicyContext, RequireSignatures};
use crate::transport::{ImageReference, TransportRegistry};

/// Options for copying an image.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct CopyOpts {
    /// Source image, e.g. `docker://quay.io/example/image:latest`
    pub(crate) source: ImageReference,

    /// Destination image, e.g. `oci:/path/to/dir:tag`
    pub(crate) destination: ImageReference,

    /// Store single images in this format: `oci`, `v2s2`, `v2s1` or a MIME type
    #[clap(long)]
    pub(crate) format: Option<String>,

    /// Store manifest lists in this format: `oci-index`, `v2list` or a MIME type
    #[clap(long)]
    pub(crate) list_format: Option<String>,

    /// Do not copy signatures; required to convert a signed image
    #[clap(long)]
    pub(crate) remove_signatures: bool,

    /// Copy every image of a manifest list, and the list itself
    #[clap(long)]
    pub(crate) all: bool,

    /// The layers will be encrypted; store a manifest type which supports that
    #[clap(long)]
    pub(crate) encrypt_layers: bool,

    /// Refuse to copy images which carry no signatures
    #[clap(long)]
    pub(crate) require_signatures: bool,

    /// Select this platform (`os/arch[/variant]`) from manifest lists
    #[clap(long)]
    pub(crate) platform: Option<Platform>,

    /// Print the result as JSON
    #[clap(long)]
    pub(crate) json: bool,
}

/// Options for showing a manifest conversion plan.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct PlanOpts {
    /// Type of the source manifest, as declared by the source
    #[clap(long)]
    pub(crate) source_type: String,

    /// A type the destination supports; may be repeated, most preferred first
    #[clap(long = "dest-type")]
    pub(crate) dest_types: Vec<String>,

    /// Force this format
    #[clap(long)]
    pub(crate) format: Option<String>,

    /// Only consider formats which can reference encrypted layers
    #[clap(long)]
    pub(crate) require_encryption: bool,

    /// The manifest must not be modified, for this reason
    #[clap(long)]
    pub(crate) cannot_modify: Option<String>,
}

/// Options for showing a manifest list conversion plan.
#[derive(Debug, Parser, PartialEq, Eq)]
pub(crate) struct PlanListOpts {
    /// Type of the manifest list, as declared by the source
    #[clap(long)]
    pub(crate) current: String,

    /// A type the destination supports; may be repeated, most preferred first
    #[clap(long = "dest-type")]
    pub(crate) dest_types: Vec<String>,

    /// Force this list format
    #[clap(long)]
    pub(crate) format: Option<String>,
}

/// Copy container images between transports, converting manifests as the
/// destination requires.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "imgcopy", version)]
pub(crate) enum Opt {
    /// Copy an image.
    Copy(CopyOpts),
    /// Show which manifest formats would be tried, in order, as JSON.
    Plan(PlanOpts),
    /// Show which manifest list formats would be tried, in order, as JSON.
    PlanList(PlanListOpts),
    /// List the supported transports.
    Transports,
}

/// Accept the short names of formats wherever a MIME type is expected.
fn resolve_format(s: &str) -> String {
    mime::parse_manifest_format(s)
        .or_else(|_| mime::parse_list_format(s))
        .map(ToOwned::to_owned)
        .unwrap_or_else(|_| s.to_owned())
}

fn print_json(v: &impl serde::Serialize) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, v)?;
    writeln!(stdout)?;
    Ok(())
}

/// Cancel `cancel` on the first SIGINT.
fn cancel_on_interrupt(cancel: CancellationToken) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Creating signal runtime")?;
    std::thread::Builder::new()
        .name("signals".into())
        .spawn(move || {
            rt.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted; cancelling");
                    cancel.cancel();
                }
            })
        })
        .context("Spawning signal handler")?;
    Ok(())
}

impl CopyOpts {
    /// Apply the flags on top of the configured options.
    fn to_options(&self, mut opts: CopyOptions) -> Result<CopyOptions> {
        if let Some(f) = self.format.as_deref() {
            opts.forced_manifest_type = Some(mime::parse_manifest_format(f)?.to_owned());
        }
        if let Some(f) = self.list_format.as_deref() {
            opts.forced_list_type = Some(mime::parse_list_format(f)?.to_owned());
        }
        opts.remove_signatures |= self.remove_signatures;
        opts.encrypt_layers |= self.encrypt_layers;
        if self.all {
            opts.image_list_selection = ImageListSelection::CopyAllImages;
        }
        if let Some(p) = self.platform.clone() {
            opts.platform = Some(p);
        }
        Ok(opts)
    }
}

fn run_copy(opts: CopyOpts) -> Result<()> {
    let copy_options = opts.to_options(config::load_config()?.copy_options()?)?;
    let policy: &dyn PolicyContext = if opts.require_signatures {
        &RequireSignatures
    } else {
        &InsecureAcceptAnything
    };
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone())?;
    let r = copy_image(
        &TransportRegistry::with_defaults(),
        policy,
        &opts.source,
        &opts.destination,
        &copy_options,
        &cancel,
    )?;
    if opts.json {
        print_json(&r)?;
    } else {
        println!("{} ({})", r.digest, mime::short_name(&r.media_type));
    }
    Ok(())
}

fn run_plan(opts: PlanOpts) -> Result<()> {
    let dest: Vec<String> = opts.dest_types.iter().map(|t| resolve_format(t)).collect();
    let forced = opts
        .format
        .as_deref()
        .map(mime::parse_manifest_format)
        .transpose()?;
    let source = resolve_format(&opts.source_type);
    let plan = plan_manifest_conversion(&ManifestConversionInputs {
        source_format: &source,
        destination_supported_formats: &dest,
        forced_format: forced,
        requires_encryption: opts.require_encryption,
        cannot_modify_reason: opts.cannot_modify.as_deref(),
    })?;
    print_json(&plan)
}

fn run_plan_list(opts: PlanListOpts) -> Result<()> {
    let dest: Vec<String> = opts.dest_types.iter().map(|t| resolve_format(t)).collect();
    let forced = opts
        .format
        .as_deref()
        .map(mime::parse_list_format)
        .transpose()?;
    let plan = plan_list_conversion(&resolve_format(&opts.current), &dest, forced)?;
    print_json(&plan)
}

fn run_transports() -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for t in TransportRegistry::with_defaults().iter() {
        let name = t.transport().serializable_name();
        if t.is_stub() {
            writeln!(stdout, "{name} (not supported in this build)")?;
        } else {
            writeln!(stdout, "{name}")?;
        }
    }
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    tracing::trace!("Running {opt:?}");
    match opt {
        Opt::Copy(opts) => run_copy(opts),
        Opt::Plan(opts) => run_plan(opts),
        Opt::PlanList(opts) => run_plan_list(opts),
        Opt::Transports => run_transports(),
    }
}
