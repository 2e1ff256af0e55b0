// The internals docs are built with --document-private-items, so allow
// linking to private items from module documentation.
#![allow(rustdoc::private_intra_doc_links)]

//! # Container image copying
//!
//! This crate copies container images between storage backends, picking a
//! manifest format the destination accepts and converting to it when
//! needed.
//!
//! # Crate Overview
//!
//! This is the core implementation library for imgcopy. The `imgcopy`
//! binary (`crates/cli`) is a thin wrapper that delegates to
//! [`cli::run_from_iter`].
//!
//! # Module Index
//!
//! ## Format negotiation
//!
//! - [`mime`] - Manifest MIME types and their properties
//! - [`plan`] - Which formats to try for a single image, in order
//! - [`list`] - The same, for manifest lists
//! - [`orchestrate`] - Trying each planned format until the destination accepts one
//!
//! ## Copying
//!
//! - [`copy`] - The copy pipeline
//! - [`convert`] - Rewriting manifests between formats
//! - [`manifest`] - Manifest list parsing and platform selection
//! - [`policy`] - Whether an image may be copied
//! - [`transport`] - Image sources and destinations
//!
//! ## Plumbing
//!
//! - [`cli`] - Command-line interface implementation (clap-based)
//! - [`config`] - Configuration files
//! - [`digest`] - Content digests

pub mod cli;
pub mod config;
pub mod convert;
pub mod copy;
pub mod digest;
pub mod list;
pub mod manifest;
pub mod mime;
pub mod orchestrate;
mod ordered_set;
pub mod plan;
pub mod policy;
pub mod transport;
