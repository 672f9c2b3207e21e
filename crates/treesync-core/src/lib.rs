//! treesync Core - Building blocks shared by the server and the client
//!
//! This crate is synchronous and runtime-free. It contains:
//! - **Configuration** - YAML-backed [`config::Config`] with validation
//! - **Paths** - slash-normalized relative paths and safe joins under a sync root
//! - **Ignore rules** - [`ignore::PathIgnorer`] (basename glob or substring)
//! - **Manifests** - [`manifest::build_manifest`] mapping relative paths to content hashes
//! - **Wire protocol** - the [`protocol::Envelope`] sum type and its JSON codec
//!
//! The async engine that moves these values over the network lives in
//! `treesync-sync`.

pub mod config;
pub mod error;
pub mod ignore;
pub mod manifest;
pub mod paths;
pub mod protocol;

pub use error::DomainError;
pub use ignore::PathIgnorer;
pub use manifest::{build_manifest, Manifest, ManifestScan};
pub use protocol::{Envelope, FileOperation, OperationKind};
