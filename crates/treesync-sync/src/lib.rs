//! treesync Sync - Live directory synchronization engine
//!
//! Provides:
//! - A [`server::Server`] that serves its tree, relays operations between peers
//!   and applies them to its own disk through one serialized queue
//! - A [`client::Client`] that mirrors a server tree, watches its local copy
//!   and pushes every local change back
//!
//! ## Modules
//!
//! - [`connection`] - Write-serialized wrapper around one WebSocket sink
//! - [`filesystem`] - Operation applier (idempotent writes and removals under a root)
//! - [`echo`] - Per-path suppression of watcher events caused by inbound applies
//! - [`reconcile`] - Initial sync planning from two manifests
//! - [`watcher`] - notify-based filesystem watcher
//! - [`server`] / [`client`] - The two processes

pub mod client;
pub mod connection;
pub mod echo;
pub mod filesystem;
pub mod reconcile;
pub mod server;
pub mod watcher;

use std::path::PathBuf;

use thiserror::Error;
use treesync_core::manifest::ManifestError;
use treesync_core::protocol::ProtocolError;
use treesync_core::DomainError;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The WebSocket layer failed (dial, handshake, read)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Writing to a peer failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The filesystem watcher could not be created or updated
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    /// An envelope could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A path or endpoint failed validation
    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),

    /// The sync root could not be scanned
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// The sync directory could not be prepared
    #[error("Cannot prepare sync directory {path}: {source}")]
    SyncDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The server could not listen on its configured address
    #[error("Cannot listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A blocking task panicked or was cancelled
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Creates `dir` (and parents) if needed, then returns its canonical form.
///
/// Used by both processes at startup; failure here is fatal.
pub(crate) async fn prepare_sync_dir(dir: &std::path::Path) -> Result<PathBuf, SyncError> {
    let as_setup_error = |source| SyncError::SyncDirectory {
        path: dir.to_path_buf(),
        source,
    };
    tokio::fs::create_dir_all(dir).await.map_err(as_setup_error)?;
    tokio::fs::canonicalize(dir).await.map_err(as_setup_error)
}
