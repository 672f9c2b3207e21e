//! Operation applier
//!
//! Every mutation of a sync directory, on either side, goes through this
//! module. All operations take a wire-format relative path and a root; the
//! path is resolved with [`resolve_under_root`] and then checked on disk so
//! that no symlink inside the root can lead outside it.
//!
//! ## Semantics
//!
//! - **Write file**: parent directories are created, then the content
//!   replaces whatever was there (truncating write).
//! - **Write directory**: `create_dir_all`; already existing is fine.
//! - **Remove**: file or directory (recursively); already absent is fine.
//!
//! Writes go straight to the target rather than through a temporary file:
//! a sibling temp file would itself be picked up by the client's watcher.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};
use treesync_core::paths::resolve_under_root;
use treesync_core::protocol::{FileOperation, OperationKind};
use treesync_core::DomainError;

use crate::SyncError;

/// Applies one operation under `root`.
///
/// Applying the same operation twice leaves the tree in the same state as
/// applying it once.
///
/// # Errors
/// Returns [`SyncError::DomainError`] for paths escaping `root` and
/// [`SyncError::IoError`] for filesystem failures.
#[instrument(skip(root, op), fields(path = %op.path, op = %op.op, is_dir = op.is_dir))]
pub async fn apply_operation(root: &Path, op: &FileOperation) -> Result<(), SyncError> {
    let target = resolve_confined(root, &op.path, op.op == OperationKind::Write).await?;

    match op.op {
        OperationKind::Write if op.is_dir => create_directory(&target).await,
        OperationKind::Write => {
            let content = op.content.as_deref().unwrap_or_default();
            write_file_at(&target, content).await
        }
        OperationKind::Remove => remove_path(&target).await,
    }
}

/// Writes `content` to the relative `path` under `root`, creating parents.
pub async fn write_file(root: &Path, path: &str, content: &[u8]) -> Result<(), SyncError> {
    let target = resolve_confined(root, path, true).await?;
    write_file_at(&target, content).await
}

/// Removes the file or directory at the relative `path` under `root`.
///
/// A symlink at `path` itself is removed, never its target.
pub async fn remove(root: &Path, path: &str) -> Result<(), SyncError> {
    let target = resolve_confined(root, path, false).await?;
    remove_path(&target).await
}

/// Reads the file at the relative `path` under `root`.
pub async fn read_file(root: &Path, path: &str) -> Result<Vec<u8>, SyncError> {
    let target = resolve_confined(root, path, true).await?;
    let data = tokio::fs::read(&target).await?;
    debug!(path = %target.display(), bytes = data.len(), "file read complete");
    Ok(data)
}

/// Resolves `path` under `root` and rejects it if any existing component
/// below the root is a symlink. The last component is only checked when
/// `check_last` is set, since removing a link never touches its target.
async fn resolve_confined(
    root: &Path,
    path: &str,
    check_last: bool,
) -> Result<PathBuf, SyncError> {
    let target = resolve_under_root(root, path)?;

    let skip = usize::from(!check_last);
    for ancestor in target.ancestors().skip(skip) {
        if ancestor == root {
            break;
        }
        match tokio::fs::symlink_metadata(ancestor).await {
            Ok(m) if m.file_type().is_symlink() => {
                return Err(DomainError::SymlinkInPath(path.to_string()).into());
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(target)
}

async fn write_file_at(target: &PathBuf, content: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, content).await?;
    debug!(bytes = content.len(), "write complete");
    Ok(())
}

async fn create_directory(target: &PathBuf) -> Result<(), SyncError> {
    tokio::fs::create_dir_all(target).await?;
    debug!("directory created");
    Ok(())
}

async fn remove_path(target: &PathBuf) -> Result<(), SyncError> {
    let metadata = match tokio::fs::symlink_metadata(target).await {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("already absent");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let result = if metadata.is_dir() {
        debug!("removing directory recursively");
        tokio::fs::remove_dir_all(target).await
    } else {
        debug!("removing file");
        tokio::fs::remove_file(target).await
    };

    match result {
        Ok(()) => Ok(()),
        // Lost a race with another remover
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// Unit tests
// ============================================================================
