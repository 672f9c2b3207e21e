//! Directory manifests
//!
//! A [`Manifest`] maps every non-ignored regular file under a root to the
//! SHA-256 of its content. Manifests are rebuilt in full whenever one is
//! needed; nothing is cached between builds.
//!
//! Building never aborts because of a single bad entry: unreadable files and
//! directories are collected into [`ManifestScan::errors`] and the walk
//! continues, so one broken file does not block the rest of the tree.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::ignore::PathIgnorer;
use crate::paths::relative_slash_path;

/// Errors that prevent a manifest from being built at all
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The root could not be inspected
    #[error("Cannot read sync root {path}: {source}")]
    RootUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The root exists but is not a directory
    #[error("Sync root is not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// A per-entry failure encountered while walking the tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanError {
    /// The entry that failed, if known
    pub path: Option<PathBuf>,
    /// Human-readable description of the failure
    pub reason: String,
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(p) => write!(f, "{}: {}", p.display(), self.reason),
            None => write!(f, "{}", self.reason),
        }
    }
}

/// Mapping of relative path (`/`-separated) to lowercase hex SHA-256
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(BTreeMap<String, String>);

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `hash` for `path`, replacing any previous entry.
    pub fn insert(&mut self, path: impl Into<String>, hash: impl Into<String>) {
        self.0.insert(path.into(), hash.into());
    }

    /// Returns the hash recorded for `path`.
    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `(path, hash)` pairs in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(p, h)| (p.as_str(), h.as_str()))
    }

    /// Iterates paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl<P, H> FromIterator<(P, H)> for Manifest
where
    P: Into<String>,
    H: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (P, H)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(p, h)| (p.into(), h.into()))
                .collect(),
        )
    }
}

/// Result of walking a tree: the entries that could be hashed plus the ones that could not
#[derive(Debug, Default)]
pub struct ManifestScan {
    pub manifest: Manifest,
    pub errors: Vec<ScanError>,
}

/// Hashes the full content of `path`.
///
/// # Errors
/// Returns any I/O error from opening or reading the file.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hashes an in-memory buffer the same way [`hash_file`] hashes a file.
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Walks `root` and hashes every regular file that `ignorer` does not exclude.
///
/// Ignored directories are pruned, so nothing below them is visited.
/// Symbolic links are not followed and are not listed.
///
/// # Errors
/// Fails only when `root` itself cannot be read or is not a directory.
/// Per-entry failures are reported in [`ManifestScan::errors`].
pub fn build_manifest(root: &Path, ignorer: &PathIgnorer) -> Result<ManifestScan, ManifestError> {
    let meta = std::fs::metadata(root).map_err(|source| ManifestError::RootUnreadable {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ManifestError::NotADirectory(root.to_path_buf()));
    }

    let mut scan = ManifestScan::default();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            match relative_slash_path(root, entry.path()) {
                Some(rel) => !ignorer.is_ignored(&rel),
                None => false,
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry while building manifest");
                scan.errors.push(ScanError {
                    path: e.path().map(Path::to_path_buf),
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let Some(rel) = relative_slash_path(root, entry.path()) else {
            warn!(path = %entry.path().display(), "Skipping non UTF-8 path");
            scan.errors.push(ScanError {
                path: Some(entry.path().to_path_buf()),
                reason: "path is not valid UTF-8".to_string(),
            });
            continue;
        };

        match hash_file(entry.path()) {
            Ok(hash) => scan.manifest.insert(rel, hash),
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping unreadable file");
                scan.errors.push(ScanError {
                    path: Some(entry.path().to_path_buf()),
                    reason: e.to_string(),
                });
            }
        }
    }

    debug!(
        root = %root.display(),
        files = scan.manifest.len(),
        errors = scan.errors.len(),
        "Manifest built"
    );

    Ok(scan)
}
