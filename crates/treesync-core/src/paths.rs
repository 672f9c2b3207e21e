//! Relative path handling
//!
//! Paths travel over the wire in a `/`-separated form relative to the sync
//! root, regardless of the platform that produced them. These helpers convert
//! between that form and local absolute paths, refusing anything that would
//! land outside the root.

use std::path::{Component, Path, PathBuf};

use crate::error::DomainError;

/// Converts an absolute path under `root` into its `/`-separated relative form.
///
/// Returns `None` when `path` is not inside `root`, is the root itself, or
/// contains components that are not valid UTF-8.
#[must_use]
pub fn relative_slash_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;

    let mut parts = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(s) => parts.push(s.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Joins a wire-format relative path onto `root`.
///
/// Empty and `.` segments are dropped; `..` is rejected, as is any path
/// that reduces to the root itself. Both `/` and `\` separate segments so a
/// Windows peer cannot smuggle a traversal through a backslash.
///
/// # Errors
/// - [`DomainError::PathOutsideRoot`] for `..` segments
/// - [`DomainError::InvalidPath`] for drive prefixes or `:` on Windows
/// - [`DomainError::EmptyPath`] if nothing remains after normalization
pub fn resolve_under_root(root: &Path, relative: &str) -> Result<PathBuf, DomainError> {
    let mut joined = root.to_path_buf();
    let mut depth = 0usize;

    for segment in relative.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(DomainError::PathOutsideRoot(relative.to_string())),
            s => {
                if cfg!(windows) && s.contains(':') {
                    return Err(DomainError::InvalidPath(relative.to_string()));
                }
                joined.push(s);
                depth += 1;
            }
        }
    }

    if depth == 0 {
        return Err(DomainError::EmptyPath);
    }
    Ok(joined)
}

/// Normalizes a wire-format path to its canonical `a/b/c` spelling.
///
/// # Errors
/// Same conditions as [`resolve_under_root`].
pub fn normalize(relative: &str) -> Result<String, DomainError> {
    let mut parts = Vec::new();
    for segment in relative.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return Err(DomainError::PathOutsideRoot(relative.to_string())),
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return Err(DomainError::EmptyPath);
    }
    Ok(parts.join("/"))
}
