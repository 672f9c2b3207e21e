//! Initial sync planning
//!
//! The server tree is authoritative for the initial sync: whatever differs is
//! fetched, and (unless disabled) whatever exists only locally is deleted.

use treesync_core::Manifest;

/// What a client must do to match the server's manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Server paths that are missing locally or have a different hash
    pub fetch: Vec<String>,
    /// Local paths the server does not have
    pub delete: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.fetch.is_empty() && self.delete.is_empty()
    }
}

/// Diffs `local` against `server`.
///
/// Both lists come out sorted, since [`Manifest`] iterates in path order.
pub fn plan_reconciliation(server: &Manifest, local: &Manifest, delete: bool) -> ReconcilePlan {
    let fetch = server
        .iter()
        .filter(|(path, hash)| local.get(path) != Some(*hash))
        .map(|(path, _)| path.to_string())
        .collect();

    let delete = if delete {
        local
            .paths()
            .filter(|path| !server.contains(path))
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    ReconcilePlan { fetch, delete }
}
