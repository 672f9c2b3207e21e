//! Filesystem watching
//!
//! Provides a [`FileWatcher`] that wraps the `notify` crate, converting raw OS
//! events into [`ChangeEvent`] values delivered through a tokio channel.
//!
//! Every directory is watched non-recursively and registered explicitly, so
//! ignored subtrees never consume watch descriptors and the watch set can
//! follow directories as they appear and disappear.
//!
//! ## Architecture
//!
//! ```text
//! inotify / kqueue / ReadDirectoryChangesW
//!       │
//!       ▼
//!  FileWatcher  ──→  mpsc::channel  ──→  client watch task  ──→  server
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::SyncError;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

// ============================================================================
// ChangeEvent
// ============================================================================

/// A filesystem change detected by the watcher, carrying the absolute path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A file or directory appeared (created or moved in)
    Created(PathBuf),
    /// A file's content changed
    Modified(PathBuf),
    /// A file or directory disappeared (deleted or moved out)
    Deleted(PathBuf),
}

impl ChangeEvent {
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
        }
    }
}

/// One entry discovered by [`FileWatcher::watch_tree`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Watches a set of directories using the OS-native mechanism
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
}

impl FileWatcher {
    /// Creates a watcher with nothing registered yet.
    ///
    /// Returns the watcher and the receiver its events are delivered to.
    ///
    /// # Errors
    /// Returns an error if the underlying OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>), SyncError> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(EVENT_CHANNEL_CAPACITY);

        info!("Initializing file watcher");

        let watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for change in map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Failed to send change event (receiver dropped)");
                            return;
                        }
                    }
                }
                Err(err) => {
                    error!(error = %err, "File watcher error");
                }
            },
            notify::Config::default(),
        )?;

        Ok((
            Self {
                watcher,
                watched: HashSet::new(),
            },
            rx,
        ))
    }

    /// Starts watching one directory (not its subdirectories).
    ///
    /// Watching an already watched directory is a no-op.
    pub fn watch_dir(&mut self, dir: &Path) -> Result<(), SyncError> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        self.watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!(path = %dir.display(), "Watching directory");
        self.watched.insert(dir.to_path_buf());
        Ok(())
    }

    /// Watches `dir` and every subdirectory below it accepted by `keep`.
    ///
    /// Returns every accepted entry below `dir` (not `dir` itself), parents
    /// before children, so the caller can announce contents that existed
    /// before the watch was registered. Symlinks are skipped. A failure to
    /// watch `dir` itself is returned; failures further down are logged.
    pub fn watch_tree<F>(&mut self, dir: &Path, mut keep: F) -> Result<Vec<TreeEntry>, SyncError>
    where
        F: FnMut(&Path) -> bool,
    {
        self.watch_dir(dir)?;

        let mut entries = Vec::new();
        let walker = WalkDir::new(dir)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| keep(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry while registering watches");
                    continue;
                }
            };
            let file_type = entry.file_type();
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                if let Err(e) = self.watch_dir(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "Failed to watch directory");
                }
            }
            entries.push(TreeEntry {
                path: entry.into_path(),
                is_dir: file_type.is_dir(),
            });
        }

        Ok(entries)
    }

    /// Stops watching `path` and every watched directory below it.
    ///
    /// Returns true if anything was being watched. Deleted directories are
    /// usually already dropped by the OS, so unwatch failures are not errors.
    pub fn unwatch_tree(&mut self, path: &Path) -> bool {
        let doomed: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|w| w.starts_with(path))
            .cloned()
            .collect();

        for dir in &doomed {
            if let Err(e) = self.watcher.unwatch(dir) {
                debug!(path = %dir.display(), error = %e, "Unwatch failed (already gone)");
            }
            self.watched.remove(dir);
        }

        !doomed.is_empty()
    }

    pub fn is_watched(&self, dir: &Path) -> bool {
        self.watched.contains(dir)
    }

    pub fn watched_count(&self) -> usize {
        self.watched.len()
    }
}

// ============================================================================
// Event mapping - notify::Event → ChangeEvent
// ============================================================================

/// Converts a `notify::Event` into zero or more [`ChangeEvent`]s
///
/// - `Create(*)` → `Created`
/// - `Modify(Data(*))`, `Modify(Any)` → `Modified`
/// - `Modify(Name(From))` → `Deleted`; `Modify(Name(To))` → `Created`
/// - `Modify(Name(Both))` → `Deleted(old)` then `Created(new)`
/// - `Modify(Name(Any | Other))` → `Created` if the path exists, else `Deleted`
/// - `Remove(*)` → `Deleted`
///
/// Metadata changes and access events are ignored.
pub(crate) fn map_notify_event(event: &notify::Event) -> Vec<ChangeEvent> {
    let paths = &event.paths;
    let Some(first) = paths.first() else {
        return Vec::new();
    };

    let mapped = match &event.kind {
        EventKind::Create(_) => vec![ChangeEvent::Created(first.clone())],

        EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any) => {
            vec![ChangeEvent::Modified(first.clone())]
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            vec![ChangeEvent::Deleted(first.clone())]
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            vec![ChangeEvent::Created(first.clone())]
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match paths.get(1) {
            Some(new) => vec![
                ChangeEvent::Deleted(first.clone()),
                ChangeEvent::Created(new.clone()),
            ],
            None => vec![ChangeEvent::Deleted(first.clone())],
        },

        EventKind::Modify(ModifyKind::Name(_)) => {
            if first.exists() {
                vec![ChangeEvent::Created(first.clone())]
            } else {
                vec![ChangeEvent::Deleted(first.clone())]
            }
        }

        EventKind::Remove(_) => vec![ChangeEvent::Deleted(first.clone())],

        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            Vec::new()
        }
    };

    debug!(kind = ?event.kind, mapped = ?mapped, "Mapped notify event");
    mapped
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use notify::event::{AccessKind, CreateKind, DataChange, MetadataKind, RemoveKind};
    use tempfile::TempDir;

    use super::*;

    fn event(kind: EventKind, paths: &[&str]) -> notify::Event {
        let mut ev = notify::Event::new(kind);
        for p in paths {
            ev = ev.add_path(PathBuf::from(p));
        }
        ev
    }

    // ------------------------------------------------------------------
    // Event mapping
    // ------------------------------------------------------------------

    #[test]
    fn test_map_create_event() {
        let ev = event(EventKind::Create(CreateKind::File), &["/w/a.txt"]);
        assert_eq!(
            map_notify_event(&ev),
            vec![ChangeEvent::Created(PathBuf::from("/w/a.txt"))]
        );
    }

    #[test]
    fn test_map_modify_data_event() {
        let ev = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/w/a.txt"],
        );
        assert_eq!(
            map_notify_event(&ev),
            vec![ChangeEvent::Modified(PathBuf::from("/w/a.txt"))]
        );
    }

    #[test]
    fn test_map_rename_halves() {
        let from = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::From)),
            &["/w/old.txt"],
        );
        let to = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::To)),
            &["/w/new.txt"],
        );
        assert_eq!(
            map_notify_event(&from),
            vec![ChangeEvent::Deleted(PathBuf::from("/w/old.txt"))]
        );
        assert_eq!(
            map_notify_event(&to),
            vec![ChangeEvent::Created(PathBuf::from("/w/new.txt"))]
        );
    }

    #[test]
    fn test_map_rename_both() {
        let ev = event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/w/old.txt", "/w/new.txt"],
        );
        assert_eq!(
            map_notify_event(&ev),
            vec![
                ChangeEvent::Deleted(PathBuf::from("/w/old.txt")),
                ChangeEvent::Created(PathBuf::from("/w/new.txt")),
            ]
        );
    }

    #[test]
    fn test_map_ambiguous_rename_checks_existence() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("present.txt");
        std::fs::write(&present, b"x").unwrap();
        let absent = dir.path().join("absent.txt");

        let mut ev = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)));
        ev = ev.add_path(present.clone());
        assert_eq!(map_notify_event(&ev), vec![ChangeEvent::Created(present)]);

        let mut ev = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)));
        ev = ev.add_path(absent.clone());
        assert_eq!(map_notify_event(&ev), vec![ChangeEvent::Deleted(absent)]);
    }

    #[test]
    fn test_map_remove_event() {
        let ev = event(EventKind::Remove(RemoveKind::Folder), &["/w/dir"]);
        assert_eq!(
            map_notify_event(&ev),
            vec![ChangeEvent::Deleted(PathBuf::from("/w/dir"))]
        );
    }

    #[test]
    fn test_map_ignored_kinds() {
        let access = event(EventKind::Access(AccessKind::Any), &["/w/a.txt"]);
        let chmod = event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/w/a.txt"],
        );
        assert!(map_notify_event(&access).is_empty());
        assert!(map_notify_event(&chmod).is_empty());
    }

    #[test]
    fn test_map_event_no_paths() {
        let ev = event(EventKind::Create(CreateKind::File), &[]);
        assert!(map_notify_event(&ev).is_empty());
    }

    // ------------------------------------------------------------------
    // Watch set
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_watch_tree_registers_kept_directories() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::create_dir_all(dir.path().join("skip/inner")).unwrap();
        std::fs::write(dir.path().join("a/file.txt"), b"x").unwrap();

        let (mut watcher, _rx) = FileWatcher::new().unwrap();
        let skip = dir.path().join("skip");
        let entries = watcher.watch_tree(dir.path(), |p| p != skip).unwrap();

        assert_eq!(watcher.watched_count(), 3);
        assert!(watcher.is_watched(&dir.path().join("a/b")));
        assert!(!watcher.is_watched(&dir.path().join("skip")));

        let found: Vec<(PathBuf, bool)> = entries.into_iter().map(|e| (e.path, e.is_dir)).collect();
        assert_eq!(
            found,
            vec![
                (dir.path().join("a"), true),
                (dir.path().join("a/b"), true),
                (dir.path().join("a/file.txt"), false),
            ]
        );
    }

    #[tokio::test]
    async fn test_unwatch_tree_drops_descendants() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::create_dir_all(dir.path().join("ab")).unwrap();

        let (mut watcher, _rx) = FileWatcher::new().unwrap();
        watcher.watch_tree(dir.path(), |_| true).unwrap();
        assert_eq!(watcher.watched_count(), 5);

        assert!(watcher.unwatch_tree(&dir.path().join("a")));
        assert_eq!(watcher.watched_count(), 2);
        assert!(watcher.is_watched(&dir.path().join("ab")));
        assert!(!watcher.unwatch_tree(&dir.path().join("a")));
    }

    #[tokio::test]
    async fn test_file_creation_is_reported() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();

        let (mut watcher, mut rx) = FileWatcher::new().unwrap();
        watcher.watch_dir(&root).unwrap();

        let target = root.join("new.txt");
        std::fs::write(&target, b"hello").unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(ev) = rx.recv().await {
                if ev.path() == target {
                    return Some(ev);
                }
            }
            None
        })
        .await
        .unwrap();

        assert!(matches!(
            seen,
            Some(ChangeEvent::Created(_) | ChangeEvent::Modified(_))
        ));
    }
}
