//! Echo suppression
//!
//! When the client applies an inbound change, its own watcher sees the write
//! and would send it straight back. [`EchoGuard`] records which paths are
//! being applied so the watch task can drop those events.
//!
//! Each apply holds a [`Suppression`] permit for its path. While the permit is
//! alive, and for a grace period after it is dropped, events for the path, its
//! descendants and its ancestors are suppressed. Ancestors are included
//! because applying `a/b/c.txt` may create `a/` and `a/b/` on the way.
//! Events for unrelated paths are never dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug, Default)]
struct Entry {
    in_flight: usize,
    until: Option<Instant>,
}

impl Entry {
    fn is_active(&self, now: Instant) -> bool {
        self.in_flight > 0 || self.until.is_some_and(|until| now < until)
    }
}

#[derive(Debug)]
struct Inner {
    grace: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

/// Per-path suppression set shared by the receive loop and the watch task
#[derive(Debug, Clone)]
pub struct EchoGuard {
    inner: Arc<Inner>,
}

impl EchoGuard {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                grace,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Marks `path` as being applied until the returned permit is dropped
    /// (plus the grace period).
    pub fn begin(&self, path: &str) -> Suppression {
        let path = path.trim_matches('/').to_string();
        {
            let mut entries = self.lock();
            entries.entry(path.clone()).or_default().in_flight += 1;
        }
        trace!(path = %path, "Suppressing watcher events");
        Suppression {
            guard: self.clone(),
            path,
        }
    }

    /// Returns true if a watcher event for `path` should be dropped.
    pub fn is_suppressed(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        let now = Instant::now();
        let mut entries = self.lock();
        entries.retain(|_, entry| entry.is_active(now));
        entries.keys().any(|applied| is_related(applied, path))
    }

    /// Returns true while any apply is in flight.
    pub fn is_syncing(&self) -> bool {
        self.lock().values().any(|entry| entry.in_flight > 0)
    }

    fn finish(&self, path: &str) {
        let until = Instant::now() + self.inner.grace;
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(path) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            entry.until = Some(entry.until.map_or(until, |prev| prev.max(until)));
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // The map stays consistent even if a holder panicked
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// RAII permit returned by [`EchoGuard::begin`]
#[derive(Debug)]
#[must_use = "suppression ends as soon as the permit is dropped"]
pub struct Suppression {
    guard: EchoGuard,
    path: String,
}

impl Drop for Suppression {
    fn drop(&mut self) {
        self.guard.finish(&self.path);
    }
}

/// Same path, one is a directory prefix of the other, or either is the root.
fn is_related(a: &str, b: &str) -> bool {
    fn is_prefix(parent: &str, child: &str) -> bool {
        parent.is_empty()
            || child
                .strip_prefix(parent)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    }
    is_prefix(a, b) || is_prefix(b, a)
}
