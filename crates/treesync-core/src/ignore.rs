//! Ignore rules for synchronized paths
//!
//! A path is ignored when either:
//! - its basename matches one of the patterns as a glob (`*.swp`, `.DS_Store`), or
//! - one of the patterns occurs anywhere in the relative path as a substring
//!   (`.git` ignores `.git/config` and `sub/.git/HEAD`).
//!
//! No regular expressions are involved; the check runs on every watcher event
//! and every manifest entry.

use glob::Pattern;
use tracing::{debug, warn};

/// A single ignore pattern, compiled once
#[derive(Debug, Clone)]
struct IgnoreRule {
    raw: String,
    /// `None` if the pattern is not a valid glob; substring matching still applies
    glob: Option<Pattern>,
}

/// Ordered set of ignore patterns
#[derive(Debug, Clone, Default)]
pub struct PathIgnorer {
    rules: Vec<IgnoreRule>,
}

impl PathIgnorer {
    /// Builds an ignorer from individual patterns.
    ///
    /// Patterns are trimmed and empty ones are dropped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules: Vec<IgnoreRule> = patterns
            .into_iter()
            .filter_map(|p| {
                let raw = p.as_ref().trim();
                if raw.is_empty() {
                    return None;
                }
                let glob = match Pattern::new(raw) {
                    Ok(g) => Some(g),
                    Err(e) => {
                        warn!(
                            pattern = %raw,
                            error = %e,
                            "Ignore pattern is not a valid glob; using substring match only"
                        );
                        None
                    }
                };
                Some(IgnoreRule {
                    raw: raw.to_string(),
                    glob,
                })
            })
            .collect();

        debug!(rules_count = rules.len(), "PathIgnorer initialized");
        Self { rules }
    }

    /// Parses a comma-separated pattern list such as `".git, *.tmp,node_modules"`.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    /// Returns true if `relative_path` (in `/`-separated form) should not be synchronized.
    pub fn is_ignored(&self, relative_path: &str) -> bool {
        let basename = relative_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(relative_path);

        self.rules.iter().any(|rule| {
            rule.glob
                .as_ref()
                .is_some_and(|g| g.matches(basename))
                || relative_path.contains(rule.raw.as_str())
        })
    }

    /// Returns the normalized patterns in their original order.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|r| r.raw.as_str())
    }

    /// Returns true if no patterns are configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
