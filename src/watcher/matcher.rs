//! Path and change-kind matching for handlers.
//!
//! Matching never fails: a path that cannot be resolved, lies outside the
//! handler root, or does not fit the pattern is simply not a match.

use std::path::{Component, Path, PathBuf};

use glob::{MatchOptions, Pattern};

use super::error::WatchError;
use super::event::ChangeKind;
use super::handler::Handler;

/// Compiled glob attached to a handler.
///
/// Matched against the file name and against the path relative to the
/// handler root; either match is enough. `*` crosses directory separators
/// in the relative form, so `src/*.rs` also sees `src/a/b.rs`.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    glob: Pattern,
}

impl PathPattern {
    pub fn new(source: &str) -> Result<Self, WatchError> {
        let glob = Pattern::new(source).map_err(|e| WatchError::InvalidPattern {
            pattern: source.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            source: source.to_string(),
            glob,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Match against the base name of `path` or against `relative`.
    pub fn matches(&self, path: &Path, relative: &Path) -> bool {
        let options = MatchOptions::new();

        let by_name = path
            .file_name()
            .is_some_and(|name| self.glob.matches_with(&name.to_string_lossy(), options));

        by_name || self.glob.matches_with(&slash_separated(relative), options)
    }
}

/// Decide whether `handler` should see a `kind` change at `path`.
pub fn matches(handler: &Handler, kind: ChangeKind, path: &Path) -> bool {
    matches_resolved(handler, kind, &resolve_path(path))
}

/// Same as [`matches`] for a path already passed through [`resolve_path`].
pub(crate) fn matches_resolved(handler: &Handler, kind: ChangeKind, resolved: &Path) -> bool {
    if !handler.events().contains_kind(kind) {
        return false;
    }

    let Ok(relative) = resolved.strip_prefix(handler.root()) else {
        return false;
    };

    // Deleted entries no longer exist, so only live kinds get the directory check.
    if kind != ChangeKind::Deleted && resolved.is_dir() {
        return false;
    }

    handler
        .pattern()
        .is_none_or(|pattern| pattern.matches(resolved, relative))
}

/// Absolute, symlink-resolved form of `path`.
///
/// Entries that no longer exist are resolved through their deepest existing
/// ancestor, so a deleted file still lands under the canonical root.
pub fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    if let Ok(resolved) = std::fs::canonicalize(&absolute) {
        return resolved;
    }

    let normalized = normalize(&absolute);
    let mut missing = Vec::new();
    let mut current = normalized.as_path();

    while let Some(parent) = current.parent() {
        if let Some(name) = current.file_name() {
            missing.push(name.to_os_string());
        }
        if let Ok(mut resolved) = std::fs::canonicalize(parent) {
            for name in missing.iter().rev() {
                resolved.push(name);
            }
            return resolved;
        }
        current = parent;
    }

    normalized
}

/// Lexically drop `.` and fold `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn slash_separated(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
