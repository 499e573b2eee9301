//! Handler registry with priority ordering.
//!
//! The registry keeps an immutable, priority-sorted snapshot that readers
//! clone cheaply. Appends replace the snapshot under a write lock, so
//! handlers can be added while a watcher is running.

use std::cmp::Reverse;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::event::ChangeKind;
use super::handler::Handler;
use super::matcher;

/// Ordered collection of registered handlers.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    /// Sorted by priority descending, insertion order on ties.
    handlers: RwLock<Arc<[Arc<Handler>]>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler and re-sort by priority.
    pub fn add(&self, handler: Handler) -> Arc<Handler> {
        let handler = Arc::new(handler);
        let mut guard = self.handlers.write();

        let mut handlers = guard.to_vec();
        handlers.push(Arc::clone(&handler));
        // Stable sort keeps registration order among equal priorities.
        handlers.sort_by_key(|h| Reverse(h.priority()));
        *guard = handlers.into();

        crate::debug_event!(
            "registry",
            "added",
            "{} (priority {}, {})",
            handler.name(),
            handler.priority(),
            handler.root().display()
        );
        handler
    }

    /// Read-only view of the handlers in dispatch order.
    pub fn handlers(&self) -> Arc<[Arc<Handler>]> {
        Arc::clone(&self.handlers.read())
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Check if any handler needs the cooperative scheduler.
    pub fn has_suspending(&self) -> bool {
        self.handlers.read().iter().any(|h| h.is_suspending())
    }

    /// Handlers that should see a `kind` change at `path`, in dispatch order.
    pub fn for_event(&self, kind: ChangeKind, path: &Path) -> Vec<Arc<Handler>> {
        self.matching_resolved(kind, &matcher::resolve_path(path))
    }

    pub(crate) fn matching_resolved(&self, kind: ChangeKind, resolved: &Path) -> Vec<Arc<Handler>> {
        self.handlers()
            .iter()
            .filter(|h| matcher::matches_resolved(h, kind, resolved))
            .cloned()
            .collect()
    }

    /// Distinct handler roots, in dispatch order.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for handler in self.handlers().iter() {
            if !roots.iter().any(|r| r == handler.root()) {
                roots.push(handler.root().to_path_buf());
            }
        }
        roots
    }

    /// Minimal set of directories to subscribe to.
    ///
    /// With `recursive`, a root nested inside another root is already
    /// covered and is dropped.
    pub fn watch_roots(&self, recursive: bool) -> Vec<PathBuf> {
        let mut roots = self.roots();
        roots.sort();

        if !recursive {
            return roots;
        }

        let mut minimal: Vec<PathBuf> = Vec::new();
        for root in roots {
            if !minimal.iter().any(|kept| root.starts_with(kept)) {
                minimal.push(root);
            }
        }
        minimal
    }
}
