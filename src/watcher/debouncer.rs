//! Debouncing of raw change notifications into settled changes.
//!
//! Editors and operating systems report a single save as a burst of raw
//! notifications (truncate + write, create + modify). The debouncer keeps
//! one pending entry per path and only releases it once the path has been
//! quiet for the whole window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::MAX_DURATION;

use super::event::{ChangeKind, RawChange};

/// A path whose debounce window has closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledChange {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    kind: ChangeKind,
    deadline: Instant,
}

/// Debounces raw changes by path.
///
/// Every new notification for a pending path slides its deadline forward,
/// so a burst settles once, after it ends.
#[derive(Debug)]
pub struct Debouncer {
    /// Pending changes: path -> merged kind and deadline.
    pending: HashMap<PathBuf, Pending>,
    /// How long a path must be quiet before it settles.
    window: Duration,
}

impl Debouncer {
    /// Windows longer than [`MAX_DURATION`] are capped so deadlines never overflow.
    pub fn new(window: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            window: window.min(MAX_DURATION),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a raw change, resetting the window for its path.
    pub fn record(&mut self, change: RawChange) {
        let deadline = change.at + self.window;

        self.pending
            .entry(change.path)
            .and_modify(|pending| {
                pending.kind = merge(pending.kind, change.kind);
                pending.deadline = pending.deadline.max(deadline);
            })
            .or_insert(Pending {
                kind: change.kind,
                deadline,
            });
    }

    /// Take all paths whose window has closed.
    pub fn take_ready(&mut self) -> Vec<SettledChange> {
        self.take_ready_at(Instant::now())
    }

    /// Take all paths whose deadline is at or before `now`, earliest first.
    pub fn take_ready_at(&mut self, now: Instant) -> Vec<SettledChange> {
        let mut ready = Vec::new();

        self.pending.retain(|path, pending| {
            if pending.deadline <= now {
                ready.push((pending.deadline, path.clone(), pending.kind));
                false
            } else {
                true
            }
        });

        ready.sort_by_key(|(deadline, _, _)| *deadline);
        ready
            .into_iter()
            .map(|(_, path, kind)| SettledChange { kind, path })
            .collect()
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending entry, returning how many were discarded.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

/// Merge a new raw kind into a pending one.
///
/// The latest kind wins, with one exception: modifications of a file
/// created inside the same window keep it `Created`.
fn merge(pending: ChangeKind, latest: ChangeKind) -> ChangeKind {
    match (pending, latest) {
        (ChangeKind::Created, ChangeKind::Modified) => ChangeKind::Created,
        (_, latest) => latest,
    }
}
