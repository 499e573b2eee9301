//! Upstream sources of raw change notifications.
//!
//! The engine consumes a [`Subscription`]: a channel of raw changes plus a
//! guard that keeps the underlying watch alive. [`NotifySource`] adapts the
//! operating system watcher; [`ChannelSource`] is fed in-process.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};

use super::error::WatchError;
use super::event::{ChangeKind, RawChange};

/// Item delivered by a subscription. An `Err` is fatal to the run.
pub type SourceItem = Result<RawChange, WatchError>;

/// Something that can report raw changes below a set of roots.
pub trait ChangeSource {
    /// Start watching `roots`. Dropping the returned subscription stops it.
    fn subscribe(&mut self, roots: &[PathBuf], recursive: bool) -> Result<Subscription, WatchError>;
}

/// Live subscription to a change source.
pub struct Subscription {
    events: Receiver<SourceItem>,
    guard: Option<Box<dyn Send>>,
}

impl Subscription {
    pub fn new(events: Receiver<SourceItem>) -> Self {
        Self {
            events,
            guard: None,
        }
    }

    /// Keep `guard` alive for as long as the subscription.
    pub fn with_guard(mut self, guard: impl Send + 'static) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<SourceItem, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pending", &self.events.len())
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// Operating system watcher via `notify`.
#[derive(Debug, Default)]
pub struct NotifySource;

impl NotifySource {
    pub fn new() -> Self {
        Self
    }
}

impl ChangeSource for NotifySource {
    fn subscribe(&mut self, roots: &[PathBuf], recursive: bool) -> Result<Subscription, WatchError> {
        let (tx, rx) = unbounded();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for change in translate(&event) {
                    if tx.send(Ok(change)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = tx.send(Err(WatchError::from(e)));
            }
        })
        .map_err(|e| WatchError::InitFailed {
            reason: format!("cannot create file watcher: {e}"),
        })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        for root in roots {
            watcher
                .watch(root, mode)
                .map_err(|e| WatchError::PathWatchFailed {
                    path: root.clone(),
                    reason: e.to_string(),
                })?;
            crate::debug_event!("source", "watching", "{}", root.display());
        }

        Ok(Subscription::new(rx).with_guard(watcher))
    }
}

/// Translate one notify event into raw changes.
pub(crate) fn translate(event: &Event) -> Vec<RawChange> {
    let paths = &event.paths;

    let single = |kind: ChangeKind| -> Vec<RawChange> {
        paths.iter().map(|p| RawChange::new(kind, p)).collect()
    };

    match event.kind {
        EventKind::Create(_) => single(ChangeKind::Created),
        EventKind::Remove(_) => single(ChangeKind::Deleted),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => single(ChangeKind::Deleted),
            RenameMode::To => single(ChangeKind::Created),
            RenameMode::Both => {
                let mut changes = Vec::with_capacity(2);
                if let Some(from) = paths.first() {
                    changes.push(RawChange::new(ChangeKind::Deleted, from));
                }
                if let Some(to) = paths.get(1) {
                    changes.push(RawChange::new(ChangeKind::Created, to));
                }
                changes
            }
            RenameMode::Any | RenameMode::Other => by_existence(paths),
        },
        EventKind::Modify(_) => single(ChangeKind::Modified),
        EventKind::Any => by_existence(paths),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}

/// Ambiguous notifications: a path that still exists was created, else deleted.
fn by_existence(paths: &[PathBuf]) -> Vec<RawChange> {
    paths
        .iter()
        .map(|p| {
            let kind = if Path::new(p).exists() {
                ChangeKind::Created
            } else {
                ChangeKind::Deleted
            };
            RawChange::new(kind, p)
        })
        .collect()
}

/// In-process source fed through a [`Sender`].
///
/// Every subscription reads from the same channel, so changes sent before
/// `run` starts are delivered once it subscribes.
#[derive(Debug, Clone)]
pub struct ChannelSource {
    receiver: Receiver<SourceItem>,
}

impl ChannelSource {
    pub fn new() -> (Self, Sender<SourceItem>) {
        let (tx, rx) = unbounded();
        (Self { receiver: rx }, tx)
    }
}

impl ChangeSource for ChannelSource {
    fn subscribe(&mut self, _roots: &[PathBuf], _recursive: bool) -> Result<Subscription, WatchError> {
        Ok(Subscription::new(self.receiver.clone()))
    }
}
