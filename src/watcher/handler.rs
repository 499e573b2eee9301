//! Handler definitions: callbacks plus the filters that decide when they run.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use super::error::WatchError;
use super::event::{ChangeKind, ChangeSet, FileEvent};
use super::matcher::{self, PathPattern};

/// Result returned by handler bodies. An `Err` is logged, never propagated.
pub type HandlerResult = anyhow::Result<()>;

/// Boxed future produced by a suspending handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send + 'static>>;

type BlockingFn = dyn Fn(&FileEvent) -> HandlerResult + Send + Sync;
type SuspendingFn = dyn Fn(FileEvent) -> HandlerFuture + Send + Sync;

/// Callback shape, fixed when the handler is built.
///
/// Blocking callbacks run on the worker pool; suspending callbacks run on
/// the single cooperative scheduler thread.
#[derive(Clone)]
pub enum Callback {
    Blocking(Arc<BlockingFn>),
    Suspending(Arc<SuspendingFn>),
}

impl Callback {
    pub fn blocking<F>(f: F) -> Self
    where
        F: Fn(&FileEvent) -> HandlerResult + Send + Sync + 'static,
    {
        Callback::Blocking(Arc::new(f))
    }

    pub fn suspending<F, Fut>(f: F) -> Self
    where
        F: Fn(FileEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Callback::Suspending(Arc::new(move |event| Box::pin(f(event))))
    }

    pub fn is_suspending(&self) -> bool {
        matches!(self, Callback::Suspending(_))
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Blocking(_) => f.write_str("Callback::Blocking"),
            Callback::Suspending(_) => f.write_str("Callback::Suspending"),
        }
    }
}

/// A registered reaction to file changes under one root.
///
/// Immutable once built; the registry hands out `Arc<Handler>`.
#[derive(Debug)]
pub struct Handler {
    name: String,
    callback: Callback,
    root: PathBuf,
    events: ChangeSet,
    pattern: Option<PathPattern>,
    process_existing: bool,
    priority: i32,
}

impl Handler {
    /// Start building a handler watching `root`.
    pub fn builder(name: impl Into<String>, root: impl AsRef<Path>) -> HandlerBuilder {
        HandlerBuilder::new(name, root)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    /// Canonical absolute root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn events(&self) -> ChangeSet {
        self.events
    }

    pub fn pattern(&self) -> Option<&PathPattern> {
        self.pattern.as_ref()
    }

    pub fn pattern_str(&self) -> Option<&str> {
        self.pattern.as_ref().map(PathPattern::as_str)
    }

    pub fn process_existing(&self) -> bool {
        self.process_existing
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_suspending(&self) -> bool {
        self.callback.is_suspending()
    }

    /// Check if this handler should see a `kind` change at `path`.
    pub fn matches(&self, kind: ChangeKind, path: &Path) -> bool {
        matcher::matches(self, kind, path)
    }

    /// Event for `path` as this handler observes it.
    pub fn event_for(&self, kind: ChangeKind, path: impl Into<PathBuf>) -> FileEvent {
        FileEvent::new(kind, path, &self.root, self.pattern_str().map(String::from))
    }
}

/// Builder for [`Handler`].
#[derive(Debug, Clone)]
pub struct HandlerBuilder {
    name: String,
    root: PathBuf,
    events: ChangeSet,
    pattern: Option<String>,
    process_existing: bool,
    priority: i32,
}

impl HandlerBuilder {
    /// Create a builder listening to every change kind.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            root: root.as_ref().to_path_buf(),
            events: ChangeSet::all(),
            pattern: None,
            process_existing: false,
            priority: 0,
        }
    }

    /// Replace the set of change kinds.
    pub fn events(mut self, kinds: impl IntoIterator<Item = ChangeKind>) -> Self {
        self.events = kinds.into_iter().collect();
        self
    }

    /// Listen to exactly one change kind.
    pub fn on(self, kind: ChangeKind) -> Self {
        self.events([kind])
    }

    /// Glob matched against the file name or the root-relative path.
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Higher priorities are submitted first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Fire once per existing file, as `created`, when the watcher starts.
    pub fn process_existing(mut self, enabled: bool) -> Self {
        self.process_existing = enabled;
        self
    }

    pub fn blocking<F>(self, f: F) -> Result<Handler, WatchError>
    where
        F: Fn(&FileEvent) -> HandlerResult + Send + Sync + 'static,
    {
        self.callback(Callback::blocking(f))
    }

    pub fn suspending<F, Fut>(self, f: F) -> Result<Handler, WatchError>
    where
        F: Fn(FileEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.callback(Callback::suspending(f))
    }

    /// Finish the handler with an explicit callback.
    pub fn callback(self, callback: Callback) -> Result<Handler, WatchError> {
        if self.events.is_empty() {
            return Err(WatchError::NoEventKinds { handler: self.name });
        }

        let pattern = self.pattern.as_deref().map(PathPattern::new).transpose()?;

        Ok(Handler {
            root: matcher::resolve_path(&self.root),
            name: self.name,
            callback,
            events: self.events,
            pattern,
            process_existing: self.process_existing,
            priority: self.priority,
        })
    }
}
