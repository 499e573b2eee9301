//! File watcher facade: owns the handler registry and drives the run loop.
//!
//! A run moves through `idle -> running -> stopping -> idle`:
//! 1. Validate that handlers exist and start the executors
//! 2. Bootstrap pass for handlers that process existing files
//! 3. Subscribe to the change source and debounce raw changes
//! 4. Dispatch settled changes until the stop token fires
//! 5. Unsubscribe, drain in-flight work within the grace period

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use crossbeam_channel::RecvTimeoutError;
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::WatchConfig;

use super::debouncer::Debouncer;
use super::dispatch::{DispatchObserver, Dispatcher};
use super::error::WatchError;
use super::event::ChangeKind;
use super::handler::Handler;
use super::matcher;
use super::registry::HandlerRegistry;
use super::source::{ChangeSource, NotifySource};

/// Where a watcher is in its run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Running,
    Stopping,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LifecycleState::Running,
            2 => LifecycleState::Stopping,
            _ => LifecycleState::Idle,
        }
    }
}

/// Summary of one completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    /// Created events synthesized for existing files.
    pub bootstrap_events: u64,
    /// Settled changes that went through dispatch.
    pub settled_events: u64,
    /// Handler invocations submitted, bootstrap included.
    pub invocations: u64,
    /// Invocations that returned an error or panicked.
    pub failures: u64,
    pub scheduler_started: bool,
}

/// Registry of handlers plus the loop that feeds them.
pub struct FileWatcher {
    config: WatchConfig,
    registry: Arc<HandlerRegistry>,
    observers: RwLock<Vec<Arc<dyn DispatchObserver>>>,
    state: AtomicU8,
}

impl FileWatcher {
    /// Create a watcher with its own empty registry.
    pub fn new(config: WatchConfig) -> Self {
        Self::with_registry(config, Arc::new(HandlerRegistry::new()))
    }

    /// Create a watcher over an existing registry.
    pub fn with_registry(config: WatchConfig, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            config,
            registry,
            observers: RwLock::new(Vec::new()),
            state: AtomicU8::new(LifecycleState::Idle as u8),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Register a handler. Allowed while running; it receives the next
    /// settled change, and a new root is subscribed on the next run.
    pub fn add_handler(&self, handler: Handler) -> Arc<Handler> {
        let handler = self.registry.add(handler);
        if self.is_running() {
            crate::debug_event!("watcher", "handler added while running", "{}", handler.name());
        }
        handler
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Attach an observer; it takes effect on the next run.
    pub fn add_observer(&self, observer: Arc<dyn DispatchObserver>) {
        self.observers.write().push(observer);
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Watch with the operating system watcher until `stop` is cancelled.
    pub fn run_notify(&self, stop: &CancellationToken) -> Result<RunStats, WatchError> {
        self.run(&mut NotifySource::new(), stop)
    }

    /// Run the watch loop against `source` until `stop` is cancelled.
    ///
    /// Blocks the calling thread. Configuration errors are returned before
    /// anything starts; a source error ends the run after a clean shutdown.
    pub fn run<S>(&self, source: &mut S, stop: &CancellationToken) -> Result<RunStats, WatchError>
    where
        S: ChangeSource + ?Sized,
    {
        self.state
            .compare_exchange(
                LifecycleState::Idle as u8,
                LifecycleState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| WatchError::AlreadyRunning)?;
        let _idle = ResetOnDrop(&self.state);

        if self.registry.is_empty() {
            return Err(WatchError::NoHandlers);
        }

        let observers = self.observers.read().clone();
        let dispatcher = Dispatcher::new(
            &self.config.name,
            Arc::clone(&self.registry),
            observers,
            self.config.workers(),
            self.config.shutdown_grace(),
        )?;
        dispatcher.announce();

        let bootstrap_events = self.bootstrap(&dispatcher);

        let outcome = self.watch(source, &dispatcher, stop);

        self.state
            .store(LifecycleState::Stopping as u8, Ordering::SeqCst);

        let scheduler_started = dispatcher.scheduler_started();
        let counters = dispatcher.counters();

        if !dispatcher.shutdown() {
            tracing::warn!("[watcher] in-flight handlers outlived the shutdown grace period");
        }

        outcome?;

        let stats = RunStats {
            bootstrap_events,
            settled_events: counters.settled.load(Ordering::Relaxed),
            invocations: counters.invocations.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            scheduler_started,
        };

        crate::log_event!(
            "watcher",
            "stopped",
            "{} settled, {} invocations, {} failures",
            stats.settled_events,
            stats.invocations,
            stats.failures
        );
        Ok(stats)
    }

    /// Subscribe and run the debounce/dispatch loop until stopped.
    fn watch<S>(
        &self,
        source: &mut S,
        dispatcher: &Dispatcher,
        stop: &CancellationToken,
    ) -> Result<(), WatchError>
    where
        S: ChangeSource + ?Sized,
    {
        let roots = self.registry.watch_roots(self.config.recursive);
        let subscription = source.subscribe(&roots, self.config.recursive)?;

        crate::log_event!(
            "watcher",
            "started",
            "{} handlers, {} roots",
            self.registry.len(),
            roots.len()
        );

        // The loop is the only writer to the debouncer: it both feeds and ticks it.
        let mut debouncer = Debouncer::new(self.config.debounce());
        let poll = self.config.poll_interval();

        let outcome = loop {
            if stop.is_cancelled() {
                break Ok(());
            }

            let wait = debouncer.next_deadline().map_or(poll, |deadline| {
                deadline.saturating_duration_since(Instant::now()).min(poll)
            });

            match subscription.recv_timeout(wait) {
                Ok(Ok(change)) => debouncer.record(change),
                Ok(Err(e)) => {
                    tracing::error!("[watcher] change source failed: {e}");
                    break Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break Err(WatchError::SourceClosed),
            }

            for settled in debouncer.take_ready() {
                dispatcher.dispatch(settled.kind, &settled.path);
            }
        };

        drop(subscription);

        let discarded = debouncer.clear();
        if discarded > 0 {
            crate::debug_event!("watcher", "discarded unsettled changes", "{discarded}");
        }

        outcome
    }

    /// Synthesize `created` events for files already under each
    /// `process_existing` handler's root. Returns the number dispatched.
    fn bootstrap(&self, dispatcher: &Dispatcher) -> u64 {
        let mut count = 0;

        for handler in self.registry.handlers().iter() {
            if !handler.process_existing() {
                continue;
            }

            for path in existing_files(handler.root(), self.config.recursive) {
                // Walked paths are already absolute under the canonical root. A link
                // keeps its own name and is only dropped when it escapes the root.
                if !matcher::resolve_path(&path).starts_with(handler.root()) {
                    continue;
                }
                if !matcher::matches_resolved(handler, ChangeKind::Created, &path) {
                    continue;
                }

                let event = handler.event_for(ChangeKind::Created, path);
                if dispatcher.submit(Arc::clone(handler), event) {
                    count += 1;
                }
            }
        }

        if count > 0 {
            crate::log_event!("watcher", "bootstrap", "{count} existing files");
        }
        count
    }
}

impl fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWatcher")
            .field("config", &self.config)
            .field("handlers", &self.registry.len())
            .field("observers", &self.observers.read().len())
            .field("state", &self.state())
            .finish()
    }
}

/// Files under `root` in a stable order: sorted by name, depth-first.
fn existing_files(root: &Path, recursive: bool) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(root).follow_links(false).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }

    walker
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("[watcher] skipping unreadable entry during bootstrap: {e}");
                None
            }
        })
        .filter(|entry| !entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}

/// Returns the watcher to `idle` however the run ends.
struct ResetOnDrop<'a>(&'a AtomicU8);

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(LifecycleState::Idle as u8, Ordering::SeqCst);
    }
}

static DEFAULT_WATCHER: LazyLock<FileWatcher> =
    LazyLock::new(|| FileWatcher::new(WatchConfig::default()));

/// Process-wide watcher with default configuration.
///
/// A convenience entry point only; everything it does is available on an
/// explicitly constructed [`FileWatcher`].
pub fn default_watcher() -> &'static FileWatcher {
    &DEFAULT_WATCHER
}
