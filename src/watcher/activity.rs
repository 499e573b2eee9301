//! In-memory activity log fed by the dispatch observer hook.
//!
//! Keeps the most recent dispatches, per-kind counters and a summary of the
//! registered handlers, and fans each record out to live subscribers.
//! Serving the data (HTTP, SSE) is left to the embedding application.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::Mutex;
use serde::Serialize;

use super::dispatch::DispatchObserver;
use super::event::{ChangeKind, FileEvent};
use super::handler::Handler;

/// Records kept by default.
pub const DEFAULT_CAPACITY: usize = 100;

/// One handler invocation as seen by the observer hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRecord {
    /// Local wall-clock time, `HH:MM:SS.mmm`.
    pub timestamp: String,
    pub kind: ChangeKind,
    pub path: PathBuf,
    pub handler: String,
    pub pattern: Option<String>,
}

impl ActivityRecord {
    pub fn from_event(event: &FileEvent, handler: &str) -> Self {
        Self {
            timestamp: chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
            kind: event.kind,
            path: event.path.clone(),
            handler: handler.to_string(),
            pattern: event.pattern.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActivityStats {
    pub created: u64,
    pub modified: u64,
    pub deleted: u64,
    pub total: u64,
}

impl ActivityStats {
    fn count(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Created => self.created += 1,
            ChangeKind::Modified => self.modified += 1,
            ChangeKind::Deleted => self.deleted += 1,
        }
        self.total += 1;
    }
}

/// Display summary of a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerSummary {
    pub name: String,
    pub root: PathBuf,
    pub pattern: Option<String>,
    pub events: Vec<ChangeKind>,
    pub priority: i32,
    pub process_existing: bool,
    pub suspending: bool,
}

impl From<&Handler> for HandlerSummary {
    fn from(handler: &Handler) -> Self {
        Self {
            name: handler.name().to_string(),
            root: handler.root().to_path_buf(),
            pattern: handler.pattern_str().map(String::from),
            events: handler.events().kinds(),
            priority: handler.priority(),
            process_existing: handler.process_existing(),
            suspending: handler.is_suspending(),
        }
    }
}

/// Serializable view of the log at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct ActivitySnapshot {
    /// Newest first.
    pub events: Vec<ActivityRecord>,
    pub stats: ActivityStats,
    pub handlers: Vec<HandlerSummary>,
    pub roots: Vec<PathBuf>,
    pub uptime_secs: f64,
}

#[derive(Debug)]
struct Inner {
    events: VecDeque<ActivityRecord>,
    stats: ActivityStats,
    handlers: Vec<HandlerSummary>,
    roots: Vec<PathBuf>,
    subscribers: Vec<Sender<ActivityRecord>>,
    started: Instant,
}

impl Inner {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            stats: ActivityStats::default(),
            handlers: Vec::new(),
            roots: Vec::new(),
            subscribers: Vec::new(),
            started: Instant::now(),
        }
    }
}

/// Bounded activity log; attach with [`FileWatcher::add_observer`].
///
/// [`FileWatcher::add_observer`]: super::FileWatcher::add_observer
#[derive(Debug)]
pub struct ActivityLog {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Convenience for sharing one log between a watcher and a reader.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store a record, update counters and notify subscribers.
    ///
    /// Full subscribers miss this record; disconnected ones are dropped.
    pub fn push(&self, record: ActivityRecord) {
        let mut inner = self.inner.lock();

        inner.stats.count(record.kind);

        inner.subscribers.retain(|subscriber| match subscriber.try_send(record.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });

        inner.events.push_front(record);
        inner.events.truncate(self.capacity);
    }

    /// Receive every future record through a channel holding up to `capacity`.
    pub fn subscribe(&self, capacity: usize) -> Receiver<ActivityRecord> {
        let (tx, rx) = bounded(capacity.max(1));
        self.inner.lock().subscribers.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn stats(&self) -> ActivityStats {
        self.inner.lock().stats
    }

    /// Recent records, newest first.
    pub fn recent(&self) -> Vec<ActivityRecord> {
        self.inner.lock().events.iter().cloned().collect()
    }

    pub fn snapshot(&self) -> ActivitySnapshot {
        let inner = self.inner.lock();
        ActivitySnapshot {
            events: inner.events.iter().cloned().collect(),
            stats: inner.stats,
            handlers: inner.handlers.clone(),
            roots: inner.roots.clone(),
            uptime_secs: inner.started.elapsed().as_secs_f64(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.snapshot())
    }

    /// Forget records, counters, handlers and subscribers; restart uptime.
    pub fn reset(&self) {
        *self.inner.lock() = Inner::new();
    }
}

impl DispatchObserver for ActivityLog {
    fn on_start(&self, handlers: &[Arc<Handler>]) {
        let summaries: Vec<HandlerSummary> = handlers.iter().map(|h| h.as_ref().into()).collect();

        let mut roots: Vec<PathBuf> = Vec::new();
        for summary in &summaries {
            if !roots.contains(&summary.root) {
                roots.push(summary.root.clone());
            }
        }

        let mut inner = self.inner.lock();
        inner.handlers = summaries;
        inner.roots = roots;
    }

    fn on_dispatch(&self, event: &FileEvent, handler: &str) {
        self.push(ActivityRecord::from_event(event, handler));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(kind: ChangeKind, path: &str) -> ActivityRecord {
        ActivityRecord {
            timestamp: "12:34:56.789".to_string(),
            kind,
            path: PathBuf::from(path),
            handler: "h".to_string(),
            pattern: None,
        }
    }

    #[test]
    fn test_push_updates_stats() {
        let log = ActivityLog::new();
        log.push(record(ChangeKind::Created, "/f1.txt"));
        log.push(record(ChangeKind::Modified, "/f2.txt"));
        log.push(record(ChangeKind::Deleted, "/f3.txt"));
        log.push(record(ChangeKind::Created, "/f4.txt"));

        assert_eq!(
            log.stats(),
            ActivityStats {
                created: 2,
                modified: 1,
                deleted: 1,
                total: 4
            }
        );
    }

    #[test]
    fn test_ring_keeps_newest_first() {
        let log = ActivityLog::new();
        for i in 0..110 {
            log.push(record(ChangeKind::Created, &format!("/file{i}.txt")));
        }

        let recent = log.recent();
        assert_eq!(recent.len(), DEFAULT_CAPACITY);
        assert_eq!(recent[0].path, PathBuf::from("/file109.txt"));
        assert_eq!(log.stats().total, 110);
    }

    #[test]
    fn test_subscribers_receive_records() {
        let log = ActivityLog::new();
        let rx = log.subscribe(10);

        log.push(record(ChangeKind::Modified, "/a.json"));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.path, PathBuf::from("/a.json"));
    }

    #[test]
    fn test_full_subscriber_is_skipped_and_closed_is_dropped() {
        let log = ActivityLog::new();
        let full = log.subscribe(1);
        let closed = log.subscribe(1);
        drop(closed);

        log.push(record(ChangeKind::Created, "/1"));
        log.push(record(ChangeKind::Created, "/2"));

        assert_eq!(log.subscriber_count(), 1);
        assert_eq!(full.try_recv().unwrap().path, PathBuf::from("/1"));
        assert!(full.try_recv().is_err());
    }

    #[test]
    fn test_on_start_records_handlers_and_roots() {
        let temp_dir = TempDir::new().unwrap();
        let handlers = vec![
            Arc::new(
                Handler::builder("json", temp_dir.path())
                    .pattern("*.json")
                    .priority(2)
                    .blocking(|_| Ok(()))
                    .unwrap(),
            ),
            Arc::new(
                Handler::builder("async", temp_dir.path())
                    .on(ChangeKind::Deleted)
                    .suspending(|_| async { Ok(()) })
                    .unwrap(),
            ),
        ];

        let log = ActivityLog::new();
        log.on_start(&handlers);

        let snapshot = log.snapshot();
        assert_eq!(snapshot.handlers.len(), 2);
        assert_eq!(snapshot.handlers[0].pattern.as_deref(), Some("*.json"));
        assert_eq!(snapshot.handlers[1].events, vec![ChangeKind::Deleted]);
        assert!(snapshot.handlers[1].suspending);
        assert_eq!(snapshot.roots.len(), 1);
    }

    #[test]
    fn test_on_dispatch_and_json() {
        let log = ActivityLog::new();
        let event = FileEvent::new(
            ChangeKind::Modified,
            "/w/data.json",
            "/w",
            Some("*.json".to_string()),
        );
        log.on_dispatch(&event, "json_handler");

        let json: serde_json::Value = serde_json::from_str(&log.to_json().unwrap()).unwrap();
        assert_eq!(json["stats"]["modified"], 1);
        assert_eq!(json["events"][0]["kind"], "modified");
        assert_eq!(json["events"][0]["handler"], "json_handler");
        assert_eq!(json["events"][0]["pattern"], "*.json");
        assert_eq!(json["events"][0]["timestamp"].as_str().unwrap().len(), 12);
    }

    #[test]
    fn test_reset_clears_everything() {
        let log = ActivityLog::new();
        let _rx = log.subscribe(4);
        log.push(record(ChangeKind::Created, "/f1.txt"));

        log.reset();

        let snapshot = log.snapshot();
        assert!(snapshot.events.is_empty());
        assert_eq!(snapshot.stats, ActivityStats::default());
        assert!(snapshot.handlers.is_empty());
        assert_eq!(log.subscriber_count(), 0);
    }
}
