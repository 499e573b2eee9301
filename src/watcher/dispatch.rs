//! Dispatch of settled changes to matching handlers.
//!
//! Blocking handlers go to the worker pool, suspending handlers to the
//! cooperative scheduler. Submission follows priority order; completion
//! order is not guaranteed. Every invocation is isolated: errors and panics
//! are logged with handler context and counted, never propagated.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::error::WatchError;
use super::event::{ChangeKind, FileEvent};
use super::handler::{Callback, Handler, HandlerFuture, HandlerResult};
use super::matcher;
use super::pool::WorkerPool;
use super::registry::HandlerRegistry;
use super::scheduler::CooperativeScheduler;

/// Extra time allowed for the scheduler thread to exit after aborting tasks.
const JOIN_SLACK: Duration = Duration::from_millis(500);

/// Observation hook called around dispatch.
///
/// Used by dashboards and activity logs. Implementations must be cheap;
/// a panic inside a hook is caught and logged like a handler failure.
pub trait DispatchObserver: Send + Sync {
    /// Called once per run with the handlers in dispatch order.
    fn on_start(&self, _handlers: &[Arc<Handler>]) {}

    /// Called synchronously just before a handler invocation is submitted.
    fn on_dispatch(&self, event: &FileEvent, handler: &str);
}

/// Counters shared with in-flight invocations.
#[derive(Debug, Default)]
pub(crate) struct DispatchCounters {
    pub(crate) settled: AtomicU64,
    pub(crate) invocations: AtomicU64,
    pub(crate) failures: AtomicU64,
}

/// Routes settled changes to handlers across the two execution pools.
pub(crate) struct Dispatcher {
    name: String,
    registry: Arc<HandlerRegistry>,
    observers: Vec<Arc<dyn DispatchObserver>>,
    pool: WorkerPool,
    /// Started on first need; never created without suspending handlers.
    scheduler: Mutex<Option<CooperativeScheduler>>,
    grace: Duration,
    counters: Arc<DispatchCounters>,
}

impl Dispatcher {
    pub(crate) fn new(
        name: &str,
        registry: Arc<HandlerRegistry>,
        observers: Vec<Arc<dyn DispatchObserver>>,
        max_workers: usize,
        grace: Duration,
    ) -> Result<Self, WatchError> {
        let pool = WorkerPool::new(max_workers, name)?;

        let scheduler = if registry.has_suspending() {
            Some(CooperativeScheduler::start(name, grace)?)
        } else {
            None
        };

        Ok(Self {
            name: name.to_string(),
            registry,
            observers,
            pool,
            scheduler: Mutex::new(scheduler),
            grace,
            counters: Arc::new(DispatchCounters::default()),
        })
    }

    /// Shared counters; they stay valid after [`Dispatcher::shutdown`].
    pub(crate) fn counters(&self) -> Arc<DispatchCounters> {
        Arc::clone(&self.counters)
    }

    pub(crate) fn scheduler_started(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    /// Tell observers which handlers are active for this run.
    pub(crate) fn announce(&self) {
        let handlers = self.registry.handlers();
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_start(&handlers))).is_err() {
                tracing::error!("[dispatch] observer panicked in on_start");
            }
        }
    }

    /// Dispatch one settled change to every matching handler.
    ///
    /// Returns the number of invocations submitted.
    pub(crate) fn dispatch(&self, kind: ChangeKind, path: &Path) -> usize {
        self.counters.settled.fetch_add(1, Ordering::Relaxed);

        let resolved = matcher::resolve_path(path);
        let handlers = self.registry.matching_resolved(kind, &resolved);

        if handlers.is_empty() {
            crate::debug_event!("dispatch", "unmatched", "{kind} {}", resolved.display());
            return 0;
        }

        let mut submitted = 0;
        for handler in handlers {
            let event = handler.event_for(kind, &resolved);
            if self.submit(handler, event) {
                submitted += 1;
            }
        }
        submitted
    }

    /// Submit one invocation of `handler` with a prepared event.
    pub(crate) fn submit(&self, handler: Arc<Handler>, event: FileEvent) -> bool {
        self.notify_observers(&event, handler.name());
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);

        let callback = handler.callback().clone();
        let submitted = match callback {
            Callback::Blocking(callback) => {
                let counters = Arc::clone(&self.counters);
                self.pool.submit(Box::new(move || {
                    let outcome = catch_unwind(AssertUnwindSafe(|| callback(&event)));
                    record_outcome(&counters, &handler, &event, outcome);
                }))
            }
            Callback::Suspending(callback) => self.submit_suspending(handler, event, callback),
        };

        if !submitted {
            self.counters.invocations.fetch_sub(1, Ordering::Relaxed);
            tracing::warn!("[dispatch] dropped invocation: executor is shutting down");
        }
        submitted
    }

    fn submit_suspending(
        &self,
        handler: Arc<Handler>,
        event: FileEvent,
        callback: Arc<dyn Fn(FileEvent) -> HandlerFuture + Send + Sync>,
    ) -> bool {
        let mut guard = self.scheduler.lock();

        if guard.is_none() {
            // A suspending handler was registered after the run started.
            match CooperativeScheduler::start(&self.name, self.grace) {
                Ok(scheduler) => *guard = Some(scheduler),
                Err(e) => {
                    tracing::error!("[dispatch] cannot start scheduler for '{}': {e}", handler.name());
                    return false;
                }
            }
        }

        let Some(scheduler) = guard.as_ref() else {
            return false;
        };

        let counters = Arc::clone(&self.counters);
        scheduler.submit(Box::pin(async move {
            // The body runs as its own task so a panic surfaces as a JoinError
            // carrying the handler context below.
            let body = catch_construction(|| callback(event.clone()));
            let outcome = match body {
                Ok(future) => match tokio::spawn(future).await {
                    Ok(result) => Ok(result),
                    Err(e) if e.is_panic() => Err(e.into_panic()),
                    Err(_) => return,
                },
                Err(panic) => Err(panic),
            };
            record_outcome(&counters, &handler, &event, outcome);
        }))
    }

    /// Wait up to `timeout` for blocking invocations to drain.
    #[cfg(test)]
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    /// Stop both executors, bounded by the grace period.
    pub(crate) fn shutdown(self) -> bool {
        crate::debug_event!(
            "dispatch",
            "stopping",
            "{} blocking invocation(s) on {} workers",
            self.pool.in_flight(),
            self.pool.size()
        );

        let pool_clean = self.pool.shutdown(self.grace);

        let scheduler_clean = match self.scheduler.into_inner() {
            // The scheduler drains for `grace` itself, then aborts; allow for both.
            Some(scheduler) => scheduler.shutdown(Instant::now() + self.grace + JOIN_SLACK),
            None => true,
        };

        pool_clean && scheduler_clean
    }

    fn notify_observers(&self, event: &FileEvent, handler: &str) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_dispatch(event, handler))).is_err() {
                tracing::error!(
                    handler,
                    path = %event.path.display(),
                    "[dispatch] observer panicked in on_dispatch"
                );
            }
        }
    }
}

type Panic = Box<dyn Any + Send + 'static>;

/// Call a future constructor, catching a panic raised before the first poll.
fn catch_construction<T>(f: impl FnOnce() -> T) -> Result<T, Panic> {
    catch_unwind(AssertUnwindSafe(f))
}

fn record_outcome(
    counters: &DispatchCounters,
    handler: &Handler,
    event: &FileEvent,
    outcome: Result<HandlerResult, Panic>,
) {
    match outcome {
        Ok(Ok(())) => {
            crate::debug_event!(handler.name(), event.kind, "{}", event.path.display());
        }
        Ok(Err(e)) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                handler = handler.name(),
                kind = %event.kind,
                root = %event.root.display(),
                path = %event.path.display(),
                "[{}] handler failed: {e:#}",
                handler.name()
            );
        }
        Err(panic) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                handler = handler.name(),
                kind = %event.kind,
                root = %event.root.display(),
                path = %event.path.display(),
                "[{}] handler panicked: {}",
                handler.name(),
                panic_message(&panic)
            );
        }
    }
}

fn panic_message(panic: &Panic) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tempfile::TempDir;

    /// Observer recording `(handler, path)` in submission order.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, PathBuf)>>,
        started: AtomicUsize,
    }

    impl DispatchObserver for Recorder {
        fn on_start(&self, handlers: &[Arc<Handler>]) {
            self.started.store(handlers.len(), Ordering::SeqCst);
        }

        fn on_dispatch(&self, event: &FileEvent, handler: &str) {
            self.seen
                .lock()
                .push((handler.to_string(), event.path.clone()));
        }
    }

    struct Exploding;

    impl DispatchObserver for Exploding {
        fn on_dispatch(&self, _event: &FileEvent, _handler: &str) {
            panic!("observer failure")
        }
    }

    fn explode() -> HandlerResult {
        panic!("handler panic")
    }

    fn dispatcher(
        registry: &Arc<HandlerRegistry>,
        observers: Vec<Arc<dyn DispatchObserver>>,
    ) -> Dispatcher {
        Dispatcher::new("test", Arc::clone(registry), observers, 2, Duration::from_secs(2)).unwrap()
    }

    fn counting(name: &str, root: &Path, priority: i32, calls: &Arc<AtomicUsize>) -> Handler {
        let calls = Arc::clone(calls);
        Handler::builder(name, root)
            .priority(priority)
            .blocking(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn test_submission_follows_priority() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(HandlerRegistry::new());
        registry.add(counting("p1", temp_dir.path(), 1, &calls));
        registry.add(counting("p3", temp_dir.path(), 3, &calls));
        registry.add(counting("p2", temp_dir.path(), 2, &calls));

        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(&registry, vec![recorder.clone() as Arc<dyn DispatchObserver>]);
        dispatcher.announce();

        assert_eq!(dispatcher.dispatch(ChangeKind::Created, &file), 3);
        assert!(dispatcher.shutdown());

        let order: Vec<String> = recorder.seen.lock().iter().map(|(h, _)| h.clone()).collect();
        assert_eq!(order, vec!["p3", "p2", "p1"]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.started.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_blocking_and_suspending_handlers_run_concurrently() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let waited = Arc::new(AtomicBool::new(false));
        let registry = Arc::new(HandlerRegistry::new());

        // Submitted first; only finishes if the suspending handler runs meanwhile.
        let (seen, done) = (Arc::clone(&flag), Arc::clone(&waited));
        registry.add(
            Handler::builder("waits", temp_dir.path())
                .priority(2)
                .blocking(move |_| {
                    let deadline = Instant::now() + Duration::from_secs(2);
                    while !seen.load(Ordering::SeqCst) {
                        if Instant::now() >= deadline {
                            anyhow::bail!("flag never set");
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    done.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap(),
        );
        let setter = Arc::clone(&flag);
        registry.add(
            Handler::builder("sets", temp_dir.path())
                .priority(1)
                .suspending(move |_| {
                    let setter = Arc::clone(&setter);
                    async move {
                        setter.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap(),
        );

        let dispatcher = dispatcher(&registry, Vec::new());
        let counters = dispatcher.counters();

        assert_eq!(dispatcher.dispatch(ChangeKind::Modified, &file), 2);
        assert!(dispatcher.shutdown());

        assert!(flag.load(Ordering::SeqCst));
        assert!(waited.load(Ordering::SeqCst));
        assert_eq!(counters.invocations.load(Ordering::SeqCst), 2);
        assert_eq!(counters.failures.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_handlers_do_not_stop_others() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(HandlerRegistry::new());

        let counter = Arc::clone(&calls);
        registry.add(
            Handler::builder("errors", temp_dir.path())
                .priority(2)
                .blocking(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("handler error")
                })
                .unwrap(),
        );
        let counter = Arc::clone(&calls);
        registry.add(
            Handler::builder("panics", temp_dir.path())
                .priority(1)
                .blocking(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    explode()
                })
                .unwrap(),
        );
        registry.add(counting("healthy", temp_dir.path(), 0, &calls));

        let dispatcher = dispatcher(&registry, Vec::new());
        dispatcher.dispatch(ChangeKind::Created, &file);
        dispatcher.dispatch(ChangeKind::Modified, &file);
        assert!(dispatcher.wait_idle(Duration::from_secs(5)));

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(dispatcher.counters().failures.load(Ordering::SeqCst), 4);
        assert_eq!(dispatcher.counters().invocations.load(Ordering::SeqCst), 6);
        assert!(dispatcher.shutdown());
    }

    #[test]
    fn test_suspending_failures_are_contained() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.json");
        fs::write(&file, "{}").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(HandlerRegistry::new());

        let counter = Arc::clone(&calls);
        registry.add(
            Handler::builder("async-panics", temp_dir.path())
                .suspending(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        explode()
                    }
                })
                .unwrap(),
        );
        let counter = Arc::clone(&calls);
        registry.add(
            Handler::builder("async-ok", temp_dir.path())
                .suspending(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap(),
        );

        let dispatcher = dispatcher(&registry, Vec::new());
        assert!(dispatcher.scheduler_started());
        dispatcher.dispatch(ChangeKind::Modified, &file);
        dispatcher.dispatch(ChangeKind::Modified, &file);

        let counters = Arc::clone(&dispatcher.counters);
        assert!(dispatcher.shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(counters.failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_scheduler_without_suspending_handlers() {
        let temp_dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(HandlerRegistry::new());
        registry.add(counting("sync", temp_dir.path(), 0, &calls));

        let dispatcher = dispatcher(&registry, Vec::new());
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();
        dispatcher.dispatch(ChangeKind::Created, &file);

        assert!(!dispatcher.scheduler_started());
        assert!(dispatcher.shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scheduler_started_for_late_suspending_handler() {
        let temp_dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(HandlerRegistry::new());
        registry.add(counting("sync", temp_dir.path(), 0, &calls));

        let dispatcher = dispatcher(&registry, Vec::new());
        assert!(!dispatcher.scheduler_started());

        let counter = Arc::clone(&calls);
        registry.add(
            Handler::builder("late", temp_dir.path())
                .suspending(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .unwrap(),
        );

        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();
        assert_eq!(dispatcher.dispatch(ChangeKind::Created, &file), 2);
        assert!(dispatcher.scheduler_started());
        assert!(dispatcher.shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_observer_panic_is_swallowed() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "x").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(HandlerRegistry::new());
        registry.add(counting("sync", temp_dir.path(), 0, &calls));

        let dispatcher = dispatcher(&registry, vec![Arc::new(Exploding) as Arc<dyn DispatchObserver>]);
        assert_eq!(dispatcher.dispatch(ChangeKind::Created, &file), 1);
        assert!(dispatcher.shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unmatched_change_submits_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let watched = temp_dir.path().join("watched");
        fs::create_dir(&watched).unwrap();
        let outside = temp_dir.path().join("outside.txt");
        fs::write(&outside, "x").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(HandlerRegistry::new());
        registry.add(counting("scoped", &watched, 0, &calls));

        let dispatcher = dispatcher(&registry, Vec::new());
        assert_eq!(dispatcher.dispatch(ChangeKind::Created, &outside), 0);
        assert_eq!(dispatcher.counters().settled.load(Ordering::SeqCst), 1);
        assert!(dispatcher.shutdown());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
