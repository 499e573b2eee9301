//! Cooperative scheduler for suspending handlers.
//!
//! One dedicated thread drives a current-thread tokio runtime. Suspending
//! handler bodies interleave at their await points on that thread but never
//! run in parallel with each other; they do run in parallel with the worker
//! pool and with the watch loop.

use std::future::Future;
use std::pin::Pin;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::error::WatchError;
use super::pool::join_by;

pub(crate) type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to the scheduler thread.
pub(crate) struct CooperativeScheduler {
    sender: Option<mpsc::UnboundedSender<Task>>,
    thread: Option<JoinHandle<()>>,
}

impl CooperativeScheduler {
    /// Spawn the scheduler thread.
    ///
    /// On shutdown, pending tasks get `grace` to finish before they are aborted.
    pub(crate) fn start(name: &str, grace: Duration) -> Result<Self, WatchError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| WatchError::InitFailed {
                reason: format!("cannot build scheduler runtime: {e}"),
            })?;

        let (sender, receiver) = mpsc::unbounded_channel::<Task>();

        let thread = thread::Builder::new()
            .name(format!("{name}-scheduler"))
            .spawn(move || {
                runtime.block_on(drive(receiver, grace));
            })
            .map_err(|e| WatchError::InitFailed {
                reason: format!("cannot spawn scheduler thread: {e}"),
            })?;

        crate::debug_event!("scheduler", "started");

        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    /// Queue a task. Returns false once the scheduler is shutting down.
    pub(crate) fn submit(&self, task: Task) -> bool {
        self.sender
            .as_ref()
            .is_some_and(|sender| sender.send(task).is_ok())
    }

    /// Close the queue and join the scheduler thread.
    ///
    /// `deadline` bounds the join; the scheduler applies its own grace
    /// period to pending tasks before that.
    pub(crate) fn shutdown(mut self, deadline: Instant) -> bool {
        self.sender = None;

        let joined = self.thread.take().is_none_or(|handle| join_by(handle, deadline));
        if joined {
            crate::debug_event!("scheduler", "stopped");
        } else {
            tracing::warn!("[scheduler] thread still busy after shutdown grace period");
        }
        joined
    }
}

impl Drop for CooperativeScheduler {
    fn drop(&mut self) {
        self.sender = None;
    }
}

/// Scheduler loop: accept tasks until the queue closes, then drain.
async fn drive(mut receiver: mpsc::UnboundedReceiver<Task>, grace: Duration) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            task = receiver.recv() => match task {
                Some(task) => {
                    tasks.spawn(task);
                }
                None => break,
            },
            Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                report(result);
            }
        }
    }

    let drained = tokio::time::timeout(grace, async {
        while let Some(result) = tasks.join_next().await {
            report(result);
        }
    })
    .await;

    if drained.is_err() {
        tracing::warn!(
            "[scheduler] cancelling {} task(s) after shutdown grace period",
            tasks.len()
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

fn report(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!("[scheduler] task panicked outside handler isolation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_tasks_interleave_on_one_thread() {
        let scheduler = CooperativeScheduler::start("test", Duration::from_secs(1)).unwrap();
        let threads = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();

        for _ in 0..3 {
            let threads = Arc::clone(&threads);
            let done = Arc::clone(&done);
            assert!(scheduler.submit(Box::pin(async move {
                threads.lock().push(thread::current().id());
                tokio::time::sleep(Duration::from_millis(150)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })));
        }

        assert!(scheduler.shutdown(Instant::now() + Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 3);
        // Sleeps overlap at their await points instead of running back to back.
        assert!(start.elapsed() < Duration::from_millis(400));

        let threads = threads.lock();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|id| *id == threads[0]));
        assert_ne!(threads[0], thread::current().id());
    }

    async fn fail() {
        panic!("task failure")
    }

    #[test]
    fn test_panicking_task_does_not_stop_scheduler() {
        let scheduler = CooperativeScheduler::start("test", Duration::from_secs(1)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        scheduler.submit(Box::pin(fail()));
        let counter = Arc::clone(&done);
        scheduler.submit(Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(scheduler.shutdown(Instant::now() + Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_tasks_cancelled_after_grace() {
        let scheduler = CooperativeScheduler::start("test", Duration::from_millis(50)).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&done);
        scheduler.submit(Box::pin(async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let start = Instant::now();
        assert!(scheduler.shutdown(Instant::now() + Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }
}
