//! Bounded worker pool for blocking handler bodies.
//!
//! A fixed number of named threads drain a shared job channel. Jobs are
//! already isolated by the dispatcher; the pool still guards each job so a
//! stray panic never takes a worker down.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, unbounded};
use parking_lot::{Condvar, Mutex};

use super::error::WatchError;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Count of queued and running jobs, with a condvar signalled on idle.
#[derive(Debug, Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, deadline: Instant) -> bool {
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    fn current(&self) -> usize {
        *self.count.lock()
    }
}

/// Fixed-size pool of worker threads.
pub(crate) struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    in_flight: Arc<InFlight>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) named `{name}-worker-{i}`.
    pub(crate) fn new(size: usize, name: &str) -> Result<Self, WatchError> {
        let size = size.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let in_flight = Arc::new(InFlight::default());

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = receiver.clone();
            let in_flight = Arc::clone(&in_flight);
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || {
                    for job in rx {
                        if catch_unwind(AssertUnwindSafe(job)).is_err() {
                            tracing::error!("[pool] job panicked outside handler isolation");
                        }
                        in_flight.finish();
                    }
                })
                .map_err(|e| WatchError::InitFailed {
                    reason: format!("cannot spawn worker thread: {e}"),
                })?;
            workers.push(handle);
        }

        crate::debug_event!("pool", "started", "{size} workers");

        Ok(Self {
            sender: Some(sender),
            workers,
            in_flight,
        })
    }

    /// Queue a job. Returns false once the pool is shutting down.
    pub(crate) fn submit(&self, job: Job) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        self.in_flight.begin();
        if sender.send(job).is_err() {
            self.in_flight.finish();
            return false;
        }
        true
    }

    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Jobs queued or running.
    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Block until no jobs are queued or running, or `timeout` elapses.
    pub(crate) fn wait_idle(&self, timeout: Duration) -> bool {
        self.in_flight.wait_idle(Instant::now() + timeout)
    }

    /// Stop accepting jobs, wait up to `grace` for in-flight ones, join workers.
    ///
    /// Returns false if some workers were still busy when the grace period
    /// ran out; those threads are left to finish on their own.
    pub(crate) fn shutdown(mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let idle = self.in_flight.wait_idle(deadline);

        // Closing the channel ends each worker's receive loop.
        self.sender = None;

        let mut clean = idle;
        for handle in self.workers.drain(..) {
            clean &= join_by(handle, deadline);
        }

        if !clean {
            tracing::warn!(
                "[pool] {} job(s) still running after shutdown grace period",
                self.in_flight.current()
            );
        }
        clean
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit once the channel drains; nothing to join here.
        self.sender = None;
    }
}

/// Join `handle` if it finishes before `deadline`; otherwise detach it.
pub(crate) fn join_by(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    handle.join().is_ok()
}
