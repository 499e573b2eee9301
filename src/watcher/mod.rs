//! File watcher engine that routes settled changes to registered handlers.
//!
//! # Architecture
//!
//! ```text
//! ChangeSource (notify / channel)
//!   -> Debouncer (one pending entry per path)
//!   -> Dispatcher (registry lookup via matcher, priority order)
//!         |
//!    +----------+------------------+
//!    |                             |
//! WorkerPool                CooperativeScheduler
//! (blocking handlers)       (suspending handlers)
//! ```
//!
//! [`FileWatcher`] owns the registry and drives the loop; observers such as
//! [`ActivityLog`] see every dispatch.

mod activity;
mod debouncer;
mod dispatch;
mod error;
mod event;
mod handler;
mod matcher;
mod pool;
mod registry;
mod scheduler;
mod source;
mod unified;

pub use activity::{
    ActivityLog, ActivityRecord, ActivitySnapshot, ActivityStats, DEFAULT_CAPACITY, HandlerSummary,
};
pub use debouncer::{Debouncer, SettledChange};
pub use dispatch::DispatchObserver;
pub use error::WatchError;
pub use event::{ChangeKind, ChangeSet, FileEvent, RawChange};
pub use handler::{Callback, Handler, HandlerBuilder, HandlerFuture, HandlerResult};
pub use matcher::{PathPattern, matches, resolve_path};
pub use registry::HandlerRegistry;
pub use source::{ChangeSource, ChannelSource, NotifySource, SourceItem, Subscription};
pub use unified::{FileWatcher, LifecycleState, RunStats, default_watcher};
