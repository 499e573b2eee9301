pub mod config;
pub mod logging;
pub mod watcher;

pub use config::{LoggingConfig, Settings, WatchConfig};
pub use watcher::{
    ActivityLog, ChangeKind, ChangeSource, ChannelSource, DispatchObserver, FileEvent, FileWatcher,
    Handler, HandlerRegistry, NotifySource, RunStats, WatchError, default_watcher,
};
