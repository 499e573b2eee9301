//! Error types for the watcher engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
///
/// Only configuration and source errors ever leave the engine. Failures
/// inside handler bodies are contained at the invocation boundary and are
/// never represented here.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("No handlers registered; add at least one handler before running")]
    NoHandlers,

    #[error("Watcher is already running")]
    AlreadyRunning,

    #[error("Handler '{handler}' does not listen to any change kind")]
    NoEventKinds { handler: String },

    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Cannot watch path {path}: {reason}")]
    PathWatchFailed { path: PathBuf, reason: String },

    #[error("Change source failed: {reason}")]
    Source { reason: String },

    #[error("Change source closed unexpectedly")]
    SourceClosed,
}

impl WatchError {
    /// Errors raised by the call that triggered them, before any watching happens.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            WatchError::NoHandlers
                | WatchError::AlreadyRunning
                | WatchError::NoEventKinds { .. }
                | WatchError::InvalidPattern { .. }
                | WatchError::InitFailed { .. }
        )
    }

    /// Errors from the upstream change source; fatal to a run.
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            WatchError::PathWatchFailed { .. } | WatchError::Source { .. } | WatchError::SourceClosed
        )
    }
}

impl From<notify::Error> for WatchError {
    fn from(e: notify::Error) -> Self {
        WatchError::Source {
            reason: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(WatchError::NoHandlers.is_configuration());
        assert!(WatchError::AlreadyRunning.is_configuration());
        assert!(!WatchError::AlreadyRunning.is_source());

        let source = WatchError::Source {
            reason: "inotify limit reached".to_string(),
        };
        assert!(source.is_source());
        assert!(!source.is_configuration());
        assert!(WatchError::SourceClosed.is_source());
    }

    #[test]
    fn test_messages_are_distinct() {
        let no_handlers = WatchError::NoHandlers.to_string();
        let running = WatchError::AlreadyRunning.to_string();

        assert!(no_handlers.contains("No handlers registered"));
        assert!(running.contains("already running"));
        assert_ne!(no_handlers, running);
    }
}
