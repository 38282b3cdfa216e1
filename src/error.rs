use std::path::PathBuf;
use thiserror::Error;

/// Failures that end the monitoring loop.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to open auth log {path}: {source}")]
    OpenLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error("watch channel closed")]
    WatchClosed,
}

/// Log rotation recovery failures.
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("failed to reopen {path} after {attempts} attempts")]
    Exhausted { path: PathBuf, attempts: u32 },

    #[error("failed to rewatch {path}: {source}")]
    Rewatch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Failures inside an isolated commit task.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("cannot open deny file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write deny file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("commit task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Notification delivery failures. Never fatal.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid mailbox: {0}")]
    Address(String),

    #[error("failed to build message: {0}")]
    Message(String),

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
