//! Error types for the watcher system.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from watcher operations.
///
/// Registration problems are returned from the call that caused them.
/// Problems hit by background readers are delivered on the watcher's error
/// queue instead.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to initialize watcher: {reason}")]
    InitFailed { reason: String },

    #[error("Cannot watch path {path}: {source}")]
    PathWatchFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("OS watch limit reached while watching {path}: {source}")]
    WatchLimit {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("File system event error{}: {source}", display_path(.path))]
    Backend {
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },

    #[error("Event queue overflow, changes were lost: {details}")]
    Overflow { details: String },

    #[error("Watcher is already closed")]
    AlreadyClosed,

    #[error("Path is not currently watched: {path}")]
    NotWatched { path: PathBuf },

    #[error("No directories to watch under {path}")]
    NoSubdirectories { path: PathBuf },

    #[error("Failed to load config: {reason}")]
    ConfigError { reason: String },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" for {}", path.display()),
        None => String::new(),
    }
}

impl WatchError {
    /// Classify a failed native registration.
    ///
    /// Quota errors (`ENOSPC` from inotify, descriptor exhaustion for
    /// kqueue) get their own variant so callers can tell them apart from a
    /// bad path.
    pub(crate) fn registration(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        if is_quota_error(&source) {
            WatchError::WatchLimit { path, source }
        } else {
            WatchError::PathWatchFailed { path, source }
        }
    }

    pub(crate) fn backend(path: Option<PathBuf>, source: io::Error) -> Self {
        WatchError::Backend { path, source }
    }
}

#[cfg(unix)]
fn is_quota_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOSPC) | Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

#[cfg(not(unix))]
fn is_quota_error(err: &io::Error) -> bool {
    // ERROR_TOO_MANY_OPEN_FILES, ERROR_NOT_ENOUGH_QUOTA
    matches!(err.raw_os_error(), Some(4) | Some(1816))
}
