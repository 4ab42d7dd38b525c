//! Platform-specific watch backends.
//!
//! Every backend owns its native watch resources, runs background reader
//! threads that block on the native wait primitive, and translates native
//! records into canonical [`Event`]s sent to the watcher's internal queue:
//!
//! - Linux / Android: inotify, one instance and one reader thread.
//! - macOS / BSD: kqueue, one queue and one reader thread; per-file creates
//!   are synthesized by diffing directory listings.
//! - Windows: `ReadDirectoryChangesW`, one directory handle and one reader
//!   thread per watched directory.
//!
//! Exactly one variant is compiled in, selected by target.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod inotify;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod kqueue;

#[cfg(windows)]
mod windows;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::Sender;

use super::WatchError;
use crate::event::Event;

/// Native watch facility behind the watcher.
///
/// Paths handed to a backend are the caller's paths; events are reported
/// under those same paths even when a symlink was followed to register them.
pub(crate) trait Backend: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// Acquire (or reuse) the native resource for `path`.
    fn add_watch(&self, path: &Path) -> Result<(), WatchError>;

    /// Release the native resource held for `path`.
    ///
    /// Returns `Ok(false)` if the backend held nothing for the path.
    fn remove_watch(&self, path: &Path) -> Result<bool, WatchError>;

    /// Whether a native resource covers `path`, either its own or one held
    /// for its directory.
    fn covers(&self, path: &Path) -> bool;

    /// Stop every reader and release every native resource.
    ///
    /// Returns once all readers have exited; after that the backend never
    /// sends again. Calling it twice is harmless.
    fn close(&self);
}

/// What a backend needs from the watcher.
pub(crate) struct BackendContext {
    /// Internal raw-event queue drained by the dispatcher.
    pub events: Sender<Event>,
    /// External error queue.
    pub errors: Sender<WatchError>,
    /// How long a reader blocks before re-checking its stop flag.
    pub poll_timeout: Duration,
    /// Size of the native read buffer in bytes.
    pub buffer_size: usize,
}

/// Create the backend for the current platform.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn create_backend(ctx: BackendContext) -> Result<Box<dyn Backend>, WatchError> {
    Ok(Box::new(inotify::InotifyBackend::new(ctx)?))
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub(crate) fn create_backend(ctx: BackendContext) -> Result<Box<dyn Backend>, WatchError> {
    Ok(Box::new(kqueue::KqueueBackend::new(ctx)?))
}

#[cfg(windows)]
pub(crate) fn create_backend(ctx: BackendContext) -> Result<Box<dyn Backend>, WatchError> {
    Ok(Box::new(windows::WindowsBackend::new(ctx)))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly",
    windows
)))]
pub(crate) fn create_backend(_ctx: BackendContext) -> Result<Box<dyn Backend>, WatchError> {
    Err(WatchError::InitFailed {
        reason: "Unsupported platform - no native watch facility".to_string(),
    })
}

/// Result of resolving a path before registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    /// Register this path (the path itself, or a symlink's target).
    Path(PathBuf),
    /// Symlink whose target does not exist; watched as a no-op.
    Dangling,
}

/// Validate `path` and follow it if it is a symlink.
///
/// A missing path is a registration failure. A symlink that cannot be
/// resolved is accepted and will simply never produce events.
pub(crate) fn resolve(path: &Path) -> Result<Target, WatchError> {
    let metadata = fs::symlink_metadata(path).map_err(|e| WatchError::registration(path, e))?;

    if !metadata.file_type().is_symlink() {
        return Ok(Target::Path(path.to_path_buf()));
    }

    match fs::canonicalize(path) {
        Ok(target) => Ok(Target::Path(target)),
        Err(e) => {
            crate::debug_event!("backend", "dangling symlink", "{}: {e}", path.display());
            Ok(Target::Dangling)
        }
    }
}

/// Block until `fd` is readable or `timeout` expires.
///
/// Returns `Ok(false)` on timeout.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn wait_readable(fd: std::os::fd::RawFd, timeout: Duration) -> std::io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `pollfd` is a valid, initialized array of length one.
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if ready < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ready > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_plain_path() {
        let temp_dir = TempDir::new().unwrap();
        assert_eq!(
            resolve(temp_dir.path()).unwrap(),
            Target::Path(temp_dir.path().to_path_buf())
        );
    }

    #[test]
    fn test_resolve_missing_path_fails() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");

        let err = resolve(&missing).unwrap_err();
        assert!(matches!(err, WatchError::PathWatchFailed { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("target");
        fs::create_dir(&target).unwrap();

        let good = temp_dir.path().join("good");
        std::os::unix::fs::symlink(&target, &good).unwrap();
        let dangling = temp_dir.path().join("dangling");
        std::os::unix::fs::symlink(temp_dir.path().join("zzz"), &dangling).unwrap();

        assert_eq!(
            resolve(&good).unwrap(),
            Target::Path(fs::canonicalize(&target).unwrap())
        );
        assert_eq!(resolve(&dangling).unwrap(), Target::Dangling);
    }
}
