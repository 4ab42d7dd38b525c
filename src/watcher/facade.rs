//! The public watcher: registration, event and error queues, shutdown.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::config::Settings;
use crate::event::Event;

use super::WatchError;
use super::backend::{Backend, BackendContext, create_backend};
use super::dispatcher::Dispatcher;
use super::options::WatchOptions;
use super::pipeline::{Pipeline, Registrar};
use super::recursive::{WatchSink, register_recursive};
use super::watch_table::WatchTable;

/// Cross-platform file system watcher.
///
/// Owns one native backend, one dispatcher thread, and the two queues
/// consumers read from. Every method takes `&self`; a watcher can be shared
/// between threads behind an `Arc`.
///
/// Dropping the watcher closes it.
pub struct Watcher {
    shared: Arc<Shared>,
    events: Receiver<Event>,
    errors: Receiver<WatchError>,
}

/// State reachable from both the facade and auto-watch steps.
struct Shared {
    backend: Box<dyn Backend>,
    table: Arc<WatchTable>,
    throttle_interval: Duration,
    defaults: WatchOptions,
    closed: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// Held so the error queue closes only after the dispatcher is gone.
    errors_tx: Mutex<Option<Sender<WatchError>>>,
    self_ref: Weak<Shared>,
}

impl Watcher {
    /// Open a watcher with default settings.
    pub fn new() -> Result<Self, WatchError> {
        Self::builder().build()
    }

    /// Create a builder for configuring the watcher.
    pub fn builder() -> WatcherBuilder {
        WatcherBuilder::new()
    }

    /// Watch `path` with the given options.
    ///
    /// Watching an already watched path replaces its options. With
    /// `recursive` set, every directory below `path` is watched too, and so
    /// is every directory created under it later.
    pub fn watch(&self, path: impl AsRef<Path>, options: &WatchOptions) -> Result<(), WatchError> {
        self.shared.register(path.as_ref(), options)
    }

    /// Watch `path` for every kind of change, dotfiles included.
    pub fn watch_all(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        self.watch(path, &WatchOptions::new().hidden(true))
    }

    /// Watch `path` with the options from the `[defaults]` settings section.
    pub fn watch_default(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        let defaults = self.shared.defaults.clone();
        self.watch(path, &defaults)
    }

    /// Stop watching `path`.
    ///
    /// Unwatching the root of a recursive watch also unwatches the
    /// directories registered under it.
    pub fn unwatch(&self, path: impl AsRef<Path>) -> Result<(), WatchError> {
        self.shared.unregister(path.as_ref())
    }

    /// Shut the watcher down.
    ///
    /// Stops every backend reader, lets the dispatcher deliver what was
    /// already read, then closes the event and error queues. Calling it again
    /// does nothing.
    pub fn close(&self) -> Result<(), WatchError> {
        self.shared.close();
        Ok(())
    }

    /// Filtered events. Disconnects once the watcher is closed.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Errors hit by background readers. Disconnects once the watcher is
    /// closed.
    pub fn errors(&self) -> &Receiver<WatchError> {
        &self.errors
    }

    /// Check if `path` has a watch entry of its own.
    pub fn is_watched(&self, path: impl AsRef<Path>) -> bool {
        self.shared.table.contains(path.as_ref())
    }

    /// All paths with a watch entry, sorted.
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        let mut paths = self.shared.table.paths();
        paths.sort();
        paths
    }

    /// Name of the native facility in use.
    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("backend", &self.backend_name())
            .field("watched", &self.shared.table.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Shared {
    fn ensure_open(&self) -> Result<(), WatchError> {
        if self.closed.load(Ordering::Acquire) {
            Err(WatchError::AlreadyClosed)
        } else {
            Ok(())
        }
    }

    fn unregister(&self, path: &Path) -> Result<(), WatchError> {
        self.ensure_open()?;

        let entry = self.table.remove(path);
        if entry.is_none() && !self.backend.covers(path) {
            return Err(WatchError::NotWatched {
                path: path.to_path_buf(),
            });
        }

        if entry.as_ref().is_some_and(|pipeline| pipeline.options().recursive) {
            for descendant in self.table.recursive_descendants(path) {
                self.unwatch_one(&descendant);
            }
        }

        self.backend.remove_watch(path)?;
        crate::debug_event!("watcher", "unwatched", "{}", path.display());
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        crate::debug_event!("watcher", "closing");

        // Readers first: once they are joined the internal queue has no
        // producers left and the dispatcher drains it and exits
        self.backend.close();

        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("[watcher] dispatcher thread panicked");
            }
        }

        self.errors_tx.lock().take();
        self.table.clear();

        crate::debug_event!("watcher", "closed");
    }
}

impl Registrar for Shared {
    fn register(&self, path: &Path, options: &WatchOptions) -> Result<(), WatchError> {
        self.ensure_open()?;

        if options.recursive {
            register_recursive(self, path, options)?;
        } else {
            self.watch_one(path, options)?;
        }
        Ok(())
    }
}

impl WatchSink for Shared {
    fn watch_one(&self, path: &Path, options: &WatchOptions) -> Result<bool, WatchError> {
        let newly_added = !self.table.contains(path);

        self.backend.add_watch(path)?;

        let registrar: Weak<dyn Registrar> = self.self_ref.clone();
        let pipeline = Pipeline::build_with(options, self.throttle_interval, Some(registrar));
        self.table.insert(path.to_path_buf(), Arc::new(pipeline));

        crate::debug_event!("watcher", "watching", "{}", path.display());
        Ok(newly_added)
    }

    fn unwatch_one(&self, path: &Path) {
        self.table.remove(path);
        if let Err(e) = self.backend.remove_watch(path) {
            crate::debug_event!("watcher", "unwatch failed", "{}: {e}", path.display());
        }
    }
}

/// Builder for [`Watcher`].
#[derive(Debug, Default)]
pub struct WatcherBuilder {
    settings: Option<Settings>,
    throttle: Option<Duration>,
}

impl WatcherBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use these settings instead of the defaults.
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Override the throttle interval from the settings.
    pub fn throttle_interval(mut self, interval: Duration) -> Self {
        self.throttle = Some(interval);
        self
    }

    /// Start the backend and the dispatcher.
    pub fn build(self) -> Result<Watcher, WatchError> {
        let settings = self.settings.unwrap_or_default();
        let throttle_interval = self
            .throttle
            .unwrap_or_else(|| settings.watcher.throttle_interval());

        let (raw_tx, raw_rx) = unbounded();
        let (events_tx, events_rx) = unbounded();
        let (errors_tx, errors_rx) = unbounded();

        let backend = create_backend(BackendContext {
            events: raw_tx,
            errors: errors_tx.clone(),
            poll_timeout: settings.watcher.poll_timeout(),
            buffer_size: settings.watcher.read_buffer_size,
        })?;

        let table = Arc::new(WatchTable::new());
        let dispatcher = Dispatcher::new(raw_rx, Arc::clone(&table), events_tx)
            .spawn()
            .map_err(|e| WatchError::InitFailed {
                reason: format!("failed to spawn dispatcher: {e}"),
            })?;

        crate::debug_event!("watcher", "opened", "{} backend", backend.name());

        let shared = Arc::new_cyclic(|self_ref| Shared {
            backend,
            table,
            throttle_interval,
            defaults: settings.defaults,
            closed: AtomicBool::new(false),
            dispatcher: Mutex::new(Some(dispatcher)),
            errors_tx: Mutex::new(Some(errors_tx)),
            self_ref: self_ref.clone(),
        });

        Ok(Watcher {
            shared,
            events: events_rx,
            errors: errors_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_watch_and_unwatch_bookkeeping() {
        let temp_dir = TempDir::new().unwrap();
        let watcher = Watcher::new().unwrap();

        watcher.watch_all(temp_dir.path()).unwrap();
        assert!(watcher.is_watched(temp_dir.path()));
        assert_eq!(watcher.watched_paths(), vec![temp_dir.path().to_path_buf()]);

        watcher.unwatch(temp_dir.path()).unwrap();
        assert!(!watcher.is_watched(temp_dir.path()));
    }

    #[test]
    fn test_rewatch_replaces_options() {
        let temp_dir = TempDir::new().unwrap();
        let watcher = Watcher::new().unwrap();

        watcher.watch(temp_dir.path(), &WatchOptions::new()).unwrap();
        watcher
            .watch(temp_dir.path(), &WatchOptions::new().pattern("*.rs"))
            .unwrap();

        let pipeline = watcher.shared.table.resolve(temp_dir.path()).unwrap();
        assert_eq!(pipeline.options().pattern, "*.rs");
        assert_eq!(watcher.watched_paths().len(), 1);
    }

    #[test]
    fn test_recursive_unwatch_removes_descendants() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        let watcher = Watcher::new().unwrap();

        watcher
            .watch(temp_dir.path(), &WatchOptions::new().recursive(true))
            .unwrap();
        assert_eq!(watcher.watched_paths().len(), 3);

        watcher.unwatch(temp_dir.path()).unwrap();
        assert!(watcher.watched_paths().is_empty());
    }

    #[test]
    fn test_watch_default_uses_settings() {
        let temp_dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.defaults = WatchOptions::new().pattern("*.toml");
        let watcher = Watcher::builder().settings(settings).build().unwrap();

        watcher.watch_default(temp_dir.path()).unwrap();

        let pipeline = watcher.shared.table.resolve(temp_dir.path()).unwrap();
        assert_eq!(pipeline.options().pattern, "*.toml");
    }

    #[test]
    fn test_operations_after_close() {
        let temp_dir = TempDir::new().unwrap();
        let watcher = Watcher::new().unwrap();
        watcher.watch_all(temp_dir.path()).unwrap();

        watcher.close().unwrap();
        watcher.close().unwrap();

        assert!(watcher.is_closed());
        assert!(watcher.watched_paths().is_empty());
        assert!(matches!(
            watcher.watch_all(temp_dir.path()),
            Err(WatchError::AlreadyClosed)
        ));
        assert!(matches!(
            watcher.unwatch(temp_dir.path()),
            Err(WatchError::AlreadyClosed)
        ));
        assert!(watcher.events().recv().is_err());
        assert!(watcher.errors().recv().is_err());
    }
}
