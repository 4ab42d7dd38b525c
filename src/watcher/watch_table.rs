//! Watch table: the registry of watched paths and their pipelines.
//!
//! The single source of truth for "is this path watched, and with what
//! policy". Shared between the registration path and the dispatcher; every
//! access goes through one mutex, and callers get an `Arc<Pipeline>` back so
//! the lock is released before a pipeline runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::pipeline::Pipeline;

/// Registry of watched paths.
#[derive(Debug, Default)]
pub struct WatchTable {
    entries: Mutex<HashMap<PathBuf, Arc<Pipeline>>>,
}

impl WatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the pipeline for `path`.
    ///
    /// Returns the pipeline previously registered for the path, if any.
    pub fn insert(&self, path: PathBuf, pipeline: Arc<Pipeline>) -> Option<Arc<Pipeline>> {
        self.entries.lock().insert(path, pipeline)
    }

    /// Remove the entry for exactly `path`.
    pub fn remove(&self, path: &Path) -> Option<Arc<Pipeline>> {
        self.entries.lock().remove(path)
    }

    /// Check if `path` itself has an entry.
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.lock().contains_key(path)
    }

    /// Find the pipeline responsible for events on `path`.
    ///
    /// An exact entry wins. Otherwise, events on entries inside a watched
    /// directory use that directory's pipeline.
    pub fn resolve(&self, path: &Path) -> Option<Arc<Pipeline>> {
        let entries = self.entries.lock();

        if let Some(pipeline) = entries.get(path) {
            return Some(Arc::clone(pipeline));
        }

        path.parent()
            .and_then(|parent| entries.get(parent))
            .map(Arc::clone)
    }

    /// Entries strictly below `root` that were registered recursively.
    pub fn recursive_descendants(&self, root: &Path) -> Vec<PathBuf> {
        self.entries
            .lock()
            .iter()
            .filter(|(path, pipeline)| {
                path.as_path() != root && path.starts_with(root) && pipeline.options().recursive
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// All watched paths.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Get count of watched paths.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
