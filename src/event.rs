//! Canonical event model shared by every backend.
//!
//! Native notification records (inotify masks, kqueue vnode flags,
//! `FILE_ACTION_*` codes) are all normalized into an [`Event`]: a path plus a
//! [`Triggers`] flag set. Several flags may be set for one occurrence, e.g. an
//! inotify `IN_MOVED_TO` is both a rename and a create.

use std::fmt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Selection of change kinds a watch cares about.
    ///
    /// `Triggers::all()` is the default. An empty mask means "unset" and is
    /// treated the same as `all()` by the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Triggers: u32 {
        const CREATE = 1 << 0;
        const MODIFY = 1 << 1;
        const DELETE = 1 << 2;
        const RENAME = 1 << 3;
    }
}

impl Default for Triggers {
    fn default() -> Self {
        Triggers::all()
    }
}

/// Rendering order for [`Event`]'s `Display` impl.
const DISPLAY_ORDER: [(Triggers, &str); 4] = [
    (Triggers::CREATE, "CREATE"),
    (Triggers::DELETE, "DELETE"),
    (Triggers::MODIFY, "MODIFY"),
    (Triggers::RENAME, "RENAME"),
];

/// A single file system change, normalized across platforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    path: PathBuf,
    ops: Triggers,
}

impl Event {
    /// Create an event for `path` with the given flags.
    pub fn new(path: impl Into<PathBuf>, ops: Triggers) -> Self {
        Self {
            path: path.into(),
            ops,
        }
    }

    pub fn create(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Triggers::CREATE)
    }

    pub fn modify(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Triggers::MODIFY)
    }

    pub fn delete(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Triggers::DELETE)
    }

    pub fn rename(path: impl Into<PathBuf>) -> Self {
        Self::new(path, Triggers::RENAME)
    }

    /// Path the change applies to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All flags set on this event.
    pub fn ops(&self) -> Triggers {
        self.ops
    }

    pub fn is_create(&self) -> bool {
        self.ops.contains(Triggers::CREATE)
    }

    pub fn is_delete(&self) -> bool {
        self.ops.contains(Triggers::DELETE)
    }

    pub fn is_modify(&self) -> bool {
        self.ops.contains(Triggers::MODIFY)
    }

    pub fn is_rename(&self) -> bool {
        self.ops.contains(Triggers::RENAME)
    }

    /// Last path component as text, used by the name based filters.
    ///
    /// Falls back to the whole path when there is no file name (`.`, `..`, `/`).
    pub(crate) fn leaf(&self) -> String {
        match self.path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => self.path.to_string_lossy().into_owned(),
        }
    }
}

impl fmt::Display for Event {
    /// Formats as `"path": CREATE|MODIFY`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = DISPLAY_ORDER
            .iter()
            .filter(|(flag, _)| self.ops.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{:?}: {}", self.path, names.join("|"))
    }
}
