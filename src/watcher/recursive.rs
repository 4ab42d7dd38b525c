//! Recursive registration of a directory tree.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::WatchError;
use super::options::WatchOptions;
use super::pipeline::is_hidden;

/// Where recursive registration adds and rolls back single watches.
pub(crate) trait WatchSink {
    /// Watch one directory. Returns `true` if the path was not watched before.
    fn watch_one(&self, path: &Path, options: &WatchOptions) -> Result<bool, WatchError>;

    /// Undo a watch added by [`WatchSink::watch_one`].
    fn unwatch_one(&self, path: &Path);
}

/// Every directory under `root`, the root included.
///
/// Hidden directories are not descended into unless `hidden` is set; the
/// root itself is always kept. Symlinks are not followed. Unreadable
/// entries are skipped.
pub(crate) fn directories(root: &Path, hidden: bool) -> Vec<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || hidden || !is_hidden(&entry.file_name().to_string_lossy())
        })
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                crate::debug_event!("recursive", "skipped", "{e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}

/// Watch `root` and every directory below it with the same options.
///
/// If one of the directories cannot be watched, the watches this call added
/// are removed again before the error is returned. Returns the number of
/// directories watched.
pub(crate) fn register_recursive(
    sink: &dyn WatchSink,
    root: &Path,
    options: &WatchOptions,
) -> Result<usize, WatchError> {
    let dirs = directories(root, options.hidden);
    if dirs.is_empty() {
        return Err(WatchError::NoSubdirectories {
            path: root.to_path_buf(),
        });
    }

    let mut added = Vec::new();
    for dir in &dirs {
        match sink.watch_one(dir, options) {
            Ok(true) => added.push(dir.as_path()),
            Ok(false) => {}
            Err(e) => {
                crate::debug_event!(
                    "recursive",
                    "rollback",
                    "{} watches under {}: {e}",
                    added.len(),
                    root.display()
                );
                for path in added.iter().rev() {
                    sink.unwatch_one(path);
                }
                return Err(e);
            }
        }
    }

    crate::debug_event!(
        "recursive",
        "registered",
        "{} directories under {}",
        dirs.len(),
        root.display()
    );
    Ok(dirs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::fs;
    use std::io;
    use tempfile::TempDir;

    /// Records watches; fails on one chosen path.
    #[derive(Default)]
    struct RecordingSink {
        watched: Mutex<HashSet<PathBuf>>,
        fail_on: Option<PathBuf>,
    }

    impl WatchSink for RecordingSink {
        fn watch_one(&self, path: &Path, _options: &WatchOptions) -> Result<bool, WatchError> {
            if self.fail_on.as_deref() == Some(path) {
                return Err(WatchError::PathWatchFailed {
                    path: path.to_path_buf(),
                    source: io::Error::from(io::ErrorKind::PermissionDenied),
                });
            }
            Ok(self.watched.lock().insert(path.to_path_buf()))
        }

        fn unwatch_one(&self, path: &Path) {
            self.watched.lock().remove(path);
        }
    }

    fn tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("a/b")).unwrap();
        fs::create_dir_all(temp_dir.path().join(".git/objects")).unwrap();
        fs::write(temp_dir.path().join("a/file.txt"), "x").unwrap();
        temp_dir
    }

    #[test]
    fn test_directories_prunes_hidden() {
        let temp_dir = tree();
        let root = temp_dir.path();

        let mut dirs = directories(root, false);
        dirs.sort();
        assert_eq!(dirs, vec![root.to_path_buf(), root.join("a"), root.join("a/b")]);

        let dirs = directories(root, true);
        assert_eq!(dirs.len(), 5);
        assert!(dirs.contains(&root.join(".git/objects")));
    }

    #[test]
    fn test_hidden_root_is_kept() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join(".config");
        fs::create_dir_all(root.join("sub")).unwrap();

        let dirs = directories(&root, false);
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn test_register_recursive_watches_every_directory() {
        let temp_dir = tree();
        let sink = RecordingSink::default();

        let count = register_recursive(&sink, temp_dir.path(), &WatchOptions::new()).unwrap();

        assert_eq!(count, 3);
        assert!(sink.watched.lock().contains(&temp_dir.path().join("a/b")));
    }

    #[test]
    fn test_missing_root_has_no_subdirectories() {
        let temp_dir = TempDir::new().unwrap();
        let sink = RecordingSink::default();

        let err = register_recursive(&sink, &temp_dir.path().join("nope"), &WatchOptions::new())
            .unwrap_err();
        assert!(matches!(err, WatchError::NoSubdirectories { .. }));
    }

    #[test]
    fn test_failure_rolls_back_new_watches_only() {
        let temp_dir = tree();
        let root = temp_dir.path();
        let sink = RecordingSink {
            fail_on: Some(root.join("a/b")),
            ..Default::default()
        };
        // Watched before the recursive call; must survive the rollback
        sink.watched.lock().insert(root.to_path_buf());

        let err = register_recursive(&sink, root, &WatchOptions::new()).unwrap_err();

        assert!(matches!(err, WatchError::PathWatchFailed { .. }));
        let watched = sink.watched.lock();
        assert_eq!(watched.len(), 1);
        assert!(watched.contains(root));
    }
}
