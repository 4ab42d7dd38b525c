//! inotify backend for Linux and Android.
//!
//! One inotify instance serves every watch. The reader thread polls its
//! descriptor with a timeout so it can notice the stop flag, then drains and
//! translates whatever records are pending.

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use parking_lot::Mutex;

use super::{Backend, BackendContext, Target, resolve, wait_readable};
use crate::event::{Event, Triggers};
use crate::watcher::WatchError;

fn watch_mask() -> WatchMask {
    WatchMask::MODIFY
        | WatchMask::ATTRIB
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::DELETE_SELF
        | WatchMask::MOVE_SELF
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
}

/// Translate an inotify mask into canonical operations.
fn translate(mask: EventMask) -> Triggers {
    let mut ops = Triggers::empty();

    if mask.contains(EventMask::CREATE) {
        ops |= Triggers::CREATE;
    }
    // An entry moved in is new at its destination
    if mask.contains(EventMask::MOVED_TO) {
        ops |= Triggers::CREATE | Triggers::RENAME;
    }
    if mask.intersects(EventMask::MOVED_FROM | EventMask::MOVE_SELF) {
        ops |= Triggers::RENAME;
    }
    if mask.intersects(EventMask::DELETE | EventMask::DELETE_SELF) {
        ops |= Triggers::DELETE;
    }
    if mask.intersects(EventMask::MODIFY | EventMask::ATTRIB) {
        ops |= Triggers::MODIFY;
    }

    ops
}

/// Registration bookkeeping shared by the facade and the reader.
struct State {
    /// `None` once the backend is closed.
    watches: Option<Watches>,
    by_path: HashMap<PathBuf, WatchDescriptor>,
    by_wd: HashMap<WatchDescriptor, PathBuf>,
    /// Symlinks with no target, watched without a native resource.
    dangling: HashSet<PathBuf>,
}

impl State {
    /// Forget a descriptor the kernel has already dropped.
    fn retire(&mut self, wd: &WatchDescriptor) {
        self.by_wd.remove(wd);
        self.by_path.retain(|_, other| other != wd);
    }

    /// Drop the registration held for `path`.
    ///
    /// The descriptor itself is only removed from the kernel once no other
    /// path (a symlink and its target) still maps to it.
    fn release(&mut self, path: &Path) -> io::Result<bool> {
        let Some(wd) = self.by_path.remove(path) else {
            return Ok(false);
        };

        if let Some(other) = self
            .by_path
            .iter()
            .find(|(_, other)| **other == wd)
            .map(|(other_path, _)| other_path.clone())
        {
            self.by_wd.insert(wd, other);
            return Ok(true);
        }

        self.by_wd.remove(&wd);
        if let Some(watches) = self.watches.as_mut() {
            match watches.remove(wd) {
                Ok(()) => {}
                // The kernel already dropped it (object deleted)
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

pub(crate) struct InotifyBackend {
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl InotifyBackend {
    pub(crate) fn new(ctx: BackendContext) -> Result<Self, WatchError> {
        let inotify = Inotify::init().map_err(|e| WatchError::InitFailed {
            reason: format!("inotify_init1 failed: {e}"),
        })?;

        let state = Arc::new(Mutex::new(State {
            watches: Some(inotify.watches()),
            by_path: HashMap::new(),
            by_wd: HashMap::new(),
            dangling: HashSet::new(),
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let reader = Reader {
            inotify,
            state: Arc::clone(&state),
            stop: Arc::clone(&stop),
            events: ctx.events,
            errors: ctx.errors,
            poll_timeout: ctx.poll_timeout,
            buffer_size: ctx.buffer_size.max(4096),
            expected_deletes: HashSet::new(),
        };

        let handle = thread::Builder::new()
            .name("pathwatch-inotify".to_string())
            .spawn(move || reader.run())
            .map_err(|e| WatchError::InitFailed {
                reason: format!("failed to spawn inotify reader: {e}"),
            })?;

        Ok(Self {
            state,
            stop,
            reader: Mutex::new(Some(handle)),
        })
    }
}

impl Backend for InotifyBackend {
    fn name(&self) -> &'static str {
        "inotify"
    }

    fn add_watch(&self, path: &Path) -> Result<(), WatchError> {
        let target = resolve(path)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(watches) = state.watches.as_mut() else {
            return Err(WatchError::AlreadyClosed);
        };

        let target = match target {
            Target::Path(target) => target,
            Target::Dangling => {
                state.dangling.insert(path.to_path_buf());
                return Ok(());
            }
        };

        let wd = watches
            .add(&target, watch_mask())
            .map_err(|e| WatchError::registration(path, e))?;

        crate::debug_event!("inotify", "watching", "{} ({wd:?})", path.display());

        state.by_wd.insert(wd.clone(), path.to_path_buf());
        state.by_path.insert(path.to_path_buf(), wd);
        Ok(())
    }

    fn remove_watch(&self, path: &Path) -> Result<bool, WatchError> {
        let mut state = self.state.lock();

        if state.dangling.remove(path) {
            return Ok(true);
        }

        let released = state
            .release(path)
            .map_err(|e| WatchError::backend(Some(path.to_path_buf()), e))?;
        if !released {
            return Ok(false);
        }

        crate::debug_event!("inotify", "unwatched", "{}", path.display());
        Ok(true)
    }

    fn covers(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.by_path.contains_key(path)
            || state.dangling.contains(path)
            || path
                .parent()
                .is_some_and(|parent| state.by_path.contains_key(parent))
    }

    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.watches = None;
            state.by_path.clear();
            state.by_wd.clear();
            state.dangling.clear();
        }

        self.stop.store(true, Ordering::Release);

        if let Some(handle) = self.reader.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("[inotify] reader thread panicked");
            }
        }
    }
}

impl Drop for InotifyBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background reader owning the inotify instance.
struct Reader {
    inotify: Inotify,
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
    events: Sender<Event>,
    errors: Sender<WatchError>,
    poll_timeout: Duration,
    buffer_size: usize,
    /// Watched objects whose deletion has been reported once and is
    /// expected to be reported again by the other side (self or parent).
    expected_deletes: HashSet<PathBuf>,
}

impl Reader {
    fn run(mut self) {
        let fd = self.inotify.as_raw_fd();
        let mut buffer = vec![0u8; self.buffer_size];

        crate::debug_event!("inotify", "reader started");

        while !self.stop.load(Ordering::Acquire) {
            match wait_readable(fd, self.poll_timeout) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = self.errors.send(WatchError::backend(None, e));
                    thread::sleep(self.poll_timeout);
                    continue;
                }
            }

            let events = match self.inotify.read_events(&mut buffer) {
                Ok(events) => events,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let _ = self.errors.send(WatchError::backend(None, e));
                    continue;
                }
            };

            for event in events {
                if !self.handle(event) {
                    crate::debug_event!("inotify", "event queue closed, reader exiting");
                    return;
                }
            }
        }

        crate::debug_event!("inotify", "reader stopped");
    }

    /// Translate one record. Returns `false` once the event queue is gone.
    fn handle(&mut self, event: inotify::Event<&OsStr>) -> bool {
        if event.mask.contains(EventMask::Q_OVERFLOW) {
            let _ = self.errors.send(WatchError::Overflow {
                details: "inotify queue overflowed".to_string(),
            });
            return true;
        }

        let mut state = self.state.lock();

        let Some(base) = state.by_wd.get(&event.wd).cloned() else {
            // Stale descriptor from a watch that was already removed
            return true;
        };

        if event.mask.contains(EventMask::IGNORED) {
            state.retire(&event.wd);
            return true;
        }

        let path = match event.name {
            Some(name) if !name.is_empty() => base.join(name),
            _ => base,
        };

        let ops = translate(event.mask);
        if ops.is_empty() {
            return true;
        }

        let from_parent = event.name.is_some_and(|name| !name.is_empty());

        // The entry's own descriptor reports these too
        if from_parent
            && state.by_path.contains_key(&path)
            && (Triggers::MODIFY | Triggers::RENAME).contains(ops)
        {
            return true;
        }

        if ops.contains(Triggers::CREATE) {
            // A new object at this path owes nothing to an earlier one
            self.expected_deletes.remove(&path);
        }

        if ops.contains(Triggers::DELETE) {
            if event.mask.contains(EventMask::DELETE_SELF) {
                state.retire(&event.wd);

                if self.expected_deletes.remove(&path) {
                    return true;
                }
                // The parent's record for the same unlink is still to come
                if path.parent().is_some_and(|p| state.by_path.contains_key(p)) {
                    self.expected_deletes.insert(path.clone());
                }
            } else {
                if self.expected_deletes.remove(&path) {
                    return true;
                }
                // The name is gone even if the inode lives on through another
                // link or an open descriptor, so the child's own watch goes
                // now. Its late DELETE_SELF or IGNORED finds no descriptor.
                if let Err(e) = state.release(&path) {
                    let _ = self
                        .errors
                        .send(WatchError::backend(Some(path.clone()), e));
                }
            }
        }

        drop(state);
        self.events.send(Event::new(path, ops)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, unbounded};
    use std::fs;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(2);

    fn backend() -> (InotifyBackend, Receiver<Event>, Receiver<WatchError>) {
        let (events_tx, events_rx) = unbounded();
        let (errors_tx, errors_rx) = unbounded();
        let backend = InotifyBackend::new(BackendContext {
            events: events_tx,
            errors: errors_tx,
            poll_timeout: Duration::from_millis(20),
            buffer_size: 4096,
        })
        .unwrap();
        (backend, events_rx, errors_rx)
    }

    #[test]
    fn test_translate_masks() {
        assert_eq!(translate(EventMask::CREATE), Triggers::CREATE);
        assert_eq!(
            translate(EventMask::MOVED_TO),
            Triggers::CREATE | Triggers::RENAME
        );
        assert_eq!(translate(EventMask::MOVED_FROM), Triggers::RENAME);
        assert_eq!(translate(EventMask::DELETE_SELF), Triggers::DELETE);
        assert_eq!(translate(EventMask::ATTRIB), Triggers::MODIFY);
        assert!(translate(EventMask::IGNORED).is_empty());
    }

    #[test]
    fn test_create_in_watched_directory() {
        let temp_dir = TempDir::new().unwrap();
        let (backend, events, _errors) = backend();

        backend.add_watch(temp_dir.path()).unwrap();
        let file = temp_dir.path().join("new.txt");
        fs::File::create(&file).unwrap();

        let event = events.recv_timeout(WAIT).unwrap();
        assert_eq!(event.path(), file.as_path());
        assert!(event.is_create());

        backend.close();
    }

    #[test]
    fn test_deleting_watched_file_reports_once() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("gone.txt");
        fs::write(&file, "x").unwrap();
        let (backend, events, _errors) = backend();

        backend.add_watch(temp_dir.path()).unwrap();
        backend.add_watch(&file).unwrap();
        fs::remove_file(&file).unwrap();

        thread::sleep(Duration::from_millis(300));
        backend.close();

        let deletes = events
            .try_iter()
            .filter(|event| event.path() == file && event.is_delete())
            .count();
        assert_eq!(deletes, 1);
    }

    fn deletes_of(events: &Receiver<Event>, path: &Path) -> usize {
        events
            .recv_timeout(Duration::from_millis(300))
            .into_iter()
            .chain(events.try_iter())
            .filter(|event| event.path() == path && event.is_delete())
            .count()
    }

    #[test]
    fn test_delete_of_hard_linked_file_releases_its_watch() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("f");
        fs::write(&file, "x").unwrap();
        let (backend, events, _errors) = backend();

        backend.add_watch(temp_dir.path()).unwrap();
        backend.add_watch(&file).unwrap();
        // The inode outlives the unlink, so no DELETE_SELF follows
        fs::hard_link(&file, temp_dir.path().join("g")).unwrap();

        fs::remove_file(&file).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(deletes_of(&events, &file), 1);
        assert!(!backend.state.lock().by_path.contains_key(&file));

        fs::write(&file, "y").unwrap();
        thread::sleep(Duration::from_millis(100));
        fs::remove_file(&file).unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(deletes_of(&events, &file), 1);

        backend.close();
    }

    #[test]
    fn test_write_to_watched_file_reported_once() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("log.txt");
        fs::write(&file, "x").unwrap();
        let (backend, events, _errors) = backend();

        backend.add_watch(temp_dir.path()).unwrap();
        backend.add_watch(&file).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&file)
            .and_then(|mut f| std::io::Write::write_all(&mut f, b"more"))
            .unwrap();

        thread::sleep(Duration::from_millis(300));
        backend.close();

        let modifies = events
            .try_iter()
            .filter(|event| event.path() == file && event.is_modify())
            .count();
        assert_eq!(modifies, 1);
    }

    #[test]
    fn test_remove_watch_and_covers() {
        let temp_dir = TempDir::new().unwrap();
        let (backend, _events, _errors) = backend();

        backend.add_watch(temp_dir.path()).unwrap();
        assert!(backend.covers(temp_dir.path()));
        assert!(backend.covers(&temp_dir.path().join("child")));

        assert!(backend.remove_watch(temp_dir.path()).unwrap());
        assert!(!backend.remove_watch(temp_dir.path()).unwrap());
        assert!(!backend.covers(temp_dir.path()));
    }

    #[test]
    fn test_add_after_close_fails() {
        let temp_dir = TempDir::new().unwrap();
        let (backend, events, _errors) = backend();

        backend.close();
        backend.close();

        assert!(matches!(
            backend.add_watch(temp_dir.path()),
            Err(WatchError::AlreadyClosed)
        ));
        // The reader dropped its sender on exit
        assert!(events.recv_timeout(WAIT).is_err());
    }
}
