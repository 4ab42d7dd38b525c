//! kqueue backend for macOS and the BSDs.
//!
//! kqueue reports vnode changes on open descriptors, not directory entries.
//! A directory only says "I was written to", so every watched directory
//! keeps a snapshot of its entries and the reader diffs it on each write to
//! synthesize per-file creates and deletes. Regular files inside a watched
//! directory get an internal descriptor of their own so that writes to them
//! are reported as well.
//!
//! The reader blocks in the queue while holding the state lock. Callers
//! that need the lock poke a socket registered with the same queue, which
//! makes the reader step aside until they are done.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ::kqueue::{EventData, EventFilter, FilterFlag, Ident, Vnode, Watcher as Kqueue};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, MutexGuard};

use super::{Backend, BackendContext, Target, resolve};
use crate::event::{Event, Triggers};
use crate::watcher::WatchError;

#[cfg(any(target_os = "macos", target_os = "ios"))]
const OPEN_FLAGS: libc::c_int = libc::O_EVTONLY | libc::O_NONBLOCK;

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
const OPEN_FLAGS: libc::c_int = libc::O_NONBLOCK;

/// Records drained per wakeup before the lock is released.
const EVENT_BATCH: usize = 32;

fn vnode_flags() -> FilterFlag {
    FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_EXTEND
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_LINK
        | FilterFlag::NOTE_RENAME
}

/// Translate a vnode change into canonical operations.
///
/// Directory writes are left out: they are turned into per-entry events by
/// diffing the directory's snapshot.
fn translate(change: &Vnode, is_dir: bool) -> Triggers {
    match change {
        Vnode::Delete => Triggers::DELETE,
        Vnode::Rename => Triggers::RENAME,
        Vnode::Attrib => Triggers::MODIFY,
        Vnode::Write | Vnode::Extend if !is_dir => Triggers::MODIFY,
        _ => Triggers::empty(),
    }
}

/// Whether a change on a directory may have added or removed entries.
fn touches_entries(change: &Vnode) -> bool {
    matches!(change, Vnode::Write | Vnode::Extend | Vnode::Link)
}

/// One open descriptor registered with the kqueue.
struct Entry {
    path: PathBuf,
    /// Closing the descriptor also drops its kevent.
    _file: File,
    is_dir: bool,
    /// Registered by the caller rather than to track a directory's files.
    explicit: bool,
    /// Directory membership at the last diff.
    snapshot: Option<HashSet<PathBuf>>,
}

struct State {
    /// `None` once the backend is closed.
    kq: Option<Kqueue>,
    by_path: HashMap<PathBuf, RawFd>,
    entries: HashMap<RawFd, Entry>,
    dangling: HashSet<PathBuf>,
}

impl State {
    /// Open `target` and register it under `path`.
    fn add_entry(&mut self, path: &Path, target: &Path, explicit: bool) -> io::Result<()> {
        if let Some(fd) = self.by_path.get(path) {
            if let Some(entry) = self.entries.get_mut(fd) {
                entry.explicit |= explicit;
            }
            return Ok(());
        }

        let Some(kq) = self.kq.as_mut() else {
            return Err(io::Error::other("kqueue closed"));
        };

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OPEN_FLAGS)
            .open(target)?;
        let is_dir = file.metadata()?.is_dir();
        let fd = file.as_raw_fd();

        kq.add_fd(fd, EventFilter::EVFILT_VNODE, vnode_flags())?;
        if let Err(e) = kq.watch() {
            let _ = kq.remove_fd(fd, EventFilter::EVFILT_VNODE);
            return Err(e);
        }

        let snapshot = if is_dir {
            match list_dir(path) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    let _ = kq.remove_fd(fd, EventFilter::EVFILT_VNODE);
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.entries.insert(
            fd,
            Entry {
                path: path.to_path_buf(),
                _file: file,
                is_dir,
                explicit,
                snapshot: snapshot.clone(),
            },
        );
        self.by_path.insert(path.to_path_buf(), fd);

        if let Some(children) = snapshot {
            for child in children {
                if let Err(e) = self.track_file(&child) {
                    self.forget(path);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Drop the entry for `path` and, for a directory, the internal entries
    /// of its files.
    fn forget(&mut self, path: &Path) {
        let Some(fd) = self.by_path.remove(path) else {
            return;
        };
        self.unregister(fd);
        let is_dir = self
            .entries
            .remove(&fd)
            .is_some_and(|entry| entry.is_dir);

        if is_dir {
            let internal: Vec<RawFd> = self
                .entries
                .iter()
                .filter(|(_, entry)| !entry.explicit && entry.path.parent() == Some(path))
                .map(|(fd, _)| *fd)
                .collect();
            for fd in internal {
                self.drop_entry(fd);
            }
        }
    }

    /// Give a regular file inside a watched directory its own descriptor.
    fn track_file(&mut self, path: &Path) -> io::Result<()> {
        if self.by_path.contains_key(path) {
            return Ok(());
        }

        match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => {}
            // Directories are tracked by their own watch; vanished or
            // unresolvable entries are skipped
            _ => return Ok(()),
        }

        match self.add_entry(path, path, false) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn drop_entry(&mut self, fd: RawFd) -> Option<Entry> {
        self.unregister(fd);
        let entry = self.entries.remove(&fd)?;
        self.by_path.remove(&entry.path);

        // Keep the parent's snapshot from reporting the entry a second time
        if let Some(parent_fd) = entry.path.parent().and_then(|p| self.by_path.get(p).copied()) {
            if let Some(parent) = self.entries.get_mut(&parent_fd) {
                if let Some(snapshot) = parent.snapshot.as_mut() {
                    snapshot.remove(&entry.path);
                }
            }
        }

        Some(entry)
    }

    /// Take `fd` out of the queue's registration list before it is closed,
    /// so a later `watch()` never resubmits a dead or reused descriptor.
    fn unregister(&mut self, fd: RawFd) {
        if let Some(kq) = self.kq.as_mut() {
            if let Err(e) = kq.remove_fd(fd, EventFilter::EVFILT_VNODE) {
                crate::debug_event!("kqueue", "remove_fd failed", "{fd}: {e}");
            }
        }
    }

    fn is_explicit(&self, path: &Path) -> bool {
        self.by_path
            .get(path)
            .and_then(|fd| self.entries.get(fd))
            .is_some_and(|entry| entry.explicit)
    }
}

/// Entries of `dir`, joined onto `dir`.
fn list_dir(dir: &Path) -> io::Result<HashSet<PathBuf>> {
    fs::read_dir(dir)?
        .map(|entry| entry.map(|entry| dir.join(entry.file_name())))
        .collect()
}

pub(crate) struct KqueueBackend {
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
    /// Callers queued for the state lock.
    waiting: Arc<AtomicUsize>,
    wake: UnixStream,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl KqueueBackend {
    pub(crate) fn new(ctx: BackendContext) -> Result<Self, WatchError> {
        let init_failed = |what: &str, e: io::Error| WatchError::InitFailed {
            reason: format!("{what}: {e}"),
        };

        let mut kq = Kqueue::new().map_err(|e| init_failed("kqueue failed", e))?;

        let (wake, wake_rx) =
            UnixStream::pair().map_err(|e| init_failed("wakeup socket failed", e))?;
        wake.set_nonblocking(true)
            .and_then(|()| wake_rx.set_nonblocking(true))
            .map_err(|e| init_failed("wakeup socket failed", e))?;

        kq.add_fd(wake_rx.as_raw_fd(), EventFilter::EVFILT_READ, FilterFlag::empty())
            .and_then(|()| kq.watch())
            .map_err(|e| init_failed("registering wakeup socket failed", e))?;

        let state = Arc::new(Mutex::new(State {
            kq: Some(kq),
            by_path: HashMap::new(),
            entries: HashMap::new(),
            dangling: HashSet::new(),
        }));
        let stop = Arc::new(AtomicBool::new(false));
        let waiting = Arc::new(AtomicUsize::new(0));

        let reader = Reader {
            state: Arc::clone(&state),
            stop: Arc::clone(&stop),
            waiting: Arc::clone(&waiting),
            wake: wake_rx,
            events: ctx.events,
            errors: ctx.errors,
            poll_timeout: ctx.poll_timeout,
        };

        let handle = thread::Builder::new()
            .name("pathwatch-kqueue".to_string())
            .spawn(move || reader.run())
            .map_err(|e| init_failed("failed to spawn kqueue reader", e))?;

        Ok(Self {
            state,
            stop,
            waiting,
            wake,
            reader: Mutex::new(Some(handle)),
        })
    }

    fn wake_reader(&self) {
        // A full socket buffer means a wakeup is already pending
        let _ = (&self.wake).write(&[1]);
    }

    /// Take the state lock, interrupting the reader's blocking poll.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.waiting.fetch_add(1, Ordering::AcqRel);
        self.wake_reader();
        let guard = self.state.lock();
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        guard
    }
}

impl Backend for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn add_watch(&self, path: &Path) -> Result<(), WatchError> {
        let target = resolve(path)?;
        let mut state = self.lock();

        if state.kq.is_none() {
            return Err(WatchError::AlreadyClosed);
        }

        match target {
            Target::Dangling => {
                state.dangling.insert(path.to_path_buf());
                Ok(())
            }
            Target::Path(target) => {
                state
                    .add_entry(path, &target, true)
                    .map_err(|e| WatchError::registration(path, e))?;
                crate::debug_event!("kqueue", "watching", "{}", path.display());
                Ok(())
            }
        }
    }

    fn remove_watch(&self, path: &Path) -> Result<bool, WatchError> {
        let mut state = self.lock();

        if state.dangling.remove(path) {
            return Ok(true);
        }

        let Some(&fd) = state.by_path.get(path) else {
            return Ok(false);
        };
        if !state.is_explicit(path) {
            return Ok(false);
        }

        // A file inside a watched directory stays tracked for the directory
        let parent_watched = path
            .parent()
            .is_some_and(|parent| state.is_explicit(parent));
        let is_dir = state.entries.get(&fd).is_some_and(|entry| entry.is_dir);

        if parent_watched && !is_dir {
            if let Some(entry) = state.entries.get_mut(&fd) {
                entry.explicit = false;
            }
            return Ok(true);
        }

        state.forget(path);

        crate::debug_event!("kqueue", "unwatched", "{}", path.display());
        Ok(true)
    }

    fn covers(&self, path: &Path) -> bool {
        let state = self.lock();
        state.is_explicit(path)
            || state.dangling.contains(path)
            || path.parent().is_some_and(|parent| state.is_explicit(parent))
    }

    fn close(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake_reader();

        if let Some(handle) = self.reader.lock().take() {
            if handle.join().is_err() {
                tracing::warn!("[kqueue] reader thread panicked");
            }
        }

        // The reader has exited, so the queue can go now
        let mut state = self.state.lock();
        state.kq = None;
        state.entries.clear();
        state.by_path.clear();
        state.dangling.clear();
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        self.close();
    }
}

struct Reader {
    state: Arc<Mutex<State>>,
    stop: Arc<AtomicBool>,
    waiting: Arc<AtomicUsize>,
    wake: UnixStream,
    events: Sender<Event>,
    errors: Sender<WatchError>,
    poll_timeout: Duration,
}

impl Reader {
    fn run(self) {
        let mut pending = Vec::new();

        crate::debug_event!("kqueue", "reader started");

        while !self.stop.load(Ordering::Acquire) {
            if self.waiting.load(Ordering::Acquire) > 0 {
                thread::yield_now();
                continue;
            }

            {
                let mut state = self.state.lock();
                let Some(kq) = state.kq.as_ref() else {
                    break;
                };

                let mut batch = Vec::new();
                let mut next = kq.poll(Some(self.poll_timeout));
                while let Some(record) = next {
                    batch.push(record);
                    if batch.len() >= EVENT_BATCH {
                        break;
                    }
                    next = kq.poll(Some(Duration::ZERO));
                }

                for record in batch {
                    self.handle(&mut state, record, &mut pending);
                }
            }

            for event in pending.drain(..) {
                if self.events.send(event).is_err() {
                    crate::debug_event!("kqueue", "event queue closed, reader exiting");
                    return;
                }
            }
        }

        crate::debug_event!("kqueue", "reader stopped");
    }

    fn drain_wakeups(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.wake).read(&mut buf), Ok(n) if n > 0) {}
    }

    fn handle(&self, state: &mut State, record: ::kqueue::Event, out: &mut Vec<Event>) {
        let Ident::Fd(fd) = record.ident else {
            return;
        };
        if fd == self.wake.as_raw_fd() {
            self.drain_wakeups();
            return;
        }
        let EventData::Vnode(change) = record.data else {
            return;
        };

        let Some(entry) = state.entries.get(&fd) else {
            return;
        };
        let path = entry.path.clone();
        let is_dir = entry.is_dir;

        if is_dir && touches_entries(&change) {
            self.diff_directory(state, fd, out);
        }

        let ops = translate(&change, is_dir);
        if !ops.is_empty() {
            out.push(Event::new(path.clone(), ops));
        }

        let internal = state.entries.get(&fd).is_some_and(|entry| !entry.explicit);
        if ops.contains(Triggers::DELETE) || (internal && ops.contains(Triggers::RENAME)) {
            state.drop_entry(fd);
            crate::debug_event!("kqueue", "retired", "{}", path.display());
        }
    }

    /// Compare a directory against its last snapshot.
    fn diff_directory(&self, state: &mut State, fd: RawFd, out: &mut Vec<Event>) {
        let Some(entry) = state.entries.get_mut(&fd) else {
            return;
        };
        let dir = entry.path.clone();

        let current = match list_dir(&dir) {
            Ok(current) => current,
            // Directory is going away; its own delete is reported separately
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                let _ = self.errors.send(WatchError::backend(Some(dir), e));
                return;
            }
        };
        let previous = entry.snapshot.replace(current.clone()).unwrap_or_default();

        let mut created: Vec<&PathBuf> = current.difference(&previous).collect();
        created.sort();
        for path in created {
            out.push(Event::create(path.clone()));
            if let Err(e) = state.track_file(path) {
                let _ = self.errors.send(WatchError::registration(path.clone(), e));
            }
        }

        let mut removed: Vec<&PathBuf> = previous.difference(&current).collect();
        removed.sort();
        for path in removed {
            // Entries with their own descriptor report their own delete
            if !state.by_path.contains_key(path) {
                out.push(Event::delete(path.clone()));
            }
        }
    }
}
