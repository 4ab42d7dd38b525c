//! `ReadDirectoryChangesW` backend for Windows.
//!
//! Windows reports changes per directory, so one directory handle (and one
//! reader thread) serves the directory itself and every watched file inside
//! it. A file watch opens its parent directory. The handle is released once
//! the last path it covers is unwatched.

use std::collections::{HashMap, HashSet};
use std::ffi::{OsString, c_void};
use std::io;
use std::iter;
use std::mem;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use windows_sys::Win32::Foundation::{
    CloseHandle, FALSE, HANDLE, INVALID_HANDLE_VALUE, TRUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED, FILE_ACTION_REMOVED,
    FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME, FILE_FLAG_BACKUP_SEMANTICS,
    FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES,
    FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING, ReadDirectoryChangesW,
};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject};

use super::{Backend, BackendContext, Target, resolve};
use crate::event::{Event, Triggers};
use crate::watcher::WatchError;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_CREATION;

fn translate(action: u32) -> Triggers {
    match action {
        FILE_ACTION_ADDED => Triggers::CREATE,
        FILE_ACTION_REMOVED => Triggers::DELETE,
        FILE_ACTION_MODIFIED => Triggers::MODIFY,
        FILE_ACTION_RENAMED_OLD_NAME | FILE_ACTION_RENAMED_NEW_NAME => Triggers::RENAME,
        _ => Triggers::empty(),
    }
}

/// One open directory handle and its reader.
struct DirWatch {
    /// Watched paths served by this handle: the directory and/or files in it.
    covered: HashSet<PathBuf>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

struct State {
    /// `None` once the backend is closed.
    events: Option<Sender<Event>>,
    errors: Option<Sender<WatchError>>,
    dirs: HashMap<PathBuf, DirWatch>,
    dangling: HashSet<PathBuf>,
}

impl State {
    /// Directory key whose handle covers `path`, if any.
    fn owner(&self, path: &Path) -> Option<PathBuf> {
        if self
            .dirs
            .get(path)
            .is_some_and(|dir| dir.covered.contains(path))
        {
            return Some(path.to_path_buf());
        }
        path.parent()
            .filter(|parent| {
                self.dirs
                    .get(*parent)
                    .is_some_and(|dir| dir.covered.contains(path))
            })
            .map(Path::to_path_buf)
    }

    /// Whether another handle reports the removal of `dir` as one of its
    /// entries.
    fn parent_reports(&self, dir: &Path) -> bool {
        dir.parent()
            .is_some_and(|parent| self.dirs.contains_key(parent))
    }

    /// Stop the reader for `dir` and return its thread for joining.
    fn release(&mut self, dir: &Path) -> Option<JoinHandle<()>> {
        let mut watch = self.dirs.remove(dir)?;
        watch.stop.store(true, Ordering::Release);
        watch.reader.take()
    }
}

pub(crate) struct WindowsBackend {
    state: Arc<Mutex<State>>,
    poll_timeout: Duration,
    buffer_size: usize,
}

impl WindowsBackend {
    pub(crate) fn new(ctx: BackendContext) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                events: Some(ctx.events),
                errors: Some(ctx.errors),
                dirs: HashMap::new(),
                dangling: HashSet::new(),
            })),
            poll_timeout: ctx.poll_timeout,
            buffer_size: ctx.buffer_size,
        }
    }

    fn open_directory(&self, dir: &Path, target: &Path) -> Result<DirWatch, WatchError> {
        let handle = open_directory_handle(target).map_err(|e| WatchError::registration(dir, e))?;

        let state = self.state.lock();
        let (Some(events), Some(errors)) = (state.events.clone(), state.errors.clone()) else {
            // SAFETY: the handle was just opened and is not shared.
            unsafe { CloseHandle(handle) };
            return Err(WatchError::AlreadyClosed);
        };
        drop(state);

        let stop = Arc::new(AtomicBool::new(false));
        let reader = Reader {
            handle,
            dir: dir.to_path_buf(),
            stop: Arc::clone(&stop),
            state: Arc::clone(&self.state),
            events,
            errors,
            poll_timeout: self.poll_timeout,
            buffer_size: self.buffer_size,
        };

        let thread = thread::Builder::new()
            .name("pathwatch-rdcw".to_string())
            .spawn(move || reader.run())
            .map_err(|e| WatchError::registration(dir, e))?;

        Ok(DirWatch {
            covered: HashSet::new(),
            stop,
            reader: Some(thread),
        })
    }
}

impl Backend for WindowsBackend {
    fn name(&self) -> &'static str {
        "ReadDirectoryChangesW"
    }

    fn add_watch(&self, path: &Path) -> Result<(), WatchError> {
        let target = resolve(path)?;

        if self.state.lock().events.is_none() {
            return Err(WatchError::AlreadyClosed);
        }

        let target = match target {
            Target::Path(target) => target,
            Target::Dangling => {
                self.state.lock().dangling.insert(path.to_path_buf());
                return Ok(());
            }
        };

        let (dir, dir_target) = if target.is_dir() {
            (path.to_path_buf(), target)
        } else {
            let parent = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let parent_target = target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| parent.clone());
            (parent, parent_target)
        };

        {
            let mut state = self.state.lock();
            if let Some(watch) = state.dirs.get_mut(&dir) {
                watch.covered.insert(path.to_path_buf());
                return Ok(());
            }
        }

        let mut watch = self.open_directory(&dir, &dir_target)?;
        watch.covered.insert(path.to_path_buf());

        let mut state = self.state.lock();
        match state.dirs.get_mut(&dir) {
            // Lost a race with another registration for the same directory
            Some(existing) => {
                existing.covered.insert(path.to_path_buf());
                watch.stop.store(true, Ordering::Release);
            }
            None => {
                state.dirs.insert(dir.clone(), watch);
            }
        }

        crate::debug_event!("windows", "watching", "{} via {}", path.display(), dir.display());
        Ok(())
    }

    fn remove_watch(&self, path: &Path) -> Result<bool, WatchError> {
        let reader = {
            let mut state = self.state.lock();

            if state.dangling.remove(path) {
                return Ok(true);
            }

            let Some(dir) = state.owner(path) else {
                return Ok(false);
            };

            let now_empty = state.dirs.get_mut(&dir).is_some_and(|watch| {
                watch.covered.remove(path);
                watch.covered.is_empty()
            });

            if now_empty { state.release(&dir) } else { None }
        };

        if let Some(reader) = reader {
            if reader.join().is_err() {
                tracing::warn!("[windows] reader thread panicked");
            }
        }

        crate::debug_event!("windows", "unwatched", "{}", path.display());
        Ok(true)
    }

    fn covers(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.dangling.contains(path)
            || state.dirs.contains_key(path)
            || path
                .parent()
                .is_some_and(|parent| state.dirs.contains_key(parent))
    }

    fn close(&self) {
        let readers: Vec<JoinHandle<()>> = {
            let mut state = self.state.lock();
            state.events = None;
            state.errors = None;
            state.dangling.clear();

            let dirs: Vec<PathBuf> = state.dirs.keys().cloned().collect();
            dirs.iter().filter_map(|dir| state.release(dir)).collect()
        };

        for reader in readers {
            if reader.join().is_err() {
                tracing::warn!("[windows] reader thread panicked");
            }
        }
    }
}

impl Drop for WindowsBackend {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_directory_handle(dir: &Path) -> io::Result<HANDLE> {
    let wide: Vec<u16> = dir
        .as_os_str()
        .encode_wide()
        .chain(iter::once(0))
        .collect();

    // SAFETY: `wide` is a NUL-terminated UTF-16 path that outlives the call.
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            FILE_LIST_DIRECTORY,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
            0,
        )
    };

    if handle == INVALID_HANDLE_VALUE {
        Err(io::Error::last_os_error())
    } else {
        Ok(handle)
    }
}

/// Background reader for one directory handle.
struct Reader {
    handle: HANDLE,
    dir: PathBuf,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<State>>,
    events: Sender<Event>,
    errors: Sender<WatchError>,
    poll_timeout: Duration,
    buffer_size: usize,
}

enum Wait {
    Completed,
    Stopped,
    Failed(io::Error),
}

impl Reader {
    fn run(self) {
        // SAFETY: manual-reset, initially unsignaled, unnamed event.
        let event = unsafe { CreateEventW(ptr::null(), TRUE, FALSE, ptr::null()) };
        if event == 0 {
            let _ = self.errors.send(WatchError::backend(
                Some(self.dir.clone()),
                io::Error::last_os_error(),
            ));
            self.retire();
        } else {
            self.read_loop(event);
            // SAFETY: created above and no longer waited on.
            unsafe { CloseHandle(event) };
        }

        // SAFETY: this thread is the only user of the directory handle.
        unsafe { CloseHandle(self.handle) };
        crate::debug_event!("windows", "reader stopped", "{}", self.dir.display());
    }

    fn read_loop(&self, event: HANDLE) {
        // DWORD-aligned, as ReadDirectoryChangesW requires
        let mut buffer = vec![0u32; self.buffer_size.max(4096) / 4];
        let buffer_bytes = (buffer.len() * 4) as u32;

        while !self.stop.load(Ordering::Acquire) {
            // SAFETY: OVERLAPPED is a plain C struct; all-zero is valid.
            let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
            overlapped.hEvent = event;

            // SAFETY: the buffer and overlapped outlive the operation; it is
            // either completed or cancelled and awaited before they drop.
            let issued = unsafe {
                ReadDirectoryChangesW(
                    self.handle,
                    buffer.as_mut_ptr() as *mut c_void,
                    buffer_bytes,
                    FALSE,
                    NOTIFY_FILTER,
                    ptr::null_mut(),
                    &mut overlapped,
                    None,
                )
            };
            if issued == 0 {
                self.fail(io::Error::last_os_error());
                return;
            }

            match self.wait(event) {
                Wait::Completed => {}
                Wait::Stopped => {
                    self.cancel(&mut overlapped);
                    return;
                }
                Wait::Failed(e) => {
                    self.cancel(&mut overlapped);
                    self.fail(e);
                    return;
                }
            }

            let mut transferred = 0u32;
            // SAFETY: the operation has completed; no wait needed.
            let ok = unsafe { GetOverlappedResult(self.handle, &overlapped, &mut transferred, FALSE) };
            if ok == 0 {
                self.fail(io::Error::last_os_error());
                return;
            }

            if transferred == 0 {
                let _ = self.errors.send(WatchError::Overflow {
                    details: format!("change buffer overflowed for {}", self.dir.display()),
                });
                continue;
            }

            // SAFETY: the kernel wrote `transferred` bytes of
            // FILE_NOTIFY_INFORMATION records into the buffer.
            let records = unsafe { parse_records(buffer.as_ptr() as *const u8, transferred as usize) };
            for (action, name) in records {
                if !self.forward(action, name) {
                    return;
                }
            }
        }
    }

    fn wait(&self, event: HANDLE) -> Wait {
        let timeout_ms = self.poll_timeout.as_millis().min(u32::MAX as u128) as u32;
        loop {
            // SAFETY: `event` is a valid event handle owned by this thread.
            match unsafe { WaitForSingleObject(event, timeout_ms) } {
                WAIT_OBJECT_0 => return Wait::Completed,
                WAIT_TIMEOUT => {
                    if self.stop.load(Ordering::Acquire) {
                        return Wait::Stopped;
                    }
                }
                _ => return Wait::Failed(io::Error::last_os_error()),
            }
        }
    }

    fn cancel(&self, overlapped: &mut OVERLAPPED) {
        let mut transferred = 0u32;
        // SAFETY: cancel the pending read, then block until the kernel is
        // done with the buffer.
        unsafe {
            CancelIoEx(self.handle, overlapped);
            GetOverlappedResult(self.handle, overlapped, &mut transferred, TRUE);
        }
    }

    /// Emit one record. Returns `false` once the event queue is gone.
    fn forward(&self, action: u32, name: OsString) -> bool {
        let ops = translate(action);
        if ops.is_empty() {
            return true;
        }

        let path = self.dir.join(name);

        if ops.contains(Triggers::DELETE) {
            self.uncover(&path);
        }

        self.events.send(Event::new(path, ops)).is_ok()
    }

    /// A covered file was deleted; stop serving it.
    fn uncover(&self, path: &Path) {
        let mut state = self.state.lock();
        let now_empty = state.dirs.get_mut(&self.dir).is_some_and(|watch| {
            watch.covered.remove(path) && watch.covered.is_empty()
        });
        if now_empty {
            // Detached: this thread exits on its own after the flag is set
            drop(state.release(&self.dir));
        }
    }

    /// The handle is unusable (typically the directory was removed).
    fn fail(&self, error: io::Error) {
        crate::log_event!("windows", "watch lost", "{}: {error}", self.dir.display());

        let reported = self.state.lock().parent_reports(&self.dir);
        if !reported && !self.dir.exists() {
            let _ = self.events.send(Event::delete(self.dir.clone()));
        }
        let _ = self
            .errors
            .send(WatchError::backend(Some(self.dir.clone()), error));
        self.retire();
    }

    fn retire(&self) {
        let mut state = self.state.lock();
        let ours = state
            .dirs
            .get(&self.dir)
            .is_some_and(|watch| Arc::ptr_eq(&watch.stop, &self.stop));
        if ours {
            drop(state.release(&self.dir));
        }
    }
}

/// Walk a chain of `FILE_NOTIFY_INFORMATION` records.
///
/// # Safety
///
/// `base` must point to `len` readable bytes holding a well-formed chain.
unsafe fn parse_records(base: *const u8, len: usize) -> Vec<(u32, OsString)> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < len {
        // SAFETY: guaranteed by the caller's contract.
        let info = unsafe { &*(base.add(offset) as *const FILE_NOTIFY_INFORMATION) };
        let name_len = info.FileNameLength as usize / 2;
        // SAFETY: the name immediately follows the header inside the record.
        let name = unsafe { slice::from_raw_parts(info.FileName.as_ptr(), name_len) };
        records.push((info.Action, OsString::from_wide(name)));

        if info.NextEntryOffset == 0 {
            break;
        }
        offset += info.NextEntryOffset as usize;
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, unbounded};
    use std::fs;
    use tempfile::TempDir;

    fn backend() -> (WindowsBackend, Receiver<Event>, Receiver<WatchError>) {
        let (events_tx, events_rx) = unbounded();
        let (errors_tx, errors_rx) = unbounded();
        let backend = WindowsBackend::new(BackendContext {
            events: events_tx,
            errors: errors_tx,
            poll_timeout: Duration::from_millis(20),
            buffer_size: 4096,
        });
        (backend, events_rx, errors_rx)
    }

    #[test]
    fn test_translate_actions() {
        assert_eq!(translate(FILE_ACTION_ADDED), Triggers::CREATE);
        assert_eq!(translate(FILE_ACTION_REMOVED), Triggers::DELETE);
        assert_eq!(translate(FILE_ACTION_RENAMED_NEW_NAME), Triggers::RENAME);
        assert!(translate(0).is_empty());
    }

    #[test]
    fn test_file_watch_shares_directory_handle() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.txt");
        fs::write(&file, "a").unwrap();
        let (backend, _events, _errors) = backend();

        backend.add_watch(temp_dir.path()).unwrap();
        backend.add_watch(&file).unwrap();
        assert_eq!(backend.state.lock().dirs.len(), 1);

        assert!(backend.remove_watch(&file).unwrap());
        assert_eq!(backend.state.lock().dirs.len(), 1);
        assert!(backend.remove_watch(temp_dir.path()).unwrap());
        assert!(backend.state.lock().dirs.is_empty());
    }

    #[test]
    fn test_create_in_watched_directory() {
        let temp_dir = TempDir::new().unwrap();
        let (backend, events, _errors) = backend();

        backend.add_watch(temp_dir.path()).unwrap();
        let file = temp_dir.path().join("new.txt");
        fs::write(&file, "x").unwrap();

        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event.path(), file.as_path());
        assert!(event.is_create());
        backend.close();
    }

    #[test]
    fn test_removed_subdirectory_reported_once() {
        let temp_dir = TempDir::new().unwrap();
        let sub = temp_dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        let (backend, events, _errors) = backend();

        backend.add_watch(temp_dir.path()).unwrap();
        backend.add_watch(&sub).unwrap();
        assert!(backend.state.lock().parent_reports(&sub));
        assert!(!backend.state.lock().parent_reports(temp_dir.path()));

        fs::remove_dir(&sub).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        backend.close();

        let deletes = events
            .try_iter()
            .filter(|event| event.path() == sub && event.is_delete())
            .count();
        assert_eq!(deletes, 1);
    }
}
