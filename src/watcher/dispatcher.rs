//! Dispatcher: routes raw backend events through their pipelines.
//!
//! A single thread drains the internal queue. For each event it looks up the
//! responsible pipeline in the [`WatchTable`] (exact path first, then the
//! watched parent directory), forwards the event if the pipeline accepts it,
//! and retires the table entry of a watched path that was deleted.
//!
//! The thread exits when every producer of the internal queue has gone away,
//! which drops the external event sender and lets consumers observe the end
//! of the stream.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};

use super::watch_table::WatchTable;
use crate::event::Event;

pub(crate) struct Dispatcher {
    raw: Receiver<Event>,
    table: Arc<WatchTable>,
    out: Sender<Event>,
}

impl Dispatcher {
    pub(crate) fn new(raw: Receiver<Event>, table: Arc<WatchTable>, out: Sender<Event>) -> Self {
        Self { raw, table, out }
    }

    /// Start the dispatcher thread.
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("pathwatch-dispatch".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        crate::debug_event!("dispatch", "started");

        for event in self.raw.iter() {
            if !self.dispatch(event) {
                break;
            }
        }

        crate::debug_event!("dispatch", "stopped");
    }

    /// Route one event. Returns `false` once the consumer side is gone.
    fn dispatch(&self, event: Event) -> bool {
        let Some(pipeline) = self.table.resolve(event.path()) else {
            crate::debug_event!("dispatch", "unwatched", "{event}");
            return true;
        };

        let retire = event.is_delete() && self.table.contains(event.path());
        let forward = pipeline.process(&event);

        if retire {
            self.table.remove(event.path());
            crate::debug_event!("dispatch", "retired", "{}", event.path().display());
        }

        if forward {
            return self.out.send(event).is_ok();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Triggers;
    use crate::watcher::WatchOptions;
    use crate::watcher::pipeline::Pipeline;
    use crossbeam_channel::unbounded;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    fn table_with(entries: &[(&str, WatchOptions)]) -> Arc<WatchTable> {
        let table = Arc::new(WatchTable::new());
        for (path, options) in entries {
            table.insert(PathBuf::from(path), Arc::new(Pipeline::build(options)));
        }
        table
    }

    #[test]
    fn test_forwards_events_for_watched_directory_children() {
        let table = table_with(&[("/w", WatchOptions::new())]);
        let (raw_tx, raw_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let handle = Dispatcher::new(raw_rx, table, out_tx).spawn().unwrap();

        raw_tx.send(Event::create("/w/a.txt")).unwrap();
        raw_tx.send(Event::create("/elsewhere/b.txt")).unwrap();
        drop(raw_tx);
        handle.join().unwrap();

        let received: Vec<Event> = out_rx.iter().collect();
        assert_eq!(received, vec![Event::create("/w/a.txt")]);
    }

    #[test]
    fn test_exact_entry_policy_wins() {
        let table = table_with(&[
            ("/w", WatchOptions::new()),
            (
                "/w/log.txt",
                WatchOptions::new().triggers(Triggers::DELETE),
            ),
        ]);
        let (raw_tx, raw_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let handle = Dispatcher::new(raw_rx, table, out_tx).spawn().unwrap();

        raw_tx.send(Event::modify("/w/log.txt")).unwrap();
        raw_tx.send(Event::modify("/w/other.txt")).unwrap();
        drop(raw_tx);
        handle.join().unwrap();

        let received: Vec<Event> = out_rx.iter().collect();
        assert_eq!(received, vec![Event::modify("/w/other.txt")]);
    }

    #[test]
    fn test_delete_retires_exact_entry() {
        let table = table_with(&[("/w", WatchOptions::new()), ("/w/sub", WatchOptions::new())]);
        let (raw_tx, raw_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let handle = Dispatcher::new(raw_rx, Arc::clone(&table), out_tx)
            .spawn()
            .unwrap();

        raw_tx.send(Event::delete("/w/sub")).unwrap();
        drop(raw_tx);
        handle.join().unwrap();

        assert_eq!(out_rx.recv_timeout(Duration::from_secs(1)).unwrap(), Event::delete("/w/sub"));
        assert!(!table.contains(Path::new("/w/sub")));
        assert!(table.contains(Path::new("/w")));
    }

    #[test]
    fn test_filtered_delete_still_retires() {
        let table = table_with(&[("/w/f", WatchOptions::new().triggers(Triggers::CREATE))]);
        let (raw_tx, raw_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let handle = Dispatcher::new(raw_rx, Arc::clone(&table), out_tx)
            .spawn()
            .unwrap();

        raw_tx.send(Event::delete("/w/f")).unwrap();
        drop(raw_tx);
        handle.join().unwrap();

        assert!(out_rx.try_recv().is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_stops_when_consumer_is_gone() {
        let table = table_with(&[("/w", WatchOptions::new())]);
        let (raw_tx, raw_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        drop(out_rx);
        let handle = Dispatcher::new(raw_rx, table, out_tx).spawn().unwrap();

        raw_tx.send(Event::create("/w/a")).unwrap();
        // The thread exits without waiting for the raw sender to close
        handle.join().unwrap();
    }
}
