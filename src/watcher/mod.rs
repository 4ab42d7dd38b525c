//! File system watcher.
//!
//! One native backend feeds raw events into an internal queue. A single
//! dispatcher thread looks up each event's pipeline in the watch table,
//! filters it, and forwards survivors to the consumer.
//!
//! # Architecture
//!
//! ```text
//!  inotify / kqueue / ReadDirectoryChangesW
//!            reader thread(s)
//!                  |  raw Event
//!                  v
//!          internal queue ---> dispatcher thread
//!                                |  WatchTable lookup
//!                                v
//!                        Pipeline (per watch)
//!   verbose -> hidden -> auto-watch -> triggers -> pattern -> throttle
//!                                |
//!              +-----------------+-----------------+
//!              v                                   v
//!        events() queue                      errors() queue
//! ```
//!
//! Auto-watch registers new directories of a recursive watch through the
//! same path a caller's `watch` takes.

mod backend;
mod dispatcher;
mod error;
mod facade;
mod options;
mod pipeline;
mod recursive;
mod throttle;
mod watch_table;

pub use error::WatchError;
pub use facade::{Watcher, WatcherBuilder};
pub use options::WatchOptions;
pub use pipeline::{DEFAULT_THROTTLE, Pipeline};
pub use throttle::Throttle;
pub use watch_table::WatchTable;
