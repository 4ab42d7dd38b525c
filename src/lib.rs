//! Cross-platform file system change notifications.
//!
//! A [`Watcher`] registers paths with the native facility of the host
//! (inotify, kqueue or `ReadDirectoryChangesW`), normalizes what it reports
//! into [`Event`]s and filters them per watch through a [`Pipeline`] before
//! delivering them on a channel.
//!
//! ```no_run
//! use pathwatch::{WatchOptions, Watcher};
//!
//! # fn main() -> Result<(), pathwatch::WatchError> {
//! let watcher = Watcher::new()?;
//! watcher.watch("src", &WatchOptions::new().recursive(true).pattern("*.rs"))?;
//!
//! for event in watcher.events().iter() {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod event;
pub mod logging;
pub mod watcher;

pub use config::Settings;
pub use event::{Event, Triggers};
pub use watcher::{Pipeline, WatchError, WatchOptions, WatchTable, Watcher, WatcherBuilder};
