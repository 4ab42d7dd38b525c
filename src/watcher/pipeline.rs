//! Per-watch filter pipeline.
//!
//! A [`Pipeline`] is built once from a [`WatchOptions`] when a path is
//! watched. Only the steps whose option is active are added, in a fixed
//! order:
//!
//! ```text
//! verbose -> hidden -> auto-watch -> triggers -> pattern -> throttle
//! ```
//!
//! Processing stops at the first step that rejects the event, so side
//! effects of later steps (auto-watch registration, throttle bookkeeping)
//! never fire for an event that was already dropped.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Weak;
use std::time::Duration;

use glob::Pattern;

use crate::event::{Event, Triggers};

use super::WatchError;
use super::options::WatchOptions;
use super::throttle::Throttle;

/// Default spacing between forwarded events for one path.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(1);

/// Something that can add a watch while events are being dispatched.
///
/// Implemented by the watcher itself; the auto-watch step only holds a weak
/// reference so a pipeline never keeps its watcher alive.
pub(crate) trait Registrar: Send + Sync {
    fn register(&self, path: &Path, options: &WatchOptions) -> Result<(), WatchError>;
}

/// Ordered filter chain deciding whether an event is forwarded.
#[derive(Debug)]
pub struct Pipeline {
    options: WatchOptions,
    steps: Vec<Step>,
}

enum Step {
    Verbose,
    Hidden,
    AutoWatch(AutoWatch),
    Triggers(Triggers),
    Pattern(Vec<Pattern>),
    Throttle(Throttle),
}

impl Pipeline {
    /// Build a pipeline with the default throttle interval and no auto-watch
    /// registrar.
    pub fn build(options: &WatchOptions) -> Self {
        Self::build_with(options, DEFAULT_THROTTLE, None)
    }

    pub(crate) fn build_with(
        options: &WatchOptions,
        throttle_interval: Duration,
        registrar: Option<Weak<dyn Registrar>>,
    ) -> Self {
        let mut steps = Vec::new();

        if options.verbose {
            steps.push(Step::Verbose);
        }

        if !options.hidden {
            steps.push(Step::Hidden);
        }

        if options.recursive {
            steps.push(Step::AutoWatch(AutoWatch {
                options: options.clone(),
                registrar,
            }));
        }

        if !options.triggers.is_all() && !options.triggers.is_empty() {
            steps.push(Step::Triggers(options.triggers));
        }

        if !options.pattern.trim().is_empty() {
            steps.push(Step::Pattern(compile_patterns(&options.pattern)));
        }

        if options.throttle {
            steps.push(Step::Throttle(Throttle::new(throttle_interval)));
        }

        Self {
            options: options.clone(),
            steps,
        }
    }

    /// Run the event through every step. Returns `true` to forward it.
    pub fn process(&self, event: &Event) -> bool {
        self.steps.iter().all(|step| step.run(event))
    }

    /// Options this pipeline was built from.
    pub fn options(&self) -> &WatchOptions {
        &self.options
    }

    /// Number of active steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl Step {
    fn run(&self, event: &Event) -> bool {
        match self {
            Step::Verbose => {
                crate::log_event!("pipeline", "event", "{event}");
                true
            }
            Step::Hidden => !is_hidden(&event.leaf()),
            Step::AutoWatch(auto) => {
                auto.run(event);
                true
            }
            Step::Triggers(mask) => event.ops().intersects(*mask),
            Step::Pattern(patterns) => {
                let leaf = event.leaf();
                patterns.iter().any(|pattern| pattern.matches(&leaf))
            }
            Step::Throttle(throttle) => throttle.allow(event.path()),
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Verbose => f.write_str("Verbose"),
            Step::Hidden => f.write_str("Hidden"),
            Step::AutoWatch(_) => f.write_str("AutoWatch"),
            Step::Triggers(mask) => f.debug_tuple("Triggers").field(mask).finish(),
            Step::Pattern(patterns) => {
                let globs: Vec<&str> = patterns.iter().map(Pattern::as_str).collect();
                f.debug_tuple("Pattern").field(&globs).finish()
            }
            Step::Throttle(_) => f.write_str("Throttle"),
        }
    }
}

/// Registers newly created directories under a recursive watch.
struct AutoWatch {
    options: WatchOptions,
    registrar: Option<Weak<dyn Registrar>>,
}

impl AutoWatch {
    fn run(&self, event: &Event) {
        if !event.is_create() {
            return;
        }

        // The directory may already be gone again; that is not an error.
        match fs::metadata(event.path()) {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return,
            Err(e) => {
                crate::debug_event!("autowatch", "stat failed", "{}: {e}", event.path().display());
                return;
            }
        }

        let Some(registrar) = self.registrar.as_ref().and_then(Weak::upgrade) else {
            return;
        };

        match registrar.register(event.path(), &self.options) {
            Ok(()) => {
                crate::debug_event!("autowatch", "watching", "{}", event.path().display());
            }
            Err(e) => {
                crate::debug_event!("autowatch", "skipped", "{}: {e}", event.path().display());
            }
        }
    }
}

/// A name is hidden if it starts with a dot, except for `.` and `..`.
pub(crate) fn is_hidden(name: &str) -> bool {
    name.starts_with('.') && name != "." && name != ".."
}

/// Compile a comma separated glob list; malformed globs are dropped so they
/// never match.
fn compile_patterns(list: &str) -> Vec<Pattern> {
    list.split(',')
        .map(str::trim)
        .filter(|glob| !glob.is_empty())
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                tracing::debug!("[pipeline] ignoring malformed glob {glob:?}: {e}");
                None
            }
        })
        .collect()
}
