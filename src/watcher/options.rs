//! Per-watch configuration.

use serde::{Deserialize, Serialize};

use crate::event::Triggers;

/// Policy attached to one watched path.
///
/// Read once when the pipeline for the path is built. Changing an options
/// value afterwards has no effect on an existing watch; call `watch` again to
/// replace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Include dotfiles and dot-directories.
    pub hidden: bool,

    /// Change kinds to forward.
    pub triggers: Triggers,

    /// Comma separated shell globs matched against the file name.
    /// Empty matches everything.
    pub pattern: String,

    /// Forward at most one event per path per throttle interval.
    pub throttle: bool,

    /// Watch every subdirectory, including ones created later.
    pub recursive: bool,

    /// Log every event that reaches the pipeline.
    pub verbose: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            hidden: false,
            triggers: Triggers::all(),
            pattern: String::new(),
            throttle: false,
            recursive: false,
            verbose: false,
        }
    }
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn triggers(mut self, triggers: Triggers) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = pattern.into();
        self
    }

    pub fn throttle(mut self, throttle: bool) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = WatchOptions::default();
        assert!(!options.hidden);
        assert_eq!(options.triggers, Triggers::all());
        assert!(options.pattern.is_empty());
        assert!(!options.throttle && !options.recursive && !options.verbose);
    }

    #[test]
    fn test_builder_setters() {
        let options = WatchOptions::new()
            .hidden(true)
            .triggers(Triggers::CREATE | Triggers::DELETE)
            .pattern("*.rs")
            .recursive(true);

        assert!(options.hidden);
        assert_eq!(options.triggers, Triggers::CREATE | Triggers::DELETE);
        assert_eq!(options.pattern, "*.rs");
        assert!(options.recursive);
        assert!(!options.throttle);
    }
}
