//! Configuration for the watcher service.
//!
//! Settings are layered:
//! - Default values
//! - TOML configuration file (`pathwatch.toml`)
//! - Environment variable overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `PATHWATCH_` and use double
//! underscores to separate nested levels:
//! - `PATHWATCH_WATCHER__THROTTLE_MS=250` sets `watcher.throttle_ms`
//! - `PATHWATCH_DEFAULTS__HIDDEN=true` sets `defaults.hidden`
//! - `PATHWATCH_LOGGING__DEFAULT=debug` sets `logging.default`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::watcher::{WatchError, WatchOptions};

/// File name looked up in the current directory by [`Settings::load`].
pub const CONFIG_FILE: &str = "pathwatch.toml";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub struct Settings {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Backend and dispatcher tuning
    #[serde(default)]
    pub watcher: WatcherConfig,

    /// Options used by `Watcher::watch_default`
    #[serde(default)]
    pub defaults: WatchOptions,
}

/// Log levels: a default plus per-module overrides.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Level for everything without an override
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module levels, e.g. `pathwatch::watcher = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Minimum spacing between two forwarded events for one path when a
    /// watch has throttling enabled
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,

    /// How long a backend reader blocks before checking for shutdown
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,

    /// Native read buffer size in bytes
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

// Default value functions
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_throttle_ms() -> u64 {
    1000
}
fn default_poll_timeout_ms() -> u64 {
    100
}
fn default_read_buffer_size() -> usize {
    4096
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

impl WatcherConfig {
    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }
}

impl Settings {
    /// Load configuration from all sources, reading `pathwatch.toml` from
    /// the current directory if it exists.
    pub fn load() -> Result<Self, WatchError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load configuration from a specific file.
    ///
    /// A missing file is not an error; defaults and environment variables
    /// still apply.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, WatchError> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(|e| WatchError::ConfigError {
                reason: e.to_string(),
            })
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Settings::default()))
            // Layer in config file if it exists
            .merge(Toml::file(path))
            // Double underscore (__) separates nested levels; single
            // underscores stay part of the field name
            .merge(Env::prefixed("PATHWATCH_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
    }

    /// Save current configuration to file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Path of the file [`Settings::load`] reads.
    pub fn default_path() -> PathBuf {
        PathBuf::from(CONFIG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Triggers;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.logging.default, "warn");
        assert_eq!(settings.watcher.throttle_ms, 1000);
        assert_eq!(settings.watcher.poll_timeout(), Duration::from_millis(100));
        assert_eq!(settings.watcher.read_buffer_size, 4096);
        assert_eq!(settings.defaults, WatchOptions::default());
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("pathwatch.toml");

        let toml_content = r#"
[logging]
default = "info"

[logging.modules]
"pathwatch::watcher" = "debug"

[watcher]
throttle_ms = 250

[defaults]
hidden = true
pattern = "*.go,*.c"
triggers = "CREATE | DELETE"
"#;

        fs::write(&config_path, toml_content).unwrap();

        let settings = Settings::load_from(&config_path).unwrap();
        assert_eq!(settings.logging.default, "info");
        assert_eq!(settings.logging.modules["pathwatch::watcher"], "debug");
        assert_eq!(settings.watcher.throttle_interval(), Duration::from_millis(250));
        assert!(settings.defaults.hidden);
        assert_eq!(settings.defaults.pattern, "*.go,*.c");
        assert_eq!(settings.defaults.triggers, Triggers::CREATE | Triggers::DELETE);
    }

    #[test]
    fn test_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("pathwatch.toml");

        fs::write(&config_path, "[watcher]\npoll_timeout_ms = 20\n").unwrap();

        let settings = Settings::load_from(&config_path).unwrap();

        // Modified value
        assert_eq!(settings.watcher.poll_timeout_ms, 20);
        // Default values should still be present
        assert_eq!(settings.watcher.throttle_ms, 1000);
        assert_eq!(settings.logging.default, "warn");
        assert!(!settings.defaults.recursive);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();

        let settings = Settings::load_from(temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.watcher, WatcherConfig::default());
    }

    #[test]
    fn test_invalid_config_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("pathwatch.toml");
        fs::write(&config_path, "[watcher]\nthrottle_ms = \"soon\"\n").unwrap();

        let err = Settings::load_from(&config_path).unwrap_err();
        assert!(matches!(err, WatchError::ConfigError { .. }));
    }

    #[test]
    fn test_save_settings() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested/pathwatch.toml");

        let mut settings = Settings::default();
        settings.watcher.throttle_ms = 50;
        settings.defaults.recursive = true;

        settings.save(&config_path).unwrap();

        let loaded = Settings::load_from(&config_path).unwrap();
        assert_eq!(loaded, settings);
    }
}
