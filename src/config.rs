//! Configuration for the watcher engine.
//!
//! Layered configuration:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides (applied by the binary)
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `DIRHOOK_` and use double
//! underscores to separate nested levels:
//! - `DIRHOOK_WATCH__MAX_WORKERS=8` sets `watch.max_workers`
//! - `DIRHOOK_WATCH__DEBOUNCE_SECS=0.5` sets `watch.debounce_secs`
//! - `DIRHOOK_LOGGING__DEFAULT=debug` sets `logging.default`

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Directory holding the settings file.
pub const CONFIG_DIR: &str = ".dirhook";
/// Settings file name inside [`CONFIG_DIR`].
pub const CONFIG_FILE: &str = "settings.toml";
/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DIRHOOK_";
/// Upper bound for configured durations; anything longer is treated as one day.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Engine behaviour
    #[serde(default)]
    pub watch: WatchConfig,

    /// Log levels and format
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WatchConfig {
    /// Prefix for worker and scheduler thread names
    #[serde(default = "default_name")]
    pub name: String,

    /// Quiet period before a change settles, in seconds
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: f64,

    /// Worker threads for blocking handlers
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Watch handler roots recursively
    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Bounded wait of the run loop; also the stop-signal latency
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long shutdown waits for in-flight handlers, in seconds
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingConfig {
    /// Default level for every target
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-module level overrides, e.g. `dispatch = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,

    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_name() -> String {
    "dirhook".to_string()
}
fn default_debounce_secs() -> f64 {
    1.6
}
fn default_max_workers() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_shutdown_grace_secs() -> f64 {
    5.0
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            debounce_secs: default_debounce_secs(),
            max_workers: default_max_workers(),
            recursive: true,
            poll_interval_ms: default_poll_interval_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
            json: false,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        seconds(self.debounce_secs)
    }

    /// Worker count, never below one.
    pub fn workers(&self) -> usize {
        self.max_workers.max(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_secs)
    }
}

/// Fractional seconds to a duration, capped at [`MAX_DURATION`].
///
/// Negative or NaN values become zero, infinity becomes the cap.
fn seconds(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value)
        .unwrap_or(MAX_DURATION)
        .min(MAX_DURATION)
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join(CONFIG_FILE));

        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honouring env overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, Box<figment::Error>> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nesting; single underscores stay in field names
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)
    }

    /// Find the settings file by looking for `.dirhook` from the CWD upward
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        current
            .ancestors()
            .map(|ancestor| ancestor.join(CONFIG_DIR))
            .find(|dir| dir.is_dir())
            .map(|dir| dir.join(CONFIG_FILE))
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }
}
