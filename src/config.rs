use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::services::file_watcher::WatchConfig;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub browse: BrowseConfig,

    #[serde(default)]
    pub watch: WatchTuning,

    #[serde(default)]
    pub mode: ModeConfig,

    #[serde(default)]
    pub edit: EditConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Text encoding passed to the remote service
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browse: BrowseConfig::default(),
            watch: WatchTuning::default(),
            mode: ModeConfig::default(),
            edit: EditConfig::default(),
            timeouts: TimeoutConfig::default(),
            encoding: default_encoding(),
        }
    }
}

/// Windowed access tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BrowseConfig {
    /// Lines per window (and per scroll block)
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Blocks kept loaded before and after the visible range
    #[serde(default = "default_preload_blocks")]
    pub preload_blocks: usize,

    #[serde(default = "default_max_cached_windows")]
    pub max_cached_windows: usize,

    /// How much one extra access is worth, in milliseconds of recency
    #[serde(default = "default_cache_access_weight")]
    pub cache_access_weight_ms: u64,

    /// Height of one rendered line, in the unit scroll offsets are given in
    #[serde(default = "default_line_height")]
    pub line_height: f64,
}

fn default_block_size() -> usize {
    1000
}

fn default_preload_blocks() -> usize {
    2
}

fn default_max_cached_windows() -> usize {
    10
}

fn default_cache_access_weight() -> u64 {
    1000
}

fn default_line_height() -> f64 {
    1.0
}

impl Default for BrowseConfig {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            preload_blocks: default_preload_blocks(),
            max_cached_windows: default_max_cached_windows(),
            cache_access_weight_ms: default_cache_access_weight(),
            line_height: default_line_height(),
        }
    }
}

/// File watcher polling behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WatchTuning {
    #[serde(default = "default_min_poll")]
    pub min_poll_interval_ms: u64,

    #[serde(default = "default_max_poll")]
    pub max_poll_interval_ms: u64,

    #[serde(default = "default_initial_poll")]
    pub initial_poll_interval_ms: u64,

    /// Interval multiplier applied after a failed poll
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Consecutive failed polls tolerated before a watch is stopped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_min_poll() -> u64 {
    250
}

fn default_max_poll() -> u64 {
    10_000
}

fn default_initial_poll() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    5
}

impl Default for WatchTuning {
    fn default() -> Self {
        Self {
            min_poll_interval_ms: default_min_poll(),
            max_poll_interval_ms: default_max_poll(),
            initial_poll_interval_ms: default_initial_poll(),
            backoff_factor: default_backoff_factor(),
            max_retries: default_max_retries(),
        }
    }
}

/// Browse/edit arbitration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ModeConfig {
    /// Files larger than this open in browse mode
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_bytes: u64,

    /// Hard ceiling for loading a file fully into edit mode
    #[serde(default = "default_max_full_load")]
    pub max_full_load_bytes: u64,
}

fn default_large_file_threshold() -> u64 {
    10 * 1024 * 1024 // 10MB
}

fn default_max_full_load() -> u64 {
    100 * 1024 * 1024 // 100MB
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            large_file_threshold_bytes: default_large_file_threshold(),
            max_full_load_bytes: default_max_full_load(),
        }
    }
}

/// Full-load editing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EditConfig {
    /// Save dirty content every this many milliseconds; disabled when unset
    #[serde(default)]
    pub autosave_interval_ms: Option<u64>,
}

/// Bounded waits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutConfig {
    /// Limit for one external line tool invocation
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Limit for one remote stat/read/write
    #[serde(default = "default_remote_timeout")]
    pub remote_timeout_ms: u64,
}

fn default_command_timeout() -> u64 {
    30_000
}

fn default_remote_timeout() -> u64 {
    15_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout(),
            remote_timeout_ms: default_remote_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn remote(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;

        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| ConfigError::Parse(format!("{}: {}", path.as_ref().display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Watcher settings in the form the watcher consumes
    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            min_interval: Duration::from_millis(self.watch.min_poll_interval_ms),
            max_interval: Duration::from_millis(self.watch.max_poll_interval_ms),
            initial_interval: Duration::from_millis(self.watch.initial_poll_interval_ms),
            backoff_factor: self.watch.backoff_factor,
            max_retries: self.watch.max_retries,
            remote_timeout: self.timeouts.remote(),
            encoding: self.encoding.clone(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.browse.block_size == 0 {
            return Err(ConfigError::Validation(
                "browse.block_size must be greater than 0".to_string(),
            ));
        }

        if self.browse.max_cached_windows == 0 {
            return Err(ConfigError::Validation(
                "browse.max_cached_windows must be greater than 0".to_string(),
            ));
        }

        if self.browse.line_height.is_nan() || self.browse.line_height <= 0.0 {
            return Err(ConfigError::Validation(
                "browse.line_height must be positive".to_string(),
            ));
        }

        let watch = &self.watch;
        if watch.min_poll_interval_ms == 0 || watch.min_poll_interval_ms > watch.max_poll_interval_ms {
            return Err(ConfigError::Validation(format!(
                "watch poll interval bounds [{}, {}] are invalid",
                watch.min_poll_interval_ms, watch.max_poll_interval_ms
            )));
        }

        if watch.backoff_factor.is_nan() || watch.backoff_factor < 1.0 {
            return Err(ConfigError::Validation(
                "watch.backoff_factor must be at least 1.0".to_string(),
            ));
        }

        if self.mode.large_file_threshold_bytes > self.mode.max_full_load_bytes {
            return Err(ConfigError::Validation(
                "mode.large_file_threshold_bytes must not exceed mode.max_full_load_bytes"
                    .to_string(),
            ));
        }

        if self.edit.autosave_interval_ms == Some(0) {
            return Err(ConfigError::Validation(
                "edit.autosave_interval_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialize error: {0}")]
    Serialize(String),
    #[error("Validation error: {0}")]
    Validation(String),
}
