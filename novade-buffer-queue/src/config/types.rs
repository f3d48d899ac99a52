//! Configuration data structures.
//!
//! All structs reject unknown keys (`#[serde(deny_unknown_fields)]`) and fill missing
//! keys from [`super::defaults`].

use std::path::PathBuf;
use std::time::Duration;

use novade_buffer_manager::BufferUsage;
use serde::Deserialize;

use super::defaults;
use crate::error::ConfigError;
use crate::queue::MAX_QUEUE_SIZE;

/// Root of a buffer queue configuration file.
///
/// ```
/// use novade_buffer_queue::config::BufferQueueSettings;
///
/// let settings: BufferQueueSettings = toml::from_str(r#"
/// [queue]
/// name = "video"
/// queue_size = 5
///
/// [logging]
/// level = "debug"
/// "#).unwrap();
/// assert_eq!(settings.queue.queue_size, 5);
/// assert_eq!(settings.logging.format, "text");
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferQueueSettings {
    #[serde(default = "defaults::default_queue_settings")]
    pub queue: QueueSettings,
    #[serde(default = "defaults::default_logging_config")]
    pub logging: LoggingConfig,
}

impl Default for BufferQueueSettings {
    fn default() -> Self {
        Self {
            queue: defaults::default_queue_settings(),
            logging: defaults::default_logging_config(),
        }
    }
}

/// Settings a queue is created with.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSettings {
    /// Name used in logs and dumps.
    #[serde(default = "defaults::default_queue_name")]
    pub name: String,
    /// Initial queue size, `1..=32`.
    #[serde(default = "defaults::default_queue_size")]
    pub queue_size: u32,
    /// Consumer default width, `0` for unset.
    #[serde(default = "defaults::default_dimension")]
    pub default_width: u32,
    /// Consumer default height, `0` for unset.
    #[serde(default = "defaults::default_dimension")]
    pub default_height: u32,
    /// Consumer default usage, e.g. `"CPU_READ | CPU_WRITE"`.
    #[serde(default = "defaults::default_usage")]
    pub default_usage: BufferUsage,
    /// Timeout of default requests in milliseconds. Negative blocks indefinitely.
    #[serde(default = "defaults::default_request_timeout_ms")]
    pub request_timeout_ms: i64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        defaults::default_queue_settings()
    }
}

impl QueueSettings {
    /// `None` for a negative timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        u64::try_from(self.request_timeout_ms).ok().map(Duration::from_millis)
    }

    /// # Errors
    /// [`ConfigError::ValidationError`] if the queue size is out of range or only one
    /// of the default dimensions is set.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 || self.queue_size > MAX_QUEUE_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "queue_size {} not in [1, {}]",
                self.queue_size, MAX_QUEUE_SIZE
            )));
        }
        if (self.default_width == 0) != (self.default_height == 0) {
            return Err(ConfigError::ValidationError(format!(
                "default size {}x{} must be fully set or fully unset",
                self.default_width, self.default_height
            )));
        }
        Ok(())
    }
}

/// Logging settings, consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of "trace", "debug", "info", "warn", "error" (case-insensitive).
    #[serde(default = "defaults::default_log_level")]
    pub level: String,
    /// Daily-rolling log file. `None` disables file logging.
    #[serde(default = "defaults::default_log_file_path")]
    pub file_path: Option<PathBuf>,
    /// "text" or "json".
    #[serde(default = "defaults::default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        defaults::default_logging_config()
    }
}

impl LoggingConfig {
    /// Lower-cases level and format and checks both are known.
    pub fn normalize(&mut self) -> Result<(), ConfigError> {
        self.level = self.level.to_lowercase();
        if !matches!(self.level.as_str(), "trace" | "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::ValidationError(format!("invalid log level '{}'", self.level)));
        }
        self.format = self.format.to_lowercase();
        if !matches!(self.format.as_str(), "text" | "json") {
            return Err(ConfigError::ValidationError(format!("invalid log format '{}'", self.format)));
        }
        Ok(())
    }
}
