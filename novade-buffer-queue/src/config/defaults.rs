//! Default configuration values for buffer queues.
//!
//! These functions are referenced by `serde`'s `default` attribute in
//! [`super::types`] so that a missing key falls back to the same value as a queue
//! created without settings.

use std::path::PathBuf;

use novade_buffer_manager::BufferUsage;

use crate::config::{LoggingConfig, QueueSettings};
use crate::queue::{DEFAULT_QUEUE_SIZE, DEFAULT_REQUEST_TIMEOUT};

pub(super) fn default_queue_settings() -> QueueSettings {
    QueueSettings {
        name: default_queue_name(),
        queue_size: default_queue_size(),
        default_width: default_dimension(),
        default_height: default_dimension(),
        default_usage: default_usage(),
        request_timeout_ms: default_request_timeout_ms(),
    }
}

pub(super) fn default_queue_name() -> String {
    "buffer-queue".to_string()
}

pub(super) fn default_queue_size() -> u32 {
    DEFAULT_QUEUE_SIZE
}

/// `0` leaves the consumer default size unset.
pub(super) fn default_dimension() -> u32 {
    0
}

pub(super) fn default_usage() -> BufferUsage {
    BufferUsage::default()
}

pub(super) fn default_request_timeout_ms() -> i64 {
    DEFAULT_REQUEST_TIMEOUT.as_millis() as i64
}

pub(super) fn default_logging_config() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        file_path: default_log_file_path(),
        format: default_log_format(),
    }
}

/// `"info"`.
pub(super) fn default_log_level() -> String {
    "info".to_string()
}

/// No log file.
pub(super) fn default_log_file_path() -> Option<PathBuf> {
    None
}

/// `"text"`.
pub(super) fn default_log_format() -> String {
    "text".to_string()
}
