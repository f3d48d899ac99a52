//! Logging setup for processes hosting buffer queues.
//!
//! The queue itself only emits `tracing` events. This module installs a subscriber
//! for them: a console layer in text or JSON and an optional daily-rolling file layer.

use std::io::IsTerminal;
use std::path::Path;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::LoggingError;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Keeps the non-blocking file writer alive; dropping it flushes pending lines.
static LOG_WORKER_GUARD: Lazy<Mutex<Option<WorkerGuard>>> = Lazy::new(|| Mutex::new(None));

/// Installs a stderr subscriber filtered by `RUST_LOG` (default "info").
///
/// Meant for tests and early startup. Does nothing if a subscriber is already set.
pub fn init_minimal_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

fn parse_level(level: &str) -> Result<Level, LoggingError> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        other => Err(LoggingError::InvalidLevel(other.to_string())),
    }
}

/// Builds a daily-rolling file layer, creating the parent directory if needed.
fn create_file_layer(log_path: &Path, format: &str) -> Result<(BoxedLayer, WorkerGuard), LoggingError> {
    let directory = match log_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory).map_err(|source| LoggingError::DirectoryCreation {
        path: directory.to_path_buf(),
        source,
    })?;

    let file_name = log_path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("buffer-queue.log"));
    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer: BoxedLayer = match format.to_lowercase().as_str() {
        "json" => fmt::layer().json().with_writer(writer).with_ansi(false).boxed(),
        _ => fmt::layer().with_writer(writer).with_ansi(false).boxed(),
    };
    Ok((layer, guard))
}

/// Installs the global subscriber described by `config`.
///
/// # Arguments
///
/// * `config`: level, format and optional log file.
/// * `is_reload`: if `true`, an already installed subscriber is not an error.
///
/// # Errors
///
/// - [`LoggingError::InvalidLevel`] for an unknown level.
/// - [`LoggingError::DirectoryCreation`] if the log directory cannot be created.
/// - [`LoggingError::SetGlobalDefault`] if a subscriber is already installed and
///   `is_reload` is `false`.
pub fn init_logging(config: &LoggingConfig, is_reload: bool) -> Result<(), LoggingError> {
    let level = parse_level(&config.level)?.to_string();

    let console_layer: BoxedLayer = match config.format.to_lowercase().as_str() {
        "json" => fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_ansi(false)
            .with_filter(EnvFilter::new(&level))
            .boxed(),
        _ => fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(std::io::stdout().is_terminal())
            .with_filter(EnvFilter::new(&level))
            .boxed(),
    };

    let mut layers: Vec<BoxedLayer> = vec![console_layer];
    let mut file_guard = None;
    if let Some(log_path) = &config.file_path {
        let (file_layer, guard) = create_file_layer(log_path, &config.format)?;
        layers.push(file_layer.with_filter(EnvFilter::new(&level)).boxed());
        file_guard = Some(guard);
    }

    let result = Registry::default().with(layers).try_init();

    // Replacing the guard flushes the previous file writer.
    *LOG_WORKER_GUARD.lock() = file_guard;

    match result {
        Ok(()) => Ok(()),
        Err(err) if is_reload => {
            tracing::info!(error = %err, "Logging reconfiguration kept the existing subscriber");
            Ok(())
        }
        Err(err) => Err(LoggingError::SetGlobalDefault(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_minimal_logging_is_idempotent() {
        init_minimal_logging();
        init_minimal_logging();
        tracing::info!("Minimal logging installed");
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARN").unwrap(), Level::WARN);
        assert_eq!(parse_level("trace").unwrap(), Level::TRACE);
        assert!(matches!(parse_level("loud"), Err(LoggingError::InvalidLevel(level)) if level == "loud"));
    }

    #[test]
    fn test_init_logging_rejects_invalid_level() {
        let config = LoggingConfig {
            level: "supertrace".to_string(),
            file_path: None,
            format: "text".to_string(),
        };
        assert!(matches!(init_logging(&config, false), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_create_file_layer_creates_parent_dir() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("nested/queue.log");
        assert!(!temp_dir.path().join("nested").exists());

        let (_layer, _guard) = create_file_layer(&log_path, "json").unwrap();
        assert!(temp_dir.path().join("nested").exists(), "Parent directory was not created");
    }

    #[test]
    fn test_reload_keeps_file_guard() {
        let temp_dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            level: "debug".to_string(),
            file_path: Some(temp_dir.path().join("reload.log")),
            format: "text".to_string(),
        };
        init_logging(&config, true).unwrap();
        assert!(LOG_WORKER_GUARD.lock().is_some());

        let console_only = LoggingConfig { file_path: None, ..config };
        init_logging(&console_only, true).unwrap();
        assert!(LOG_WORKER_GUARD.lock().is_none());
    }
}
