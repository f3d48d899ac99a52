//! Loading and validating [`BufferQueueSettings`].

use std::fs;
use std::path::Path;

use crate::config::BufferQueueSettings;
use crate::error::ConfigError;

/// Namespace for the settings loading functions.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Parses TOML `content` and validates the result.
    ///
    /// # Errors
    /// [`ConfigError::ParseError`] for malformed TOML or unknown keys,
    /// [`ConfigError::ValidationError`] for out-of-range values.
    pub fn load_from_str(content: &str) -> Result<BufferQueueSettings, ConfigError> {
        let settings: BufferQueueSettings = toml::from_str(content)?;
        Self::validate(settings)
    }

    /// Reads and parses the settings file at `path`.
    ///
    /// # Errors
    /// [`ConfigError::ReadError`] if the file cannot be read, otherwise as
    /// [`ConfigLoader::load_from_str`].
    pub fn load_from_path(path: &Path) -> Result<BufferQueueSettings, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::load_from_str(&content)?;
        tracing::info!(path = %path.display(), queue = %settings.queue.name, "Loaded buffer queue settings");
        Ok(settings)
    }

    fn validate(mut settings: BufferQueueSettings) -> Result<BufferQueueSettings, ConfigError> {
        settings.queue.validate()?;
        settings.logging.normalize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novade_buffer_manager::BufferUsage;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    use crate::config::{LoggingConfig, QueueSettings};
    use crate::queue::{DEFAULT_QUEUE_SIZE, DEFAULT_REQUEST_TIMEOUT};

    #[test]
    fn test_empty_content_gives_defaults() {
        let settings = ConfigLoader::load_from_str("").unwrap();
        assert_eq!(settings.queue, QueueSettings::default());
        assert_eq!(settings.queue.queue_size, DEFAULT_QUEUE_SIZE);
        assert_eq!(settings.queue.request_timeout(), Some(DEFAULT_REQUEST_TIMEOUT));
        assert_eq!(settings.logging, LoggingConfig::default());
    }

    #[test]
    fn test_full_settings() {
        let settings = ConfigLoader::load_from_str(
            r#"
            [queue]
            name = "camera"
            queue_size = 4
            default_width = 1280
            default_height = 720
            default_usage = "HW_RENDER | HW_TEXTURE"
            request_timeout_ms = -1

            [logging]
            level = "DEBUG"
            file_path = "/tmp/queue.log"
            format = "Json"
            "#,
        )
        .unwrap();

        assert_eq!(
            settings.queue,
            QueueSettings {
                name: "camera".to_string(),
                queue_size: 4,
                default_width: 1280,
                default_height: 720,
                default_usage: BufferUsage::HW_RENDER | BufferUsage::HW_TEXTURE,
                request_timeout_ms: -1,
            }
        );
        assert_eq!(settings.queue.request_timeout(), None);
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.format, "json");
        assert_eq!(settings.logging.file_path, Some(PathBuf::from("/tmp/queue.log")));
    }

    #[test]
    fn test_zero_timeout_polls() {
        let settings = ConfigLoader::load_from_str("[queue]\nrequest_timeout_ms = 0").unwrap();
        assert_eq!(settings.queue.request_timeout(), Some(Duration::ZERO));
    }

    #[test]
    fn test_invalid_values_rejected() {
        for content in [
            "[queue]\nqueue_size = 0",
            "[queue]\nqueue_size = 33",
            "[queue]\ndefault_width = 10",
            "[logging]\nlevel = \"loud\"",
            "[logging]\nformat = \"xml\"",
        ] {
            let err = ConfigLoader::load_from_str(content).unwrap_err();
            assert!(matches!(err, ConfigError::ValidationError(_)), "{:?} gave {:?}", content, err);
        }
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = ConfigLoader::load_from_str("[queue]\nshared = true").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)), "got {:?}", err);
    }

    #[test]
    fn test_load_from_path() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[queue]\nname = \"from-file\"\nqueue_size = 2").unwrap();

        let settings = ConfigLoader::load_from_path(file.path()).unwrap();
        assert_eq!(settings.queue.name, "from-file");
        assert_eq!(settings.queue.queue_size, 2);

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            ConfigLoader::load_from_path(&missing),
            Err(ConfigError::ReadError { .. })
        ));
    }
}
