// novade-buffer-queue/tests/configured_queue_test.rs

use std::sync::Arc;
use std::time::Duration;

use novade_buffer_manager::{BufferManager, BufferUsage};
use novade_buffer_queue::config::ConfigLoader;
use novade_buffer_queue::error::ConfigError;
use novade_buffer_queue::{BufferQueue, ErrorCode, Fence, FlushConfig, QueueRegistry};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tracing_subscriber::{fmt, EnvFilter};

fn init_tracing() {
    let _ = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

const QUEUE_TOML: &str = r#"
[queue]
name = "surface-42"
queue_size = 2
default_width = 320
default_height = 240
default_usage = "CPU_READ | CPU_WRITE | HW_TEXTURE"
request_timeout_ms = 0

[logging]
level = "debug"
format = "json"
"#;

#[test]
fn queue_from_config_file_uses_its_defaults() {
    init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("queue.toml");
    std::fs::write(&path, QUEUE_TOML).unwrap();

    let settings = ConfigLoader::load_from_path(&path).unwrap();
    assert_eq!(settings.logging.format, "json");

    let (producer, consumer) =
        BufferQueue::from_settings(&settings.queue, Arc::new(BufferManager::new())).unwrap();
    assert_eq!(producer.name(), "surface-42");
    assert_eq!(consumer.queue_size(), 2);

    let config = producer.default_request_config();
    assert_eq!((config.width, config.height), (320, 240));
    assert_eq!(config.usage, BufferUsage::CPU_READ | BufferUsage::CPU_WRITE | BufferUsage::HW_TEXTURE);
    assert_eq!(config.timeout, Some(Duration::ZERO));

    let first = producer.request_default_buffer().unwrap();
    let second = producer.request_default_buffer().unwrap();
    assert_ne!(first.sequence, second.sequence);
    assert_eq!(
        producer.request_default_buffer().unwrap_err().code(),
        ErrorCode::QueueFull,
        "A zero timeout must fail immediately at capacity."
    );
}

#[test]
fn invalid_queue_settings_are_rejected() {
    init_tracing();
    let err = ConfigLoader::load_from_str("[queue]\nqueue_size = 33\n").unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)), "Unexpected error: {err:?}");

    let err = ConfigLoader::load_from_str("[queue]\ndefault_width = 64\n").unwrap_err();
    assert!(matches!(err, ConfigError::ValidationError(_)), "Unexpected error: {err:?}");

    let err = ConfigLoader::load_from_str("[queue]\nslots = 3\n").unwrap_err();
    assert!(matches!(err, ConfigError::ParseError(_)), "Unexpected error: {err:?}");
}

#[test]
fn registry_resolves_configured_queue() {
    init_tracing();
    let settings = ConfigLoader::load_from_str(QUEUE_TOML).unwrap();
    let registry = QueueRegistry::new();
    let (producer, consumer) =
        BufferQueue::from_settings(&settings.queue, Arc::new(BufferManager::new())).unwrap();
    let id = registry.add(producer.queue());

    // A consumer that only knows the id flushes through the resolved queue.
    let requested = producer.request_default_buffer().unwrap();
    let resolved = registry.lookup(id).expect("registered queue should resolve");
    assert_eq!(resolved.id(), consumer.id());
    producer
        .flush_buffer(requested.sequence, Fence::signaled(), &FlushConfig::default())
        .unwrap();
    let acquired = resolved.acquire_buffer().unwrap();
    assert_eq!(acquired.sequence, requested.sequence);

    drop(resolved);
    drop(acquired);
    drop(producer);
    drop(consumer);
    assert!(registry.lookup(id).is_none());
}
