//! Configuration for buffer queues.
//!
//! - [`types`]: [`BufferQueueSettings`], [`QueueSettings`] and [`LoggingConfig`].
//! - [`defaults`]: default values used by `serde` for missing keys.
//! - [`loader`]: [`ConfigLoader`], which parses TOML and validates the result.
//!
//! A loaded [`QueueSettings`] is turned into a queue with
//! [`BufferQueue::from_settings`](crate::queue::BufferQueue::from_settings).

mod defaults;
pub mod loader;
pub mod types;

pub use loader::ConfigLoader;
pub use types::{BufferQueueSettings, LoggingConfig, QueueSettings};
