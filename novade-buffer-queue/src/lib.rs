//! # Novade Buffer Queue
//!
//! Zero-copy buffer exchange between a producer (a client or render thread) and a
//! consumer (the compositor or display pipeline).
//!
//! A [`BufferQueue`] owns a fixed array of slots, each holding at most one graphics
//! buffer obtained from a [`novade_buffer_manager::BufferAllocator`]. Buffers cycle
//! through `FREE -> DEQUEUED -> QUEUED -> ACQUIRED -> FREE`:
//!
//! 1. the producer requests a buffer, waits on its release fence and renders into it,
//! 2. the producer flushes it together with an acquire fence,
//! 3. the consumer is notified, acquires it and waits on the acquire fence,
//! 4. the consumer releases it with a release fence.
//!
//! Fences ([`fence::Fence`]) carry the "hardware is done with this memory" signal
//! across the hand-off; the queue never waits on them while holding its lock.
//!
//! ## Modules
//! - [`fence`]: fences, merging and a software [`fence::SyncTimeline`].
//! - [`slot`]: the per-slot state machine.
//! - [`metadata`]: per-buffer side data keyed by sequence number.
//! - [`queue`]: the shared core.
//! - [`producer`] / [`consumer`]: the two endpoints.
//! - [`listener`]: consumer and release notifications.
//! - [`registry`]: id-to-queue resolution.
//! - [`config`], [`logging`], [`error`]: settings, tracing setup and error types.
//!
//! ```
//! use std::sync::Arc;
//! use novade_buffer_manager::BufferManager;
//! use novade_buffer_queue::{BufferQueue, Fence, FlushConfig, QueueConfig};
//!
//! let (producer, consumer) = BufferQueue::create("example", Arc::new(BufferManager::new()));
//!
//! let requested = producer.request_buffer(&QueueConfig::new(64, 64)).unwrap();
//! requested.buffer.with_pixels_mut(|pixels| pixels.fill(0xff));
//! producer.flush_buffer(requested.sequence, Fence::signaled(), &FlushConfig::default()).unwrap();
//!
//! let acquired = consumer.acquire_buffer().unwrap();
//! assert!(acquired.buffer.with_pixels(|pixels| pixels.iter().all(|p| *p == 0xff)));
//! consumer.release_buffer(acquired.sequence, Fence::signaled()).unwrap();
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod fence;
pub mod listener;
pub mod logging;
pub mod metadata;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod slot;

// Re-export key types for convenience.
pub use consumer::BufferQueueConsumer;
pub use error::{BufferQueueError, ErrorCode};
pub use fence::{Fence, FenceError, FenceStatus, SyncTimeline};
pub use listener::{BufferQueueListener, ChannelListener, QueueEvent};
pub use metadata::{
    HdrMetadata, HdrMetadataKey, HdrMetadataType, PresentTimestamp, PresentTimestampType,
    PresentTimestampTypes, ScalingMode, TunnelHandle,
};
pub use producer::BufferQueueProducer;
pub use queue::{
    AcquiredBuffer, BufferQueue, ConsumerDefaults, FlushConfig, QueueConfig, QueueId, RequestedBuffer,
    TransformType, DEFAULT_QUEUE_SIZE, MAX_QUEUE_SIZE,
};
pub use registry::QueueRegistry;
pub use slot::{Rect, SlotState};
