//! The consuming side of a buffer queue.

use std::sync::Arc;

use novade_buffer_manager::{BufferHandle, BufferUsage, SequenceNumber};

use crate::error::Result;
use crate::fence::Fence;
use crate::listener::BufferQueueListener;
use crate::metadata::{
    HdrMetadata, HdrMetadataKey, HdrMetadataType, PresentTimestamp, PresentTimestampTypes, ScalingMode,
    TunnelHandle,
};
use crate::queue::{AcquiredBuffer, BufferQueue, QueueId, TransformType};
use crate::slot::SlotState;

/// Acquire/release/notification surface of a [`BufferQueue`].
///
/// There is exactly one consumer per queue. Dropping it counts as the consumer dying:
/// cached buffers are dropped and the queue is disconnected, which wakes any producer
/// blocked in a request.
pub struct BufferQueueConsumer {
    queue: Arc<BufferQueue>,
}

impl BufferQueueConsumer {
    pub(crate) fn new(queue: Arc<BufferQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn id(&self) -> QueueId {
        self.queue.id()
    }

    /// Takes the oldest flushed buffer. Wait on [`AcquiredBuffer::acquire_fence`] before
    /// reading it.
    pub fn acquire_buffer(&self) -> Result<AcquiredBuffer> {
        self.queue.acquire_buffer()
    }

    /// Returns an acquired buffer with the fence guarding the consumer's reads.
    pub fn release_buffer(&self, sequence: SequenceNumber, release_fence: Fence) -> Result<()> {
        self.queue.release_buffer(sequence, release_fence)
    }

    /// Takes an acquired buffer out of the queue without freeing it.
    pub fn detach_buffer(&self, sequence: SequenceNumber) -> Result<BufferHandle> {
        self.queue.detach_buffer(sequence, SlotState::Acquired)
    }

    pub fn register_listener<L: BufferQueueListener + 'static>(&self, listener: &Arc<L>) {
        self.queue.register_listener(listener);
    }

    pub fn unregister_listener(&self) {
        self.queue.unregister_listener();
    }

    pub fn set_supported_present_timestamps(&self, types: PresentTimestampTypes) {
        self.queue.set_supported_present_timestamps(types);
    }

    pub fn set_present_timestamp(&self, sequence: SequenceNumber, timestamp: PresentTimestamp) -> Result<()> {
        self.queue.set_present_timestamp(sequence, timestamp)
    }

    pub fn scaling_mode(&self, sequence: SequenceNumber) -> Result<ScalingMode> {
        self.queue.scaling_mode(sequence)
    }

    pub fn metadata(&self, sequence: SequenceNumber) -> Result<Vec<HdrMetadata>> {
        self.queue.metadata(sequence)
    }

    pub fn metadata_set(&self, sequence: SequenceNumber, key: HdrMetadataKey) -> Result<Vec<u8>> {
        self.queue.metadata_set(sequence, key)
    }

    pub fn query_metadata_type(&self, sequence: SequenceNumber) -> Result<HdrMetadataType> {
        self.queue.query_metadata_type(sequence)
    }

    pub fn tunnel_handle(&self, sequence: SequenceNumber) -> Result<TunnelHandle> {
        self.queue.tunnel_handle(sequence)
    }

    pub fn set_default_width_and_height(&self, width: u32, height: u32) -> Result<()> {
        self.queue.set_default_width_and_height(width, height)
    }

    pub fn set_default_usage(&self, usage: BufferUsage) -> Result<()> {
        self.queue.set_default_usage(usage)
    }

    pub fn set_transform(&self, transform: TransformType) -> Result<()> {
        self.queue.set_transform(transform)
    }

    pub fn clean_cache(&self) -> Result<()> {
        self.queue.clean_cache()
    }

    pub fn go_background(&self) -> Result<()> {
        self.queue.go_background()
    }

    pub fn queue_size(&self) -> u32 {
        self.queue.queue_size()
    }

    pub fn dump(&self) -> String {
        self.queue.dump()
    }

    /// Disconnects the queue without dropping the consumer.
    pub fn disconnect(&self) {
        self.queue.disconnect();
    }
}

impl Drop for BufferQueueConsumer {
    fn drop(&mut self) {
        self.queue.on_consumer_died();
    }
}

impl std::fmt::Debug for BufferQueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueueConsumer").field("queue", &self.queue).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::listener::{ChannelListener, QueueEvent};
    use crate::queue::{FlushConfig, QueueConfig};
    use novade_buffer_manager::BufferManager;
    use std::time::Duration;

    #[test]
    fn test_detach_requires_acquired() {
        let manager = Arc::new(BufferManager::new());
        let (producer, consumer) = BufferQueue::create("consumer-test", manager);
        let requested = producer
            .request_buffer(&QueueConfig::new(8, 8).with_timeout(Some(Duration::ZERO)))
            .unwrap();
        assert_eq!(
            consumer.detach_buffer(requested.sequence).unwrap_err().code(),
            ErrorCode::InvalidOperating
        );

        producer
            .flush_buffer(requested.sequence, Fence::signaled(), &FlushConfig::default())
            .unwrap();
        let acquired = consumer.acquire_buffer().unwrap();
        let detached = consumer.detach_buffer(acquired.sequence).unwrap();
        assert!(detached.ptr_eq(&requested.buffer));
        assert_eq!(producer.queue().buffer_count(), 0);
    }

    #[test]
    fn test_drop_disconnects_and_frees_cache() {
        let manager = Arc::new(BufferManager::new());
        let (producer, consumer) = BufferQueue::create("consumer-drop", manager.clone());
        let (listener, events) = ChannelListener::new();
        consumer.register_listener(&listener);

        let requested = producer
            .request_buffer(&QueueConfig::new(8, 8).with_timeout(Some(Duration::ZERO)))
            .unwrap();
        producer.cancel_buffer(requested.sequence).unwrap();

        drop(consumer);
        assert!(producer.queue().is_disconnected());
        assert!(!manager.is_live(requested.sequence));
        let received: Vec<_> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![QueueEvent::BufferDeleted(requested.sequence), QueueEvent::Disconnected]
        );
        let err = producer.request_buffer(&QueueConfig::new(8, 8)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoConsumer);
    }
}
