//! The producing side of a buffer queue.

use std::collections::HashSet;
use std::sync::Arc;

use novade_buffer_manager::{BufferHandle, SequenceNumber};
use parking_lot::Mutex;

use crate::error::{BufferQueueError, Result};
use crate::fence::Fence;
use crate::listener::BufferQueueListener;
use crate::metadata::{
    HdrMetadata, HdrMetadataKey, HdrMetadataType, PresentTimestampType, ScalingMode, TunnelHandle,
};
use crate::queue::{BufferQueue, ConsumerDefaults, FlushConfig, QueueConfig, QueueId, RequestedBuffer};
use crate::slot::SlotState;

/// Request/flush/cancel/attach surface of a [`BufferQueue`].
///
/// The producer remembers which buffers it currently holds. Flushing, cancelling or
/// detaching a buffer it does not hold is rejected before the queue is touched.
/// Dropping the producer cancels every buffer it still holds.
pub struct BufferQueueProducer {
    queue: Arc<BufferQueue>,
    dequeued: Mutex<HashSet<SequenceNumber>>,
}

impl BufferQueueProducer {
    pub(crate) fn new(queue: Arc<BufferQueue>) -> Self {
        Self {
            queue,
            dequeued: Mutex::new(HashSet::new()),
        }
    }

    /// The queue behind this endpoint, e.g. for registering it in a
    /// [`QueueRegistry`](crate::registry::QueueRegistry).
    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn id(&self) -> QueueId {
        self.queue.id()
    }

    /// Number of buffers this producer currently holds.
    pub fn dequeued_count(&self) -> usize {
        self.dequeued.lock().len()
    }

    fn check_owned(
        &self,
        sequence: SequenceNumber,
        unknown: fn(SequenceNumber) -> BufferQueueError,
    ) -> Result<()> {
        if self.dequeued.lock().contains(&sequence) {
            return Ok(());
        }
        let err = if self.queue.contains(sequence) {
            BufferQueueError::NotOwned { sequence }
        } else {
            unknown(sequence)
        };
        tracing::warn!(queue = %self.queue.name(), %sequence, error = %err, "Producer does not hold buffer");
        Err(err)
    }

    /// Requests a buffer; see [`BufferQueue::request_buffer`].
    ///
    /// The caller must wait on [`RequestedBuffer::release_fence`] before writing.
    pub fn request_buffer(&self, config: &QueueConfig) -> Result<RequestedBuffer> {
        let requested = self.queue.request_buffer(config)?;
        self.dequeued.lock().insert(requested.sequence);
        Ok(requested)
    }

    /// Requests a buffer with the consumer's default parameters.
    pub fn request_default_buffer(&self) -> Result<RequestedBuffer> {
        self.request_buffer(&self.queue.default_request_config())
    }

    /// Submits a held buffer with the fence guarding the producer's writes.
    pub fn flush_buffer(&self, sequence: SequenceNumber, acquire_fence: Fence, config: &FlushConfig) -> Result<()> {
        self.check_owned(sequence, BufferQueueError::UnknownBuffer)?;
        self.queue.flush_buffer(sequence, acquire_fence, config)?;
        self.dequeued.lock().remove(&sequence);
        Ok(())
    }

    /// Gives a held buffer back without submitting it.
    pub fn cancel_buffer(&self, sequence: SequenceNumber) -> Result<()> {
        self.check_owned(sequence, BufferQueueError::UnknownSequence)?;
        self.queue.cancel_buffer(sequence)?;
        self.dequeued.lock().remove(&sequence);
        Ok(())
    }

    /// Inserts an externally allocated buffer; the producer then holds it.
    pub fn attach_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let sequence = buffer.sequence();
        self.queue.attach_buffer(buffer)?;
        self.dequeued.lock().insert(sequence);
        Ok(())
    }

    /// Takes a held buffer out of the queue. The queue forgets it and does not free it.
    pub fn detach_buffer(&self, sequence: SequenceNumber) -> Result<BufferHandle> {
        self.check_owned(sequence, BufferQueueError::UnknownSequence)?;
        let buffer = self.queue.detach_buffer(sequence, SlotState::Dequeued)?;
        self.dequeued.lock().remove(&sequence);
        Ok(buffer)
    }

    /// Registers `listener` for [`BufferQueueListener::on_buffer_released`], so the
    /// producer learns when the consumer hands a buffer back.
    pub fn register_release_listener<L: BufferQueueListener + 'static>(&self, listener: &Arc<L>) {
        self.queue.register_release_listener(listener);
    }

    pub fn unregister_release_listener(&self) {
        self.queue.unregister_release_listener();
    }

    pub fn set_queue_size(&self, queue_size: u32) -> Result<()> {
        self.queue.set_queue_size(queue_size)
    }

    pub fn queue_size(&self) -> u32 {
        self.queue.queue_size()
    }

    pub fn set_scaling_mode(&self, sequence: SequenceNumber, mode: ScalingMode) -> Result<()> {
        self.queue.set_scaling_mode(sequence, mode)
    }

    pub fn set_metadata(&self, sequence: SequenceNumber, metadata: Vec<HdrMetadata>) -> Result<()> {
        self.queue.set_metadata(sequence, metadata)
    }

    pub fn set_metadata_set(&self, sequence: SequenceNumber, key: HdrMetadataKey, value: Vec<u8>) -> Result<()> {
        self.queue.set_metadata_set(sequence, key, value)
    }

    pub fn query_metadata_type(&self, sequence: SequenceNumber) -> Result<HdrMetadataType> {
        self.queue.query_metadata_type(sequence)
    }

    pub fn set_tunnel_handle(&self, sequence: SequenceNumber, handle: TunnelHandle) -> Result<()> {
        self.queue.set_tunnel_handle(sequence, handle)
    }

    pub fn present_timestamp(&self, sequence: SequenceNumber, kind: PresentTimestampType) -> Result<i64> {
        self.queue.present_timestamp(sequence, kind)
    }

    pub fn defaults(&self) -> ConsumerDefaults {
        self.queue.defaults()
    }

    pub fn default_request_config(&self) -> QueueConfig {
        self.queue.default_request_config()
    }
}

impl Drop for BufferQueueProducer {
    fn drop(&mut self) {
        for sequence in self.dequeued.get_mut().drain() {
            if let Err(err) = self.queue.cancel_buffer(sequence) {
                tracing::debug!(queue = %self.queue.name(), %sequence, error = %err, "Could not cancel buffer on producer drop");
            }
        }
    }
}

impl std::fmt::Debug for BufferQueueProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueueProducer")
            .field("queue", &self.queue)
            .field("dequeued", &self.dequeued.lock().len())
            .finish()
    }
}
