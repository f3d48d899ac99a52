//! The shared buffer queue.
//!
//! [`BufferQueue`] owns the slot array, the FIFO of flushed buffers, the per-buffer
//! metadata and the consumer-provided defaults, all behind one mutex. Every operation
//! takes the lock for its whole critical section and releases it before any listener
//! callback runs. Fence waits never happen under the lock; fences are copied out and
//! waited on by the endpoints.
//!
//! The only intentional blocking point is [`BufferQueue::request_buffer`] when the
//! queue is at capacity. It parks on a condition variable that is signaled whenever a
//! slot returns to FREE, a slot is retired, the queue grows, or the queue is
//! disconnected.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use novade_buffer_manager::{
    BufferAllocator, BufferHandle, BufferRequest, BufferUsage, PixelFormat, SequenceNumber,
    MAX_STRIDE_ALIGNMENT, MIN_STRIDE_ALIGNMENT,
};
use parking_lot::{Condvar, Mutex};

use crate::config::QueueSettings;
use crate::consumer::BufferQueueConsumer;
use crate::error::{BufferQueueError, ConfigError, Result};
use crate::fence::{Fence, FenceStatus};
use crate::listener::{deliver, BufferQueueListener, QueueEvent};
use crate::metadata::{
    HdrMetadata, HdrMetadataKey, HdrMetadataType, MetadataStore, PresentTimestamp,
    PresentTimestampType, PresentTimestampTypes, ScalingMode, TunnelHandle,
};
use crate::producer::BufferQueueProducer;
use crate::slot::{BufferOrigin, BufferSlot, Rect, SlotState};

/// Upper bound for [`BufferQueue::set_queue_size`].
pub const MAX_QUEUE_SIZE: u32 = 32;
/// Queue size of a freshly created queue.
pub const DEFAULT_QUEUE_SIZE: u32 = 3;
/// Request timeout used by [`BufferQueue::default_request_config`] unless configured.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);
/// Row alignment used by [`QueueConfig::new`].
pub const DEFAULT_STRIDE_ALIGNMENT: u32 = 8;

/// Process-unique identifier of a queue.
///
/// The upper 32 bits carry the process id, the lower 32 bits a per-process counter, so
/// ids stay distinct when handed to another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(u64);

impl QueueId {
    fn next() -> Self {
        static NEXT_QUEUE: AtomicU32 = AtomicU32::new(0);
        let counter = NEXT_QUEUE.fetch_add(1, Ordering::Relaxed);
        QueueId((u64::from(std::process::id()) << 32) | u64::from(counter))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transform the consumer will apply when presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransformType {
    #[default]
    None,
    Rotate90,
    Rotate180,
    Rotate270,
    FlipH,
    FlipV,
}

/// Buffer parameters suggested by the consumer to the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerDefaults {
    /// Default width, 0 until the consumer sets it.
    pub width: u32,
    /// Default height, 0 until the consumer sets it.
    pub height: u32,
    pub usage: BufferUsage,
    pub transform: TransformType,
}

impl Default for ConsumerDefaults {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            usage: BufferUsage::default(),
            transform: TransformType::None,
        }
    }
}

/// Parameters of a [`BufferQueue::request_buffer`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    /// Row alignment in bytes, a power of two in `[4, 32]`.
    pub stride_alignment: u32,
    /// How long to wait for a free buffer when the queue is at capacity. `None` waits
    /// until one frees up or the queue is disconnected; `Some(Duration::ZERO)` fails
    /// immediately.
    pub timeout: Option<Duration>,
}

impl QueueConfig {
    /// RGBA8888 with default usage, 8 byte alignment and [`DEFAULT_REQUEST_TIMEOUT`].
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Rgba8888,
            usage: BufferUsage::default(),
            stride_alignment: DEFAULT_STRIDE_ALIGNMENT,
            timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_usage(mut self, usage: BufferUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_stride_alignment(mut self, stride_alignment: u32) -> Self {
        self.stride_alignment = stride_alignment;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The allocation request this config describes.
    pub fn buffer_request(&self) -> BufferRequest {
        BufferRequest {
            width: self.width,
            height: self.height,
            format: self.format,
            usage: self.usage,
            stride_alignment: self.stride_alignment,
        }
    }

    /// # Errors
    /// [`BufferQueueError::InvalidArguments`] for a zero dimension or a stride
    /// alignment outside `[4, 32]` or not a power of two.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(BufferQueueError::InvalidArguments(format!(
                "buffer size must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if !(MIN_STRIDE_ALIGNMENT..=MAX_STRIDE_ALIGNMENT).contains(&self.stride_alignment)
            || !self.stride_alignment.is_power_of_two()
        {
            return Err(BufferQueueError::InvalidArguments(format!(
                "stride alignment {} must be a power of two in [{}, {}]",
                self.stride_alignment, MIN_STRIDE_ALIGNMENT, MAX_STRIDE_ALIGNMENT
            )));
        }
        Ok(())
    }
}

/// Parameters of a [`BufferQueue::flush_buffer`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushConfig {
    pub damage: Rect,
    /// Presentation timestamp in nanoseconds. `0` is replaced by the flush time.
    pub timestamp: i64,
}

impl FlushConfig {
    pub fn new(damage: Rect, timestamp: i64) -> Self {
        Self { damage, timestamp }
    }

    /// # Errors
    /// [`BufferQueueError::InvalidArguments`] for a negative damage width or height.
    pub fn validate(&self) -> Result<()> {
        if self.damage.w < 0 || self.damage.h < 0 {
            return Err(BufferQueueError::InvalidArguments(format!(
                "damage size must not be negative, got {}x{}",
                self.damage.w, self.damage.h
            )));
        }
        Ok(())
    }
}

/// Result of a successful [`BufferQueue::request_buffer`].
#[derive(Debug, Clone)]
pub struct RequestedBuffer {
    pub sequence: SequenceNumber,
    pub buffer: BufferHandle,
    /// Must be waited on before writing to the buffer.
    pub release_fence: Fence,
    /// Buffers retired since the previous successful request.
    pub deleting: Vec<SequenceNumber>,
}

/// Result of a successful [`BufferQueue::acquire_buffer`].
#[derive(Debug, Clone)]
pub struct AcquiredBuffer {
    pub sequence: SequenceNumber,
    pub buffer: BufferHandle,
    /// Must be waited on before reading from the buffer.
    pub acquire_fence: Fence,
    pub damage: Rect,
    pub timestamp: i64,
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

struct QueueState {
    slots: Vec<BufferSlot>,
    queued: VecDeque<SequenceNumber>,
    queue_size: u32,
    current_request: Option<BufferRequest>,
    metadata: MetadataStore,
    disconnected: bool,
    defaults: ConsumerDefaults,
    supported_timestamps: PresentTimestampTypes,
    deleting: Vec<SequenceNumber>,
}

impl QueueState {
    fn index_of(&self, sequence: SequenceNumber) -> Option<usize> {
        self.slots.iter().position(|slot| slot.sequence() == Some(sequence))
    }

    fn bound_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_bound()).count()
    }

    fn capacity(&self) -> usize {
        self.queue_size as usize
    }
}

/// Buffer exchange between one producer and one consumer.
pub struct BufferQueue {
    name: String,
    id: QueueId,
    allocator: Arc<dyn BufferAllocator>,
    default_timeout: Option<Duration>,
    state: Mutex<QueueState>,
    slot_freed: Condvar,
    listener: Mutex<Option<Weak<dyn BufferQueueListener>>>,
    release_listener: Mutex<Option<Weak<dyn BufferQueueListener>>>,
}

impl BufferQueue {
    /// Creates a queue with [`DEFAULT_QUEUE_SIZE`] and no endpoints.
    pub fn new(name: impl Into<String>, allocator: Arc<dyn BufferAllocator>) -> Arc<Self> {
        Self::with_options(
            name.into(),
            allocator,
            DEFAULT_QUEUE_SIZE,
            ConsumerDefaults::default(),
            Some(DEFAULT_REQUEST_TIMEOUT),
        )
    }

    /// Creates a queue and its producer and consumer endpoints.
    pub fn create(
        name: impl Into<String>,
        allocator: Arc<dyn BufferAllocator>,
    ) -> (BufferQueueProducer, BufferQueueConsumer) {
        let queue = Self::new(name, allocator);
        (BufferQueueProducer::new(Arc::clone(&queue)), BufferQueueConsumer::new(queue))
    }

    /// Creates a queue and its endpoints from loaded settings.
    ///
    /// # Errors
    /// [`ConfigError::ValidationError`] if `settings` do not validate.
    pub fn from_settings(
        settings: &QueueSettings,
        allocator: Arc<dyn BufferAllocator>,
    ) -> std::result::Result<(BufferQueueProducer, BufferQueueConsumer), ConfigError> {
        settings.validate()?;
        let defaults = ConsumerDefaults {
            width: settings.default_width,
            height: settings.default_height,
            usage: settings.default_usage,
            transform: TransformType::None,
        };
        let queue = Self::with_options(
            settings.name.clone(),
            allocator,
            settings.queue_size,
            defaults,
            settings.request_timeout(),
        );
        Ok((BufferQueueProducer::new(Arc::clone(&queue)), BufferQueueConsumer::new(queue)))
    }

    fn with_options(
        name: String,
        allocator: Arc<dyn BufferAllocator>,
        queue_size: u32,
        defaults: ConsumerDefaults,
        default_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let id = QueueId::next();
        tracing::info!(queue = %name, %id, queue_size, "Created buffer queue");
        Arc::new(Self {
            name,
            id,
            allocator,
            default_timeout,
            state: Mutex::new(QueueState {
                slots: (0..MAX_QUEUE_SIZE).map(|_| BufferSlot::new()).collect(),
                queued: VecDeque::new(),
                queue_size,
                current_request: None,
                metadata: MetadataStore::new(),
                disconnected: false,
                defaults,
                supported_timestamps: PresentTimestampTypes::empty(),
                deleting: Vec::new(),
            }),
            slot_freed: Condvar::new(),
            listener: Mutex::new(None),
            release_listener: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Runs `op` under the lock after checking the queue is connected, then delivers
    /// the events it produced.
    fn with_state<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut QueueState, &mut Vec<QueueEvent>) -> Result<R>,
    ) -> Result<R> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            if state.disconnected {
                Err(BufferQueueError::Disconnected)
            } else {
                f(&mut *state, &mut events)
            }
        };
        if let Err(err) = &result {
            tracing::warn!(queue = %self.name, op, error = %err, "Buffer queue operation rejected");
        }
        self.dispatch(events);
        result
    }

    fn dispatch(&self, events: Vec<QueueEvent>) {
        if events.is_empty() {
            return;
        }
        let listener = self.listener.lock().as_ref().and_then(Weak::upgrade);
        let release_listener = self.release_listener.lock().as_ref().and_then(Weak::upgrade);
        for event in events {
            let target = match event {
                QueueEvent::BufferReleased(_) => release_listener.as_ref(),
                _ => listener.as_ref(),
            };
            match target {
                Some(target) => deliver(target.as_ref(), event),
                None => tracing::trace!(queue = %self.name, ?event, "No live listener for queue event"),
            }
        }
    }

    /// Unbinds the slot at `index`, frees allocated memory and drops its metadata.
    fn retire(&self, state: &mut QueueState, index: usize, events: &mut Vec<QueueEvent>) {
        let Some((buffer, origin)) = state.slots[index].unbind() else {
            return;
        };
        let sequence = buffer.sequence();
        if origin == BufferOrigin::Allocated {
            if let Err(err) = self.allocator.free(&buffer) {
                tracing::warn!(queue = %self.name, %sequence, error = %err, "Allocator rejected free of retired buffer");
            }
        }
        state.metadata.remove(sequence);
        state.queued.retain(|queued| *queued != sequence);
        state.deleting.push(sequence);
        events.push(QueueEvent::BufferDeleted(sequence));
        tracing::debug!(queue = %self.name, %sequence, ?origin, "Retired buffer");
        self.slot_freed.notify_all();
    }

    /// Retires every FREE slot and marks all other bound slots stale.
    fn drop_cached_buffers(&self, state: &mut QueueState, events: &mut Vec<QueueEvent>) {
        for index in 0..state.slots.len() {
            let slot = &mut state.slots[index];
            if !slot.is_bound() {
                continue;
            }
            if slot.state() == SlotState::Free {
                self.retire(state, index, events);
            } else {
                slot.stale = true;
            }
        }
    }

    /// Invalidates every bound buffer that cannot satisfy `request`.
    fn apply_request_config(&self, state: &mut QueueState, request: &BufferRequest, events: &mut Vec<QueueEvent>) {
        tracing::debug!(queue = %self.name, width = request.width, height = request.height, format = ?request.format, "Buffer request config changed");
        state.current_request = Some(*request);
        for index in 0..state.slots.len() {
            let slot = &mut state.slots[index];
            let mismatched = !slot.stale
                && slot.buffer().map_or(false, |buffer| !buffer.descriptor().matches(request));
            if !mismatched {
                continue;
            }
            if slot.state() == SlotState::Free {
                self.retire(state, index, events);
            } else {
                tracing::debug!(queue = %self.name, sequence = ?slot.sequence(), state = %slot.state(), "Marked buffer stale");
                slot.stale = true;
            }
        }
    }

    fn dequeue_slot(&self, state: &mut QueueState, index: usize) -> Option<RequestedBuffer> {
        let slot = &mut state.slots[index];
        let buffer = slot.buffer().cloned()?;
        slot.transition(SlotState::Dequeued);
        let release_fence = slot.release_fence.clone();
        Some(RequestedBuffer {
            sequence: buffer.sequence(),
            buffer,
            release_fence,
            deleting: std::mem::take(&mut state.deleting),
        })
    }

    fn try_dequeue(&self, state: &mut QueueState, request: &BufferRequest) -> Result<Option<RequestedBuffer>> {
        let ready = state.slots.iter().position(|slot| {
            slot.is_reusable_for(request) && slot.release_fence.status() == FenceStatus::Signaled
        });
        if let Some(index) = ready {
            return Ok(self.dequeue_slot(state, index));
        }

        if state.bound_count() < state.capacity() {
            if let Some(index) = state.slots.iter().position(|slot| !slot.is_bound()) {
                let buffer = self.allocator.allocate(request).map_err(|err| {
                    tracing::error!(queue = %self.name, error = %err, "Buffer allocation failed");
                    BufferQueueError::from(err)
                })?;
                tracing::debug!(
                    queue = %self.name,
                    sequence = %buffer.sequence(),
                    width = request.width,
                    height = request.height,
                    "Allocated buffer"
                );
                state.slots[index].bind(buffer, BufferOrigin::Allocated);
                return Ok(self.dequeue_slot(state, index));
            }
        }

        // Still fenced by the consumer; the caller waits on the returned fence.
        let pending = state.slots.iter().position(|slot| slot.is_reusable_for(request));
        Ok(pending.and_then(|index| self.dequeue_slot(state, index)))
    }

    /// Hands a buffer matching `config` to the producer.
    ///
    /// Reuses a FREE matching buffer, preferring one whose release fence has already
    /// signaled, or allocates a new one while below the queue size. At capacity the
    /// call blocks for up to `config.timeout` until a buffer returns to FREE.
    ///
    /// Buffers that no longer match the requested parameters are marked stale and
    /// returned to the allocator once FREE.
    ///
    /// # Errors
    /// - [`BufferQueueError::InvalidArguments`] if `config` is malformed.
    /// - [`BufferQueueError::AllocationFailed`] if the allocator fails.
    /// - [`BufferQueueError::QueueFull`] if the timeout elapsed.
    /// - [`BufferQueueError::Disconnected`] if the queue is or becomes disconnected.
    pub fn request_buffer(&self, config: &QueueConfig) -> Result<RequestedBuffer> {
        config.validate()?;
        let request = config.buffer_request();
        let deadline = config.timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        let mut events = Vec::new();
        let mut state = self.state.lock();
        let mut expired = false;
        let result = loop {
            if state.disconnected {
                break Err(BufferQueueError::Disconnected);
            }
            if state.current_request != Some(request) {
                self.apply_request_config(&mut state, &request, &mut events);
            }
            match self.try_dequeue(&mut state, &request) {
                Ok(Some(requested)) => break Ok(requested),
                Ok(None) => {}
                Err(err) => break Err(err),
            }
            if expired {
                break Err(BufferQueueError::QueueFull { queue_size: state.queue_size });
            }
            tracing::debug!(queue = %self.name, queue_size = state.queue_size, "No free buffer, waiting");
            expired = match deadline {
                None => {
                    self.slot_freed.wait(&mut state);
                    false
                }
                Some(deadline) => self.slot_freed.wait_until(&mut state, deadline).timed_out(),
            };
        };
        drop(state);

        match &result {
            Ok(requested) => {
                tracing::trace!(queue = %self.name, sequence = %requested.sequence, "Buffer requested")
            }
            Err(err) => tracing::warn!(queue = %self.name, error = %err, "Buffer request failed"),
        }
        self.dispatch(events);
        result
    }

    /// Submits a DEQUEUED buffer to the consumer.
    ///
    /// A buffer that went stale while dequeued is retired instead of queued; the call
    /// still succeeds but the consumer is not notified.
    pub fn flush_buffer(&self, sequence: SequenceNumber, acquire_fence: Fence, config: &FlushConfig) -> Result<()> {
        config.validate()?;
        self.with_state("flush", |state, events| {
            let index = state.index_of(sequence).ok_or(BufferQueueError::UnknownBuffer(sequence))?;
            state.slots[index].require(SlotState::Dequeued)?;

            if state.slots[index].is_stale() {
                state.slots[index].transition(SlotState::Free);
                self.retire(state, index, events);
                return Ok(());
            }

            let timestamp = if config.timestamp == 0 { now_nanos() } else { config.timestamp };
            let slot = &mut state.slots[index];
            slot.transition(SlotState::Queued);
            slot.acquire_fence = acquire_fence;
            slot.damage = config.damage;
            slot.timestamp = timestamp;
            state.queued.push_back(sequence);
            events.push(QueueEvent::BufferAvailable);
            tracing::trace!(queue = %self.name, %sequence, timestamp, "Buffer flushed");
            Ok(())
        })
    }

    /// Returns a DEQUEUED buffer to FREE without notifying the consumer.
    pub fn cancel_buffer(&self, sequence: SequenceNumber) -> Result<()> {
        self.with_state("cancel", |state, events| {
            let index = state.index_of(sequence).ok_or(BufferQueueError::UnknownSequence(sequence))?;
            let slot = &mut state.slots[index];
            slot.require(SlotState::Dequeued)?;
            slot.transition(SlotState::Free);
            if slot.is_stale() {
                self.retire(state, index, events);
            }
            self.slot_freed.notify_all();
            Ok(())
        })
    }

    /// Takes the oldest QUEUED buffer.
    ///
    /// # Errors
    /// [`BufferQueueError::NoBuffer`] if nothing is queued.
    pub fn acquire_buffer(&self) -> Result<AcquiredBuffer> {
        self.with_state("acquire", |state, _| {
            while let Some(sequence) = state.queued.pop_front() {
                let Some(index) = state.index_of(sequence) else {
                    continue;
                };
                let slot = &mut state.slots[index];
                slot.require(SlotState::Queued)?;
                let Some(buffer) = slot.buffer().cloned() else {
                    continue;
                };
                slot.transition(SlotState::Acquired);
                return Ok(AcquiredBuffer {
                    sequence,
                    buffer,
                    acquire_fence: slot.acquire_fence.clone(),
                    damage: slot.damage,
                    timestamp: slot.timestamp,
                });
            }
            Err(BufferQueueError::NoBuffer)
        })
    }

    /// Returns an ACQUIRED buffer to FREE; the next request of it receives `release_fence`.
    pub fn release_buffer(&self, sequence: SequenceNumber, release_fence: Fence) -> Result<()> {
        self.with_state("release", |state, events| {
            let index = state.index_of(sequence).ok_or(BufferQueueError::UnknownSequence(sequence))?;
            let slot = &mut state.slots[index];
            slot.require(SlotState::Acquired)?;
            slot.transition(SlotState::Free);
            slot.release_fence = release_fence;
            events.push(QueueEvent::BufferReleased(sequence));
            if slot.is_stale() {
                self.retire(state, index, events);
            }
            self.slot_freed.notify_all();
            Ok(())
        })
    }

    /// Inserts an externally allocated buffer as DEQUEUED.
    ///
    /// At capacity, FREE buffers are retired to make room. The queue never frees an
    /// attached buffer through the allocator.
    ///
    /// # Errors
    /// - [`BufferQueueError::InvalidArguments`] if the buffer is already in the queue.
    /// - [`BufferQueueError::QueueFull`] if no room can be made.
    pub fn attach_buffer(&self, buffer: BufferHandle) -> Result<()> {
        self.with_state("attach", |state, events| {
            let sequence = buffer.sequence();
            if state.index_of(sequence).is_some() {
                return Err(BufferQueueError::InvalidArguments(format!(
                    "buffer {} is already in the queue",
                    sequence
                )));
            }

            if state.bound_count() >= state.capacity() {
                let free: Vec<usize> = state
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.is_bound() && slot.state() == SlotState::Free)
                    .map(|(index, _)| index)
                    .collect();
                for index in free {
                    if state.bound_count() < state.capacity() {
                        break;
                    }
                    self.retire(state, index, events);
                }
            }
            let index = state
                .slots
                .iter()
                .position(|slot| !slot.is_bound())
                .filter(|_| state.bound_count() < state.capacity())
                .ok_or(BufferQueueError::QueueFull { queue_size: state.queue_size })?;

            let slot = &mut state.slots[index];
            slot.bind(buffer, BufferOrigin::Attached);
            slot.transition(SlotState::Dequeued);
            tracing::debug!(queue = %self.name, %sequence, "Attached buffer");
            Ok(())
        })
    }

    /// Removes a buffer in `expected` state from the queue without freeing it.
    ///
    /// The buffer is reported as deleted, both to the listener and in the next
    /// request's deleted list, so cached mappings of it get dropped.
    pub(crate) fn detach_buffer(&self, sequence: SequenceNumber, expected: SlotState) -> Result<BufferHandle> {
        self.with_state("detach", |state, events| {
            let index = state.index_of(sequence).ok_or(BufferQueueError::UnknownSequence(sequence))?;
            state.slots[index].require(expected)?;
            let (buffer, _) = state.slots[index]
                .unbind()
                .ok_or(BufferQueueError::UnknownSequence(sequence))?;
            state.metadata.remove(sequence);
            state.deleting.push(sequence);
            events.push(QueueEvent::BufferDeleted(sequence));
            self.slot_freed.notify_all();
            tracing::debug!(queue = %self.name, %sequence, "Detached buffer");
            Ok(buffer)
        })
    }

    /// `true` if a slot is bound to `sequence`.
    pub fn contains(&self, sequence: SequenceNumber) -> bool {
        self.state.lock().index_of(sequence).is_some()
    }

    /// Current state of the buffer `sequence`.
    pub fn slot_state(&self, sequence: SequenceNumber) -> Option<SlotState> {
        let state = self.state.lock();
        state.index_of(sequence).map(|index| state.slots[index].state())
    }

    /// Number of buffers currently bound to the queue.
    pub fn buffer_count(&self) -> usize {
        self.state.lock().bound_count()
    }

    /// Changes the number of buffers the queue may hold.
    ///
    /// Shrinking retires FREE buffers first. Buffers still in flight beyond the new
    /// size are marked stale and retired when they come back to FREE.
    ///
    /// # Errors
    /// [`BufferQueueError::InvalidArguments`] if `queue_size` is 0 or above
    /// [`MAX_QUEUE_SIZE`].
    pub fn set_queue_size(&self, queue_size: u32) -> Result<()> {
        if queue_size == 0 || queue_size > MAX_QUEUE_SIZE {
            return Err(BufferQueueError::InvalidArguments(format!(
                "queue size {} not in [1, {}]",
                queue_size, MAX_QUEUE_SIZE
            )));
        }
        self.with_state("set_queue_size", |state, events| {
            let previous = state.queue_size;
            state.queue_size = queue_size;

            let bound = state.bound_count();
            if bound > state.capacity() {
                let mut excess = bound - state.capacity();
                let free: Vec<usize> = state
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.is_bound() && slot.state() == SlotState::Free)
                    .map(|(index, _)| index)
                    .collect();
                for index in free.into_iter().take(excess) {
                    self.retire(state, index, events);
                    excess -= 1;
                }

                let pending = state.slots.iter().filter(|slot| slot.is_bound() && slot.stale).count();
                let to_mark = excess.saturating_sub(pending);
                for slot in state
                    .slots
                    .iter_mut()
                    .filter(|slot| slot.is_bound() && !slot.stale)
                    .take(to_mark)
                {
                    slot.stale = true;
                }
            }

            self.slot_freed.notify_all();
            tracing::info!(queue = %self.name, previous, queue_size, "Queue size changed");
            Ok(())
        })
    }

    pub fn queue_size(&self) -> u32 {
        self.state.lock().queue_size
    }

    fn with_known<R>(
        &self,
        op: &'static str,
        sequence: SequenceNumber,
        f: impl FnOnce(&mut MetadataStore) -> Result<R>,
    ) -> Result<R> {
        self.with_state(op, |state, _| {
            if state.index_of(sequence).is_none() {
                return Err(BufferQueueError::UnknownSequence(sequence));
            }
            f(&mut state.metadata)
        })
    }

    pub fn set_scaling_mode(&self, sequence: SequenceNumber, mode: ScalingMode) -> Result<()> {
        self.with_known("set_scaling_mode", sequence, |store| {
            store.set_scaling_mode(sequence, mode);
            Ok(())
        })
    }

    pub fn scaling_mode(&self, sequence: SequenceNumber) -> Result<ScalingMode> {
        self.with_known("scaling_mode", sequence, |store| Ok(store.scaling_mode(sequence)))
    }

    pub fn set_metadata(&self, sequence: SequenceNumber, metadata: Vec<HdrMetadata>) -> Result<()> {
        self.with_known("set_metadata", sequence, |store| store.set_metadata(sequence, metadata))
    }

    pub fn metadata(&self, sequence: SequenceNumber) -> Result<Vec<HdrMetadata>> {
        self.with_known("metadata", sequence, |store| store.metadata(sequence))
    }

    pub fn set_metadata_set(&self, sequence: SequenceNumber, key: HdrMetadataKey, value: Vec<u8>) -> Result<()> {
        self.with_known("set_metadata_set", sequence, |store| store.set_metadata_set(sequence, key, value))
    }

    pub fn metadata_set(&self, sequence: SequenceNumber, key: HdrMetadataKey) -> Result<Vec<u8>> {
        self.with_known("metadata_set", sequence, |store| store.metadata_set(sequence, key))
    }

    pub fn query_metadata_type(&self, sequence: SequenceNumber) -> Result<HdrMetadataType> {
        self.with_known("query_metadata_type", sequence, |store| Ok(store.query_metadata_type(sequence)))
    }

    /// Sets the tunnel handle of `sequence` and notifies the listener.
    ///
    /// # Errors
    /// [`BufferQueueError::TunnelHandleAlreadySet`] on a second call for the same buffer.
    pub fn set_tunnel_handle(&self, sequence: SequenceNumber, handle: TunnelHandle) -> Result<()> {
        self.with_state("set_tunnel_handle", |state, events| {
            if state.index_of(sequence).is_none() {
                return Err(BufferQueueError::UnknownSequence(sequence));
            }
            state.metadata.set_tunnel_handle(sequence, handle)?;
            events.push(QueueEvent::TunnelHandleChanged(sequence));
            Ok(())
        })
    }

    pub fn tunnel_handle(&self, sequence: SequenceNumber) -> Result<TunnelHandle> {
        self.with_known("tunnel_handle", sequence, |store| store.tunnel_handle(sequence))
    }

    pub fn set_supported_present_timestamps(&self, types: PresentTimestampTypes) {
        self.state.lock().supported_timestamps = types;
    }

    pub fn supported_present_timestamps(&self) -> PresentTimestampTypes {
        self.state.lock().supported_timestamps
    }

    pub fn set_present_timestamp(&self, sequence: SequenceNumber, timestamp: PresentTimestamp) -> Result<()> {
        self.with_state("set_present_timestamp", |state, _| {
            if state.index_of(sequence).is_none() {
                return Err(BufferQueueError::UnknownSequence(sequence));
            }
            if !state.supported_timestamps.contains(timestamp.kind.as_flag()) {
                return Err(BufferQueueError::NotSupported(format!(
                    "present timestamp type {:?}",
                    timestamp.kind
                )));
            }
            state.metadata.set_present_timestamp(sequence, timestamp);
            Ok(())
        })
    }

    /// Present time of `sequence`.
    ///
    /// [`PresentTimestampType::Delay`] is reported as stored.
    /// [`PresentTimestampType::Timestamp`] is reported relative to the flush timestamp.
    ///
    /// # Errors
    /// - [`BufferQueueError::NotSupported`] if the consumer does not report `kind`.
    /// - [`BufferQueueError::MetadataUnset`] if no time of `kind` was reported yet.
    pub fn present_timestamp(&self, sequence: SequenceNumber, kind: PresentTimestampType) -> Result<i64> {
        self.with_state("present_timestamp", |state, _| {
            let index = state.index_of(sequence).ok_or(BufferQueueError::UnknownSequence(sequence))?;
            if !state.supported_timestamps.contains(kind.as_flag()) {
                return Err(BufferQueueError::NotSupported(format!("present timestamp type {:?}", kind)));
            }
            let time = state.metadata.present_timestamp(sequence, kind)?;
            match kind {
                PresentTimestampType::Delay => Ok(time),
                PresentTimestampType::Timestamp => {
                    let flushed = state.slots[index].timestamp;
                    time.checked_sub(flushed).ok_or_else(|| {
                        BufferQueueError::InvalidArguments(format!(
                            "present time {} is not representable relative to flush time {}",
                            time, flushed
                        ))
                    })
                }
            }
        })
    }

    pub fn defaults(&self) -> ConsumerDefaults {
        self.state.lock().defaults
    }

    /// # Errors
    /// [`BufferQueueError::InvalidArguments`] if either dimension is 0.
    pub fn set_default_width_and_height(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(BufferQueueError::InvalidArguments(format!(
                "default size must be positive, got {}x{}",
                width, height
            )));
        }
        self.with_state("set_default_width_and_height", |state, _| {
            state.defaults.width = width;
            state.defaults.height = height;
            Ok(())
        })
    }

    pub fn set_default_usage(&self, usage: BufferUsage) -> Result<()> {
        self.with_state("set_default_usage", |state, _| {
            state.defaults.usage = usage;
            Ok(())
        })
    }

    pub fn set_transform(&self, transform: TransformType) -> Result<()> {
        self.with_state("set_transform", |state, _| {
            state.defaults.transform = transform;
            Ok(())
        })
    }

    /// Request parameters built from the consumer defaults and the configured timeout.
    pub fn default_request_config(&self) -> QueueConfig {
        let defaults = self.defaults();
        QueueConfig::new(defaults.width, defaults.height)
            .with_usage(defaults.usage)
            .with_timeout(self.default_timeout)
    }

    /// Registers the single listener, replacing any previous one. Only a weak reference
    /// is kept.
    pub fn register_listener<L: BufferQueueListener + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<L> = Arc::downgrade(listener);
        let weak: Weak<dyn BufferQueueListener> = weak;
        *self.listener.lock() = Some(weak);
        tracing::debug!(queue = %self.name, "Listener registered");
    }

    pub fn unregister_listener(&self) {
        *self.listener.lock() = None;
    }

    /// Registers the producer-side listener that receives
    /// [`on_buffer_released`](BufferQueueListener::on_buffer_released), replacing any
    /// previous one. Only a weak reference is kept.
    pub fn register_release_listener<L: BufferQueueListener + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<L> = Arc::downgrade(listener);
        let weak: Weak<dyn BufferQueueListener> = weak;
        *self.release_listener.lock() = Some(weak);
        tracing::debug!(queue = %self.name, "Release listener registered");
    }

    pub fn unregister_release_listener(&self) {
        *self.release_listener.lock() = None;
    }

    /// Drops all cached buffers on the consumer's request.
    pub fn clean_cache(&self) -> Result<()> {
        self.with_state("clean_cache", |state, events| {
            events.push(QueueEvent::CleanCache);
            self.drop_cached_buffers(state, events);
            Ok(())
        })
    }

    /// Drops all cached buffers because the consumer moved to the background.
    pub fn go_background(&self) -> Result<()> {
        self.with_state("go_background", |state, events| {
            events.push(QueueEvent::GoBackground);
            self.drop_cached_buffers(state, events);
            Ok(())
        })
    }

    /// Tears the queue down after the consumer went away.
    pub fn on_consumer_died(&self) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            self.drop_cached_buffers(&mut state, &mut events);
        }
        tracing::info!(queue = %self.name, "Consumer died");
        self.dispatch(events);
        self.disconnect();
    }

    /// Disconnects the queue. Blocked requests fail, later operations are rejected.
    pub fn disconnect(&self) {
        {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        self.slot_freed.notify_all();
        tracing::info!(queue = %self.name, "Buffer queue disconnected");
        self.dispatch(vec![QueueEvent::Disconnected]);
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    /// Human-readable snapshot of the queue and its slots.
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "BufferQueue {} (id {}): queue_size={}, buffers={}, queued={}, disconnected={}",
            self.name,
            self.id,
            state.queue_size,
            state.bound_count(),
            state.queued.len(),
            state.disconnected
        );
        let _ = writeln!(
            out,
            "  defaults: {}x{}, usage={:?}, transform={:?}",
            state.defaults.width, state.defaults.height, state.defaults.usage, state.defaults.transform
        );
        for (index, slot) in state.slots.iter().enumerate() {
            let (Some(buffer), Some(origin)) = (slot.buffer(), slot.origin()) else {
                continue;
            };
            let _ = writeln!(
                out,
                "  slot {}: sequence={}, state={}, stale={}, origin={:?}, config=[{}x{}, {:?}], timestamp={}, damage=[{}, {}, {}, {}]",
                index,
                buffer.sequence(),
                slot.state(),
                slot.is_stale(),
                origin,
                buffer.width(),
                buffer.height(),
                buffer.format(),
                slot.timestamp,
                slot.damage.x,
                slot.damage.y,
                slot.damage.w,
                slot.damage.h
            );
        }
        out
    }
}

impl fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferQueue")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for BufferQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for slot in state.slots.iter_mut() {
            if let Some((buffer, BufferOrigin::Allocated)) = slot.unbind() {
                if let Err(err) = self.allocator.free(&buffer) {
                    tracing::warn!(queue = %self.name, sequence = %buffer.sequence(), error = %err, "Failed to free buffer on queue drop");
                }
            }
        }
        tracing::debug!(queue = %self.name, "Buffer queue dropped");
    }
}
