//! Buffer slots and their state machine.
//!
//! The queue owns a fixed array of [`BufferSlot`]s. A slot is either empty or bound
//! to exactly one buffer, identified by the buffer's [`SequenceNumber`]. Endpoints
//! never see slots directly, they address buffers by sequence number.
//!
//! ```text
//! FREE --request--> DEQUEUED --flush--> QUEUED --acquire--> ACQUIRED --release--> FREE
//!                       \--cancel--> FREE
//! ```
//!
//! A slot can also be marked *stale*, meaning its buffer must not be handed out again.
//! Stale slots are retired (unbound, buffer returned to the allocator) as soon as they
//! reach FREE.

use std::fmt;

use novade_buffer_manager::{BufferHandle, BufferRequest, SequenceNumber};

use crate::error::{BufferQueueError, Result};
use crate::fence::Fence;

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SlotState {
    /// Owned by the queue, available to the producer.
    #[default]
    Free,
    /// Handed to the producer for rendering.
    Dequeued,
    /// Submitted by the producer, waiting for the consumer.
    Queued,
    /// Held by the consumer.
    Acquired,
}

impl SlotState {
    /// Returns `true` if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SlotState) -> bool {
        matches!(
            (self, next),
            (SlotState::Free, SlotState::Dequeued)
                | (SlotState::Dequeued, SlotState::Queued)
                | (SlotState::Dequeued, SlotState::Free)
                | (SlotState::Queued, SlotState::Acquired)
                | (SlotState::Acquired, SlotState::Free)
        )
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Free => "FREE",
            SlotState::Dequeued => "DEQUEUED",
            SlotState::Queued => "QUEUED",
            SlotState::Acquired => "ACQUIRED",
        };
        f.write_str(name)
    }
}

/// Damage rectangle in buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }
}

/// Where the buffer bound to a slot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Allocated by the queue; returned to the allocator on retirement.
    Allocated,
    /// Attached by an endpoint; the queue never frees it.
    Attached,
}

/// Bookkeeping for one buffer position in the queue.
#[derive(Debug, Default)]
pub struct BufferSlot {
    state: SlotState,
    buffer: Option<(BufferHandle, BufferOrigin)>,
    pub(crate) acquire_fence: Fence,
    pub(crate) release_fence: Fence,
    pub(crate) stale: bool,
    pub(crate) damage: Rect,
    pub(crate) timestamp: i64,
}

impl BufferSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.buffer.is_some()
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Sequence number of the bound buffer.
    pub fn sequence(&self) -> Option<SequenceNumber> {
        self.buffer.as_ref().map(|(buffer, _)| buffer.sequence())
    }

    pub fn buffer(&self) -> Option<&BufferHandle> {
        self.buffer.as_ref().map(|(buffer, _)| buffer)
    }

    pub fn origin(&self) -> Option<BufferOrigin> {
        self.buffer.as_ref().map(|(_, origin)| *origin)
    }

    /// `true` if the slot is FREE, not stale, and its buffer satisfies `request`.
    pub fn is_reusable_for(&self, request: &BufferRequest) -> bool {
        self.state == SlotState::Free
            && !self.stale
            && self.buffer().map_or(false, |buffer| buffer.descriptor().matches(request))
    }

    /// Binds `buffer` to this empty slot. The slot starts out FREE with sentinel fences.
    pub(crate) fn bind(&mut self, buffer: BufferHandle, origin: BufferOrigin) {
        debug_assert!(!self.is_bound(), "binding over a bound slot");
        *self = BufferSlot {
            buffer: Some((buffer, origin)),
            ..BufferSlot::default()
        };
    }

    /// Empties the slot and hands back what was bound to it.
    pub(crate) fn unbind(&mut self) -> Option<(BufferHandle, BufferOrigin)> {
        std::mem::take(self).buffer
    }

    /// Fails unless the slot is in `expected`.
    pub(crate) fn require(&self, expected: SlotState) -> Result<()> {
        if self.state == expected {
            return Ok(());
        }
        Err(BufferQueueError::InvalidState {
            sequence: self.sequence().unwrap_or_else(|| SequenceNumber::new(0)),
            actual: self.state,
            expected,
        })
    }

    /// Moves the slot to `next`. Callers check the source state with
    /// [`BufferSlot::require`] first.
    pub(crate) fn transition(&mut self, next: SlotState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal slot transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(sequence = ?self.sequence(), from = %self.state, to = %next, "Slot transition");
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use novade_buffer_manager::{BufferUsage, PixelFormat};
    use rstest::rstest;

    fn request(width: u32, height: u32) -> BufferRequest {
        BufferRequest {
            width,
            height,
            format: PixelFormat::Rgba8888,
            usage: BufferUsage::default(),
            stride_alignment: 8,
        }
    }

    fn buffer(width: u32, height: u32) -> BufferHandle {
        BufferHandle::new(request(width, height).describe().unwrap()).unwrap()
    }

    #[rstest]
    #[case(SlotState::Free, SlotState::Dequeued, true)]
    #[case(SlotState::Dequeued, SlotState::Queued, true)]
    #[case(SlotState::Dequeued, SlotState::Free, true)]
    #[case(SlotState::Queued, SlotState::Acquired, true)]
    #[case(SlotState::Acquired, SlotState::Free, true)]
    #[case(SlotState::Free, SlotState::Queued, false)]
    #[case(SlotState::Free, SlotState::Acquired, false)]
    #[case(SlotState::Queued, SlotState::Free, false)]
    #[case(SlotState::Acquired, SlotState::Dequeued, false)]
    #[case(SlotState::Acquired, SlotState::Queued, false)]
    fn test_transitions(#[case] from: SlotState, #[case] to: SlotState, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed, "{} -> {}", from, to);
    }

    #[test]
    fn test_bind_and_unbind() {
        let mut slot = BufferSlot::new();
        assert!(!slot.is_bound());
        assert_eq!(slot.sequence(), None);

        let handle = buffer(16, 16);
        let sequence = handle.sequence();
        slot.bind(handle.clone(), BufferOrigin::Allocated);
        assert_eq!(slot.sequence(), Some(sequence));
        assert_eq!(slot.state(), SlotState::Free);
        assert!(!slot.release_fence.is_valid());

        slot.stale = true;
        let (unbound, origin) = slot.unbind().expect("slot was bound");
        assert!(unbound.ptr_eq(&handle));
        assert_eq!(origin, BufferOrigin::Allocated);
        assert!(!slot.is_bound());
        assert!(!slot.is_stale(), "Unbinding resets the slot.");
    }

    #[test]
    fn test_reusable_only_when_free_and_matching() {
        let mut slot = BufferSlot::new();
        slot.bind(buffer(32, 32), BufferOrigin::Allocated);
        assert!(slot.is_reusable_for(&request(32, 32)));
        assert!(!slot.is_reusable_for(&request(64, 32)));

        slot.transition(SlotState::Dequeued);
        assert!(!slot.is_reusable_for(&request(32, 32)));
        slot.transition(SlotState::Free);

        slot.stale = true;
        assert!(!slot.is_reusable_for(&request(32, 32)));
    }

    #[test]
    fn test_require_reports_states() {
        let mut slot = BufferSlot::new();
        let handle = buffer(8, 8);
        let sequence = handle.sequence();
        slot.bind(handle, BufferOrigin::Attached);

        assert!(slot.require(SlotState::Free).is_ok());
        match slot.require(SlotState::Acquired) {
            Err(BufferQueueError::InvalidState { sequence: s, actual, expected }) => {
                assert_eq!(s, sequence);
                assert_eq!(actual, SlotState::Free);
                assert_eq!(expected, SlotState::Acquired);
            }
            other => panic!("Expected InvalidState, got {:?}", other),
        }
    }
}
