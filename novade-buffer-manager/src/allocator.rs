//! The allocator seam between the buffer queue and whatever owns graphics memory.

use thiserror::Error;

use crate::buffer::{BufferHandle, BufferRequest, SequenceNumber};

/// Errors reported by a [`BufferAllocator`].
#[derive(Debug, Error)]
pub enum AllocError {
    /// The request cannot describe a valid buffer (zero size, bad alignment, overflow).
    #[error("Invalid allocation request: {0}")]
    InvalidRequest(String),

    /// The backing store could not provide the requested amount of memory.
    #[error("Out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// The allocator's configured live-buffer limit has been reached.
    #[error("Allocation limit of {limit} live buffers reached")]
    LimitReached { limit: usize },

    /// `free` was called for a buffer this allocator does not (or no longer) own.
    #[error("Buffer {0} is not a live allocation")]
    UnknownBuffer(SequenceNumber),
}

/// Turns a size/format/usage request into mapped memory and takes it back.
///
/// The buffer queue calls `allocate` when it binds a new buffer to a slot and `free`
/// when it retires one. It never frees a buffer that a producer or consumer may still
/// be touching.
pub trait BufferAllocator: Send + Sync {
    /// Allocates and maps a buffer satisfying `request`.
    fn allocate(&self, request: &BufferRequest) -> Result<BufferHandle, AllocError>;

    /// Releases a buffer previously returned by [`BufferAllocator::allocate`].
    fn free(&self, handle: &BufferHandle) -> Result<(), AllocError>;
}
