//! # Novade Buffer Manager
//!
//! This crate provides the buffer side of the Novade buffer-exchange stack. It describes
//! graphic buffers (dimensions, pixel format, usage, stride) and defines the
//! [`BufferAllocator`] seam through which the buffer queue obtains and returns memory.
//!
//! [`BufferManager`] is the in-process shared-memory implementation of that seam. It
//! keeps a table of live allocations keyed by [`SequenceNumber`] so that double frees
//! and leaks are visible to callers.

pub mod allocator;
pub mod buffer;

// Re-export key types for convenience.
pub use allocator::{AllocError, BufferAllocator};
pub use buffer::{
    BufferDescriptor, BufferHandle, BufferManager, BufferRequest, BufferUsage, PixelFormat,
    SequenceNumber, MAX_STRIDE_ALIGNMENT, MIN_STRIDE_ALIGNMENT,
};
