//! Error handling for the buffer queue.
//!
//! [`BufferQueueError`] is returned by every queue, producer and consumer operation.
//! Callers that only care about the coarse outcome can collapse it with
//! [`BufferQueueError::code`], which maps each variant onto exactly one [`ErrorCode`].
//!
//! Fence failures are deliberately not part of this type; see
//! [`crate::fence::FenceError`]. Configuration and logging setup have their own
//! [`ConfigError`] and [`LoggingError`].

use std::fmt;
use std::path::PathBuf;

use novade_buffer_manager::{AllocError, SequenceNumber};
use thiserror::Error;

use crate::slot::SlotState;

/// Coarse classification of a [`BufferQueueError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Malformed configuration, queue size or argument.
    InvalidArguments,
    /// The addressed buffer is not in the state the operation requires.
    InvalidOperating,
    /// Unknown sequence number, metadata that was never set, or a tunnel handle
    /// that is already set.
    NoEntry,
    /// No buffer available to satisfy the call.
    NoBuffer,
    /// The consumer does not offer the requested feature.
    NotSupport,
    /// Capacity exhausted under the caller's blocking policy.
    QueueFull,
    /// The queue was disconnected.
    NoConsumer,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidArguments => "INVALID_ARGUMENTS",
            ErrorCode::InvalidOperating => "INVALID_OPERATING",
            ErrorCode::NoEntry => "NO_ENTRY",
            ErrorCode::NoBuffer => "NO_BUFFER",
            ErrorCode::NotSupport => "NOT_SUPPORT",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::NoConsumer => "NO_CONSUMER",
        };
        f.write_str(name)
    }
}

/// Errors produced by buffer queue operations.
#[derive(Debug, Error)]
pub enum BufferQueueError {
    /// A request, flush or sizing argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArguments(String),

    /// The buffer exists but is in the wrong state for the operation.
    #[error("Buffer {sequence} is {actual}, operation requires {expected}")]
    InvalidState {
        sequence: SequenceNumber,
        actual: SlotState,
        expected: SlotState,
    },

    /// The buffer is not held by the endpoint that tried to use it.
    #[error("Buffer {sequence} is not owned by this endpoint")]
    NotOwned { sequence: SequenceNumber },

    /// No slot is bound to this sequence number.
    #[error("Unknown buffer sequence {0}")]
    UnknownSequence(SequenceNumber),

    /// The buffer is known but this metadata field was never set.
    #[error("Metadata {field} not set for buffer {sequence}")]
    MetadataUnset {
        sequence: SequenceNumber,
        field: &'static str,
    },

    /// The tunnel handle of a buffer can only be set once.
    #[error("Tunnel handle already set for buffer {0}")]
    TunnelHandleAlreadySet(SequenceNumber),

    /// Nothing is queued for the consumer.
    #[error("No buffer queued")]
    NoBuffer,

    /// A flush named a sequence number the queue has no slot for.
    #[error("Buffer {0} is not bound to this queue")]
    UnknownBuffer(SequenceNumber),

    /// The allocator could not provide a buffer.
    #[error("Buffer allocation failed: {0}")]
    AllocationFailed(#[from] AllocError),

    /// The consumer does not support the requested feature.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// No slot became free within the caller's timeout.
    #[error("Queue full ({queue_size} buffers in flight)")]
    QueueFull { queue_size: u32 },

    /// The queue has been disconnected and accepts no further operations.
    #[error("Buffer queue disconnected")]
    Disconnected,
}

impl BufferQueueError {
    /// Maps this error onto the coarse [`ErrorCode`] taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            BufferQueueError::InvalidArguments(_) => ErrorCode::InvalidArguments,
            BufferQueueError::InvalidState { .. } | BufferQueueError::NotOwned { .. } => {
                ErrorCode::InvalidOperating
            }
            BufferQueueError::UnknownSequence(_)
            | BufferQueueError::MetadataUnset { .. }
            | BufferQueueError::TunnelHandleAlreadySet(_) => ErrorCode::NoEntry,
            BufferQueueError::NoBuffer
            | BufferQueueError::UnknownBuffer(_)
            | BufferQueueError::AllocationFailed(_) => ErrorCode::NoBuffer,
            BufferQueueError::NotSupported(_) => ErrorCode::NotSupport,
            BufferQueueError::QueueFull { .. } => ErrorCode::QueueFull,
            BufferQueueError::Disconnected => ErrorCode::NoConsumer,
        }
    }
}

/// Convenience alias for queue results.
pub type Result<T, E = BufferQueueError> = std::result::Result<T, E>;

/// Errors raised while loading or validating [`crate::config::BufferQueueSettings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration file {path:?}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Errors raised while installing the tracing subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log level string is not one of trace, debug, info, warn, error.
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// The log directory could not be created.
    #[error("Failed to create log directory {path:?}: {source}")]
    DirectoryCreation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber was already installed.
    #[error("Failed to set global subscriber: {0}")]
    SetGlobalDefault(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BufferQueueError::InvalidArguments("queue size 0".into()), ErrorCode::InvalidArguments)]
    #[case(
        BufferQueueError::InvalidState {
            sequence: SequenceNumber::new(1),
            actual: SlotState::Free,
            expected: SlotState::Acquired,
        },
        ErrorCode::InvalidOperating
    )]
    #[case(BufferQueueError::NotOwned { sequence: SequenceNumber::new(1) }, ErrorCode::InvalidOperating)]
    #[case(BufferQueueError::UnknownSequence(SequenceNumber::new(2)), ErrorCode::NoEntry)]
    #[case(BufferQueueError::TunnelHandleAlreadySet(SequenceNumber::new(2)), ErrorCode::NoEntry)]
    #[case(BufferQueueError::NoBuffer, ErrorCode::NoBuffer)]
    #[case(BufferQueueError::AllocationFailed(AllocError::OutOfMemory { requested: 64 }), ErrorCode::NoBuffer)]
    #[case(BufferQueueError::NotSupported("timestamp".into()), ErrorCode::NotSupport)]
    #[case(BufferQueueError::QueueFull { queue_size: 3 }, ErrorCode::QueueFull)]
    #[case(BufferQueueError::Disconnected, ErrorCode::NoConsumer)]
    fn test_error_codes(#[case] error: BufferQueueError, #[case] expected: ErrorCode) {
        assert_eq!(error.code(), expected, "Unexpected code for {}", error);
    }

    #[test]
    fn test_error_display() {
        let err = BufferQueueError::InvalidState {
            sequence: SequenceNumber::new(7),
            actual: SlotState::Free,
            expected: SlotState::Acquired,
        };
        assert_eq!(err.to_string(), "Buffer 7 is FREE, operation requires ACQUIRED");
        assert_eq!(ErrorCode::InvalidOperating.to_string(), "INVALID_OPERATING");
    }
}
