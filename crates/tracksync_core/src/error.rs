//! Error types for the sync core.

use crate::types::ResourceId;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while synchronizing a resource.
///
/// Transport failures are recovered inside the poll and channel loops and
/// never cross the [`SyncHandle`](crate::SyncHandle) boundary; they show up
/// here because fetchers and transports report them through this type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The transport gave up waiting for the server.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to server")]
    NotConnected,

    /// A live session already tracks this resource.
    #[error("resource {0} is already attached")]
    AlreadyAttached(ResourceId),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::NotConnected => true,
            SyncError::AlreadyAttached(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::NotConnected.is_retryable());
        assert!(!SyncError::AlreadyAttached(ResourceId::new("run-1")).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::NotConnected;
        assert_eq!(err.to_string(), "not connected to server");

        let err = SyncError::AlreadyAttached(ResourceId::new("run-42"));
        assert_eq!(err.to_string(), "resource run-42 is already attached");
    }
}
