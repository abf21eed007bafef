//! Error types for the replication engine.

use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Result type for storage collaborator operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The remote returned a non-success HTTP status.
    #[error("HTTP status {status} from {url}")]
    HttpStatus {
        /// Response status code.
        status: u16,
        /// Request URL, credentials stripped.
        url: String,
    },

    /// Malformed payload from the remote (bad JSON, missing fields).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Attachment integrity violation: digest or length mismatch, or a
    /// MIME body that cannot be accounted for.
    #[error("multipart error: {0}")]
    Multipart(String),

    /// Local storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Invalid configuration; fails fast.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The session was stopped while the operation was in flight.
    #[error("replication cancelled")]
    Cancelled,
}

impl ReplicationError {
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

    /// Returns true if retrying the operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ReplicationError::Transport { retryable, .. } => *retryable,
            ReplicationError::HttpStatus { status, .. } => is_transient_status(*status),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(err: serde_json::Error) -> Self {
        ReplicationError::Protocol(err.to_string())
    }
}

impl From<revodb_sync_protocol::ProtocolError> for ReplicationError {
    fn from(err: revodb_sync_protocol::ProtocolError) -> Self {
        ReplicationError::Protocol(err.to_string())
    }
}

/// Returns true for HTTP statuses worth retrying.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

/// Errors reported by the local storage collaborator.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The revision was rejected by a validation function. The replicator
    /// treats this as an expected outcome, not a failure.
    #[error("revision rejected by validation")]
    Forbidden,

    /// The requested document or revision does not exist locally.
    #[error("not found")]
    NotFound,

    /// Any other storage failure.
    #[error("storage failure: {0}")]
    Internal(String),
}

impl StorageError {
    /// Creates an internal storage error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(ReplicationError::transport_retryable("connection reset").is_transient());
        assert!(!ReplicationError::transport_fatal("bad certificate").is_transient());
        assert!(ReplicationError::HttpStatus {
            status: 503,
            url: "http://example.com/db".into()
        }
        .is_transient());
        assert!(!ReplicationError::HttpStatus {
            status: 404,
            url: "http://example.com/db".into()
        }
        .is_transient());
        assert!(!ReplicationError::Cancelled.is_transient());
    }

    #[test]
    fn transient_status_codes() {
        for status in [500, 502, 503, 504] {
            assert!(is_transient_status(status));
        }
        for status in [200, 304, 400, 401, 403, 404, 409, 412] {
            assert!(!is_transient_status(status));
        }
    }

    #[test]
    fn storage_error_display() {
        assert_eq!(
            StorageError::Forbidden.to_string(),
            "revision rejected by validation"
        );
    }
}
