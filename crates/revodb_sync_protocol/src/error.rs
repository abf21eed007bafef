//! Error types for protocol parsing.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while parsing or building protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The payload was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was valid JSON but not the expected shape.
    #[error("invalid message structure: {0}")]
    InvalidStructure(String),
}

impl ProtocolError {
    /// Creates a structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
