//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur during protocol operations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum allowed size.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Failed to serialize or deserialize a packet.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Incomplete message (connection closed before full message received).
    #[error("incomplete message: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// Empty message received.
    #[error("empty message")]
    EmptyMessage,

    /// A STOMP frame violates the framing or escaping rules.
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// No STOMP version is acceptable to both peers.
    #[error("no supported protocol version in {offered:?} (server supports {supported})")]
    UnsupportedVersion { offered: String, supported: String },

    /// A `heart-beat` header could not be parsed.
    #[error("invalid heart-beat header: {value:?}")]
    InvalidHeartbeat { value: String },
}

impl ProtocolError {
    /// Creates a malformed frame error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            reason: reason.into(),
        }
    }
}
