//! Server error types.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use relaymq_core::HandlerId;
use relaymq_protocol::{ErrorCode, ErrorResponse, PacketType, ProtocolError};
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (socket, file, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (framing, encoding, etc.).
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Listener could not be bound.
    #[error("Failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Dispatcher or outbound channel failure.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Shutdown requested.
    #[error("Server shutdown requested")]
    Shutdown,
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

/// Errors raised by the packet dispatcher and outbound channels.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// A handler with this id is already registered.
    #[error("handler already registered: {id}")]
    DuplicateHandler { id: HandlerId },

    /// The outbound channel's receiving side is gone.
    #[error("outbound channel closed")]
    ChannelClosed,

    /// The outbound channel stayed full for the whole send timeout.
    #[error("outbound send timed out after {timeout:?}")]
    SendTimeout { timeout: Duration },
}

/// Authentication gateway failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Unknown user or wrong password.
    #[error("invalid credentials for user {username:?}")]
    InvalidCredentials { username: String },

    /// No login was given and anonymous access is disabled.
    #[error("anonymous connections are not allowed")]
    AnonymousRefused,
}

/// Failures a packet handler reports back to the dispatcher.
///
/// Every variant maps onto an [`ErrorCode`] so the dispatcher can turn it
/// into an error response.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Authentication failed.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The handler does not accept this packet type.
    #[error("handler {handler} does not accept {packet_type:?} packets")]
    UnsupportedPacket {
        handler: HandlerId,
        packet_type: PacketType,
    },

    /// The request is invalid in the handler's current state.
    #[error("{message}")]
    IllegalState { message: String },

    /// Registering or pushing through the dispatcher failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl HandlerError {
    /// Creates an unsupported packet error.
    pub fn unsupported(handler: &HandlerId, packet_type: PacketType) -> Self {
        Self::UnsupportedPacket {
            handler: handler.clone(),
            packet_type,
        }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Returns the wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Auth(_) => ErrorCode::AuthenticationFailed,
            Self::UnsupportedPacket { .. } => ErrorCode::UnsupportedPacket,
            Self::IllegalState { .. } => ErrorCode::IllegalState,
            Self::Dispatch(_) => ErrorCode::InternalError,
        }
    }

    /// Converts the failure into error response details.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}

/// Delivery backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The subscription id is already in use for this session.
    #[error("subscription {id} already exists")]
    DuplicateSubscription { id: String },

    /// No such subscription for this session.
    #[error("no subscription with id {id}")]
    UnknownSubscription { id: String },

    /// No in-flight message with this id for this session.
    #[error("no in-flight message with id {message_id}")]
    UnknownMessage { message_id: String },

    /// The session was never attached or has been detached.
    #[error("session is not attached")]
    Detached,
}

/// STOMP session failures, each rendered as an ERROR frame.
#[derive(Debug, Error)]
pub enum StompError {
    /// Credentials rejected while connecting.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// Version or heartbeat negotiation failed.
    #[error("negotiation failed: {0}")]
    Negotiation(#[source] ProtocolError),

    /// The frame could not be parsed.
    #[error("malformed frame: {0}")]
    Malformed(#[source] ProtocolError),

    /// A frame other than CONNECT arrived before the session was connected.
    #[error("expected CONNECT or STOMP, got {command}")]
    NotConnected { command: String },

    /// A second CONNECT on an established session.
    #[error("session is already connected")]
    AlreadyConnected,

    /// A required header is absent.
    #[error("{command} frame requires a {header} header")]
    MissingHeader {
        command: String,
        header: &'static str,
    },

    /// A header value is not acceptable.
    #[error("invalid {header} header: {value:?}")]
    InvalidHeader { header: &'static str, value: String },

    /// SUBSCRIBE reused an active subscription id.
    #[error("subscription {id} already exists")]
    DuplicateSubscription { id: String },

    /// UNSUBSCRIBE named an unknown subscription.
    #[error("no subscription with id {id}")]
    UnknownSubscription { id: String },

    /// ACK or NACK did not match a pending delivery.
    #[error("no pending message {message_id} on subscription {subscription}")]
    AckMismatch {
        subscription: String,
        message_id: String,
    },

    /// ACK or NACK named a message that is not pending on any subscription.
    #[error("no pending message {message_id}")]
    UnknownMessage { message_id: String },

    /// The command is not supported on this session.
    #[error("{command} is not supported{detail}")]
    Unsupported { command: String, detail: String },

    /// The delivery backend refused the operation.
    #[error("delivery backend: {0}")]
    Backend(#[from] BackendError),

    /// The client stopped sending within the negotiated window.
    #[error("no frame received for {idle:?}")]
    HeartbeatTimeout { idle: Duration },
}

impl StompError {
    /// Returns true if the session must be closed after this error.
    pub fn closes_connection(&self) -> bool {
        match self {
            Self::Authentication(_)
            | Self::Negotiation(_)
            | Self::Malformed(_)
            | Self::NotConnected { .. }
            | Self::AlreadyConnected
            | Self::HeartbeatTimeout { .. } => true,
            Self::MissingHeader { .. }
            | Self::InvalidHeader { .. }
            | Self::DuplicateSubscription { .. }
            | Self::UnknownSubscription { .. }
            | Self::AckMismatch { .. }
            | Self::UnknownMessage { .. }
            | Self::Unsupported { .. }
            | Self::Backend(_) => false,
        }
    }

    /// Short summary used as the ERROR frame's `message` header.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication failed",
            Self::Negotiation(_) => "protocol negotiation failed",
            Self::Malformed(_) => "malformed frame",
            Self::NotConnected { .. } => "not connected",
            Self::AlreadyConnected => "already connected",
            Self::MissingHeader { .. } => "missing header",
            Self::InvalidHeader { .. } => "invalid header",
            Self::DuplicateSubscription { .. } => "duplicate subscription",
            Self::UnknownSubscription { .. } => "unknown subscription",
            Self::AckMismatch { .. } | Self::UnknownMessage { .. } => "acknowledgement mismatch",
            Self::Unsupported { .. } => "unsupported command",
            Self::Backend(_) => "delivery failed",
            Self::HeartbeatTimeout { .. } => "heartbeat timeout",
        }
    }
}
