//! Remoting packets exchanged on the binary path.
//!
//! Every packet names the handler it is addressed to (`target_id`), the wire
//! version the sender speaks, and a correlation id. Responses copy the
//! correlation and target of the request they answer (see
//! [`Packet::normalize`]); server pushes use correlation `0`.

use std::collections::BTreeMap;

use relaymq_core::{ClientInstanceId, HandlerId};
use serde::{Deserialize, Serialize};

use crate::WIRE_VERSION;

/// A single remoting packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Wire version the sender negotiated.
    pub version: u8,
    /// Handler the packet is addressed to.
    pub target_id: HandlerId,
    /// Request/response correlation; `0` for unsolicited pushes.
    pub correlation_id: u64,
    /// The packet body.
    pub kind: PacketKind,
}

impl Packet {
    /// Creates a packet at the current wire version with no correlation.
    pub fn new(target_id: impl Into<HandlerId>, kind: PacketKind) -> Self {
        Self {
            version: WIRE_VERSION,
            target_id: target_id.into(),
            correlation_id: 0,
            kind,
        }
    }

    /// Builder: set the correlation id.
    pub fn with_correlation(mut self, correlation_id: u64) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Builder: set the wire version.
    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// Creates an error response already normalized against `request`.
    pub fn error_for(request: &Packet, error: ErrorResponse) -> Self {
        let mut packet = Self::new(request.target_id.clone(), PacketKind::Error { error });
        packet.normalize(request);
        packet
    }

    /// Aligns a response with the request it answers.
    ///
    /// Copies correlation id, target id and version so the client can route
    /// the response to the proxy that issued the request.
    pub fn normalize(&mut self, request: &Packet) {
        self.correlation_id = request.correlation_id;
        self.target_id = request.target_id.clone();
        self.version = request.version;
    }

    /// Returns the fieldless type tag of this packet.
    pub fn packet_type(&self) -> PacketType {
        self.kind.packet_type()
    }

    /// Returns the error if this is an error response.
    pub fn as_error(&self) -> Option<&ErrorResponse> {
        match &self.kind {
            PacketKind::Error { error } => Some(error),
            _ => None,
        }
    }
}

/// Packet bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PacketKind {
    /// Open a connection through a connection factory.
    CreateConnection {
        /// Login, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        /// Password, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
        /// Node the client is failing over from; negative for a normal connect.
        failed_node_id: i32,
        /// Identity of the client process.
        client_instance_id: ClientInstanceId,
        /// Explicit client id overriding every configured default.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Connection created.
    CreateConnectionResponse {
        /// Handler id of the new server-side connection.
        connection_id: HandlerId,
        /// Server that owns the connection.
        server_id: u32,
    },

    /// Ask a connection factory for its current topology.
    GetTopology,

    /// Topology snapshot, either as a reply or pushed after a cluster change.
    Topology {
        /// The snapshot.
        topology: TopologySnapshot,
    },

    /// Register or drop the sender of this packet as a topology callback.
    UpdateCallback {
        /// Identity of the client process.
        client_instance_id: ClientInstanceId,
        /// `true` to add, `false` to remove.
        add: bool,
    },

    /// Liveness probe for a connection.
    Ping,

    /// Reply to Ping.
    Pong,

    /// Close a server-side connection.
    CloseConnection,

    /// Reply to CloseConnection.
    Closed,

    /// Error response.
    Error {
        /// Error details.
        #[serde(flatten)]
        error: ErrorResponse,
    },
}

impl PacketKind {
    /// Creates an Error packet body.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            error: ErrorResponse::new(code, message),
        }
    }

    /// Returns the fieldless type tag.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::CreateConnection { .. } => PacketType::CreateConnection,
            Self::CreateConnectionResponse { .. } => PacketType::CreateConnectionResponse,
            Self::GetTopology => PacketType::GetTopology,
            Self::Topology { .. } => PacketType::Topology,
            Self::UpdateCallback { .. } => PacketType::UpdateCallback,
            Self::Ping => PacketType::Ping,
            Self::Pong => PacketType::Pong,
            Self::CloseConnection => PacketType::CloseConnection,
            Self::Closed => PacketType::Closed,
            Self::Error { .. } => PacketType::Error,
        }
    }
}

/// Fieldless packet type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    CreateConnection,
    CreateConnectionResponse,
    GetTopology,
    Topology,
    UpdateCallback,
    Ping,
    Pong,
    CloseConnection,
    Closed,
    Error,
}

/// How a packet type participates in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketRole {
    /// Expects exactly one response (or an error response).
    Request,
    /// Answers a request.
    Response,
    /// Fire and forget; no response is produced.
    OneWay,
}

impl PacketType {
    /// All packet types.
    pub const ALL: [PacketType; 10] = [
        Self::CreateConnection,
        Self::CreateConnectionResponse,
        Self::GetTopology,
        Self::Topology,
        Self::UpdateCallback,
        Self::Ping,
        Self::Pong,
        Self::CloseConnection,
        Self::Closed,
        Self::Error,
    ];

    /// Returns the role of this packet type.
    pub fn role(self) -> PacketRole {
        match self {
            Self::CreateConnection | Self::GetTopology | Self::Ping | Self::CloseConnection => {
                PacketRole::Request
            }
            Self::CreateConnectionResponse
            | Self::Topology
            | Self::Pong
            | Self::Closed
            | Self::Error => PacketRole::Response,
            Self::UpdateCallback => PacketRole::OneWay,
        }
    }

    /// Returns the success response type for a request type.
    ///
    /// `None` for responses and one-way packets. Any request may also be
    /// answered with [`PacketType::Error`].
    pub fn response_type(self) -> Option<PacketType> {
        match self {
            Self::CreateConnection => Some(Self::CreateConnectionResponse),
            Self::GetTopology => Some(Self::Topology),
            Self::Ping => Some(Self::Pong),
            Self::CloseConnection => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Descriptor a client needs to open a replacement connection on a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFactoryDelegate {
    /// Handler id of the factory on that peer.
    pub factory_id: HandlerId,
    /// Server id of the peer.
    pub server_id: u32,
    /// Locator the client dials, e.g. `tcp://10.0.0.2:5445`.
    pub locator: String,
}

impl ConnectionFactoryDelegate {
    /// Creates a delegate descriptor.
    pub fn new(factory_id: impl Into<HandlerId>, server_id: u32, locator: impl Into<String>) -> Self {
        Self {
            factory_id: factory_id.into(),
            server_id,
            locator: locator.into(),
        }
    }
}

/// Immutable view of a connection factory's cluster topology.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Unique name of the factory.
    pub factory_name: String,
    /// Peer delegates, in preference order.
    pub delegates: Vec<ConnectionFactoryDelegate>,
    /// Failed node id → substitute node id.
    pub failover_map: BTreeMap<u32, u32>,
}

/// Error codes carried by error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown or internal error.
    InternalError,

    /// No handler is registered under the packet's target id.
    UnknownTarget,

    /// Credentials were rejected.
    AuthenticationFailed,

    /// The handler does not accept this packet type.
    UnsupportedPacket,

    /// The operation is invalid in the handler's current state.
    IllegalState,
}

impl ErrorCode {
    /// Returns a human-readable description of the error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::InternalError => "An internal error occurred",
            Self::UnknownTarget => "No handler registered for target",
            Self::AuthenticationFailed => "Authentication failed",
            Self::UnsupportedPacket => "Packet type not supported by handler",
            Self::IllegalState => "Operation not valid in current state",
        }
    }
}

/// Error details of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

impl ErrorResponse {
    /// Creates a new error response.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates the error returned for an unresolvable target.
    pub fn unknown_target(target: &HandlerId) -> Self {
        Self::new(
            ErrorCode::UnknownTarget,
            format!("no handler registered for id {target}"),
        )
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.description(), self.message)
    }
}

impl std::error::Error for ErrorResponse {}
