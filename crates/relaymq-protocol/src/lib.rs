//! Wire formats for relaymq.
//!
//! Two transports share this crate:
//!
//! - The binary remoting transport, carrying [`Packet`]s as length-prefixed
//!   JSON. Every packet names the handler it is addressed to and a
//!   correlation id that the response echoes.
//! - The [`stomp`] text protocol, with its frame codec and the version and
//!   heartbeat negotiation rules.
//!
//! # Example
//!
//! ```rust
//! use relaymq_protocol::{Packet, PacketKind, encode_message, decode_message};
//!
//! let ping = Packet::new("conn-1", PacketKind::Ping).with_correlation(7);
//! let bytes = encode_message(&ping).unwrap();
//! let decoded: Packet = decode_message(&bytes).unwrap();
//! assert_eq!(decoded.correlation_id, 7);
//! ```

mod error;
mod framing;
mod packet;
pub mod stomp;

pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter, PacketCodec, decode_message, encode_message};
pub use packet::{
    ConnectionFactoryDelegate, ErrorCode, ErrorResponse, Packet, PacketKind, PacketRole,
    PacketType, TopologySnapshot,
};

/// Remoting wire version stamped on packets created locally.
pub const WIRE_VERSION: u8 = 1;

/// Maximum remoting packet payload (1 MiB).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Default maximum STOMP frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
