//! STOMP text protocol: frames, codec, version and heartbeat negotiation.

mod codec;
mod frame;
mod heartbeat;
mod version;

pub use codec::{StompCodec, StompItem, escape_header, unescape_header};
pub use frame::{StompFrame, command, header};
pub use heartbeat::{HeartbeatSettings, negotiate_heartbeat, negotiate_interval};
pub use version::{NegotiatedVersion, StompVersion, negotiate_version, supported_list};
