//! `heart-beat` header parsing and negotiation.
//!
//! The client sends `heart-beat:cx,cy`: it can emit a heartbeat every `cx`
//! milliseconds and wants one from the server every `cy` milliseconds.
//! Zero disables a direction. The server answers with its own pair, where
//! each non-zero interval is raised to at least the server minimum.

use std::time::Duration;

use crate::error::{ProtocolError, ProtocolResult};

/// A pair of heartbeat intervals in milliseconds, as carried in a
/// `heart-beat` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSettings {
    /// Interval at which the sender of the header emits heartbeats.
    pub outgoing_ms: u64,
    /// Interval at which the sender of the header wants to receive them.
    pub incoming_ms: u64,
}

impl HeartbeatSettings {
    /// Disabled in both directions.
    pub const DISABLED: Self = Self {
        outgoing_ms: 0,
        incoming_ms: 0,
    };

    /// Creates settings from the two intervals.
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self {
            outgoing_ms,
            incoming_ms,
        }
    }

    /// Parses a `cx,cy` header value.
    pub fn parse_header(value: &str) -> ProtocolResult<Self> {
        let invalid = || ProtocolError::InvalidHeartbeat {
            value: value.to_string(),
        };
        let (outgoing, incoming) = value.split_once(',').ok_or_else(invalid)?;
        let outgoing_ms = outgoing.trim().parse().map_err(|_| invalid())?;
        let incoming_ms = incoming.trim().parse().map_err(|_| invalid())?;
        Ok(Self::new(outgoing_ms, incoming_ms))
    }

    /// Formats the pair as a header value.
    pub fn to_header_value(&self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }

    /// Outgoing interval, `None` when disabled.
    pub fn outgoing(&self) -> Option<Duration> {
        (self.outgoing_ms > 0).then(|| Duration::from_millis(self.outgoing_ms))
    }

    /// Incoming interval, `None` when disabled.
    pub fn incoming(&self) -> Option<Duration> {
        (self.incoming_ms > 0).then(|| Duration::from_millis(self.incoming_ms))
    }

    /// Returns true if neither direction is enabled.
    pub fn is_disabled(&self) -> bool {
        self.outgoing_ms == 0 && self.incoming_ms == 0
    }
}

/// Raises a non-zero interval to `server_min_ms`; zero stays disabled.
pub fn negotiate_interval(requested_ms: u64, server_min_ms: u64) -> u64 {
    if requested_ms == 0 {
        0
    } else {
        requested_ms.max(server_min_ms)
    }
}

/// Computes the server side of the heartbeat exchange.
///
/// The returned settings are from the server's point of view:
/// `outgoing_ms` is how often the server pings the client (derived from the
/// client's `cy`) and `incoming_ms` is how often the server expects to hear
/// from the client (derived from `cx`). A missing client header disables
/// both directions.
pub fn negotiate_heartbeat(
    client: Option<HeartbeatSettings>,
    server_min_ms: u64,
) -> HeartbeatSettings {
    let Some(client) = client else {
        return HeartbeatSettings::DISABLED;
    };
    HeartbeatSettings {
        outgoing_ms: negotiate_interval(client.incoming_ms, server_min_ms),
        incoming_ms: negotiate_interval(client.outgoing_ms, server_min_ms),
    }
}
