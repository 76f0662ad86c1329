//! STOMP protocol version negotiation.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

/// A STOMP protocol version such as `1.0` or `1.1`.
///
/// Ordering compares dot-separated segments numerically when both sides
/// parse as integers and lexicographically otherwise, so `1.10 > 1.9`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StompVersion(String);

impl StompVersion {
    /// Creates a version from its textual form.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into().trim().to_string())
    }

    /// STOMP 1.0.
    pub fn v1_0() -> Self {
        Self::new("1.0")
    }

    /// STOMP 1.1.
    pub fn v1_1() -> Self {
        Self::new("1.1")
    }

    /// Returns the textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Header escaping applies from 1.1 on.
    pub fn supports_escaping(&self) -> bool {
        *self >= Self::v1_1()
    }

    /// NACK frames exist from 1.1 on.
    pub fn supports_nack(&self) -> bool {
        *self >= Self::v1_1()
    }

    /// 1.0 sessions may omit the subscription id and acknowledge by
    /// `message-id` alone.
    pub fn requires_subscription_id(&self) -> bool {
        *self >= Self::v1_1()
    }
}

impl Ord for StompVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut ours = self.0.split('.');
        let mut theirs = other.0.split('.');
        loop {
            match (ours.next(), theirs.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => {
                    let ordering = match (a.parse::<u64>(), b.parse::<u64>()) {
                        (Ok(a), Ok(b)) => a.cmp(&b),
                        _ => a.cmp(b),
                    };
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
            }
        }
    }
}

impl PartialOrd for StompVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StompVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StompVersion {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Outcome of version negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedVersion {
    /// Version the session speaks.
    pub version: StompVersion,
    /// Whether CONNECTED should carry a `version` header. False when the
    /// client sent no `accept-version` and is treated as a 1.0 client.
    pub announced: bool,
}

/// Picks the session version from the client's `accept-version` header.
///
/// Without the header the oldest supported version is used and not
/// announced. Otherwise the highest version present in both sets wins;
/// an empty intersection is an error.
pub fn negotiate_version(
    accept_version: Option<&str>,
    supported: &[StompVersion],
) -> ProtocolResult<NegotiatedVersion> {
    let Some(accept) = accept_version else {
        let oldest = supported
            .iter()
            .min()
            .cloned()
            .unwrap_or_else(StompVersion::v1_0);
        return Ok(NegotiatedVersion {
            version: oldest,
            announced: false,
        });
    };

    let best = accept
        .split(',')
        .map(StompVersion::new)
        .filter(|offered| !offered.as_str().is_empty() && supported.contains(offered))
        .max();

    match best {
        Some(version) => Ok(NegotiatedVersion {
            version,
            announced: true,
        }),
        None => Err(ProtocolError::UnsupportedVersion {
            offered: accept.to_string(),
            supported: supported_list(supported),
        }),
    }
}

/// Formats versions as a comma separated list, oldest first.
pub fn supported_list(supported: &[StompVersion]) -> String {
    let mut versions: Vec<&StompVersion> = supported.iter().collect();
    versions.sort();
    versions
        .iter()
        .map(|v| v.as_str())
        .collect::<Vec<_>>()
        .join(",")
}
