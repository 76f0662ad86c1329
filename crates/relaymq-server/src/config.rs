//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use relaymq_protocol::DEFAULT_MAX_FRAME_SIZE;
use relaymq_protocol::stomp::StompVersion;

use crate::error::{ServerError, ServerResult};

/// Default STOMP listen address.
pub const DEFAULT_STOMP_ADDR: &str = "127.0.0.1:61613";

/// Default remoting listen address.
pub const DEFAULT_REMOTING_ADDR: &str = "127.0.0.1:5445";

/// STOMP session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompConfig {
    /// Protocol versions the server will negotiate.
    pub versions: Vec<StompVersion>,

    /// Lower bound applied to every non-zero heartbeat interval.
    pub min_heartbeat: Duration,

    /// A client is dropped after `incoming interval × multiplier` of silence.
    pub heartbeat_timeout_multiplier: u32,

    /// Largest accepted frame, head and body included.
    pub max_frame_size: usize,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            versions: vec![StompVersion::v1_0(), StompVersion::v1_1()],
            min_heartbeat: Duration::from_millis(500),
            heartbeat_timeout_multiplier: 2,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl StompConfig {
    /// Builder: set supported versions.
    pub fn with_versions<I, V>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<StompVersion>,
    {
        self.versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the minimum heartbeat interval.
    pub fn with_min_heartbeat(mut self, min: Duration) -> Self {
        self.min_heartbeat = min;
        self
    }

    /// Builder: set the heartbeat timeout multiplier.
    pub fn with_heartbeat_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.heartbeat_timeout_multiplier = multiplier;
        self
    }

    /// Builder: set the maximum frame size.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Minimum heartbeat in whole milliseconds.
    pub fn min_heartbeat_ms(&self) -> u64 {
        u64::try_from(self.min_heartbeat.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// STOMP listen address.
    pub stomp_addr: SocketAddr,

    /// Remoting listen address.
    pub remoting_addr: SocketAddr,

    /// Maximum concurrent connections per listener.
    pub max_connections: usize,

    /// Id of this node within the cluster.
    pub server_id: u32,

    /// STOMP session settings.
    pub stomp: StompConfig,

    /// Bound on a single topology push to one callback channel.
    pub callback_send_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stomp_addr: SocketAddr::from(([127, 0, 0, 1], 61613)),
            remoting_addr: SocketAddr::from(([127, 0, 0, 1], 5445)),
            max_connections: 100,
            server_id: 0,
            stomp: StompConfig::default(),
            callback_send_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Builder: set the STOMP listen address.
    pub fn with_stomp_addr(mut self, addr: SocketAddr) -> Self {
        self.stomp_addr = addr;
        self
    }

    /// Builder: set the remoting listen address.
    pub fn with_remoting_addr(mut self, addr: SocketAddr) -> Self {
        self.remoting_addr = addr;
        self
    }

    /// Builder: set max connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder: set the server id.
    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// Builder: set the STOMP settings.
    pub fn with_stomp(mut self, stomp: StompConfig) -> Self {
        self.stomp = stomp;
        self
    }

    /// Builder: set the callback send timeout.
    pub fn with_callback_send_timeout(mut self, timeout: Duration) -> Self {
        self.callback_send_timeout = timeout;
        self
    }

    /// Checks the settings for values the server cannot run with.
    pub fn validate(&self) -> ServerResult<()> {
        if self.max_connections == 0 {
            return Err(ServerError::config("max_connections must be at least 1"));
        }
        if self.stomp.versions.is_empty() {
            return Err(ServerError::config(
                "at least one STOMP version must be supported",
            ));
        }
        if self.stomp.heartbeat_timeout_multiplier == 0 {
            return Err(ServerError::config(
                "heartbeat_timeout_multiplier must be at least 1",
            ));
        }
        if self.stomp.max_frame_size == 0 {
            return Err(ServerError::config("max_frame_size must be positive"));
        }
        if self.callback_send_timeout.is_zero() {
            return Err(ServerError::config("callback_send_timeout must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.stomp_addr.to_string(), DEFAULT_STOMP_ADDR);
        assert_eq!(config.remoting_addr.to_string(), DEFAULT_REMOTING_ADDR);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.server_id, 0);
        assert_eq!(config.callback_send_timeout, Duration::from_secs(5));
        assert_eq!(config.stomp.min_heartbeat_ms(), 500);
        assert_eq!(config.stomp.heartbeat_timeout_multiplier, 2);
        assert_eq!(
            config.stomp.versions,
            vec![StompVersion::v1_0(), StompVersion::v1_1()]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_config() {
        let config = ServerConfig::default()
            .with_max_connections(5)
            .with_server_id(3)
            .with_stomp(
                StompConfig::default()
                    .with_versions(["1.0"])
                    .with_min_heartbeat(Duration::from_millis(250)),
            );

        assert_eq!(config.max_connections, 5);
        assert_eq!(config.server_id, 3);
        assert_eq!(config.stomp.versions, vec![StompVersion::v1_0()]);
        assert_eq!(config.stomp.min_heartbeat_ms(), 250);
    }

    #[test]
    fn validation_rejects_unusable_values() {
        let config = ServerConfig::default().with_max_connections(0);
        assert!(matches!(config.validate(), Err(ServerError::Config { .. })));

        let config = ServerConfig::default()
            .with_stomp(StompConfig::default().with_versions(Vec::<StompVersion>::new()));
        assert!(matches!(config.validate(), Err(ServerError::Config { .. })));

        let config = ServerConfig::default()
            .with_stomp(StompConfig::default().with_heartbeat_timeout_multiplier(0));
        assert!(matches!(config.validate(), Err(ServerError::Config { .. })));
    }
}
