//! Broker configuration file.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/relaymq/config.toml` by default:
//!
//! ```toml
//! [server]
//! stomp_addr = "127.0.0.1:61613"
//! remoting_addr = "127.0.0.1:5445"
//! allow_anonymous = false
//!
//! [stomp]
//! versions = ["1.0", "1.1"]
//! min_heartbeat_ms = 500
//!
//! [[users]]
//! username = "guest"
//! password = "guest"
//!
//! [[connection_factories]]
//! name = "default"
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use relaymq_server::{
    ConnectionFactoryConfig, ServerConfig, StaticAuthenticator, StompConfig, UserCredentials,
};
use serde::{Deserialize, Serialize};

use crate::cli::ServeArgs;
use crate::error::{CliError, CliResult};

/// Factory created when the file declares none.
pub const DEFAULT_FACTORY_NAME: &str = "default";

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Listener and node settings.
    pub server: ServerSettings,

    /// STOMP session settings.
    pub stomp: StompSettings,

    /// Accounts accepted by the authenticator.
    pub users: Vec<UserCredentials>,

    /// Connection factories to register.
    pub connection_factories: Vec<FactorySettings>,
}

/// `[server]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub stomp_addr: SocketAddr,
    pub remoting_addr: SocketAddr,
    pub max_connections: usize,
    pub server_id: u32,
    /// Bound on one topology push, in milliseconds.
    pub callback_send_timeout_ms: u64,
    /// Accept connections without a login.
    pub allow_anonymous: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            stomp_addr: defaults.stomp_addr,
            remoting_addr: defaults.remoting_addr,
            max_connections: defaults.max_connections,
            server_id: defaults.server_id,
            callback_send_timeout_ms: defaults.callback_send_timeout.as_millis() as u64,
            allow_anonymous: false,
        }
    }
}

/// `[stomp]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StompSettings {
    pub versions: Vec<String>,
    pub min_heartbeat_ms: u64,
    pub heartbeat_timeout_multiplier: u32,
    pub max_frame_size: usize,
}

impl Default for StompSettings {
    fn default() -> Self {
        let defaults = StompConfig::default();
        Self {
            versions: defaults
                .versions
                .iter()
                .map(|v| v.as_str().to_string())
                .collect(),
            min_heartbeat_ms: defaults.min_heartbeat_ms(),
            heartbeat_timeout_multiplier: defaults.heartbeat_timeout_multiplier,
            max_frame_size: defaults.max_frame_size,
        }
    }
}

/// `[[connection_factories]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorySettings {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_client_id: Option<String>,
}

impl BrokerConfig {
    /// Loads configuration from the default path, or defaults if the file
    /// does not exist.
    pub fn load() -> CliResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> CliResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CliError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| CliError::ParseConfig {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("relaymq")
    }

    /// Applies command-line overrides.
    pub fn apply(&mut self, args: &ServeArgs) {
        if let Some(addr) = args.stomp_addr {
            self.server.stomp_addr = addr;
        }
        if let Some(addr) = args.remoting_addr {
            self.server.remoting_addr = addr;
        }
        if let Some(id) = args.server_id {
            self.server.server_id = id;
        }
    }

    /// Builds the server configuration.
    pub fn server_config(&self) -> ServerConfig {
        let stomp = StompConfig::default()
            .with_versions(self.stomp.versions.iter().map(String::as_str))
            .with_min_heartbeat(Duration::from_millis(self.stomp.min_heartbeat_ms))
            .with_heartbeat_timeout_multiplier(self.stomp.heartbeat_timeout_multiplier)
            .with_max_frame_size(self.stomp.max_frame_size);
        ServerConfig::default()
            .with_stomp_addr(self.server.stomp_addr)
            .with_remoting_addr(self.server.remoting_addr)
            .with_max_connections(self.server.max_connections)
            .with_server_id(self.server.server_id)
            .with_callback_send_timeout(Duration::from_millis(
                self.server.callback_send_timeout_ms,
            ))
            .with_stomp(stomp)
    }

    /// Builds the authenticator from `[[users]]`.
    pub fn authenticator(&self) -> StaticAuthenticator {
        StaticAuthenticator::new(self.users.iter().cloned())
            .with_anonymous(self.server.allow_anonymous)
    }

    /// Factory settings, prefilled from `[server]`. Falls back to a single
    /// factory named [`DEFAULT_FACTORY_NAME`].
    pub fn factory_configs(&self) -> Vec<ConnectionFactoryConfig> {
        let fallback = [FactorySettings {
            name: DEFAULT_FACTORY_NAME.to_string(),
            default_client_id: None,
        }];
        let factories = if self.connection_factories.is_empty() {
            &fallback[..]
        } else {
            &self.connection_factories[..]
        };
        factories
            .iter()
            .map(|factory| {
                let config = ConnectionFactoryConfig::new(factory.name.clone())
                    .with_server_id(self.server.server_id)
                    .with_callback_send_timeout(Duration::from_millis(
                        self.server.callback_send_timeout_ms,
                    ));
                match &factory.default_client_id {
                    Some(client_id) => config.with_default_client_id(client_id.clone()),
                    None => config,
                }
            })
            .collect()
    }

    /// Checks everything the server would reject, plus duplicate names.
    pub fn validate(&self) -> CliResult<()> {
        self.server_config().validate()?;
        if self.server.stomp_addr == self.server.remoting_addr
            && self.server.stomp_addr.port() != 0
        {
            return Err(CliError::config(format!(
                "stomp_addr and remoting_addr are both {}",
                self.server.stomp_addr
            )));
        }

        let mut seen = HashSet::new();
        for user in &self.users {
            if user.username.is_empty() {
                return Err(CliError::config("user with an empty username"));
            }
            if !seen.insert(user.username.as_str()) {
                return Err(CliError::config(format!(
                    "duplicate user {:?}",
                    user.username
                )));
            }
        }

        let mut seen = HashSet::new();
        for factory in &self.connection_factories {
            if factory.name.is_empty() {
                return Err(CliError::config("connection factory with an empty name"));
            }
            if !seen.insert(factory.name.as_str()) {
                return Err(CliError::config(format!(
                    "duplicate connection factory {:?}",
                    factory.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymq_protocol::stomp::StompVersion;
    use relaymq_server::{Authenticator, ServerError};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FULL: &str = r#"
[server]
stomp_addr = "0.0.0.0:61614"
remoting_addr = "0.0.0.0:5446"
max_connections = 10
server_id = 2
callback_send_timeout_ms = 250

[stomp]
versions = ["1.0"]
min_heartbeat_ms = 1000
heartbeat_timeout_multiplier = 3

[[users]]
username = "guest"
password = "guest"

[[users]]
username = "app"
password = "secret"
client_id = "app-client"

[[connection_factories]]
name = "cf"
default_client_id = "fallback"
"#;

    fn write(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_gives_defaults() {
        let file = write("");
        let config = BrokerConfig::load_from(file.path()).unwrap();
        assert_eq!(config, BrokerConfig::default());

        let server = config.server_config();
        assert_eq!(server.stomp_addr.to_string(), "127.0.0.1:61613");
        assert_eq!(server.remoting_addr.to_string(), "127.0.0.1:5445");
        assert_eq!(server.stomp.min_heartbeat_ms(), 500);
        assert_eq!(server.stomp.heartbeat_timeout_multiplier, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_file_is_mapped() {
        let file = write(FULL);
        let config = BrokerConfig::load_from(file.path()).unwrap();
        config.validate().unwrap();

        let server = config.server_config();
        assert_eq!(server.stomp_addr.port(), 61614);
        assert_eq!(server.max_connections, 10);
        assert_eq!(server.server_id, 2);
        assert_eq!(server.callback_send_timeout, Duration::from_millis(250));
        assert_eq!(server.stomp.versions, vec![StompVersion::v1_0()]);
        assert_eq!(server.stomp.min_heartbeat_ms(), 1000);
        assert_eq!(server.stomp.heartbeat_timeout_multiplier, 3);

        let auth = config.authenticator();
        assert!(auth.authenticate(Some("app"), Some("secret")).is_ok());
        assert!(auth.authenticate(None, None).is_err());
        assert_eq!(
            auth.preconfigured_client_id("app"),
            Some("app-client".to_string())
        );

        let factories = config.factory_configs();
        assert_eq!(factories.len(), 1);
        assert_eq!(factories[0].name, "cf");
        assert_eq!(factories[0].server_id, 2);
        assert_eq!(factories[0].default_client_id.as_deref(), Some("fallback"));
    }

    #[test]
    fn default_factory_when_none_declared() {
        let factories = BrokerConfig::default().factory_configs();
        assert_eq!(factories.len(), 1);
        assert_eq!(factories[0].name, DEFAULT_FACTORY_NAME);
    }

    #[test]
    fn overrides_apply() {
        let mut config = BrokerConfig::default();
        config.apply(&ServeArgs {
            stomp_addr: Some("127.0.0.1:7000".parse().unwrap()),
            remoting_addr: None,
            server_id: Some(9),
        });
        assert_eq!(config.server.stomp_addr.port(), 7000);
        assert_eq!(config.server.remoting_addr.port(), 5445);
        assert_eq!(config.server.server_id, 9);
    }

    #[test]
    fn parse_errors_name_the_file() {
        let file = write("[server]\nstomp_addr = \"not an address\"\n");
        let err = BrokerConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, CliError::ParseConfig { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BrokerConfig::load_from(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, CliError::ReadConfig { .. }));
    }

    #[test]
    fn validation_catches_conflicts() {
        let mut config = BrokerConfig::default();
        config.users = vec![
            UserCredentials::new("a", "1"),
            UserCredentials::new("a", "2"),
        ];
        assert!(matches!(config.validate(), Err(CliError::Config(_))));

        let mut config = BrokerConfig::default();
        config.connection_factories = vec![
            FactorySettings {
                name: "cf".into(),
                default_client_id: None,
            },
            FactorySettings {
                name: "cf".into(),
                default_client_id: None,
            },
        ];
        assert!(matches!(config.validate(), Err(CliError::Config(_))));

        let mut config = BrokerConfig::default();
        config.server.remoting_addr = config.server.stomp_addr;
        assert!(matches!(config.validate(), Err(CliError::Config(_))));

        let mut config = BrokerConfig::default();
        config.stomp.versions.clear();
        assert!(matches!(
            config.validate(),
            Err(CliError::Server(ServerError::Config { .. }))
        ));
    }

    #[test]
    fn dump_round_trips_through_toml() {
        let file = write(FULL);
        let config = BrokerConfig::load_from(file.path()).unwrap();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: BrokerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}
