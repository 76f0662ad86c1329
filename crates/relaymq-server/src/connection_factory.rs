//! Connection factory endpoint and the server connections it creates.
//!
//! A factory authenticates clients, creates a [`ConnectionEndpoint`] per
//! successful login and registers it with the dispatcher under a fresh id.
//! It also owns the factory's topology and pushes every change to the
//! callback channels clients registered with `UpdateCallback`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use relaymq_core::{ClientInstanceId, HandlerId, SessionId};
use relaymq_protocol::{ConnectionFactoryDelegate, Packet, PacketKind, TopologySnapshot};
use tracing::{debug, info, instrument, warn};

use crate::auth::{Authenticator, SecurityContext};
use crate::callbacks::{CallbackChannel, CallbackKey, CallbackRegistry};
use crate::dispatcher::{PacketDispatcher, PacketHandler, PacketSender};
use crate::error::{DispatchError, HandlerError};
use crate::topology::TopologyManager;

/// Settings of one connection factory.
#[derive(Debug, Clone)]
pub struct ConnectionFactoryConfig {
    /// Unique factory name, also its handler id.
    pub name: String,
    /// Id of the server hosting the factory.
    pub server_id: u32,
    /// Client id used when neither the request nor the user provides one.
    pub default_client_id: Option<String>,
    /// Bound on a single topology push.
    pub callback_send_timeout: Duration,
}

impl ConnectionFactoryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            server_id: 0,
            default_client_id: None,
            callback_send_timeout: Duration::from_secs(5),
        }
    }

    /// Builder: set the server id.
    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    /// Builder: set the default client id.
    pub fn with_default_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.default_client_id = Some(client_id.into());
        self
    }

    /// Builder: set the callback send timeout.
    pub fn with_callback_send_timeout(mut self, timeout: Duration) -> Self {
        self.callback_send_timeout = timeout;
        self
    }
}

/// Arguments of [`ConnectionFactoryEndpoint::create_connection`].
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Node the client is failing over from; negative for a normal connect.
    pub failed_node_id: i32,
    pub client_instance_id: ClientInstanceId,
    /// Per-connection client id overriding every configured default.
    pub client_id: Option<String>,
    /// Transport session the connection is opened on.
    pub session_id: SessionId,
    /// Wire version of that session.
    pub wire_version: u8,
}

/// Result of a successful `create_connection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDelegate {
    pub connection_id: HandlerId,
    pub server_id: u32,
    pub client_id: Option<String>,
}

/// Outcome of a topology push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Channels the snapshot was queued on.
    pub delivered: usize,
    /// Channels removed while the push was in flight.
    pub skipped: usize,
    /// Channels that were closed or timed out.
    pub failed: usize,
}

enum PushOutcome {
    Delivered,
    Skipped,
    Failed,
}

/// A connection factory.
pub struct ConnectionFactoryEndpoint {
    id: HandlerId,
    config: ConnectionFactoryConfig,
    dispatcher: Arc<PacketDispatcher>,
    authenticator: Arc<dyn Authenticator>,
    topology: TopologyManager,
    callbacks: CallbackRegistry,
    /// Connections created per transport session.
    sessions: DashMap<SessionId, Vec<HandlerId>>,
}

impl ConnectionFactoryEndpoint {
    pub fn new(
        config: ConnectionFactoryConfig,
        dispatcher: Arc<PacketDispatcher>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            id: HandlerId::new(config.name.clone()),
            topology: TopologyManager::new(config.name.clone()),
            config,
            dispatcher,
            authenticator,
            callbacks: CallbackRegistry::new(),
            sessions: DashMap::new(),
        }
    }

    /// Handler id of the factory.
    pub fn id(&self) -> &HandlerId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn server_id(&self) -> u32 {
        self.config.server_id
    }

    /// Authenticates and opens a new server connection.
    ///
    /// The client id is the request's explicit one, else the user's
    /// preconfigured one, else the factory default.
    #[instrument(
        skip_all,
        fields(
            factory = %self.config.name,
            session_id = %request.session_id,
            wire_version = request.wire_version,
        )
    )]
    pub fn create_connection(
        &self,
        request: ConnectionRequest,
    ) -> Result<ConnectionDelegate, HandlerError> {
        let context = self
            .authenticator
            .authenticate(request.username.as_deref(), request.password.as_deref())
            .inspect_err(|e| warn!(error = %e, "Connection refused"))?;

        let client_id = request
            .client_id
            .or_else(|| {
                context
                    .principal()
                    .and_then(|user| self.authenticator.preconfigured_client_id(user))
            })
            .or_else(|| self.config.default_client_id.clone());

        if request.failed_node_id >= 0 {
            info!(
                failed_node_id = request.failed_node_id,
                client_instance_id = %request.client_instance_id,
                "Client reconnecting after node failure"
            );
        }

        let connection_id = HandlerId::generate();
        let connection = ConnectionEndpoint {
            id: connection_id.clone(),
            session_id: request.session_id.clone(),
            client_id: client_id.clone(),
            dispatcher: Arc::downgrade(&self.dispatcher),
            _context: context,
        };
        self.dispatcher.register(Arc::new(connection))?;
        self.sessions
            .entry(request.session_id)
            .or_default()
            .push(connection_id.clone());

        info!(connection_id = %connection_id, client_id = ?client_id, "Connection created");
        Ok(ConnectionDelegate {
            connection_id,
            server_id: self.config.server_id,
            client_id,
        })
    }

    /// Registers a channel for topology pushes.
    pub fn add_callback_channel(
        &self,
        client_instance_id: ClientInstanceId,
        session_id: SessionId,
        channel: PacketSender,
        wire_version: u8,
    ) {
        debug!(client_instance_id = %client_instance_id, session_id = %session_id, "Callback channel added");
        self.callbacks.insert(
            CallbackKey::new(client_instance_id, session_id),
            CallbackChannel::new(channel, wire_version),
        );
    }

    /// Drops a channel. Returns true if it was registered.
    pub fn remove_callback_channel(
        &self,
        client_instance_id: &ClientInstanceId,
        session_id: &SessionId,
    ) -> bool {
        self.callbacks.remove(&CallbackKey::new(
            client_instance_id.clone(),
            session_id.clone(),
        ))
    }

    /// Number of registered callback channels.
    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    /// Current topology snapshot.
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.topology.snapshot()
    }

    /// Replaces the topology without notifying anyone.
    pub fn update_topology(
        &self,
        delegates: Vec<ConnectionFactoryDelegate>,
        failover_map: BTreeMap<u32, u32>,
    ) -> Arc<TopologySnapshot> {
        self.topology.replace(delegates, failover_map)
    }

    /// Replaces the topology and pushes it to every callback channel.
    ///
    /// Pushes run concurrently, each bounded by the callback send timeout.
    /// A failing channel is logged and pruned; it never stops the others.
    #[instrument(skip_all, fields(factory = %self.config.name))]
    pub async fn publish_topology(
        &self,
        delegates: Vec<ConnectionFactoryDelegate>,
        failover_map: BTreeMap<u32, u32>,
    ) -> PublishReport {
        let snapshot = self.update_topology(delegates, failover_map);
        let pushes = self
            .callbacks
            .snapshot()
            .into_iter()
            .map(|(key, channel)| self.push(key, channel, &snapshot));

        let mut report = PublishReport::default();
        for outcome in join_all(pushes).await {
            match outcome {
                PushOutcome::Delivered => report.delivered += 1,
                PushOutcome::Skipped => report.skipped += 1,
                PushOutcome::Failed => report.failed += 1,
            }
        }
        info!(
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "Topology published"
        );
        report
    }

    async fn push(
        &self,
        key: CallbackKey,
        channel: CallbackChannel,
        snapshot: &TopologySnapshot,
    ) -> PushOutcome {
        if !self.callbacks.contains(&key) {
            return PushOutcome::Skipped;
        }
        let packet = Packet::new(
            self.id.clone(),
            PacketKind::Topology {
                topology: snapshot.clone(),
            },
        )
        .with_version(channel.wire_version());

        match channel
            .sender()
            .send_timeout(packet, self.config.callback_send_timeout)
            .await
        {
            Ok(()) => PushOutcome::Delivered,
            Err(e) => {
                warn!(
                    client_instance_id = %key.client_instance_id,
                    session_id = %key.session_id,
                    error = %e,
                    "Topology push failed"
                );
                if matches!(e, DispatchError::ChannelClosed) {
                    self.callbacks.remove(&key);
                }
                PushOutcome::Failed
            }
        }
    }

    /// Forgets everything tied to a closed transport session: its
    /// connections are unregistered and its callback channels removed.
    pub fn release_session(&self, session_id: &SessionId) {
        let connections = self
            .sessions
            .remove(session_id)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        let unregistered = connections
            .iter()
            .filter(|id| self.dispatcher.unregister(id))
            .count();
        let callbacks = self.callbacks.remove_session(session_id);
        if unregistered > 0 || callbacks > 0 {
            debug!(
                factory = %self.config.name,
                session_id = %session_id,
                connections = unregistered,
                callbacks,
                "Released session"
            );
        }
    }
}

/// Dispatcher-facing handler for a [`ConnectionFactoryEndpoint`].
pub struct ConnectionFactoryHandler {
    endpoint: Arc<ConnectionFactoryEndpoint>,
}

impl ConnectionFactoryHandler {
    pub fn new(endpoint: Arc<ConnectionFactoryEndpoint>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl PacketHandler for ConnectionFactoryHandler {
    fn id(&self) -> &HandlerId {
        self.endpoint.id()
    }

    async fn handle(
        &self,
        packet: &Packet,
        channel: &PacketSender,
    ) -> Result<Option<Packet>, HandlerError> {
        match &packet.kind {
            PacketKind::CreateConnection {
                username,
                password,
                failed_node_id,
                client_instance_id,
                client_id,
            } => {
                let delegate = self.endpoint.create_connection(ConnectionRequest {
                    username: username.clone(),
                    password: password.clone(),
                    failed_node_id: *failed_node_id,
                    client_instance_id: client_instance_id.clone(),
                    client_id: client_id.clone(),
                    session_id: channel.session_id().clone(),
                    wire_version: packet.version,
                })?;
                Ok(Some(Packet::new(
                    self.endpoint.id().clone(),
                    PacketKind::CreateConnectionResponse {
                        connection_id: delegate.connection_id,
                        server_id: delegate.server_id,
                    },
                )))
            }
            PacketKind::GetTopology => Ok(Some(Packet::new(
                self.endpoint.id().clone(),
                PacketKind::Topology {
                    topology: (*self.endpoint.topology()).clone(),
                },
            ))),
            PacketKind::UpdateCallback {
                client_instance_id,
                add,
            } => {
                if *add {
                    self.endpoint.add_callback_channel(
                        client_instance_id.clone(),
                        channel.session_id().clone(),
                        channel.clone(),
                        packet.version,
                    );
                } else {
                    self.endpoint
                        .remove_callback_channel(client_instance_id, channel.session_id());
                }
                Ok(None)
            }
            _ => Err(HandlerError::unsupported(
                self.endpoint.id(),
                packet.packet_type(),
            )),
        }
    }
}

/// A server-side connection opened through a factory.
///
/// Holds the login's [`SecurityContext`] for as long as it is registered.
pub struct ConnectionEndpoint {
    id: HandlerId,
    session_id: SessionId,
    client_id: Option<String>,
    dispatcher: Weak<PacketDispatcher>,
    _context: SecurityContext,
}

impl ConnectionEndpoint {
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

#[async_trait]
impl PacketHandler for ConnectionEndpoint {
    fn id(&self) -> &HandlerId {
        &self.id
    }

    async fn handle(
        &self,
        packet: &Packet,
        _channel: &PacketSender,
    ) -> Result<Option<Packet>, HandlerError> {
        match packet.kind {
            PacketKind::Ping => Ok(Some(Packet::new(self.id.clone(), PacketKind::Pong))),
            PacketKind::CloseConnection => {
                if let Some(dispatcher) = self.dispatcher.upgrade() {
                    dispatcher.unregister(&self.id);
                }
                info!(connection_id = %self.id, session_id = %self.session_id, "Connection closed by client");
                Ok(Some(Packet::new(self.id.clone(), PacketKind::Closed)))
            }
            _ => Err(HandlerError::unsupported(&self.id, packet.packet_type())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticAuthenticator, UserCredentials};
    use relaymq_protocol::ErrorCode;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Arc<PacketDispatcher>,
        auth: Arc<StaticAuthenticator>,
        endpoint: Arc<ConnectionFactoryEndpoint>,
    }

    fn fixture() -> Fixture {
        let dispatcher = Arc::new(PacketDispatcher::new());
        let auth = Arc::new(StaticAuthenticator::new([
            UserCredentials::new("guest", "guest"),
            UserCredentials::new("app", "pw").with_client_id("app-client"),
        ]));
        let endpoint = Arc::new(ConnectionFactoryEndpoint::new(
            ConnectionFactoryConfig::new("cf")
                .with_server_id(7)
                .with_default_client_id("default-client")
                .with_callback_send_timeout(Duration::from_millis(20)),
            Arc::clone(&dispatcher),
            auth.clone(),
        ));
        dispatcher
            .register(Arc::new(ConnectionFactoryHandler::new(Arc::clone(&endpoint))))
            .unwrap();
        Fixture {
            dispatcher,
            auth,
            endpoint,
        }
    }

    fn request(user: &str, pass: &str, session: &str) -> ConnectionRequest {
        ConnectionRequest {
            username: Some(user.to_string()),
            password: Some(pass.to_string()),
            failed_node_id: -1,
            client_instance_id: ClientInstanceId::new("vm-1"),
            client_id: None,
            session_id: SessionId::new(session),
            wire_version: 1,
        }
    }

    fn delegates(n: u32) -> Vec<ConnectionFactoryDelegate> {
        (0..n)
            .map(|i| ConnectionFactoryDelegate::new(format!("cf@{i}"), i, format!("tcp://n{i}:5445")))
            .collect()
    }

    #[test]
    fn create_connection_registers_handler() {
        let f = fixture();
        let delegate = f.endpoint.create_connection(request("guest", "guest", "s1")).unwrap();
        assert_eq!(delegate.server_id, 7);
        assert!(f.dispatcher.contains(&delegate.connection_id));
        assert_eq!(f.auth.active_contexts(), 1);
    }

    #[test]
    fn client_id_resolution_order() {
        let f = fixture();
        let mut explicit = request("app", "pw", "s1");
        explicit.client_id = Some("explicit".into());
        assert_eq!(
            f.endpoint.create_connection(explicit).unwrap().client_id.as_deref(),
            Some("explicit")
        );
        assert_eq!(
            f.endpoint
                .create_connection(request("app", "pw", "s1"))
                .unwrap()
                .client_id
                .as_deref(),
            Some("app-client")
        );
        assert_eq!(
            f.endpoint
                .create_connection(request("guest", "guest", "s1"))
                .unwrap()
                .client_id
                .as_deref(),
            Some("default-client")
        );
    }

    #[test]
    fn failed_authentication_is_typed() {
        let f = fixture();
        let err = f
            .endpoint
            .create_connection(request("guest", "wrong", "s1"))
            .unwrap_err();
        assert!(matches!(err, HandlerError::Auth(_)));
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        assert_eq!(f.dispatcher.len(), 1);
    }

    #[test]
    fn release_session_unregisters_connections() {
        let f = fixture();
        let a = f.endpoint.create_connection(request("guest", "guest", "s1")).unwrap();
        let b = f.endpoint.create_connection(request("guest", "guest", "s2")).unwrap();
        let (sender, _rx) = PacketSender::channel(SessionId::new("s1"), 4);
        f.endpoint
            .add_callback_channel(ClientInstanceId::new("vm-1"), SessionId::new("s1"), sender, 1);

        f.endpoint.release_session(&SessionId::new("s1"));

        assert!(!f.dispatcher.contains(&a.connection_id));
        assert!(f.dispatcher.contains(&b.connection_id));
        assert_eq!(f.endpoint.callback_count(), 0);
        assert_eq!(f.auth.active_contexts(), 1);
    }

    #[test]
    fn update_topology_does_not_notify() {
        let f = fixture();
        let (sender, mut rx) = PacketSender::channel(SessionId::new("s1"), 4);
        f.endpoint
            .add_callback_channel(ClientInstanceId::new("vm-1"), SessionId::new("s1"), sender, 1);

        f.endpoint.update_topology(delegates(2), BTreeMap::from([(0, 1)]));
        assert_eq!(f.endpoint.topology().delegates.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_reaches_every_channel_with_its_version() {
        let f = fixture();
        let (s1, mut rx1) = PacketSender::channel(SessionId::new("s1"), 4);
        let (s2, mut rx2) = PacketSender::channel(SessionId::new("s2"), 4);
        f.endpoint
            .add_callback_channel(ClientInstanceId::new("vm-1"), SessionId::new("s1"), s1, 1);
        f.endpoint
            .add_callback_channel(ClientInstanceId::new("vm-2"), SessionId::new("s2"), s2, 2);

        let report = f
            .endpoint
            .publish_topology(delegates(3), BTreeMap::from([(0, 2)]))
            .await;
        assert_eq!(report.delivered, 2);

        let pushed = rx1.recv().await.unwrap();
        assert_eq!(pushed.version, 1);
        assert_eq!(pushed.target_id, HandlerId::new("cf"));
        assert_eq!(pushed.correlation_id, 0);
        match pushed.kind {
            PacketKind::Topology { topology } => {
                assert_eq!(topology.factory_name, "cf");
                assert_eq!(topology.delegates.len(), 3);
                assert_eq!(topology.failover_map.get(&0), Some(&2));
            }
            other => panic!("unexpected packet {other:?}"),
        }
        assert_eq!(rx2.recv().await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn failing_channels_do_not_block_others() {
        let f = fixture();
        // Full channel: times out.
        let (slow, _slow_rx) = PacketSender::channel(SessionId::new("slow"), 1);
        slow.send(Packet::new("x", PacketKind::Ping)).await.unwrap();
        // Closed channel: pruned.
        let (gone, gone_rx) = PacketSender::channel(SessionId::new("gone"), 1);
        drop(gone_rx);
        let (ok, mut ok_rx) = PacketSender::channel(SessionId::new("ok"), 4);

        f.endpoint
            .add_callback_channel(ClientInstanceId::new("a"), SessionId::new("slow"), slow, 1);
        f.endpoint
            .add_callback_channel(ClientInstanceId::new("b"), SessionId::new("gone"), gone, 1);
        f.endpoint
            .add_callback_channel(ClientInstanceId::new("c"), SessionId::new("ok"), ok, 1);

        let report = f.endpoint.publish_topology(delegates(1), BTreeMap::new()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert!(ok_rx.recv().await.is_some());
        assert_eq!(f.endpoint.callback_count(), 2);
    }

    #[tokio::test]
    async fn handler_serves_remoting_requests() {
        let f = fixture();
        let (reply, mut rx) = PacketSender::channel(SessionId::new("s1"), 8);

        let create = Packet::new(
            "cf",
            PacketKind::CreateConnection {
                username: Some("guest".into()),
                password: Some("guest".into()),
                failed_node_id: -1,
                client_instance_id: ClientInstanceId::new("vm-1"),
                client_id: None,
            },
        )
        .with_correlation(1);
        f.dispatcher.dispatch(create, &reply).await.unwrap();
        let connection_id = match rx.recv().await.unwrap().kind {
            PacketKind::CreateConnectionResponse {
                connection_id,
                server_id,
            } => {
                assert_eq!(server_id, 7);
                connection_id
            }
            other => panic!("unexpected packet {other:?}"),
        };

        let register = Packet::new(
            "cf",
            PacketKind::UpdateCallback {
                client_instance_id: ClientInstanceId::new("vm-1"),
                add: true,
            },
        );
        f.dispatcher.dispatch(register, &reply).await.unwrap();
        assert_eq!(f.endpoint.callback_count(), 1);

        let ping = Packet::new(connection_id.clone(), PacketKind::Ping).with_correlation(2);
        f.dispatcher.dispatch(ping, &reply).await.unwrap();
        let pong = rx.recv().await.unwrap();
        assert_eq!(pong.kind, PacketKind::Pong);
        assert_eq!(pong.correlation_id, 2);

        let close = Packet::new(connection_id.clone(), PacketKind::CloseConnection);
        f.dispatcher.dispatch(close, &reply).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().kind, PacketKind::Closed);
        assert!(!f.dispatcher.contains(&connection_id));
        assert_eq!(f.auth.active_contexts(), 0);

        let topology = Packet::new(connection_id, PacketKind::GetTopology).with_correlation(3);
        f.dispatcher.dispatch(topology, &reply).await.unwrap();
        let response = rx.recv().await.unwrap();
        assert_eq!(response.as_error().unwrap().code, ErrorCode::UnknownTarget);
    }

    #[tokio::test]
    async fn connection_rejects_factory_packets() {
        let f = fixture();
        let delegate = f.endpoint.create_connection(request("guest", "guest", "s1")).unwrap();
        let (reply, mut rx): (PacketSender, mpsc::Receiver<Packet>) =
            PacketSender::channel(SessionId::new("s1"), 4);
        let packet = Packet::new(delegate.connection_id, PacketKind::GetTopology);
        f.dispatcher.dispatch(packet, &reply).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap().as_error().unwrap().code,
            ErrorCode::UnsupportedPacket
        );
    }
}
