//! STOMP session state machine.
//!
//! The engine is transport-free: the connection task feeds it decoded
//! frames and backend deliveries, and writes whatever frames it returns.
//!
//! ```text
//! AwaitingConnect --CONNECT/STOMP--> Connected --DISCONNECT / fatal error--> Disconnected
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use relaymq_core::SessionId;
use relaymq_protocol::stomp::{
    HeartbeatSettings, StompFrame, StompVersion, command, header, negotiate_heartbeat,
    negotiate_version,
};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::auth::{Authenticator, SecurityContext};
use crate::backend::{AckMode, Delivery, DeliveryBackend};
use crate::config::StompConfig;
use crate::error::StompError;

/// Value of the `server` header in CONNECTED frames.
pub fn server_name() -> String {
    format!("relaymq/{}", env!("CARGO_PKG_VERSION"))
}

/// Builds the ERROR frame for `error`, echoing `receipt` as `receipt-id`.
pub fn error_frame(error: &StompError, receipt: Option<&str>) -> StompFrame {
    let mut frame = StompFrame::new(command::ERROR).header(header::MESSAGE, error.summary());
    if let Some(receipt) = receipt {
        frame.push_header(header::RECEIPT_ID, receipt);
    }
    frame
        .header(header::CONTENT_TYPE, "text/plain")
        .body(error.to_string())
}

fn receipt_frame(receipt: &str) -> StompFrame {
    StompFrame::new(command::RECEIPT).header(header::RECEIPT_ID, receipt)
}

fn require<'a>(frame: &'a StompFrame, name: &'static str) -> Result<&'a str, StompError> {
    frame.get(name).ok_or_else(|| StompError::MissingHeader {
        command: frame.command().to_string(),
        header: name,
    })
}

/// Collaborators shared by every STOMP session.
#[derive(Clone)]
pub struct StompServices {
    pub authenticator: Arc<dyn Authenticator>,
    pub backend: Arc<dyn DeliveryBackend>,
    pub config: Arc<StompConfig>,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    AwaitingConnect,
    Connected,
    Disconnected,
}

/// An active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub destination: String,
    pub ack_mode: AckMode,
    /// Backend generation; deliveries tagged with another one are stale.
    pub generation: u64,
}

/// A MESSAGE sent under a non-auto subscription and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingDelivery {
    message_id: String,
    subscription_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack,
}

/// Parameters fixed by a successful CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    pub version: StompVersion,
    /// Negotiated heartbeats, seen from the server.
    pub heartbeat: HeartbeatSettings,
}

/// What the connection has to do after a frame.
#[derive(Debug, Default)]
pub struct EngineOutput {
    /// Frames to write, in order.
    pub frames: Vec<StompFrame>,
    /// Set once, by the frame that completed CONNECT.
    pub connected: Option<SessionParams>,
    /// Close the connection after writing `frames`.
    pub close: bool,
}

/// Per-connection STOMP protocol engine.
pub struct StompEngine {
    session_id: SessionId,
    services: StompServices,
    outbox: mpsc::UnboundedSender<Delivery>,
    state: EngineState,
    version: StompVersion,
    attached: bool,
    context: Option<SecurityContext>,
    subscriptions: HashMap<String, Subscription>,
    pending: Vec<PendingDelivery>,
}

impl StompEngine {
    /// Creates an engine and the channel its backend deliveries arrive on.
    pub fn new(
        session_id: SessionId,
        services: StompServices,
    ) -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (outbox, deliveries) = mpsc::unbounded_channel();
        let engine = Self {
            session_id,
            services,
            outbox,
            state: EngineState::AwaitingConnect,
            version: StompVersion::v1_0(),
            attached: false,
            context: None,
            subscriptions: HashMap::new(),
            pending: Vec::new(),
        };
        (engine, deliveries)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Negotiated version; `1.0` until connected.
    pub fn version(&self) -> &StompVersion {
        &self.version
    }

    pub fn subscription(&self, id: &str) -> Option<&Subscription> {
        self.subscriptions.get(id)
    }

    /// Number of deliveries awaiting ACK or NACK.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Handles one inbound frame.
    ///
    /// Failures are answered with an ERROR frame; fatal ones also set
    /// `close`. A `receipt` header on a failed frame is echoed as
    /// `receipt-id` on the ERROR.
    #[instrument(skip_all, fields(session_id = %self.session_id, command = %frame.command()))]
    pub async fn on_frame(&mut self, frame: StompFrame) -> EngineOutput {
        let receipt = frame.get(header::RECEIPT).map(str::to_owned);
        match self.handle_frame(frame).await {
            Ok(output) => output,
            Err(e) => {
                let close = e.closes_connection();
                if close {
                    warn!(error = %e, "Closing session");
                    self.state = EngineState::Disconnected;
                } else {
                    debug!(error = %e, "Frame rejected");
                }
                EngineOutput {
                    frames: vec![error_frame(&e, receipt.as_deref())],
                    connected: None,
                    close,
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: StompFrame) -> Result<EngineOutput, StompError> {
        match self.state {
            EngineState::Disconnected => Ok(EngineOutput::default()),
            EngineState::AwaitingConnect => {
                if frame.is(command::CONNECT) || frame.is(command::STOMP) {
                    self.connect(&frame).await
                } else {
                    Err(StompError::NotConnected {
                        command: frame.command().to_string(),
                    })
                }
            }
            EngineState::Connected => self.handle_connected(frame).await,
        }
    }

    async fn handle_connected(&mut self, frame: StompFrame) -> Result<EngineOutput, StompError> {
        let receipt = frame.get(header::RECEIPT).map(str::to_owned);
        let command = frame.command().to_owned();
        let mut close = false;

        match command.as_str() {
            command::CONNECT | command::STOMP => return Err(StompError::AlreadyConnected),
            command::SEND => self.on_send(frame).await?,
            command::SUBSCRIBE => self.on_subscribe(&frame).await?,
            command::UNSUBSCRIBE => self.on_unsubscribe(&frame).await?,
            command::ACK => self.on_settle(&frame, Settlement::Ack).await?,
            command::NACK => self.on_settle(&frame, Settlement::Nack).await?,
            command::DISCONNECT => {
                info!("Client disconnected");
                self.state = EngineState::Disconnected;
                close = true;
            }
            command::BEGIN | command::COMMIT | command::ABORT => {
                return Err(StompError::Unsupported {
                    command,
                    detail: ": transactions are not available".to_string(),
                });
            }
            _ => {
                return Err(StompError::Unsupported {
                    command,
                    detail: String::new(),
                });
            }
        }

        Ok(EngineOutput {
            frames: receipt.as_deref().map(receipt_frame).into_iter().collect(),
            connected: None,
            close,
        })
    }

    async fn connect(&mut self, frame: &StompFrame) -> Result<EngineOutput, StompError> {
        let config = Arc::clone(&self.services.config);
        let negotiated = negotiate_version(frame.get(header::ACCEPT_VERSION), &config.versions)
            .map_err(StompError::Negotiation)?;

        // 1.0 clients that do not announce a version get no heartbeats.
        let heartbeat = if negotiated.announced {
            let requested = frame
                .get(header::HEART_BEAT)
                .map(HeartbeatSettings::parse_header)
                .transpose()
                .map_err(StompError::Negotiation)?;
            negotiate_heartbeat(requested, config.min_heartbeat_ms())
        } else {
            HeartbeatSettings::DISABLED
        };

        let context = self
            .services
            .authenticator
            .authenticate(frame.get(header::LOGIN), frame.get(header::PASSCODE))?;

        self.services
            .backend
            .attach(&self.session_id, self.outbox.clone())
            .await;
        self.attached = true;
        self.state = EngineState::Connected;
        self.version = negotiated.version.clone();
        self.context = Some(context);

        let mut connected = StompFrame::new(command::CONNECTED);
        if negotiated.announced {
            connected.push_header(header::VERSION, negotiated.version.as_str());
        }
        connected.push_header(header::SESSION, self.session_id.as_str());
        connected.push_header(header::SERVER, server_name());
        if negotiated.announced {
            connected.push_header(header::HEART_BEAT, heartbeat.to_header_value());
        }

        info!(
            version = %negotiated.version,
            heart_beat = %heartbeat.to_header_value(),
            principal = ?self.context.as_ref().and_then(|c| c.principal()),
            "Session connected"
        );
        Ok(EngineOutput {
            frames: vec![connected],
            connected: Some(SessionParams {
                version: negotiated.version,
                heartbeat,
            }),
            close: false,
        })
    }

    async fn on_send(&mut self, frame: StompFrame) -> Result<(), StompError> {
        let destination = require(&frame, header::DESTINATION)?.to_owned();
        let headers: Vec<(String, String)> = frame
            .headers()
            .iter()
            .filter(|(key, _)| {
                !matches!(
                    key.as_str(),
                    header::RECEIPT | header::DESTINATION | header::SUBSCRIPTION | header::MESSAGE_ID
                )
            })
            .cloned()
            .collect();
        let message_id = self
            .services
            .backend
            .send(&destination, headers, frame.payload().clone())
            .await?;
        debug!(destination = %destination, message_id = %message_id, "Message sent");
        Ok(())
    }

    async fn on_subscribe(&mut self, frame: &StompFrame) -> Result<(), StompError> {
        let destination = require(frame, header::DESTINATION)?;
        let id = match frame.get(header::ID) {
            Some(id) => id,
            None if !self.version.requires_subscription_id() => destination,
            None => require(frame, header::ID)?,
        };
        let ack_mode = match frame.get(header::ACK) {
            None => AckMode::Auto,
            Some(value) => value.parse().map_err(|_| StompError::InvalidHeader {
                header: header::ACK,
                value: value.to_string(),
            })?,
        };
        if self.subscriptions.contains_key(id) {
            return Err(StompError::DuplicateSubscription { id: id.to_string() });
        }

        let generation = self
            .services
            .backend
            .subscribe(&self.session_id, id, destination, ack_mode)
            .await?;
        self.subscriptions.insert(
            id.to_string(),
            Subscription {
                id: id.to_string(),
                destination: destination.to_string(),
                ack_mode,
                generation,
            },
        );
        debug!(subscription = %id, destination = %destination, ack = %ack_mode, "Subscribed");
        Ok(())
    }

    async fn on_unsubscribe(&mut self, frame: &StompFrame) -> Result<(), StompError> {
        let id = match frame.get(header::ID) {
            Some(id) => id,
            None if !self.version.requires_subscription_id() => require(frame, header::DESTINATION)?,
            None => require(frame, header::ID)?,
        };
        if !self.subscriptions.contains_key(id) {
            return Err(StompError::UnknownSubscription { id: id.to_string() });
        }

        self.services
            .backend
            .unsubscribe(&self.session_id, id)
            .await?;
        self.subscriptions.remove(id);
        self.pending.retain(|p| p.subscription_id != id);
        debug!(subscription = %id, "Unsubscribed");
        Ok(())
    }

    async fn on_settle(
        &mut self,
        frame: &StompFrame,
        settlement: Settlement,
    ) -> Result<(), StompError> {
        if settlement == Settlement::Nack && !self.version.supports_nack() {
            return Err(StompError::Unsupported {
                command: command::NACK.to_string(),
                detail: format!(" in STOMP {}", self.version),
            });
        }

        let message_id = require(frame, header::MESSAGE_ID)?;
        let subscription = match frame.get(header::SUBSCRIPTION) {
            Some(subscription) => subscription.to_string(),
            None if !self.version.requires_subscription_id() => self
                .pending
                .iter()
                .find(|p| p.message_id == message_id)
                .map(|p| p.subscription_id.clone())
                .ok_or_else(|| StompError::UnknownMessage {
                    message_id: message_id.to_string(),
                })?,
            None => require(frame, header::SUBSCRIPTION)?.to_string(),
        };

        let position = self
            .pending
            .iter()
            .position(|p| p.message_id == message_id && p.subscription_id == subscription)
            .ok_or_else(|| StompError::AckMismatch {
                subscription: subscription.clone(),
                message_id: message_id.to_string(),
            })?;

        let cumulative = self
            .subscriptions
            .get(&subscription)
            .is_some_and(|s| s.ack_mode == AckMode::Client);
        // Client mode covers every earlier delivery of the same subscription.
        let targets: Vec<String> = if cumulative {
            self.pending[..=position]
                .iter()
                .filter(|p| p.subscription_id == subscription)
                .map(|p| p.message_id.clone())
                .collect()
        } else {
            vec![message_id.to_string()]
        };

        // Pending entries go only once the backend has taken the settlement.
        let mut settled = 0;
        let mut failure = None;
        for target in &targets {
            let result = match settlement {
                Settlement::Ack => {
                    self.services
                        .backend
                        .acknowledge(&self.session_id, target)
                        .await
                }
                Settlement::Nack => self.services.backend.reject(&self.session_id, target).await,
            };
            match result {
                Ok(()) => {
                    self.pending
                        .retain(|p| !(p.message_id == *target && p.subscription_id == subscription));
                    settled += 1;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        debug!(
            subscription = %subscription,
            message_id = %message_id,
            settled,
            settlement = ?settlement,
            "Deliveries settled"
        );
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Turns a backend delivery into a MESSAGE frame.
    ///
    /// Returns `None` for deliveries of a subscription that is gone or was
    /// replaced; the backend requeued those when the subscription ended.
    /// Auto-mode deliveries are acknowledged here.
    pub async fn on_delivery(&mut self, delivery: Delivery) -> Option<StompFrame> {
        if self.state != EngineState::Connected {
            return None;
        }
        let Delivery {
            subscription_id,
            generation,
            message,
        } = delivery;
        let Some(subscription) = self
            .subscriptions
            .get(&subscription_id)
            .filter(|s| s.generation == generation)
        else {
            debug!(
                subscription = %subscription_id,
                generation,
                message_id = %message.id,
                "Dropping stale delivery"
            );
            return None;
        };
        let ack_mode = subscription.ack_mode;

        if !ack_mode.requires_ack()
            && let Err(e) = self
                .services
                .backend
                .acknowledge(&self.session_id, &message.id)
                .await
        {
            warn!(error = %e, message_id = %message.id, "Auto acknowledgement failed");
            return None;
        }

        let mut frame = StompFrame::new(command::MESSAGE)
            .header(header::SUBSCRIPTION, subscription_id.as_str())
            .header(header::MESSAGE_ID, message.id.as_str())
            .header(header::DESTINATION, message.destination.as_str());
        for (key, value) in message.headers {
            if !matches!(
                key.as_str(),
                header::RECEIPT | header::DESTINATION | header::SUBSCRIPTION | header::MESSAGE_ID
            ) {
                frame.push_header(key, value);
            }
        }

        if ack_mode.requires_ack() {
            self.pending.push(PendingDelivery {
                message_id: message.id,
                subscription_id,
            });
        }
        Some(frame.body(message.body))
    }

    /// Releases everything the session holds: backend subscriptions (whose
    /// unacknowledged messages are requeued), pending deliveries and the
    /// security context.
    pub async fn teardown(&mut self) {
        if self.attached {
            self.services.backend.detach(&self.session_id).await;
            self.attached = false;
        }
        self.subscriptions.clear();
        self.pending.clear();
        self.context = None;
        self.state = EngineState::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{StaticAuthenticator, UserCredentials};
    use crate::backend::MemoryBroker;

    struct Harness {
        engine: StompEngine,
        deliveries: mpsc::UnboundedReceiver<Delivery>,
        broker: Arc<MemoryBroker>,
        auth: Arc<StaticAuthenticator>,
    }

    impl Harness {
        fn new() -> Self {
            let broker = Arc::new(MemoryBroker::new());
            let auth = Arc::new(StaticAuthenticator::new([UserCredentials::new(
                "guest", "guest",
            )]));
            let services = StompServices {
                authenticator: auth.clone(),
                backend: broker.clone(),
                config: Arc::new(StompConfig::default()),
            };
            let (engine, deliveries) = StompEngine::new(SessionId::new("sess-1"), services);
            Self {
                engine,
                deliveries,
                broker,
                auth,
            }
        }

        async fn connected(accept_version: &str) -> Self {
            let mut h = Self::new();
            let out = h
                .engine
                .on_frame(connect_frame().header(header::ACCEPT_VERSION, accept_version))
                .await;
            assert_eq!(out.frames[0].command(), command::CONNECTED);
            h
        }

        async fn send(&mut self, frame: StompFrame) -> EngineOutput {
            self.engine.on_frame(frame).await
        }

        async fn next_message(&mut self) -> StompFrame {
            let delivery = self.deliveries.try_recv().expect("no delivery queued");
            self.engine.on_delivery(delivery).await.expect("delivery dropped")
        }
    }

    fn connect_frame() -> StompFrame {
        StompFrame::new(command::CONNECT)
            .header(header::LOGIN, "guest")
            .header(header::PASSCODE, "guest")
    }

    fn subscribe(id: &str, destination: &str, ack: &str) -> StompFrame {
        StompFrame::new(command::SUBSCRIBE)
            .header(header::ID, id)
            .header(header::DESTINATION, destination)
            .header(header::ACK, ack)
    }

    fn send(destination: &str, body: &str) -> StompFrame {
        StompFrame::new(command::SEND)
            .header(header::DESTINATION, destination)
            .body(body.to_string())
    }

    fn ack(cmd: &str, subscription: &str, message_id: &str) -> StompFrame {
        StompFrame::new(cmd)
            .header(header::SUBSCRIPTION, subscription)
            .header(header::MESSAGE_ID, message_id)
            .header(header::RECEIPT, "r-1")
    }

    fn message_id(frame: &StompFrame) -> String {
        frame.get(header::MESSAGE_ID).unwrap().to_string()
    }

    #[tokio::test]
    async fn connect_picks_highest_common_version() {
        let mut h = Harness::new();
        let out = h
            .send(connect_frame().header(header::ACCEPT_VERSION, "1.0,1.1,1.2"))
            .await;

        let connected = &out.frames[0];
        assert_eq!(connected.command(), command::CONNECTED);
        assert_eq!(connected.get(header::VERSION), Some("1.1"));
        assert_eq!(connected.get(header::HEART_BEAT), Some("0,0"));
        assert_eq!(connected.get(header::SESSION), Some("sess-1"));
        assert!(connected.get(header::SERVER).unwrap().starts_with("relaymq/"));
        assert_eq!(out.connected.unwrap().version, StompVersion::v1_1());
        assert_eq!(h.engine.state(), EngineState::Connected);
        assert_eq!(h.auth.active_contexts(), 1);
    }

    #[tokio::test]
    async fn connect_without_accept_version_is_stomp_1_0() {
        let mut h = Harness::new();
        let out = h
            .send(
                StompFrame::new(command::STOMP)
                    .header(header::LOGIN, "guest")
                    .header(header::PASSCODE, "guest")
                    .header(header::HEART_BEAT, "1000,1000"),
            )
            .await;
        let connected = &out.frames[0];
        assert_eq!(connected.get(header::VERSION), None);
        assert_eq!(connected.get(header::HEART_BEAT), None);
        let params = out.connected.unwrap();
        assert_eq!(params.version, StompVersion::v1_0());
        assert!(params.heartbeat.is_disabled());
    }

    #[tokio::test]
    async fn unsupported_version_closes() {
        let mut h = Harness::new();
        let out = h
            .send(connect_frame().header(header::ACCEPT_VERSION, "1.2"))
            .await;
        assert!(out.close);
        assert_eq!(out.frames[0].command(), command::ERROR);
        assert_eq!(
            out.frames[0].get(header::MESSAGE),
            Some("protocol negotiation failed")
        );
        assert_eq!(h.engine.state(), EngineState::Disconnected);
        assert_eq!(h.auth.active_contexts(), 0);
    }

    #[tokio::test]
    async fn heartbeat_negotiation_in_connected() {
        for (requested, expected) in [("1,1", "500,500"), ("500,1000", "1000,500"), ("0,0", "0,0"), ("1,0", "0,500")] {
            let mut h = Harness::new();
            let out = h
                .send(
                    connect_frame()
                        .header(header::ACCEPT_VERSION, "1.1")
                        .header(header::HEART_BEAT, requested),
                )
                .await;
            assert_eq!(out.frames[0].get(header::HEART_BEAT), Some(expected), "{requested}");
        }
    }

    #[tokio::test]
    async fn bad_credentials_close() {
        let mut h = Harness::new();
        let out = h
            .send(
                StompFrame::new(command::CONNECT)
                    .header(header::ACCEPT_VERSION, "1.1")
                    .header(header::LOGIN, "guest")
                    .header(header::PASSCODE, "wrong"),
            )
            .await;
        assert!(out.close);
        assert_eq!(out.frames[0].get(header::MESSAGE), Some("authentication failed"));
    }

    #[tokio::test]
    async fn frames_before_connect_close() {
        let mut h = Harness::new();
        let out = h.send(send("/queue/a", "x")).await;
        assert!(out.close);
        assert_eq!(out.frames[0].command(), command::ERROR);
    }

    #[tokio::test]
    async fn send_subscribe_ack_with_receipts() {
        let mut h = Harness::connected("1.1").await;
        let out = h
            .send(subscribe("sub-0", "/queue/a", "client-individual").header(header::RECEIPT, "sub-r"))
            .await;
        assert_eq!(out.frames[0].command(), command::RECEIPT);
        assert_eq!(out.frames[0].get(header::RECEIPT_ID), Some("sub-r"));

        let out = h
            .send(
                send("/queue/a", "hello")
                    .header(header::CONTENT_TYPE, "text/plain")
                    .header("custom", "value")
                    .header(header::RECEIPT, "send-r"),
            )
            .await;
        assert_eq!(out.frames[0].get(header::RECEIPT_ID), Some("send-r"));

        let message = h.next_message().await;
        assert_eq!(message.command(), command::MESSAGE);
        assert_eq!(message.get(header::SUBSCRIPTION), Some("sub-0"));
        assert_eq!(message.get(header::DESTINATION), Some("/queue/a"));
        assert_eq!(message.get(header::CONTENT_TYPE), Some("text/plain"));
        assert_eq!(message.get("custom"), Some("value"));
        assert_eq!(message.get(header::RECEIPT), None);
        assert_eq!(message.get(header::CONTENT_LENGTH), None);
        assert_eq!(message.body_text(), "hello");
        assert_eq!(h.engine.pending_count(), 1);

        let out = h.send(ack(command::ACK, "sub-0", &message_id(&message))).await;
        assert_eq!(out.frames[0].command(), command::RECEIPT);
        assert_eq!(out.frames[0].get(header::RECEIPT_ID), Some("r-1"));
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(h.broker.in_flight(h.engine.session_id()), 0);
    }

    #[tokio::test]
    async fn content_length_is_propagated_verbatim() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("s", "/queue/a", "auto")).await;
        h.send(send("/queue/a", "Hello World 1!").header(header::CONTENT_LENGTH, "14"))
            .await;
        let message = h.next_message().await;
        assert_eq!(message.get(header::CONTENT_LENGTH), Some("14"));
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn ack_mismatch_leaves_delivery_pending() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("sub-0", "/queue/a", "client-individual")).await;
        h.send(subscribe("sub-1", "/queue/b", "client-individual")).await;
        h.send(send("/queue/a", "x")).await;
        let id = message_id(&h.next_message().await);

        let out = h.send(ack(command::ACK, "sub-1", &id)).await;
        assert!(!out.close);
        assert_eq!(out.frames[0].command(), command::ERROR);
        assert_eq!(out.frames[0].get(header::RECEIPT_ID), Some("r-1"));
        assert_eq!(out.frames[0].get(header::MESSAGE), Some("acknowledgement mismatch"));
        assert_eq!(h.engine.pending_count(), 1);

        let out = h.send(ack(command::ACK, "sub-0", "no-such-id")).await;
        assert_eq!(out.frames[0].command(), command::ERROR);
        assert_eq!(h.engine.pending_count(), 1);

        let out = h.send(ack(command::ACK, "sub-0", &id)).await;
        assert_eq!(out.frames[0].command(), command::RECEIPT);
        assert_eq!(h.engine.pending_count(), 0);

        // Second acknowledgement of the same delivery.
        let out = h.send(ack(command::ACK, "sub-0", &id)).await;
        assert_eq!(out.frames[0].command(), command::ERROR);
    }

    #[tokio::test]
    async fn nack_rejects_message() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("sub-0", "/queue/a", "client-individual")).await;
        h.send(send("/queue/a", "x")).await;
        let id = message_id(&h.next_message().await);

        let out = h.send(ack(command::NACK, "sub-0", &id)).await;
        assert_eq!(out.frames[0].command(), command::RECEIPT);
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(h.broker.in_flight(h.engine.session_id()), 0);
        assert_eq!(h.broker.queued("/queue/a"), 0);
    }

    #[tokio::test]
    async fn client_mode_ack_is_cumulative() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("sub-0", "/queue/a", "client")).await;
        for body in ["1", "2", "3"] {
            h.send(send("/queue/a", body)).await;
        }
        let _first = h.next_message().await;
        let second = h.next_message().await;
        let _third = h.next_message().await;
        assert_eq!(h.engine.pending_count(), 3);

        h.send(ack(command::ACK, "sub-0", &message_id(&second))).await;
        assert_eq!(h.engine.pending_count(), 1);
        assert_eq!(h.broker.in_flight(h.engine.session_id()), 1);
    }

    #[tokio::test]
    async fn duplicate_and_unknown_subscriptions() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("sub-0", "/queue/a", "auto")).await;
        let out = h.send(subscribe("sub-0", "/queue/b", "auto")).await;
        assert_eq!(out.frames[0].get(header::MESSAGE), Some("duplicate subscription"));
        assert!(!out.close);

        let out = h
            .send(StompFrame::new(command::UNSUBSCRIBE).header(header::ID, "nope"))
            .await;
        assert_eq!(out.frames[0].command(), command::ERROR);

        let out = h
            .send(
                StompFrame::new(command::UNSUBSCRIBE)
                    .header(header::ID, "sub-0")
                    .header(header::RECEIPT, "u"),
            )
            .await;
        assert_eq!(out.frames[0].get(header::RECEIPT_ID), Some("u"));
        assert!(h.engine.subscription("sub-0").is_none());
    }

    #[tokio::test]
    async fn subscribe_requires_id_from_1_1() {
        let mut h = Harness::connected("1.1").await;
        let out = h
            .send(StompFrame::new(command::SUBSCRIBE).header(header::DESTINATION, "/queue/a"))
            .await;
        assert_eq!(out.frames[0].get(header::MESSAGE), Some("missing header"));
    }

    #[tokio::test]
    async fn invalid_ack_mode_is_rejected() {
        let mut h = Harness::connected("1.1").await;
        let out = h.send(subscribe("s", "/queue/a", "sometimes")).await;
        assert_eq!(out.frames[0].get(header::MESSAGE), Some("invalid header"));
        assert!(h.engine.subscription("s").is_none());
    }

    #[tokio::test]
    async fn stomp_1_0_rules() {
        let mut h = Harness::connected("1.0").await;
        let out = h
            .send(
                StompFrame::new(command::SUBSCRIBE)
                    .header(header::DESTINATION, "/queue/a")
                    .header(header::ACK, "client"),
            )
            .await;
        assert!(out.frames.is_empty());
        assert!(h.engine.subscription("/queue/a").is_some());

        h.send(send("/queue/a", "x")).await;
        let message = h.next_message().await;
        assert_eq!(message.get(header::SUBSCRIPTION), Some("/queue/a"));

        let out = h
            .send(
                StompFrame::new(command::NACK)
                    .header(header::MESSAGE_ID, message_id(&message)),
            )
            .await;
        assert_eq!(out.frames[0].get(header::MESSAGE), Some("unsupported command"));
        assert_eq!(h.engine.pending_count(), 1);

        let out = h
            .send(
                StompFrame::new(command::ACK)
                    .header(header::MESSAGE_ID, message_id(&message))
                    .header(header::RECEIPT, "a"),
            )
            .await;
        assert_eq!(out.frames[0].command(), command::RECEIPT);
        assert_eq!(h.engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn transactions_and_unknown_commands_keep_session() {
        let mut h = Harness::connected("1.1").await;
        for cmd in [command::BEGIN, command::COMMIT, command::ABORT, "FROB"] {
            let out = h.send(StompFrame::new(cmd).header("transaction", "tx1")).await;
            assert_eq!(out.frames[0].command(), command::ERROR);
            assert!(!out.close, "{cmd}");
        }
        assert_eq!(h.engine.state(), EngineState::Connected);
    }

    #[tokio::test]
    async fn second_connect_closes() {
        let mut h = Harness::connected("1.1").await;
        let out = h.send(connect_frame()).await;
        assert!(out.close);
        assert_eq!(out.frames[0].get(header::MESSAGE), Some("already connected"));
    }

    #[tokio::test]
    async fn disconnect_with_receipt() {
        let mut h = Harness::connected("1.1").await;
        let out = h
            .send(StompFrame::new(command::DISCONNECT).header(header::RECEIPT, "bye"))
            .await;
        assert!(out.close);
        assert_eq!(out.frames[0].command(), command::RECEIPT);
        assert_eq!(out.frames[0].get(header::RECEIPT_ID), Some("bye"));
        assert_eq!(h.engine.state(), EngineState::Disconnected);

        // Ignored after disconnect.
        assert!(h.send(send("/queue/a", "late")).await.frames.is_empty());
    }

    #[tokio::test]
    async fn teardown_requeues_and_releases() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("sub-0", "/queue/a", "client-individual")).await;
        h.send(send("/queue/a", "x")).await;
        h.next_message().await;
        assert_eq!(h.broker.queued("/queue/a"), 0);

        h.engine.teardown().await;
        assert_eq!(h.broker.queued("/queue/a"), 1);
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(h.auth.active_contexts(), 0);
        assert_eq!(h.engine.state(), EngineState::Disconnected);
    }

    fn unsubscribe(id: &str) -> StompFrame {
        StompFrame::new(command::UNSUBSCRIBE).header(header::ID, id)
    }

    async fn drain(h: &mut Harness) -> Vec<StompFrame> {
        let mut frames = Vec::new();
        while let Ok(delivery) = h.deliveries.try_recv() {
            frames.extend(h.engine.on_delivery(delivery).await);
        }
        frames
    }

    #[tokio::test]
    async fn resubscribed_id_ignores_stale_deliveries() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("s0", "/queue/a", "client-individual")).await;
        h.send(send("/queue/a", "x")).await;
        h.send(unsubscribe("s0")).await;
        h.send(subscribe("s0", "/queue/a", "client-individual")).await;

        let messages = drain(&mut h).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(h.engine.pending_count(), 1);

        let id = message_id(&messages[0]);
        let out = h.send(ack(command::ACK, "s0", &id)).await;
        assert_eq!(out.frames[0].command(), command::RECEIPT);
        assert_eq!(h.engine.pending_count(), 0);
        assert_eq!(h.broker.in_flight(h.engine.session_id()), 0);

        let out = h.send(ack(command::ACK, "s0", &id)).await;
        assert_eq!(out.frames[0].get(header::MESSAGE), Some("acknowledgement mismatch"));
    }

    #[tokio::test]
    async fn auto_delivery_survives_unsubscribe() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("s0", "/queue/a", "auto")).await;
        h.send(send("/queue/a", "x")).await;
        h.send(unsubscribe("s0")).await;

        assert!(drain(&mut h).await.is_empty());
        assert_eq!(h.broker.queued("/queue/a"), 1);

        h.send(subscribe("s1", "/queue/a", "auto")).await;
        let messages = drain(&mut h).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body_text(), "x");
        assert_eq!(h.broker.queued("/queue/a"), 0);
        assert_eq!(h.broker.in_flight(h.engine.session_id()), 0);
    }

    #[tokio::test]
    async fn backend_failure_leaves_delivery_pending() {
        let mut h = Harness::connected("1.1").await;
        h.send(subscribe("s0", "/queue/a", "client-individual")).await;
        h.send(send("/queue/a", "x")).await;
        let id = message_id(&h.next_message().await);

        // Settled behind the session's back.
        h.broker
            .acknowledge(h.engine.session_id(), &id)
            .await
            .unwrap();

        let out = h.send(ack(command::ACK, "s0", &id)).await;
        assert_eq!(out.frames[0].command(), command::ERROR);
        assert_eq!(out.frames[0].get(header::RECEIPT_ID), Some("r-1"));
        assert_eq!(h.engine.pending_count(), 1);
    }

    #[test]
    fn error_frame_layout() {
        let frame = error_frame(
            &StompError::UnknownSubscription { id: "s-9".into() },
            Some("r-7"),
        );
        insta::assert_snapshot!(frame.to_string(), @"ERROR message:unknown subscription receipt-id:r-7 content-type:text/plain Body (27 bytes)");
    }
}
