//! Packet handler registry and dispatch.
//!
//! Every server-side endpoint reachable over the remoting transport is a
//! [`PacketHandler`] registered under a unique [`HandlerId`]. Inbound
//! packets are routed by their `target_id`; responses are normalized
//! against the request and written to the reply channel of the session the
//! request arrived on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use relaymq_core::{HandlerId, SessionId};
use relaymq_protocol::{ErrorResponse, Packet};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, instrument, warn};

use crate::error::{DispatchError, HandlerError};

/// A server-side endpoint that consumes packets addressed to its id.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Id the handler is registered under.
    fn id(&self) -> &HandlerId;

    /// Handles one packet.
    ///
    /// `Ok(None)` for one-way packets, `Ok(Some(response))` for requests.
    /// Failures are reported to the client as error responses.
    async fn handle(
        &self,
        packet: &Packet,
        channel: &PacketSender,
    ) -> Result<Option<Packet>, HandlerError>;
}

/// Outbound half of a remoting session.
///
/// Cloning shares the same channel. Everything sent through any clone is
/// written to the socket in send order.
#[derive(Debug, Clone)]
pub struct PacketSender {
    session_id: SessionId,
    tx: mpsc::Sender<Packet>,
}

impl PacketSender {
    /// Wraps an existing channel.
    pub fn new(session_id: SessionId, tx: mpsc::Sender<Packet>) -> Self {
        Self { session_id, tx }
    }

    /// Creates a bounded channel for a session.
    pub fn channel(session_id: SessionId, capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(session_id, tx), rx)
    }

    /// Session this channel writes to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Returns true if the session's writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queues a packet, waiting for capacity.
    pub async fn send(&self, packet: Packet) -> Result<(), DispatchError> {
        self.tx
            .send(packet)
            .await
            .map_err(|_| DispatchError::ChannelClosed)
    }

    /// Queues a packet, giving up after `timeout`.
    pub async fn send_timeout(&self, packet: Packet, timeout: Duration) -> Result<(), DispatchError> {
        self.tx
            .send_timeout(packet, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => DispatchError::SendTimeout { timeout },
                SendTimeoutError::Closed(_) => DispatchError::ChannelClosed,
            })
    }
}

/// Registry of packet handlers keyed by id.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: DashMap<HandlerId, Arc<dyn PacketHandler>>,
}

impl PacketDispatcher {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its own id.
    ///
    /// Fails if the id is already taken.
    pub fn register(&self, handler: Arc<dyn PacketHandler>) -> Result<(), DispatchError> {
        match self.handlers.entry(handler.id().clone()) {
            Entry::Occupied(entry) => Err(DispatchError::DuplicateHandler {
                id: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                debug!(handler_id = %entry.key(), "Registered packet handler");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Removes a handler. Unknown ids are ignored.
    ///
    /// Returns true if a handler was removed.
    pub fn unregister(&self, id: &HandlerId) -> bool {
        let removed = self.handlers.remove(id).is_some();
        if removed {
            debug!(handler_id = %id, "Unregistered packet handler");
        }
        removed
    }

    /// Returns true if a handler is registered under `id`.
    pub fn contains(&self, id: &HandlerId) -> bool {
        self.handlers.contains_key(id)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Routes a packet to its handler and writes the response, if any, to
    /// `reply`.
    ///
    /// Handler failures and unknown targets become error responses carrying
    /// the request's correlation id. Only a failure to write to `reply`
    /// is returned.
    #[instrument(
        skip_all,
        fields(
            session_id = %reply.session_id(),
            target = %packet.target_id,
            kind = ?packet.packet_type(),
            correlation_id = packet.correlation_id,
        )
    )]
    pub async fn dispatch(&self, packet: Packet, reply: &PacketSender) -> Result<(), DispatchError> {
        // Clone the handler out so no map guard is held across the await.
        let handler = self
            .handlers
            .get(&packet.target_id)
            .map(|entry| Arc::clone(entry.value()));

        let response = match handler {
            None => {
                warn!("No handler registered for target");
                Some(Packet::error_for(
                    &packet,
                    ErrorResponse::unknown_target(&packet.target_id),
                ))
            }
            Some(handler) => match handler.handle(&packet, reply).await {
                Ok(Some(mut response)) => {
                    response.normalize(&packet);
                    Some(response)
                }
                Ok(None) => None,
                Err(e) => {
                    debug!(error = %e, "Handler failed");
                    Some(Packet::error_for(&packet, e.to_response()))
                }
            },
        };

        match response {
            Some(response) => reply.send(response).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymq_protocol::{ErrorCode, PacketKind};

    struct Echo {
        id: HandlerId,
    }

    #[async_trait]
    impl PacketHandler for Echo {
        fn id(&self) -> &HandlerId {
            &self.id
        }

        async fn handle(
            &self,
            packet: &Packet,
            _channel: &PacketSender,
        ) -> Result<Option<Packet>, HandlerError> {
            match packet.kind {
                // Deliberately wrong routing fields; dispatch must fix them.
                PacketKind::Ping => Ok(Some(Packet::new("elsewhere", PacketKind::Pong))),
                PacketKind::UpdateCallback { .. } => Ok(None),
                _ => Err(HandlerError::unsupported(&self.id, packet.packet_type())),
            }
        }
    }

    fn echo(id: &str) -> Arc<dyn PacketHandler> {
        Arc::new(Echo {
            id: HandlerId::new(id),
        })
    }

    fn sender() -> (PacketSender, mpsc::Receiver<Packet>) {
        PacketSender::channel(SessionId::new("session-1"), 8)
    }

    #[test]
    fn duplicate_registration_fails() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(echo("h1")).unwrap();
        let err = dispatcher.register(echo("h1")).unwrap_err();
        assert_eq!(
            err,
            DispatchError::DuplicateHandler {
                id: HandlerId::new("h1")
            }
        );
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn unregister_unknown_is_noop() {
        let dispatcher = PacketDispatcher::new();
        assert!(!dispatcher.unregister(&HandlerId::new("missing")));
        dispatcher.register(echo("h1")).unwrap();
        assert!(dispatcher.unregister(&HandlerId::new("h1")));
        assert!(dispatcher.is_empty());
        // The id is free again.
        dispatcher.register(echo("h1")).unwrap();
    }

    #[tokio::test]
    async fn response_is_normalized_against_request() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(echo("h1")).unwrap();
        let (reply, mut rx) = sender();

        let request = Packet::new("h1", PacketKind::Ping)
            .with_correlation(42)
            .with_version(3);
        dispatcher.dispatch(request, &reply).await.unwrap();

        let response = rx.recv().await.unwrap();
        assert_eq!(response.kind, PacketKind::Pong);
        assert_eq!(response.correlation_id, 42);
        assert_eq!(response.target_id, HandlerId::new("h1"));
        assert_eq!(response.version, 3);
    }

    #[tokio::test]
    async fn unknown_target_yields_error_response() {
        let dispatcher = PacketDispatcher::new();
        let (reply, mut rx) = sender();

        let request = Packet::new("ghost", PacketKind::Ping).with_correlation(9);
        dispatcher.dispatch(request, &reply).await.unwrap();

        let response = rx.recv().await.unwrap();
        let error = response.as_error().unwrap();
        assert_eq!(error.code, ErrorCode::UnknownTarget);
        assert!(error.message.contains("ghost"));
        assert_eq!(response.correlation_id, 9);
    }

    #[tokio::test]
    async fn handler_failure_becomes_error_response() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(echo("h1")).unwrap();
        let (reply, mut rx) = sender();

        let request = Packet::new("h1", PacketKind::GetTopology).with_correlation(5);
        dispatcher.dispatch(request, &reply).await.unwrap();

        let response = rx.recv().await.unwrap();
        assert_eq!(response.as_error().unwrap().code, ErrorCode::UnsupportedPacket);
        assert_eq!(response.correlation_id, 5);
    }

    #[tokio::test]
    async fn one_way_packets_produce_no_reply() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(echo("h1")).unwrap();
        let (reply, mut rx) = sender();

        let packet = Packet::new(
            "h1",
            PacketKind::UpdateCallback {
                client_instance_id: "vm-1".into(),
                add: true,
            },
        );
        dispatcher.dispatch(packet, &reply).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_reply_channel_escapes() {
        let dispatcher = PacketDispatcher::new();
        dispatcher.register(echo("h1")).unwrap();
        let (reply, rx) = sender();
        drop(rx);

        let err = dispatcher
            .dispatch(Packet::new("h1", PacketKind::Ping), &reply)
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::ChannelClosed);
    }

    #[tokio::test]
    async fn send_timeout_on_full_channel() {
        let (sender, _rx) = PacketSender::channel(SessionId::new("s"), 1);
        sender.send(Packet::new("h", PacketKind::Ping)).await.unwrap();
        let err = sender
            .send_timeout(Packet::new("h", PacketKind::Ping), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SendTimeout { .. }));
    }
}
