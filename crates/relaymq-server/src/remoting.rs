//! Remoting sessions: length-prefixed packets in, dispatcher replies and
//! topology pushes out.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use relaymq_core::SessionId;
use relaymq_protocol::{PacketCodec, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, instrument, trace, warn};

use crate::connection_factory::ConnectionFactoryEndpoint;
use crate::dispatcher::{PacketDispatcher, PacketSender};
use crate::error::ServerResult;

/// Outbound packets buffered per session before senders wait.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Shared state for every remoting session.
pub struct RemotingContext {
    dispatcher: Arc<PacketDispatcher>,
    factories: RwLock<Vec<Arc<ConnectionFactoryEndpoint>>>,
    outbound_capacity: usize,
}

impl RemotingContext {
    pub fn new(dispatcher: Arc<PacketDispatcher>) -> Self {
        Self {
            dispatcher,
            factories: RwLock::new(Vec::new()),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }

    /// Builder: set the per-session outbound buffer.
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    /// Tracks a factory so closed sessions are released from it.
    pub fn add_factory(&self, factory: Arc<ConnectionFactoryEndpoint>) {
        self.factories.write().push(factory);
    }

    /// Serves one transport session until the peer closes it.
    ///
    /// Inbound packets are dispatched one at a time, in arrival order.
    /// Replies and pushes share one outbound queue drained by a writer
    /// running alongside the reader.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn serve<S>(&self, stream: S, session_id: SessionId) -> ServerResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut sink, mut inbound) = Framed::new(stream, PacketCodec).split();
        let (sender, mut outbound) =
            PacketSender::channel(session_id.clone(), self.outbound_capacity);

        let writer = async move {
            while let Some(packet) = outbound.recv().await {
                trace!(packet_type = ?packet.packet_type(), target = %packet.target_id, "Writing packet");
                if let Err(e) = sink.send(packet).await {
                    debug!(error = %e, "Remoting write failed");
                    break;
                }
            }
        };

        let reader = async move {
            let result = loop {
                let packet = match inbound.next().await {
                    None => break Ok(()),
                    Some(Ok(packet)) => packet,
                    Some(Err(ProtocolError::Io(e))) => break Err(e.into()),
                    Some(Err(e)) => {
                        warn!(error = %e, "Unreadable packet, closing session");
                        break Err(e.into());
                    }
                };
                trace!(packet_type = ?packet.packet_type(), target = %packet.target_id, "Packet received");
                if let Err(e) = self.dispatcher.dispatch(packet, &sender).await {
                    debug!(error = %e, "Reply channel gone, closing session");
                    break Ok(());
                }
            };
            self.release(&session_id);
            // The writer stops once the last sender clone is gone.
            drop(sender);
            result
        };

        let (result, ()) = tokio::join!(reader, writer);
        debug!("Remoting session closed");
        result
    }

    fn release(&self, session_id: &SessionId) {
        let factories = self.factories.read().clone();
        for factory in factories {
            factory.release_session(session_id);
        }
    }
}
