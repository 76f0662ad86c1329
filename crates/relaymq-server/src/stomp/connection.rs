//! STOMP connection task.
//!
//! Owns the framed transport, the session engine, the backend delivery
//! channel and the heartbeat monitor, and multiplexes them in one
//! `select!` loop. Everything the session holds is released when the loop
//! ends, whatever ended it.

use futures_util::{SinkExt, StreamExt};
use relaymq_core::SessionId;
use relaymq_protocol::ProtocolError;
use relaymq_protocol::stomp::{StompCodec, StompFrame, StompItem};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, trace, warn};

use crate::backend::Delivery;
use crate::error::{ServerResult, StompError};
use crate::heartbeat::{HeartbeatEvent, HeartbeatMonitor};

use super::engine::{EngineOutput, StompEngine, StompServices, error_frame};

/// One client connection speaking STOMP.
pub struct StompConnection<S> {
    framed: Framed<S, StompCodec>,
    engine: StompEngine,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
    monitor: HeartbeatMonitor,
    timeout_multiplier: u32,
}

impl<S> StompConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, session_id: SessionId, services: StompServices) -> Self {
        let codec = StompCodec::new(services.config.max_frame_size);
        let timeout_multiplier = services.config.heartbeat_timeout_multiplier;
        let (engine, deliveries) = StompEngine::new(session_id, services);
        Self {
            framed: Framed::new(stream, codec),
            engine,
            deliveries,
            monitor: HeartbeatMonitor::disabled(),
            timeout_multiplier,
        }
    }

    /// Serves the connection until the client disconnects, a fatal error
    /// occurs or the peer goes silent.
    #[instrument(skip_all, fields(session_id = %self.engine.session_id()))]
    pub async fn run(mut self) -> ServerResult<()> {
        debug!("STOMP connection opened");
        let result = self.drive().await;
        self.engine.teardown().await;
        match &result {
            Ok(()) => debug!("STOMP connection closed"),
            Err(e) => debug!(error = %e, "STOMP connection closed with error"),
        }
        result
    }

    async fn drive(&mut self) -> ServerResult<()> {
        loop {
            tokio::select! {
                item = self.framed.next() => {
                    let item = match item {
                        None => {
                            debug!("Peer closed the connection");
                            return Ok(());
                        }
                        Some(Err(ProtocolError::Io(e))) => return Err(e.into()),
                        Some(Err(e)) => {
                            let error = StompError::Malformed(e);
                            warn!(error = %error, "Dropping connection");
                            self.write(error_frame(&error, None)).await?;
                            return Ok(());
                        }
                        Some(Ok(item)) => item,
                    };
                    self.monitor.record_read();
                    let StompItem::Frame(frame) = item else {
                        trace!("Heartbeat received");
                        continue;
                    };
                    let output = self.engine.on_frame(frame).await;
                    if self.apply(output).await? {
                        return Ok(());
                    }
                }
                Some(delivery) = self.deliveries.recv() => {
                    if let Some(frame) = self.engine.on_delivery(delivery).await {
                        self.write(frame).await?;
                    }
                }
                event = self.monitor.tick() => match event {
                    HeartbeatEvent::SendHeartbeat => {
                        trace!("Sending heartbeat");
                        self.framed.send(StompItem::Heartbeat).await?;
                        self.monitor.record_write();
                    }
                    HeartbeatEvent::TimedOut { idle } => {
                        let error = StompError::HeartbeatTimeout { idle };
                        info!(idle_ms = idle.as_millis() as u64, "Client missed heartbeats");
                        if let Err(e) = self.write(error_frame(&error, None)).await {
                            debug!(error = %e, "Could not report heartbeat timeout");
                        }
                        return Ok(());
                    }
                },
            }
        }
    }

    /// Writes the engine's frames. Returns true when the connection must
    /// close.
    async fn apply(&mut self, output: EngineOutput) -> ServerResult<bool> {
        if let Some(params) = &output.connected {
            self.framed
                .codec_mut()
                .set_escape_headers(params.version.supports_escaping());
            self.monitor = HeartbeatMonitor::new(params.heartbeat, self.timeout_multiplier);
            debug!(
                send_interval = ?self.monitor.send_interval(),
                read_timeout = ?self.monitor.read_timeout(),
                "Heartbeats armed"
            );
        }
        for frame in output.frames {
            self.write(frame).await?;
        }
        Ok(output.close)
    }

    async fn write(&mut self, frame: StompFrame) -> ServerResult<()> {
        trace!(frame = %frame, "Writing frame");
        self.framed.send(StompItem::Frame(frame)).await?;
        self.monitor.record_write();
        Ok(())
    }
}
