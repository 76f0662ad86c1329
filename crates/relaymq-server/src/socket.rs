//! TCP listeners for the STOMP and remoting acceptors.
//!
//! Each accepted socket gets a fresh [`SessionId`] and holds a permit from
//! the acceptor's connection semaphore for as long as its handler runs.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use relaymq_core::SessionId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use crate::error::{ServerError, ServerResult};

/// A bound TCP acceptor.
pub struct TcpAcceptor {
    /// Acceptor name used in logs and errors (`stomp`, `remoting`).
    name: &'static str,
    listener: TcpListener,
    /// Semaphore for limiting concurrent connections.
    connection_semaphore: Arc<Semaphore>,
}

impl TcpAcceptor {
    /// Binds `addr`. Port `0` picks a free port; see [`Self::local_addr`].
    pub async fn bind(
        name: &'static str,
        addr: SocketAddr,
        max_connections: usize,
    ) -> ServerResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { name, addr, source })?;
        let local = listener.local_addr()?;
        info!(acceptor = name, addr = %local, max_connections, "Listening");

        Ok(Self {
            name,
            listener,
            connection_semaphore: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> ServerResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts a single connection, waiting for a free slot first.
    pub async fn accept(&self) -> ServerResult<Connection> {
        let permit = Arc::clone(&self.connection_semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ServerError::Shutdown)?;

        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle");
        }
        let session_id = SessionId::generate();
        debug!(acceptor = self.name, peer = %peer, session_id = %session_id, "Accepted connection");

        Ok(Connection {
            stream,
            peer,
            session_id,
            _permit: permit,
        })
    }

    /// Runs the accept loop, spawning `handler` for each connection.
    ///
    /// Accept errors are logged and the loop continues.
    pub async fn run<F, Fut>(&self, handler: F) -> ServerResult<()>
    where
        F: Fn(TcpStream, SessionId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            match self.accept().await {
                Ok(connection) => {
                    let Connection {
                        stream,
                        session_id,
                        _permit: permit,
                        ..
                    } = connection;
                    let fut = handler(stream, session_id);
                    tokio::spawn(async move {
                        fut.await;
                        drop(permit);
                    });
                }
                Err(ServerError::Shutdown) => return Ok(()),
                Err(e) => {
                    error!(acceptor = self.name, error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Runs the accept loop until `shutdown` completes.
    pub async fn run_until_shutdown<F, Fut, S>(&self, handler: F, shutdown: S) -> ServerResult<()>
    where
        F: Fn(TcpStream, SessionId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()> + Send,
    {
        tokio::select! {
            result = self.run(handler) => result,
            _ = shutdown => {
                info!(acceptor = self.name, "Acceptor stopped");
                Ok(())
            }
        }
    }
}

/// An accepted client connection.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    session_id: SessionId,
    _permit: OwnedSemaphorePermit,
}

impl Connection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}
