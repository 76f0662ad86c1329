//! Broker assembly: one dispatcher, one authenticator, one delivery
//! backend, any number of connection factories, and the two listeners.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::net::TcpStream;
use tracing::{debug, info};

use relaymq_core::SessionId;

use crate::auth::Authenticator;
use crate::backend::DeliveryBackend;
use crate::config::ServerConfig;
use crate::connection_factory::{
    ConnectionFactoryConfig, ConnectionFactoryEndpoint, ConnectionFactoryHandler,
};
use crate::dispatcher::PacketDispatcher;
use crate::error::{DispatchError, ServerResult};
use crate::remoting::RemotingContext;
use crate::signals::ShutdownHandle;
use crate::socket::TcpAcceptor;
use crate::stomp::{StompConnection, StompServices};

/// Listeners bound by [`Broker::bind`].
pub struct BrokerListeners {
    pub stomp: TcpAcceptor,
    pub remoting: TcpAcceptor,
}

/// A configured broker node.
pub struct Broker {
    config: ServerConfig,
    dispatcher: Arc<PacketDispatcher>,
    authenticator: Arc<dyn Authenticator>,
    stomp: StompServices,
    remoting: Arc<RemotingContext>,
    factories: DashMap<String, Arc<ConnectionFactoryEndpoint>>,
}

impl Broker {
    /// Creates a broker after validating `config`.
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        backend: Arc<dyn DeliveryBackend>,
    ) -> ServerResult<Self> {
        config.validate()?;
        let dispatcher = Arc::new(PacketDispatcher::new());
        let stomp = StompServices {
            authenticator: Arc::clone(&authenticator),
            backend,
            config: Arc::new(config.stomp.clone()),
        };
        Ok(Self {
            remoting: Arc::new(RemotingContext::new(Arc::clone(&dispatcher))),
            config,
            dispatcher,
            authenticator,
            stomp,
            factories: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<PacketDispatcher> {
        &self.dispatcher
    }

    /// Factory settings prefilled with this node's server id and push
    /// timeout.
    pub fn factory_config(&self, name: impl Into<String>) -> ConnectionFactoryConfig {
        ConnectionFactoryConfig::new(name)
            .with_server_id(self.config.server_id)
            .with_callback_send_timeout(self.config.callback_send_timeout)
    }

    /// Creates a connection factory and registers it with the dispatcher
    /// under its name.
    pub fn add_connection_factory(
        &self,
        config: ConnectionFactoryConfig,
    ) -> ServerResult<Arc<ConnectionFactoryEndpoint>> {
        let entry = match self.factories.entry(config.name.clone()) {
            Entry::Occupied(entry) => {
                return Err(DispatchError::DuplicateHandler {
                    id: entry.get().id().clone(),
                }
                .into());
            }
            Entry::Vacant(entry) => entry,
        };

        let endpoint = Arc::new(ConnectionFactoryEndpoint::new(
            config,
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.authenticator),
        ));
        self.dispatcher
            .register(Arc::new(ConnectionFactoryHandler::new(Arc::clone(&endpoint))))?;
        self.remoting.add_factory(Arc::clone(&endpoint));
        entry.insert(Arc::clone(&endpoint));
        info!(factory = %endpoint.name(), server_id = endpoint.server_id(), "Connection factory registered");
        Ok(endpoint)
    }

    pub fn factory(&self, name: &str) -> Option<Arc<ConnectionFactoryEndpoint>> {
        self.factories.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Binds both listeners.
    pub async fn bind(&self) -> ServerResult<BrokerListeners> {
        Ok(BrokerListeners {
            stomp: TcpAcceptor::bind(
                "stomp",
                self.config.stomp_addr,
                self.config.max_connections,
            )
            .await?,
            remoting: TcpAcceptor::bind(
                "remoting",
                self.config.remoting_addr,
                self.config.max_connections,
            )
            .await?,
        })
    }

    /// Accepts on both listeners until `shutdown` is triggered.
    ///
    /// Connection tasks already running are left to finish on their own.
    pub async fn run(
        &self,
        listeners: BrokerListeners,
        shutdown: ShutdownHandle,
    ) -> ServerResult<()> {
        let services = self.stomp.clone();
        let stomp_handler = move |stream: TcpStream, session_id: SessionId| {
            let connection = StompConnection::new(stream, session_id, services.clone());
            async move {
                if let Err(e) = connection.run().await {
                    debug!(error = %e, "STOMP connection ended with error");
                }
            }
        };

        let remoting = Arc::clone(&self.remoting);
        let remoting_handler = move |stream: TcpStream, session_id: SessionId| {
            let remoting = Arc::clone(&remoting);
            async move {
                if let Err(e) = remoting.serve(stream, session_id).await {
                    debug!(error = %e, "Remoting session ended with error");
                }
            }
        };

        let (stomp, remoting) = tokio::join!(
            listeners
                .stomp
                .run_until_shutdown(stomp_handler, shutdown.wait().wait()),
            listeners
                .remoting
                .run_until_shutdown(remoting_handler, shutdown.wait().wait()),
        );
        stomp?;
        remoting?;
        info!("Broker stopped");
        Ok(())
    }

    /// Binds and runs until `shutdown` is triggered.
    pub async fn serve(&self, shutdown: ShutdownHandle) -> ServerResult<()> {
        let listeners = self.bind().await?;
        self.run(listeners, shutdown).await
    }
}
