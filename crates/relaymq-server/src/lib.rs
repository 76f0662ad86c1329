//! Broker wire layer: packet dispatch, connection factories, STOMP.
//!
//! This crate provides the server side of a relaymq node:
//! - A packet dispatcher routing remoting packets to registered handlers
//! - Connection factory endpoints with topology push to callback channels
//! - A STOMP 1.0/1.1 engine with version and heartbeat negotiation
//! - TCP acceptors and signal-driven shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use relaymq_server::{
//!     Broker, MemoryBroker, ServerConfig, SignalHandler, StaticAuthenticator, UserCredentials,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let auth = StaticAuthenticator::new([UserCredentials::new("guest", "guest")]);
//!     let broker = Broker::new(
//!         ServerConfig::default(),
//!         Arc::new(auth),
//!         Arc::new(MemoryBroker::new()),
//!     )?;
//!     broker.add_connection_factory(broker.factory_config("default"))?;
//!
//!     let signals = SignalHandler::new();
//!     signals.spawn_listener();
//!     broker.serve(signals.shutdown_handle()).await?;
//!     Ok(())
//! }
//! ```

mod auth;
mod backend;
mod broker;
mod callbacks;
mod config;
mod connection_factory;
mod dispatcher;
mod error;
mod heartbeat;
mod remoting;
mod signals;
mod socket;
pub mod stomp;
mod topology;

pub use auth::{Authenticator, SecurityContext, StaticAuthenticator, UserCredentials};
pub use backend::{AckMode, Delivery, DeliveryBackend, MemoryBroker, Message};
pub use broker::{Broker, BrokerListeners};
pub use callbacks::{CallbackChannel, CallbackKey, CallbackRegistry};
pub use config::{DEFAULT_REMOTING_ADDR, DEFAULT_STOMP_ADDR, ServerConfig, StompConfig};
pub use connection_factory::{
    ConnectionDelegate, ConnectionEndpoint, ConnectionFactoryConfig, ConnectionFactoryEndpoint,
    ConnectionFactoryHandler, ConnectionRequest, PublishReport,
};
pub use dispatcher::{PacketDispatcher, PacketHandler, PacketSender};
pub use error::{
    AuthError, BackendError, DispatchError, HandlerError, ServerError, ServerResult, StompError,
};
pub use heartbeat::{HeartbeatEvent, HeartbeatMonitor};
pub use remoting::{DEFAULT_OUTBOUND_CAPACITY, RemotingContext};
pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
pub use socket::{Connection, TcpAcceptor};
pub use topology::TopologyManager;
