//! Serve command: runs the broker in the foreground.
//!
//! Builds the authenticator, the in-memory delivery backend and every
//! configured connection factory, then accepts STOMP and remoting
//! connections until SIGINT or SIGTERM.

use std::sync::Arc;

use tracing::info;

use relaymq_server::{Broker, MemoryBroker, SignalHandler};

use crate::cli::ServeArgs;
use crate::config::BrokerConfig;
use crate::error::CliResult;

/// Builds a broker from the configuration, with factories registered.
pub fn build_broker(config: &BrokerConfig) -> CliResult<Broker> {
    config.validate()?;
    let broker = Broker::new(
        config.server_config(),
        Arc::new(config.authenticator()),
        Arc::new(MemoryBroker::new()),
    )?;
    for factory in config.factory_configs() {
        broker.add_connection_factory(factory)?;
    }
    Ok(broker)
}

/// Starts the broker and blocks until a shutdown signal arrives.
pub async fn run(mut config: BrokerConfig, args: &ServeArgs) -> CliResult<()> {
    config.apply(args);
    let broker = build_broker(&config)?;

    let signals = SignalHandler::new();
    signals.spawn_listener();

    info!(
        stomp_addr = %config.server.stomp_addr,
        remoting_addr = %config.server.remoting_addr,
        server_id = config.server.server_id,
        version = env!("CARGO_PKG_VERSION"),
        "Starting relaymq"
    );
    broker.serve(signals.shutdown_handle()).await?;
    info!("relaymq stopped");
    Ok(())
}
