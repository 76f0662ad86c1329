//! STOMP acceptor side: per-session protocol engine and the connection
//! task that drives it.

mod connection;
mod engine;

pub use connection::StompConnection;
pub use engine::{
    EngineOutput, EngineState, SessionParams, StompEngine, StompServices, Subscription,
    error_frame, server_name,
};
