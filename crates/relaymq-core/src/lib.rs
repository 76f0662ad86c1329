//! Core types: tracing setup and identifiers shared across relaymq crates.

pub mod id;
pub mod tracing;

pub use id::{ClientInstanceId, HandlerId, SessionId};
pub use tracing::{LogFormat, TracingConfig, TracingError, WORKSPACE_TARGETS, init_tracing};
