//! CLI and bootstrap for the relaymq broker
//!
//! This crate provides the `relaymq` command-line interface.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::Cli;
pub use config::BrokerConfig;
pub use error::{CliError, CliResult};
