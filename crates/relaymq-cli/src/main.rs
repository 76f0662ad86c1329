//! relaymq entry point.

use std::process::ExitCode;

use clap::Parser;

use relaymq_cli::cli::{Cli, Command, ConfigAction, ServeArgs};
use relaymq_cli::commands;
use relaymq_cli::config::BrokerConfig;
use relaymq_cli::error::CliResult;
use relaymq_core::{TracingConfig, init_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let tracing = if cli.debug {
        TracingConfig::debug()
    } else if cli.json_logs {
        TracingConfig::json()
    } else {
        TracingConfig::broker()
    };
    if let Err(e) = init_tracing(tracing) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> CliResult<()> {
    let path = cli.config.clone().unwrap_or_else(BrokerConfig::default_path);
    let config = match cli.config {
        Some(ref path) => BrokerConfig::load_from(path)?,
        None => BrokerConfig::load()?,
    };

    match cli.command {
        Some(Command::Config { action }) => match action {
            ConfigAction::Dump => commands::config::dump(&config, &path),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(&path),
        },
        Some(Command::Serve(args)) => commands::serve::run(config, &args).await,
        None => commands::serve::run(config, &ServeArgs::default()).await,
    }
}
