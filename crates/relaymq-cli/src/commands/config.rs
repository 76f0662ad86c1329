//! Configuration commands.

use std::path::Path;

use crate::config::BrokerConfig;
use crate::error::CliResult;

/// Dump the effective configuration to stdout.
pub fn dump(config: &BrokerConfig, path: &Path) -> CliResult<()> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("# config.toml ({})", path.display());
    println!("{}", toml_str);
    Ok(())
}

/// Validate the configuration.
pub fn validate(config: &BrokerConfig) -> CliResult<()> {
    config.validate()?;
    println!(
        "Configuration is valid: {} user(s), {} connection factory(ies).",
        config.users.len(),
        config.factory_configs().len()
    );
    Ok(())
}

/// Show the configuration file path.
pub fn path(path: &Path) -> CliResult<()> {
    println!("config: {}", path.display());
    Ok(())
}
