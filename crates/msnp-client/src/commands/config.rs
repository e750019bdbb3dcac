//! Configuration commands.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::secret;

/// Dump the current configuration to stdout, with the ticket masked.
pub fn dump(config: &ClientConfig) -> ClientResult<()> {
    let mut shown = config.clone();
    if let Some(ticket) = &shown.ticket {
        if !secret::is_reference(ticket) {
            shown.ticket = Some("********".to_string());
        }
    }
    let toml_str = toml::to_string_pretty(&shown)
        .map_err(|e| ClientError::Config(format!("failed to serialize config: {}", e)))?;
    println!("# config.toml ({})", ClientConfig::default_path().display());
    println!("{}", toml_str);
    Ok(())
}

/// Validate the configuration, including the ticket reference.
pub fn validate(config: &ClientConfig) -> ClientResult<()> {
    config.validate()?;
    if config.ticket.is_some() {
        config.resolve_ticket()?;
        println!("Ticket resolves.");
    }
    println!("Configuration is valid.");
    Ok(())
}

/// Show the configuration file path.
pub fn path() -> ClientResult<()> {
    println!("config: {}", ClientConfig::default_path().display());
    Ok(())
}
