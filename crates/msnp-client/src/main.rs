//! msnp CLI entry point.

use std::process::ExitCode;

use clap::Parser;

use msnp_client::cli::{Cli, Command, ConfigAction};
use msnp_client::commands::{self, Session};
use msnp_client::config::ClientConfig;
use msnp_client::error::ClientResult;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = msnp_core::init_tracing(config.tracing_config(cli.debug)) {
        eprintln!("warning: {}", e);
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Reads the config file and applies command-line overrides.
fn load_config(cli: &Cli) -> ClientResult<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path)?,
        None => ClientConfig::load()?,
    };
    if let Some(account) = &cli.account {
        config.account = Some(account.clone());
    }
    if let Some(server) = &cli.server {
        config.server.nameserver = server.clone();
    }
    if let Some(status) = cli.status {
        config.profile.status = status;
    }
    Ok(config)
}

async fn run(cli: Cli, config: ClientConfig) -> ClientResult<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Dump => commands::config::dump(&config),
            ConfigAction::Validate => commands::config::validate(&config),
            ConfigAction::Path => commands::config::path(),
        };
    }

    config.validate()?;
    let session = Session::sign_in(&config).await?;

    match cli.command {
        Command::Contacts { online } => commands::contacts::list(session, online, cli.json).await,
        Command::Chat { participants } => commands::chat::run(session, &participants).await,
        Command::SendFile { contact, path } => {
            commands::transfer::send_file(session, &contact, &path).await
        }
        Command::FetchAvatar { contact, output } => {
            commands::transfer::fetch_avatar(session, &contact, output, &config.download_dir()).await
        }
        Command::Block { contact } => commands::contacts::block(session, &contact).await,
        Command::Unblock { contact } => commands::contacts::unblock(session, &contact).await,
        Command::Config { .. } => Ok(()),
    }
}
