//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use msnp_core::PresenceStatus;

/// msnp - messenger protocol client
#[derive(Debug, Parser)]
#[command(name = "msnp")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "MSNP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Account to sign in with (overrides the config file)
    #[arg(long, short, env = "MSNP_ACCOUNT")]
    pub account: Option<String>,

    /// Nameserver endpoint as host:port (overrides the config file)
    #[arg(long, env = "MSNP_SERVER")]
    pub server: Option<String>,

    /// Presence to sign in with (online, busy, away, hidden, ...)
    #[arg(long)]
    pub status: Option<PresenceStatus>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in and print the contact list
    Contacts {
        /// Only show contacts that are online
        #[arg(long)]
        online: bool,
    },

    /// Chat with one or more contacts; lines from stdin are sent
    Chat {
        /// Contacts to talk to
        #[arg(required = true)]
        participants: Vec<String>,
    },

    /// Send a file to a contact
    SendFile {
        contact: String,
        path: PathBuf,
    },

    /// Download a contact's display picture
    FetchAvatar {
        contact: String,

        /// Output file (defaults to the download directory)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Block a contact
    Block { contact: String },

    /// Unblock a contact
    Unblock { contact: String },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}
