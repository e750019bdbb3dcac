//! CLI, configuration, secret resolution
//!
//! This crate provides the `msnp` command-line interface on top of
//! `msnp-engine`.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod secret;

pub use cli::Cli;
pub use error::{ClientError, ClientResult};
