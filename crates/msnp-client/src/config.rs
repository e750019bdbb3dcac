//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/msnp/config.toml` by default.
//!
//! The `ticket` value supports secret references:
//! - `pass::path/in/store` resolved via `pass show`
//! - `env::VAR_NAME` resolved from the environment
//! - `file::/path` read from a file
//! - plain text used as-is

use std::path::{Path, PathBuf};
use std::time::Duration;

use msnp_core::{ObjectKind, PresenceStatus, TracingConfig, TracingOutputFormat};
use msnp_engine::{CachePolicy, DEFAULT_NAMESERVER, EngineConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

// ---------------------------------------------------------------------------
// ClientConfig (config.toml)
// ---------------------------------------------------------------------------

/// Configuration for the msnp client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Account to sign in with.
    pub account: Option<String>,

    /// Login ticket (supports `pass::`, `env::` and `file::` prefixes).
    pub ticket: Option<String>,

    /// Debug mode.
    pub debug: bool,

    /// What we advertise about ourselves.
    pub profile: ProfileSettings,

    /// Nameserver connection settings.
    pub server: ServerSettings,

    /// Conversation settings.
    pub conversations: ConversationSettings,

    /// Transfer and cache settings.
    pub transfers: TransferSettings,

    /// Log output settings.
    pub logging: LogSettings,
}

/// Profile applied after login.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSettings {
    /// Presence set when login completes.
    pub status: PresenceStatus,

    pub display_name: Option<String>,

    pub personal_message: Option<String>,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            status: PresenceStatus::Online,
            display_name: None,
            personal_message: None,
        }
    }
}

/// Nameserver connection settings. Timeouts are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Nameserver endpoint (`host:port`).
    pub nameserver: String,

    pub connect_timeout: u64,

    pub request_timeout: u64,

    pub keepalive_interval: u64,

    pub max_redirects: u32,
}

impl Default for ServerSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            nameserver: DEFAULT_NAMESERVER.to_string(),
            connect_timeout: engine.connect_timeout.as_secs(),
            request_timeout: engine.request_timeout.as_secs(),
            keepalive_interval: engine.keepalive_interval.as_secs(),
            max_redirects: engine.max_redirects,
        }
    }
}

/// Conversation settings. Durations are in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationSettings {
    /// How long a message waits for a switchboard.
    pub binding_timeout: u64,

    /// How long an empty conversation stays open.
    pub empty_grace: u64,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            binding_timeout: engine.binding_timeout.as_secs(),
            empty_grace: engine.empty_conversation_grace.as_secs(),
        }
    }
}

/// Transfer and object cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSettings {
    pub chunk_size: usize,

    pub window_bytes: u64,

    pub max_object_size: u64,

    /// Seconds a transfer waits for a new switchboard.
    pub rebind_timeout: u64,

    /// Seconds a transfer may stay silent before it is given up.
    pub idle_timeout: u64,

    pub cache_capacity_bytes: usize,

    pub cache_policy: CachePolicy,

    /// Object kinds accepted without asking.
    pub auto_accept: Vec<ObjectKind>,

    /// Where received files and pictures are written.
    pub download_dir: Option<PathBuf>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            chunk_size: engine.chunk_size,
            window_bytes: engine.window_bytes,
            max_object_size: engine.max_object_size,
            rebind_timeout: engine.rebind_timeout.as_secs(),
            idle_timeout: engine.transfer_idle_timeout.as_secs(),
            cache_capacity_bytes: engine.cache_capacity_bytes,
            cache_policy: engine.cache_policy,
            auto_accept: engine.auto_accept,
            download_dir: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub format: LogFormat,

    /// Dump every frame at TRACE level.
    pub frame_dump: bool,

    /// Filter directive, same syntax as `RUST_LOG`.
    pub filter: Option<String>,
}

impl ClientConfig {
    /// Loads configuration from the default path, or defaults if there is
    /// no file.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            ClientError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("msnp")
    }

    /// Returns the directory received objects are written to.
    pub fn download_dir(&self) -> PathBuf {
        self.transfers.download_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("msnp")
        })
    }

    /// The configured account, or an error explaining how to set one.
    pub fn account(&self) -> ClientResult<&str> {
        self.account.as_deref().ok_or_else(|| {
            ClientError::Config(format!(
                "no account configured. Add to {}:\n  \
                 account = \"you@example.com\"\n  \
                 ticket = \"env::MSNP_TICKET\"\n\n  \
                 Or pass --account",
                Self::default_path().display()
            ))
        })
    }

    /// Resolves the login ticket, expanding secret references.
    pub fn resolve_ticket(&self) -> ClientResult<String> {
        let raw = self
            .ticket
            .as_deref()
            .ok_or_else(|| ClientError::Config("`ticket` is missing from config.toml".to_string()))?;
        crate::secret::resolve(raw)
    }

    /// Checks values the engine cannot work with.
    pub fn validate(&self) -> ClientResult<()> {
        if !self.server.nameserver.contains(':') {
            return Err(ClientError::Config(format!(
                "nameserver `{}` must be host:port",
                self.server.nameserver
            )));
        }
        if self.transfers.chunk_size == 0 {
            return Err(ClientError::Config("chunk_size must be positive".to_string()));
        }
        if self.transfers.window_bytes < self.transfers.chunk_size as u64 {
            return Err(ClientError::Config(
                "window_bytes must hold at least one chunk".to_string(),
            ));
        }
        if let Some(account) = &self.account {
            if !account.contains('@') {
                return Err(ClientError::Config(format!(
                    "account `{}` is not an address",
                    account
                )));
            }
        }
        Ok(())
    }

    /// Builds the engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        let secs = Duration::from_secs;
        let mut config = EngineConfig::new(self.server.nameserver.clone())
            .with_connect_timeout(secs(self.server.connect_timeout))
            .with_request_timeout(secs(self.server.request_timeout))
            .with_keepalive_interval(secs(self.server.keepalive_interval))
            .with_binding_timeout(secs(self.conversations.binding_timeout))
            .with_empty_conversation_grace(secs(self.conversations.empty_grace))
            .with_rebind_timeout(secs(self.transfers.rebind_timeout))
            .with_transfer_idle_timeout(secs(self.transfers.idle_timeout))
            .with_chunk_size(self.transfers.chunk_size)
            .with_window_bytes(self.transfers.window_bytes)
            .with_cache_capacity(self.transfers.cache_capacity_bytes)
            .with_cache_policy(self.transfers.cache_policy)
            .with_auto_accept(self.transfers.auto_accept.iter().copied())
            .with_initial_status(self.profile.status);
        config.max_redirects = self.server.max_redirects;
        config.max_object_size = self.transfers.max_object_size;
        config
    }

    /// Builds the tracing setup; `debug` comes from the command line or
    /// the file.
    pub fn tracing_config(&self, debug: bool) -> TracingConfig {
        let base = if debug || self.debug {
            TracingConfig::cli_debug()
        } else {
            TracingConfig::default()
        };
        let format = match self.logging.format {
            LogFormat::Pretty => TracingOutputFormat::Pretty,
            LogFormat::Compact => TracingOutputFormat::Compact,
            LogFormat::Json => TracingOutputFormat::Json,
        };
        let config = base
            .with_format(format)
            .with_frame_dump(self.logging.frame_dump);
        match &self.logging.filter {
            Some(filter) => config.with_env_filter(filter.clone()),
            None => config,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn empty_file_gives_engine_defaults() {
        let config: ClientConfig = toml::from_str("").unwrap();
        let engine = config.engine_config();
        let defaults = EngineConfig::default();
        assert_eq!(engine.nameserver, DEFAULT_NAMESERVER);
        assert_eq!(engine.request_timeout, defaults.request_timeout);
        assert_eq!(engine.chunk_size, defaults.chunk_size);
        assert_eq!(engine.auto_accept, defaults.auto_accept);
        assert_eq!(engine.initial_status, PresenceStatus::Online);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_sections_map_onto_engine() {
        let config: ClientConfig = toml::from_str(
            r#"
account = "alice@example.com"
ticket = "t=plain"

[profile]
status = "away"
display_name = "Alice"

[server]
nameserver = "127.0.0.1:1863"
request_timeout = 5

[transfers]
chunk_size = 500
window_bytes = 1500
auto_accept = ["avatar"]
cache_policy = "validate"
idle_timeout = 45

[logging]
format = "json"
"#,
        )
        .unwrap();

        assert_eq!(config.account().unwrap(), "alice@example.com");
        assert_eq!(config.resolve_ticket().unwrap(), "t=plain");
        assert_eq!(config.profile.display_name.as_deref(), Some("Alice"));

        let engine = config.engine_config();
        assert_eq!(engine.nameserver, "127.0.0.1:1863");
        assert_eq!(engine.request_timeout, Duration::from_secs(5));
        assert_eq!(engine.chunk_size, 500);
        assert_eq!(engine.window_bytes, 1500);
        assert_eq!(engine.auto_accept, [ObjectKind::Avatar]);
        assert_eq!(engine.cache_policy, CachePolicy::Validate);
        assert_eq!(engine.transfer_idle_timeout, Duration::from_secs(45));
        assert_eq!(engine.initial_status, PresenceStatus::Away);
        assert_eq!(
            config.tracing_config(false).output_format,
            TracingOutputFormat::Json
        );
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "account = \"bob@example.com\"").unwrap();
        writeln!(file, "[server]\nnameserver = \"ns.example.com:1863\"").unwrap();
        let config = ClientConfig::load_from(file.path()).unwrap();
        assert_eq!(config.account.as_deref(), Some("bob@example.com"));
        assert_eq!(config.server.nameserver, "ns.example.com:1863");
    }

    #[test]
    fn unreadable_or_invalid_files_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ClientConfig::load_from(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ClientError::Config(_))));

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "account = [").unwrap();
        let err = ClientConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));
    }

    #[test]
    fn missing_account_and_ticket_error() {
        let config = ClientConfig::default();
        assert!(config.account().unwrap_err().to_string().contains("--account"));
        assert!(matches!(config.resolve_ticket(), Err(ClientError::Config(_))));
    }

    #[test]
    fn ticket_env_reference_is_resolved() {
        unsafe {
            std::env::set_var("_MSNP_CONFIG_TEST_TICKET", "t=env");
        }
        let config = ClientConfig {
            ticket: Some("env::_MSNP_CONFIG_TEST_TICKET".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolve_ticket().unwrap(), "t=env");
        unsafe {
            std::env::remove_var("_MSNP_CONFIG_TEST_TICKET");
        }
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ClientConfig::default();
        config.server.nameserver = "no-port".to_string();
        assert!(config.validate().is_err());

        let mut config = ClientConfig::default();
        config.transfers.window_bytes = 10;
        assert!(config.validate().is_err());

        let config = ClientConfig {
            account: Some("alice".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn dump_round_trips_through_toml() {
        let config = ClientConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.nameserver, config.server.nameserver);
        assert_eq!(parsed.transfers.auto_accept, config.transfers.auto_accept);
    }
}
