//! Engine configuration.

use std::time::Duration;

use msnp_core::{ObjectKind, PresenceStatus};
use serde::{Deserialize, Serialize};

/// Default nameserver endpoint.
pub const DEFAULT_NAMESERVER: &str = "messenger.hotmail.com:1863";

/// Client capability bits announced with presence: P2P transfers, custom
/// emoticons, display pictures.
pub const DEFAULT_CAPABILITIES: u64 = 0x5000_0000 | 0x04 | 0x10;

/// How an incoming offer for content that is already cached is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// A cache hit completes the transfer without receiving any bytes.
    #[default]
    TrustCache,
    /// Always receive the bytes, even on a cache hit.
    Validate,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Nameserver endpoint (`host:port`).
    pub nameserver: String,

    /// Timeout for establishing a TCP connection.
    pub connect_timeout: Duration,

    /// Timeout for a reply to a request carrying a trid.
    pub request_timeout: Duration,

    /// How long a send waits for a conversation to get a live switchboard.
    pub binding_timeout: Duration,

    /// How long a transfer waits for a new route after losing its switchboard.
    pub rebind_timeout: Duration,

    /// How long a transfer may go without hearing from the peer.
    pub transfer_idle_timeout: Duration,

    /// How long an empty or unrouted conversation stays open.
    pub empty_conversation_grace: Duration,

    /// Interval between nameserver keepalive pings.
    pub keepalive_interval: Duration,

    /// Maximum number of nameserver redirects followed during login.
    pub max_redirects: u32,

    /// Capability bits announced with presence.
    pub capabilities: u64,

    /// Presence set when login completes.
    pub initial_status: PresenceStatus,

    /// P2P chunk size in bytes.
    pub chunk_size: usize,

    /// Maximum unacknowledged bytes in flight per transfer.
    pub window_bytes: u64,

    /// Largest object accepted from a peer.
    pub max_object_size: u64,

    /// Object cache capacity in bytes (published objects are not counted
    /// against eviction).
    pub cache_capacity_bytes: usize,

    /// Object kinds accepted without asking the consumer.
    pub auto_accept: Vec<ObjectKind>,

    /// Handling of offers for content that is already cached.
    pub cache_policy: CachePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            nameserver: DEFAULT_NAMESERVER.to_string(),
            connect_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            binding_timeout: Duration::from_secs(20),
            rebind_timeout: Duration::from_secs(30),
            transfer_idle_timeout: Duration::from_secs(60),
            empty_conversation_grace: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(50),
            max_redirects: 3,
            capabilities: DEFAULT_CAPABILITIES,
            initial_status: PresenceStatus::Online,
            chunk_size: 1202,
            window_bytes: 8 * 1202,
            max_object_size: 16 * 1024 * 1024,
            cache_capacity_bytes: 64 * 1024 * 1024,
            auto_accept: vec![ObjectKind::Avatar, ObjectKind::Emoticon],
            cache_policy: CachePolicy::TrustCache,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration for the given nameserver endpoint.
    pub fn new(nameserver: impl Into<String>) -> Self {
        Self {
            nameserver: nameserver.into(),
            ..Default::default()
        }
    }

    /// Builder: set connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Builder: set request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Builder: set binding timeout.
    pub fn with_binding_timeout(mut self, timeout: Duration) -> Self {
        self.binding_timeout = timeout;
        self
    }

    /// Builder: set rebind timeout.
    pub fn with_rebind_timeout(mut self, timeout: Duration) -> Self {
        self.rebind_timeout = timeout;
        self
    }

    /// Builder: set the transfer idle timeout.
    pub fn with_transfer_idle_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_idle_timeout = timeout;
        self
    }

    /// Builder: set the grace period for empty conversations.
    pub fn with_empty_conversation_grace(mut self, grace: Duration) -> Self {
        self.empty_conversation_grace = grace;
        self
    }

    /// Builder: set keepalive interval.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Builder: set P2P chunk size.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Builder: set P2P window.
    pub fn with_window_bytes(mut self, window: u64) -> Self {
        self.window_bytes = window.max(1);
        self
    }

    /// Builder: set cache capacity.
    pub fn with_cache_capacity(mut self, bytes: usize) -> Self {
        self.cache_capacity_bytes = bytes;
        self
    }

    /// Builder: set auto-accepted object kinds.
    pub fn with_auto_accept(mut self, kinds: impl IntoIterator<Item = ObjectKind>) -> Self {
        self.auto_accept = kinds.into_iter().collect();
        self
    }

    /// Builder: set cache policy.
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Builder: set initial presence.
    pub fn with_initial_status(mut self, status: PresenceStatus) -> Self {
        self.initial_status = status;
        self
    }
}
