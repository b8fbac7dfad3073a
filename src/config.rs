use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ParavonError, Result};
use storage::{Limits, NodeId};

/// Startup descriptor of a node. Loaded once, validated, then split into
/// the per-crate configs; nothing changes it afterwards.
///
/// Replication factor, quorum sizes and hint retention have no defaults and
/// must be present in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub node_id: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    #[serde(default = "default_peer_port")]
    pub peer_port: u16,
    /// Peer addresses (host:port) contacted until gossip knows other members.
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default)]
    pub tls: system::TlsPaths,
    #[serde(default = "default_vnodes")]
    pub vnodes: u16,

    pub replication_factor: usize,
    pub write_quorum: usize,
    pub read_quorum: usize,
    pub hint_retention_ms: u64,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_hint_capacity")]
    pub hint_capacity: usize,
    #[serde(default = "default_hint_sweep_interval_ms")]
    pub hint_sweep_interval_ms: u64,
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
    #[serde(default = "default_gossip_fanout")]
    pub gossip_fanout: usize,
    #[serde(default = "default_suspect_after")]
    pub suspect_after: u32,
    #[serde(default = "default_dead_after")]
    pub dead_after: u32,
    #[serde(default = "default_dwell_ms")]
    pub dwell_ms: u64,
    #[serde(default = "default_removal_grace_ms")]
    pub removal_grace_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    /// Counter distance a tombstone must trail the local clock before it is
    /// reclaimed.
    #[serde(default = "default_tombstone_grace")]
    pub tombstone_grace: u64,
    #[serde(default = "default_tombstone_interval_ms")]
    pub tombstone_interval_ms: u64,
    #[serde(default = "default_max_key_size")]
    pub max_key_size: usize,
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// First delay before reconnecting to a peer whose connect failed.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
    /// Gossip exchanges and liveness pings allowed in flight at once.
    #[serde(default = "default_gossip_max_inflight")]
    pub gossip_max_inflight: usize,
}

/// Bytes a peer frame needs beyond key and value: the envelope with its
/// request id and sender, the message tag and the value's stamp.
pub const FRAME_OVERHEAD: usize = 4096;

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    2001
}

fn default_admin_port() -> u16 {
    6001
}

fn default_peer_port() -> u16 {
    7001
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/paravon")
}

fn default_vnodes() -> u16 {
    64
}

fn default_request_timeout_ms() -> u64 {
    2000
}

fn default_hint_capacity() -> usize {
    10_000
}

fn default_hint_sweep_interval_ms() -> u64 {
    5000
}

fn default_gossip_interval_ms() -> u64 {
    500
}

fn default_gossip_fanout() -> usize {
    3
}

fn default_suspect_after() -> u32 {
    4
}

fn default_dead_after() -> u32 {
    12
}

fn default_dwell_ms() -> u64 {
    2000
}

fn default_removal_grace_ms() -> u64 {
    60_000
}

fn default_ping_timeout_ms() -> u64 {
    300
}

fn default_tombstone_grace() -> u64 {
    1_000_000
}

fn default_tombstone_interval_ms() -> u64 {
    60_000
}

fn default_max_key_size() -> usize {
    1024
}

fn default_max_value_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_max_frame_size() -> usize {
    4 * 1024 * 1024
}

fn default_reconnect_initial_ms() -> u64 {
    100
}

fn default_reconnect_max_ms() -> u64 {
    5000
}

fn default_reconnect_jitter_ms() -> u64 {
    100
}

fn default_gossip_max_inflight() -> usize {
    32
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ParavonError::InvalidConfig(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ParavonError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ParavonError::InvalidConfig(msg));

        if self.node_id.trim().is_empty() {
            return invalid("node_id must not be empty".to_string());
        }
        if self.replication_factor == 0 {
            return invalid("replication_factor must be at least 1".to_string());
        }
        if self.write_quorum == 0 || self.write_quorum > self.replication_factor {
            return invalid(format!(
                "write_quorum must be between 1 and {}, got {}",
                self.replication_factor, self.write_quorum
            ));
        }
        if self.read_quorum == 0 || self.read_quorum > self.replication_factor {
            return invalid(format!(
                "read_quorum must be between 1 and {}, got {}",
                self.replication_factor, self.read_quorum
            ));
        }
        if self.vnodes == 0 {
            return invalid("vnodes must be at least 1".to_string());
        }
        if self.hint_capacity == 0 {
            return invalid("hint_capacity must be at least 1".to_string());
        }
        if self.suspect_after == 0 || self.suspect_after >= self.dead_after {
            return invalid(format!(
                "suspect_after ({}) must be positive and below dead_after ({})",
                self.suspect_after, self.dead_after
            ));
        }
        if self.gossip_interval_ms == 0 || self.gossip_fanout == 0 {
            return invalid("gossip interval and fanout must be positive".to_string());
        }
        if self.request_timeout_ms == 0 || self.hint_sweep_interval_ms == 0 || self.tombstone_interval_ms == 0 {
            return invalid("timeouts and task intervals must be positive".to_string());
        }
        if self.reconnect_initial_ms == 0 || self.reconnect_max_ms < self.reconnect_initial_ms {
            return invalid(format!(
                "reconnect_max_ms ({}) must be at least reconnect_initial_ms ({}), which must be positive",
                self.reconnect_max_ms, self.reconnect_initial_ms
            ));
        }
        if self.gossip_max_inflight < self.gossip_fanout {
            return invalid(format!(
                "gossip_max_inflight ({}) must be at least gossip_fanout ({})",
                self.gossip_max_inflight, self.gossip_fanout
            ));
        }
        // A full-size write has to fit in one peer frame.
        let required = self.max_key_size + self.max_value_size + FRAME_OVERHEAD;
        if self.max_frame_size < required {
            return invalid(format!(
                "max_frame_size ({}) must be at least max_key_size + max_value_size + {} ({})",
                self.max_frame_size, FRAME_OVERHEAD, required
            ));
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::new(self.node_id.clone())
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.host, self.api_port)
    }

    pub fn admin_addr(&self) -> String {
        format!("{}:{}", self.host, self.admin_port)
    }

    pub fn peer_addr(&self) -> String {
        format!("{}:{}", self.host, self.peer_port)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            max_key_size: self.max_key_size,
            max_value_size: self.max_value_size,
        }
    }

    pub fn hint_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.hint_sweep_interval_ms)
    }

    pub fn tombstone_interval(&self) -> Duration {
        Duration::from_millis(self.tombstone_interval_ms)
    }
}

impl From<Config> for network::Config {
    fn from(config: Config) -> Self {
        network::Config {
            call_timeout: Duration::from_millis(config.request_timeout_ms),
            max_frame_size: config.max_frame_size,
            reconnect_backoff: network::ExponentialBackoff::new(
                Duration::from_millis(config.reconnect_initial_ms),
                Duration::from_millis(config.reconnect_max_ms),
                2,
                Duration::from_millis(config.reconnect_jitter_ms),
            ),
            ..network::Config::new(config.node_id(), config.peer_addr())
        }
    }
}

impl From<Config> for membership::MembershipConfig {
    fn from(config: Config) -> Self {
        membership::MembershipConfig {
            gossip_interval: Duration::from_millis(config.gossip_interval_ms),
            gossip_fanout: config.gossip_fanout,
            suspect_after: config.suspect_after,
            dead_after: config.dead_after,
            dwell: Duration::from_millis(config.dwell_ms),
            removal_grace: Duration::from_millis(config.removal_grace_ms),
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
            max_inflight: config.gossip_max_inflight,
            seeds: config.seeds,
        }
    }
}

impl From<Config> for replication::Config {
    fn from(config: Config) -> Self {
        let quorum = replication::QuorumConfig {
            n: config.replication_factor,
            w: config.write_quorum,
            r: config.read_quorum,
        };
        replication::Config {
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            hint_capacity: config.hint_capacity,
            tombstone_grace: config.tombstone_grace,
            limits: config.limits(),
            ..replication::Config::new(quorum, Duration::from_millis(config.hint_retention_ms))
        }
    }
}

impl From<Config> for api::Config {
    fn from(config: Config) -> Self {
        api::Config {
            api_addr: config.api_addr(),
            admin_addr: config.admin_addr(),
            replication_factor: config.replication_factor,
        }
    }
}

impl From<Config> for system::PreflightConfig {
    fn from(config: Config) -> Self {
        system::PreflightConfig {
            storage_path: config.storage_path,
            tls: config.tls,
        }
    }
}
