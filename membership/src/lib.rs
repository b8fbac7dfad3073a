//! Gossip-driven cluster membership.
//!
//! Every node periodically bumps its own heartbeat counter and exchanges its
//! member table with a few random peers. A peer whose heartbeat stops
//! advancing is first suspected, then declared dead. Ring changes are only
//! published once a state has held for the configured dwell time, so a
//! flapping node does not rebuild the ring on every blip.

mod gossip;
mod member;
mod table;

pub use gossip::{Membership, MembershipChannels};
pub use member::{GossipDigest, MemberInfo, MemberRecord, MemberState};
pub use table::{MemberTable, TableOutcome};

use async_trait::async_trait;
use std::time::Duration;
use storage::NodeId;

pub type Result<T> = std::result::Result<T, MembershipError>;

#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Peer {0} did not answer in time")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub gossip_interval: Duration,
    pub gossip_fanout: usize,
    /// Missed heartbeat intervals before a member is suspected.
    pub suspect_after: u32,
    /// Missed heartbeat intervals before a member is declared dead.
    pub dead_after: u32,
    /// How long a state must hold before the ring is rebuilt for it.
    pub dwell: Duration,
    /// How long a dead or departed member is remembered before removal.
    pub removal_grace: Duration,
    pub ping_timeout: Duration,
    /// Gossip exchanges and liveness pings allowed in flight at once.
    pub max_inflight: usize,
    pub seeds: Vec<String>,
}

impl MembershipConfig {
    pub fn validate(&self) -> Result<()> {
        if self.gossip_interval.is_zero() {
            return Err(MembershipError::InvalidConfig(
                "gossip interval must be positive".to_string(),
            ));
        }
        if self.gossip_fanout == 0 {
            return Err(MembershipError::InvalidConfig(
                "gossip fan-out must be at least 1".to_string(),
            ));
        }
        if self.max_inflight == 0 {
            return Err(MembershipError::InvalidConfig(
                "gossip in-flight bound must be at least 1".to_string(),
            ));
        }
        if self.suspect_after == 0 || self.suspect_after >= self.dead_after {
            return Err(MembershipError::InvalidConfig(format!(
                "suspect threshold ({}) must be positive and below dead threshold ({})",
                self.suspect_after, self.dead_after
            )));
        }
        Ok(())
    }
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(500),
            gossip_fanout: 3,
            suspect_after: 4,
            dead_after: 12,
            dwell: Duration::from_secs(2),
            removal_grace: Duration::from_secs(60),
            ping_timeout: Duration::from_millis(300),
            max_inflight: 32,
            seeds: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    Suspected(NodeId),
    /// A suspected or dead member was heard from again.
    Recovered(NodeId),
    Failed(NodeId),
    Left(NodeId),
    Removed(NodeId),
}

/// How gossip reaches other nodes. Addresses are peer addresses.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Sends our digest and returns the peer's.
    async fn exchange(&self, addr: &str, digest: GossipDigest) -> Result<GossipDigest>;

    /// Direct liveness ping.
    async fn ping(&self, addr: &str) -> Result<()>;
}
