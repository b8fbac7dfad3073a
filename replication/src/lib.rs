//! Replication and convergence engine.
//!
//! A write is stamped once by the coordinating node's [`UpdateClock`] and
//! fanned out to the key's replica set; every replica keeps the version
//! with the highest stamp, so replicas converge whatever order writes
//! arrive in. Replicas that miss a write get it later through hinted
//! handoff or read repair.

mod clock;
mod context;
mod coordinator;
mod handoff;
mod quorum;
mod replica;

pub use clock::UpdateClock;
pub use context::{AssumeAlive, ClusterContext, Liveness};
pub use coordinator::{Coordinator, WriteReceipt};
pub use handoff::{DrainReport, Hint, HintStats, HintedHandoff};
pub use quorum::{ConsistencyLevel, QuorumConfig, QuorumDescriptor};
pub use replica::ReplicaService;

use std::time::Duration;
use storage::{Limits, NodeId, StorageError};

pub type Result<T> = std::result::Result<T, ReplicationError>;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("Unavailable: {available} of {required} required replicas reachable")]
    Unavailable { required: usize, available: usize },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Membership changed during request (ring epoch {epoch})")]
    MembershipConflict { epoch: u64 },

    #[error("Hint queue for {target} is full, {dropped} hints dropped so far")]
    HandoffOverflow { target: NodeId, dropped: u64 },

    #[error("Replica error: {0}")]
    Replica(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<StorageError> for ReplicationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidKey(msg) => ReplicationError::InvalidKey(msg),
            StorageError::InvalidValue(msg) => ReplicationError::InvalidValue(msg),
            other => ReplicationError::Storage(other),
        }
    }
}

impl ReplicationError {
    /// Whether a client may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicationError::Unavailable { .. }
                | ReplicationError::Timeout(_)
                | ReplicationError::MembershipConflict { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub quorum: QuorumConfig,
    /// Deadline for each replica call of a request.
    pub request_timeout: Duration,
    pub hint_retention: Duration,
    pub hint_capacity: usize,
    /// Distance, in clock counter units, a tombstone must trail the local
    /// clock before it can be reclaimed.
    pub tombstone_grace: u64,
    pub limits: Limits,
    pub max_conflict_retries: usize,
}

impl Config {
    pub fn new(quorum: QuorumConfig, hint_retention: Duration) -> Self {
        Self {
            quorum,
            request_timeout: Duration::from_secs(2),
            hint_retention,
            hint_capacity: 10_000,
            tombstone_grace: 1_000_000,
            limits: Limits::default(),
            max_conflict_retries: 2,
        }
    }
}
