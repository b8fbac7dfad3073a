use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ReplicationError, Result};
use topology::{NodeEntry, RingView};

/// Replication factor and quorum sizes. There are no defaults: every
/// deployment states them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumConfig {
    pub n: usize,
    pub w: usize,
    pub r: usize,
}

impl QuorumConfig {
    pub fn new(n: usize, w: usize, r: usize) -> Result<Self> {
        if n == 0 {
            return Err(ReplicationError::InvalidConfig(
                "replication factor must be at least 1".to_string(),
            ));
        }
        if w == 0 || w > n {
            return Err(ReplicationError::InvalidConfig(format!(
                "write quorum {} must be between 1 and {}",
                w, n
            )));
        }
        if r == 0 || r > n {
            return Err(ReplicationError::InvalidConfig(format!(
                "read quorum {} must be between 1 and {}",
                r, n
            )));
        }
        Ok(Self { n, w, r })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsistencyLevel {
    One,
    Quorum,
    All,
    /// The configured W for writes and R for reads.
    #[default]
    Default,
}

impl ConsistencyLevel {
    fn required(self, configured: usize, replicas: usize) -> usize {
        let wanted = match self {
            ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => replicas / 2 + 1,
            ConsistencyLevel::All => replicas,
            ConsistencyLevel::Default => configured,
        };
        // Fewer owners than N: degrade instead of failing closed.
        wanted.min(replicas)
    }
}

impl FromStr for ConsistencyLevel {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "one" => Ok(ConsistencyLevel::One),
            "quorum" => Ok(ConsistencyLevel::Quorum),
            "all" => Ok(ConsistencyLevel::All),
            "default" | "" => Ok(ConsistencyLevel::Default),
            other => Err(ReplicationError::InvalidConfig(format!(
                "unknown consistency level '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsistencyLevel::One => "one",
            ConsistencyLevel::Quorum => "quorum",
            ConsistencyLevel::All => "all",
            ConsistencyLevel::Default => "default",
        };
        f.write_str(name)
    }
}

/// Replica set and acknowledgement count for one request, derived from a
/// ring snapshot. Never stored.
#[derive(Debug, Clone)]
pub struct QuorumDescriptor {
    pub epoch: u64,
    pub replicas: Vec<NodeEntry>,
    pub required: usize,
}

impl QuorumDescriptor {
    pub fn for_write(view: &RingView, key: &[u8], config: &QuorumConfig, level: ConsistencyLevel) -> Self {
        Self::build(view, key, config.n, config.w, level)
    }

    pub fn for_read(view: &RingView, key: &[u8], config: &QuorumConfig, level: ConsistencyLevel) -> Self {
        Self::build(view, key, config.n, config.r, level)
    }

    fn build(view: &RingView, key: &[u8], n: usize, configured: usize, level: ConsistencyLevel) -> Self {
        let replicas = view.replicas_for(key, n);
        let required = level.required(configured, replicas.len());
        Self {
            epoch: view.epoch,
            replicas,
            required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::NodeId;
    use topology::vnode_tokens;

    fn view(ids: &[&str]) -> RingView {
        RingView::from_members(ids.iter().map(|id| {
            let node = NodeId::from(*id);
            let tokens = vnode_tokens(&node, 8);
            NodeEntry::new(node, *id, *id, tokens).unwrap()
        }))
    }

    #[test]
    fn rejects_impossible_quorums() {
        assert!(QuorumConfig::new(0, 1, 1).is_err());
        assert!(QuorumConfig::new(3, 4, 2).is_err());
        assert!(QuorumConfig::new(3, 2, 0).is_err());
        assert!(QuorumConfig::new(1, 1, 1).is_ok());
        assert!(QuorumConfig::new(3, 2, 2).is_ok());
    }

    #[test]
    fn levels_resolve_against_replica_count() {
        let config = QuorumConfig::new(3, 2, 1).unwrap();
        let ring = view(&["a", "b", "c", "d"]);

        let write = QuorumDescriptor::for_write(&ring, b"k", &config, ConsistencyLevel::Default);
        assert_eq!(write.replicas.len(), 3);
        assert_eq!(write.required, 2);

        let read = QuorumDescriptor::for_read(&ring, b"k", &config, ConsistencyLevel::Default);
        assert_eq!(read.required, 1);

        assert_eq!(QuorumDescriptor::for_read(&ring, b"k", &config, ConsistencyLevel::All).required, 3);
        assert_eq!(QuorumDescriptor::for_read(&ring, b"k", &config, ConsistencyLevel::Quorum).required, 2);
        assert_eq!(QuorumDescriptor::for_write(&ring, b"k", &config, ConsistencyLevel::One).required, 1);
    }

    #[test]
    fn small_cluster_degrades_quorum() {
        let config = QuorumConfig::new(3, 3, 2).unwrap();
        let ring = view(&["a", "b"]);
        let write = QuorumDescriptor::for_write(&ring, b"k", &config, ConsistencyLevel::Default);
        assert_eq!(write.replicas.len(), 2);
        assert_eq!(write.required, 2);
    }

    #[test]
    fn parses_levels() {
        assert_eq!("QUORUM".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::Quorum);
        assert_eq!("one".parse::<ConsistencyLevel>().unwrap(), ConsistencyLevel::One);
        assert!("most".parse::<ConsistencyLevel>().is_err());
        assert_eq!(ConsistencyLevel::All.to_string(), "all");
    }
}
