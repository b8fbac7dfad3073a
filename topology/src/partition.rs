use serde::{Deserialize, Serialize};

use crate::hash::{hash_key, Token};
use crate::ring::Ring;
use crate::{NodeId, Result, TopologyError};

const MAX_SHIFT: u8 = 32;

/// Splits the hash space into `2^shift` equal segments.
///
/// Partitions are a reporting and bookkeeping unit: routing always goes
/// through the ring, but the admin surface and the hint queues describe
/// ownership per partition so operators can see how ranges move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    shift: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwner {
    pub pid: u32,
    pub start: Token,
    pub end: Token,
    pub replicas: Vec<NodeId>,
}

impl Partitioner {
    pub fn new(shift: u8) -> Result<Self> {
        if shift == 0 || shift > MAX_SHIFT {
            return Err(TopologyError::InvalidPartitionShift {
                shift,
                max: MAX_SHIFT,
            });
        }
        Ok(Self { shift })
    }

    pub fn partition_count(&self) -> u64 {
        1u64 << self.shift
    }

    pub fn pid_for_token(&self, token: Token) -> u32 {
        (token >> (64 - u32::from(self.shift))) as u32
    }

    pub fn pid_for_key(&self, key: &[u8]) -> u32 {
        self.pid_for_token(hash_key(key))
    }

    /// Inclusive token range covered by `pid`.
    pub fn segment(&self, pid: u32) -> (Token, Token) {
        let width = 64 - u32::from(self.shift);
        let start = u64::from(pid) << width;
        (start, start | (u64::MAX >> self.shift))
    }

    /// Replica set of every partition, keyed by the segment's last token.
    pub fn owners(&self, ring: &Ring, n: usize) -> Vec<PartitionOwner> {
        (0..self.partition_count())
            .map(|pid| {
                let pid = pid as u32;
                let (start, end) = self.segment(pid);
                PartitionOwner {
                    pid,
                    start,
                    end,
                    replicas: ring.preference_list(end, n),
                }
            })
            .collect()
    }
}
