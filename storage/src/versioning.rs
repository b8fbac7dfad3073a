use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::NodeId;

/// Version stamp attached to every write.
///
/// Stamps form a total order: a higher counter wins, and equal counters are
/// broken by the origin node id. Wall-clock time never takes part in the
/// comparison, so every replica picks the same winner whatever order the
/// writes arrive in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateStamp {
    pub counter: u64,
    pub origin: NodeId,
}

impl UpdateStamp {
    pub fn new(counter: u64, origin: NodeId) -> Self {
        Self { counter, origin }
    }

    /// True iff `self` strictly wins over `other`.
    pub fn wins_over(&self, other: &UpdateStamp) -> bool {
        self > other
    }
}

impl Ord for UpdateStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for UpdateStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Data(Bytes),
    Tombstone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    pub stamp: UpdateStamp,
}

impl VersionedValue {
    pub fn data(bytes: impl Into<Bytes>, stamp: UpdateStamp) -> Self {
        Self {
            value: Value::Data(bytes.into()),
            stamp,
        }
    }

    pub fn tombstone(stamp: UpdateStamp) -> Self {
        Self {
            value: Value::Tombstone,
            stamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self.value, Value::Tombstone)
    }

    /// Payload bytes, `None` for a tombstone.
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.value {
            Value::Data(bytes) => Some(bytes),
            Value::Tombstone => None,
        }
    }

    pub fn size(&self) -> usize {
        self.bytes().map(|b| b.len()).unwrap_or(0)
    }

    pub fn supersedes(&self, other: &VersionedValue) -> bool {
        self.stamp.wins_over(&other.stamp)
    }
}

/// Picks the winner among candidate versions of one key.
pub fn resolve<'a, I>(candidates: I) -> Option<&'a VersionedValue>
where
    I: IntoIterator<Item = &'a VersionedValue>,
{
    candidates.into_iter().max_by(|a, b| a.stamp.cmp(&b.stamp))
}
