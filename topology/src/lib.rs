//! Consistent-hash ring topology.
//!
//! The ring is never mutated in place: every membership change produces a
//! new [`RingView`] from the full membership snapshot, and [`Topology`]
//! swaps the shared pointer so in-flight readers keep a consistent view.

mod hash;
mod partition;
mod ring;
mod view;

pub use hash::{hash_key, vnode_tokens, Token};
pub use partition::{Partitioner, PartitionOwner};
pub use ring::{Ring, VNode};
pub use view::{MembershipDelta, NodeEntry, RingView, Topology};

pub use storage::NodeId;

pub type Result<T> = std::result::Result<T, TopologyError>;

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Partition shift must be between 1 and {max}, got {shift}")]
    InvalidPartitionShift { shift: u8, max: u8 },

    #[error("Node {0} has no ring tokens")]
    NoTokens(NodeId),
}
