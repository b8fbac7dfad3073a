use serde::{Deserialize, Serialize};
use storage::NodeId;
use topology::{NodeEntry, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl MemberState {
    /// Alive and suspected members keep their ring positions.
    pub fn holds_ring_positions(self) -> bool {
        matches!(self, MemberState::Alive | MemberState::Suspect)
    }

    pub fn is_down(self) -> bool {
        matches!(self, MemberState::Dead | MemberState::Left)
    }
}

/// The part of a member's state that is gossiped. Only the owning node
/// changes its own record; everyone else copies the newest version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub id: NodeId,
    pub peer_addr: String,
    pub api_addr: String,
    pub tls_identity: Option<String>,
    pub tokens: Vec<Token>,
    pub incarnation: u64,
    pub heartbeat: u64,
    pub left: bool,
}

impl MemberRecord {
    pub fn new(entry: NodeEntry, incarnation: u64) -> Self {
        Self {
            id: entry.id,
            peer_addr: entry.peer_addr,
            api_addr: entry.api_addr,
            tls_identity: entry.tls_identity,
            tokens: entry.tokens,
            incarnation,
            heartbeat: 0,
            left: false,
        }
    }

    pub fn entry(&self) -> NodeEntry {
        NodeEntry {
            id: self.id.clone(),
            peer_addr: self.peer_addr.clone(),
            api_addr: self.api_addr.clone(),
            tls_identity: self.tls_identity.clone(),
            tokens: self.tokens.clone(),
        }
    }

    // A departure is sticky within an incarnation: it beats any heartbeat
    // of the same incarnation.
    fn version(&self) -> (u64, bool, u64) {
        (self.incarnation, self.left, self.heartbeat)
    }

    pub fn supersedes(&self, other: &MemberRecord) -> bool {
        self.version() > other.version()
    }
}

/// A node's view of the member table, as exchanged during gossip.
///
/// A digest with no records is a summary: the sender's table hashes to
/// `checksum` and the receiver already holds the same view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipDigest {
    pub from: NodeId,
    pub checksum: [u8; 32],
    pub records: Vec<MemberRecord>,
}

impl GossipDigest {
    pub fn new(from: NodeId, mut records: Vec<MemberRecord>) -> Self {
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let checksum = checksum(&records);
        Self {
            from,
            checksum,
            records,
        }
    }

    pub fn summary(from: NodeId, checksum: [u8; 32]) -> Self {
        Self {
            from,
            checksum,
            records: Vec::new(),
        }
    }

    pub fn is_summary(&self) -> bool {
        self.records.is_empty()
    }
}

/// Hash over records sorted by node id.
pub(crate) fn checksum(records: &[MemberRecord]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for record in records {
        hasher.update(record.id.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&record.incarnation.to_be_bytes());
        hasher.update(&record.heartbeat.to_be_bytes());
        hasher.update(&[u8::from(record.left)]);
        hasher.update(record.peer_addr.as_bytes());
        hasher.update(&[0]);
        hasher.update(&(record.tokens.len() as u64).to_be_bytes());
    }
    *hasher.finalize().as_bytes()
}

/// Admin-facing description of one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: NodeId,
    pub state: MemberState,
    pub peer_addr: String,
    pub api_addr: String,
    pub incarnation: u64,
    pub heartbeat: u64,
    pub in_ring: bool,
    pub local: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, incarnation: u64, heartbeat: u64) -> MemberRecord {
        let entry =
            NodeEntry::new(NodeId::from(id), format!("{}:6001", id), format!("{}:2001", id), vec![1])
                .unwrap();
        let mut record = MemberRecord::new(entry, incarnation);
        record.heartbeat = heartbeat;
        record
    }

    #[test]
    fn newer_incarnation_beats_heartbeat() {
        assert!(record("a", 2, 0).supersedes(&record("a", 1, 99)));
        assert!(record("a", 1, 5).supersedes(&record("a", 1, 4)));
        assert!(!record("a", 1, 4).supersedes(&record("a", 1, 4)));
    }

    #[test]
    fn leave_is_sticky_within_incarnation() {
        let mut left = record("a", 3, 1);
        left.left = true;
        assert!(left.supersedes(&record("a", 3, 50)));
        assert!(!record("a", 3, 50).supersedes(&left));
        assert!(record("a", 4, 0).supersedes(&left));
    }

    #[test]
    fn digest_checksum_ignores_input_order() {
        let forward = GossipDigest::new(NodeId::from("x"), vec![record("a", 1, 1), record("b", 1, 2)]);
        let backward = GossipDigest::new(NodeId::from("x"), vec![record("b", 1, 2), record("a", 1, 1)]);
        assert_eq!(forward.checksum, backward.checksum);

        let advanced = GossipDigest::new(NodeId::from("x"), vec![record("a", 1, 2), record("b", 1, 2)]);
        assert_ne!(forward.checksum, advanced.checksum);
    }
}
