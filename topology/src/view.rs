use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::info;

use crate::hash::Token;
use crate::ring::Ring;
use crate::{NodeId, Result, TopologyError};

/// Everything the ring needs to know about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    pub peer_addr: String,
    pub api_addr: String,
    pub tls_identity: Option<String>,
    pub tokens: Vec<Token>,
}

impl NodeEntry {
    pub fn new(
        id: NodeId,
        peer_addr: impl Into<String>,
        api_addr: impl Into<String>,
        tokens: Vec<Token>,
    ) -> Result<Self> {
        if tokens.is_empty() {
            return Err(TopologyError::NoTokens(id));
        }
        Ok(Self {
            id,
            peer_addr: peer_addr.into(),
            api_addr: api_addr.into(),
            tls_identity: None,
            tokens,
        })
    }

    pub fn with_tls_identity(mut self, identity: impl Into<String>) -> Self {
        self.tls_identity = Some(identity.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipDelta {
    Upsert(NodeEntry),
    Remove(NodeId),
}

/// Immutable snapshot of ring membership.
///
/// The epoch increases by one for every delta that changed membership, so
/// two snapshots with the same epoch describe the same ring.
#[derive(Debug, Clone, Default)]
pub struct RingView {
    pub epoch: u64,
    pub members: BTreeMap<NodeId, NodeEntry>,
    pub ring: Ring,
}

impl RingView {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_members<I>(members: I) -> Self
    where
        I: IntoIterator<Item = NodeEntry>,
    {
        let members: BTreeMap<_, _> = members.into_iter().map(|e| (e.id.clone(), e)).collect();
        let ring = build_ring(&members);
        Self {
            epoch: 1,
            members,
            ring,
        }
    }

    /// Returns the snapshot that results from `delta`. `self` is untouched.
    pub fn apply(&self, delta: &MembershipDelta) -> RingView {
        let mut members = self.members.clone();
        let changed = match delta {
            MembershipDelta::Upsert(entry) => {
                members.insert(entry.id.clone(), entry.clone()).as_ref() != Some(entry)
            }
            MembershipDelta::Remove(id) => members.remove(id).is_some(),
        };

        if !changed {
            return self.clone();
        }

        let ring = build_ring(&members);
        RingView {
            epoch: self.epoch + 1,
            members,
            ring,
        }
    }

    pub fn entry(&self, id: &NodeId) -> Option<&NodeEntry> {
        self.members.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.members.contains_key(id)
    }

    /// Replica set for `key`, resolved to member entries.
    pub fn replicas_for(&self, key: &[u8], n: usize) -> Vec<NodeEntry> {
        self.ring
            .replicas_for(key, n)
            .iter()
            .filter_map(|id| self.members.get(id).cloned())
            .collect()
    }
}

fn build_ring(members: &BTreeMap<NodeId, NodeEntry>) -> Ring {
    Ring::build(
        members
            .values()
            .map(|entry| (entry.id.clone(), entry.tokens.clone())),
    )
}

/// Shared handle to the current ring snapshot.
///
/// Readers take an `Arc<RingView>` and never block writers. Writers are
/// serialised and publish a complete new snapshot in one swap.
pub struct Topology {
    tx: watch::Sender<Arc<RingView>>,
    write: Mutex<()>,
}

impl Topology {
    pub fn new(initial: RingView) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self {
            tx,
            write: Mutex::new(()),
        }
    }

    pub fn snapshot(&self) -> Arc<RingView> {
        self.tx.borrow().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.tx.borrow().epoch
    }

    /// Applies `deltas` in order and publishes the result. Returns the new
    /// snapshot; publishes nothing when no delta changed membership.
    pub fn apply<I>(&self, deltas: I) -> Arc<RingView>
    where
        I: IntoIterator<Item = MembershipDelta>,
    {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot();

        let mut next: Option<RingView> = None;
        for delta in deltas {
            let base = next.as_ref().unwrap_or(&current);
            let applied = base.apply(&delta);
            if applied.epoch != base.epoch {
                next = Some(applied);
            }
        }

        match next {
            Some(view) => {
                let view = Arc::new(view);
                info!(
                    epoch = view.epoch,
                    members = view.members.len(),
                    vnodes = view.ring.len(),
                    "Ring rebuilt"
                );
                self.tx.send_replace(view.clone());
                view
            }
            None => current,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RingView>> {
        self.tx.subscribe()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new(RingView::empty())
    }
}
