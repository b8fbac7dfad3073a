use async_trait::async_trait;
use std::sync::Arc;

use membership::Membership;
use network::{PeerHandler, PeerMessage, PeerReply};
use replication::ReplicaService;
use storage::NodeId;

/// Dispatches inbound peer messages: gossip goes to membership, data
/// traffic to the local replica.
pub struct PeerRouter {
    membership: Arc<Membership>,
    replica: Arc<ReplicaService>,
}

impl PeerRouter {
    pub fn new(membership: Arc<Membership>, replica: Arc<ReplicaService>) -> Self {
        Self { membership, replica }
    }
}

#[async_trait]
impl PeerHandler for PeerRouter {
    async fn handle(&self, from: NodeId, message: PeerMessage) -> PeerReply {
        match message {
            PeerMessage::Gossip(digest) => PeerReply::Gossip(self.membership.handle_gossip(digest).await),
            other => self.replica.handle(from, other).await,
        }
    }
}
