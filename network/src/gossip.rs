use async_trait::async_trait;
use std::sync::Arc;

use crate::{NetworkError, PeerMessage, PeerReply, PeerTransport};
use membership::{GossipDigest, GossipTransport, MembershipError};

/// Carries membership gossip over the peer transport.
pub struct GossipClient {
    transport: Arc<dyn PeerTransport>,
}

impl GossipClient {
    pub fn new(transport: Arc<dyn PeerTransport>) -> Self {
        Self { transport }
    }
}

fn to_membership_error(addr: &str, err: NetworkError) -> MembershipError {
    match err {
        NetworkError::Timeout(_) => MembershipError::Timeout(addr.to_string()),
        other => MembershipError::Transport(other.to_string()),
    }
}

#[async_trait]
impl GossipTransport for GossipClient {
    async fn exchange(&self, addr: &str, digest: GossipDigest) -> membership::Result<GossipDigest> {
        match self.transport.call(addr, PeerMessage::Gossip(digest)).await {
            Ok(PeerReply::Gossip(remote)) => Ok(remote),
            Ok(other) => Err(MembershipError::Transport(format!(
                "unexpected gossip reply from {}: {:?}",
                addr, other
            ))),
            Err(e) => Err(to_membership_error(addr, e)),
        }
    }

    async fn ping(&self, addr: &str) -> membership::Result<()> {
        match self.transport.call(addr, PeerMessage::Ping).await {
            Ok(PeerReply::Pong { .. }) => Ok(()),
            Ok(other) => Err(MembershipError::Transport(format!(
                "unexpected ping reply from {}: {:?}",
                addr, other
            ))),
            Err(e) => Err(to_membership_error(addr, e)),
        }
    }
}
