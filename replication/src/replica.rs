use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::{ReplicationError, Result, UpdateClock};
use network::{PeerHandler, PeerMessage, PeerReply, RemoteErrorKind};
use storage::{validate_key, validate_value, ApplyOutcome, Limits, NodeId, StorageEngine, VersionedValue};

/// Replica side of the peer protocol: applies replicated writes and hint
/// replays to local storage and serves read fetches.
pub struct ReplicaService {
    node: NodeId,
    storage: Arc<StorageEngine>,
    clock: Arc<UpdateClock>,
    limits: Limits,
}

impl ReplicaService {
    pub fn new(storage: Arc<StorageEngine>, clock: Arc<UpdateClock>, limits: Limits) -> Self {
        Self {
            node: clock.node().clone(),
            storage,
            clock,
            limits,
        }
    }

    /// Applies `value` under the stamp comparison rule. Returns whether the
    /// stored version changed.
    pub async fn apply(&self, key: &[u8], value: VersionedValue) -> Result<bool> {
        validate_key(key, &self.limits)?;
        if let Some(bytes) = value.bytes() {
            validate_value(bytes, &self.limits)?;
        }
        self.clock.observe(&value.stamp).await?;

        let outcome = self.storage.apply(key, value).await?;
        Ok(outcome == ApplyOutcome::Applied)
    }

    pub async fn fetch(&self, key: &[u8]) -> Result<Option<VersionedValue>> {
        validate_key(key, &self.limits)?;
        Ok(self.storage.get(key).await?)
    }
}

fn error_reply(err: ReplicationError) -> PeerReply {
    let kind = match err {
        ReplicationError::InvalidKey(_) => RemoteErrorKind::InvalidKey,
        ReplicationError::InvalidValue(_) => RemoteErrorKind::InvalidValue,
        _ => RemoteErrorKind::Storage,
    };
    PeerReply::Error {
        kind,
        message: err.to_string(),
    }
}

#[async_trait]
impl PeerHandler for ReplicaService {
    async fn handle(&self, from: NodeId, message: PeerMessage) -> PeerReply {
        trace!(from = %from, kind = message.kind(), "Replica request");
        match message {
            PeerMessage::WriteReplicate { key, value } => match self.apply(&key, value).await {
                Ok(applied) => PeerReply::Ack { applied },
                Err(e) => error_reply(e),
            },
            PeerMessage::HintReplay { key, value } => match self.apply(&key, value).await {
                Ok(applied) => {
                    debug!(from = %from, applied, "Hint replayed");
                    PeerReply::Ack { applied }
                }
                Err(e) => error_reply(e),
            },
            PeerMessage::ReadFetch { key } => match self.fetch(&key).await {
                Ok(value) => PeerReply::Value(value),
                Err(e) => error_reply(e),
            },
            PeerMessage::Ping => PeerReply::Pong {
                node: self.node.clone(),
            },
            PeerMessage::Gossip(_) => PeerReply::Error {
                kind: RemoteErrorKind::Unsupported,
                message: "gossip is not served by the replica service".to_string(),
            },
        }
    }
}
