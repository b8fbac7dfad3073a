use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::handoff::{DrainReport, HintedHandoff};
use crate::{Config, ReplicaService, ReplicationError, Result, UpdateClock};
use membership::Membership;
use network::{PeerMessage, PeerReply, PeerTransport, RemoteErrorKind};
use storage::{NodeId, StorageEngine, VersionedValue};
use topology::{NodeEntry, Topology};

/// Failure knowledge the coordinator consults before contacting a replica.
#[async_trait]
pub trait Liveness: Send + Sync {
    /// True when `node` is known to be dead or departed.
    async fn is_down(&self, node: &NodeId) -> bool;
}

#[async_trait]
impl Liveness for Membership {
    async fn is_down(&self, node: &NodeId) -> bool {
        Membership::is_down(self, node).await
    }
}

/// Treats every node as reachable; calls time out instead.
pub struct AssumeAlive;

#[async_trait]
impl Liveness for AssumeAlive {
    async fn is_down(&self, _node: &NodeId) -> bool {
        false
    }
}

/// Everything a node's replication engine shares: ring snapshot handle,
/// update clock, local replica, hint queues and the peer transport.
///
/// Built once at startup and passed around by `Arc`.
pub struct ClusterContext {
    local: NodeId,
    topology: Arc<Topology>,
    storage: Arc<StorageEngine>,
    clock: Arc<UpdateClock>,
    replica: Arc<ReplicaService>,
    handoff: HintedHandoff,
    transport: Arc<dyn PeerTransport>,
    liveness: Arc<dyn Liveness>,
    config: Config,
}

impl ClusterContext {
    pub async fn new(
        local: NodeId,
        storage: Arc<StorageEngine>,
        topology: Arc<Topology>,
        transport: Arc<dyn PeerTransport>,
        liveness: Arc<dyn Liveness>,
        config: Config,
    ) -> Result<Self> {
        let clock = Arc::new(UpdateClock::restore(local.clone(), storage.clone()).await?);
        let replica = Arc::new(ReplicaService::new(storage.clone(), clock.clone(), config.limits));
        let handoff = HintedHandoff::new(config.hint_capacity, config.hint_retention);

        Ok(Self {
            local,
            topology,
            storage,
            clock,
            replica,
            handoff,
            transport,
            liveness,
            config,
        })
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn storage(&self) -> &Arc<StorageEngine> {
        &self.storage
    }

    pub fn clock(&self) -> &Arc<UpdateClock> {
        &self.clock
    }

    pub fn replica(&self) -> &Arc<ReplicaService> {
        &self.replica
    }

    pub fn handoff(&self) -> &HintedHandoff {
        &self.handoff
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) async fn is_down(&self, node: &NodeId) -> bool {
        *node != self.local && self.liveness.is_down(node).await
    }

    /// Sends one version to one replica, applying it directly when the
    /// replica is this node. Transport failures come back as `Timeout`.
    pub(crate) async fn send_write(&self, replica: &NodeEntry, key: Bytes, value: VersionedValue) -> Result<bool> {
        if replica.id == self.local {
            return self.replica.apply(&key, value).await;
        }
        let reply = self
            .call(&replica.peer_addr, PeerMessage::WriteReplicate { key, value })
            .await?;
        match reply {
            PeerReply::Ack { applied } => Ok(applied),
            other => Err(unexpected(&replica.id, other)),
        }
    }

    pub(crate) async fn fetch(&self, replica: &NodeEntry, key: Bytes) -> Result<Option<VersionedValue>> {
        if replica.id == self.local {
            return self.replica.fetch(&key).await;
        }
        match self.call(&replica.peer_addr, PeerMessage::ReadFetch { key }).await? {
            PeerReply::Value(value) => Ok(value),
            other => Err(unexpected(&replica.id, other)),
        }
    }

    async fn call(&self, addr: &str, message: PeerMessage) -> Result<PeerReply> {
        match timeout(self.config.request_timeout, self.transport.call(addr, message)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(ReplicationError::Timeout(format!("{}: {}", addr, e))),
            Err(_) => Err(ReplicationError::Timeout(format!(
                "{} did not answer within {:?}",
                addr, self.config.request_timeout
            ))),
        }
    }

    /// Queues a missed write for `replica`. Overflow is logged and counted
    /// by the queue and never fails the write.
    pub(crate) fn hint(&self, replica: &NodeEntry, key: Bytes, value: VersionedValue) {
        if let Err(e) = self.handoff.enqueue(&replica.id, &replica.peer_addr, key, value) {
            debug!(replica = %replica.id, error = %e, "Hint dropped");
        }
    }

    /// Replays the hints held for `target`.
    pub async fn drain_hints(&self, target: &NodeId) -> DrainReport {
        let view = self.topology.snapshot();
        let current_addr = view.entry(target).map(|entry| entry.peer_addr.clone());
        let queued_addr = self
            .handoff
            .targets()
            .into_iter()
            .find(|(id, _)| id == target)
            .map(|(_, addr)| addr);
        let Some(addr) = current_addr.or(queued_addr) else {
            return DrainReport::default();
        };

        self.handoff
            .drain(target, |hint| {
                let addr = addr.clone();
                async move {
                    let message = PeerMessage::HintReplay {
                        key: hint.key,
                        value: hint.value,
                    };
                    match self.call(&addr, message).await? {
                        PeerReply::Ack { .. } => Ok(()),
                        other => Err(unexpected(target, other)),
                    }
                }
            })
            .await
    }

    /// Drains every target that holds hints and is not known to be down.
    pub async fn drain_pending(&self) -> usize {
        let mut replayed = 0;
        for (target, _) in self.handoff.targets() {
            if self.is_down(&target).await {
                continue;
            }
            replayed += self.drain_hints(&target).await.replayed;
        }
        replayed
    }

    /// Drops tombstones that trail the local clock by more than the
    /// configured grace distance.
    ///
    /// A tombstone is kept while this node still queues a hint carrying an
    /// older version of the same key: once that hint is replayed somewhere,
    /// the tombstone is what read repair needs to suppress it. Hints queued
    /// on other nodes are not visible here, so `tombstone_grace` has to
    /// cover the clock advance over one hint retention window.
    pub async fn reclaim_tombstones(&self) -> Result<usize> {
        let horizon = self.clock.current().await.saturating_sub(self.config.tombstone_grace);
        if horizon == 0 {
            return Ok(0);
        }
        let held = self.handoff.oldest_counters();
        let reclaimed = self
            .storage
            .reclaim_tombstones_except(horizon, |key, tombstone| {
                held.get(key).map_or(false, |oldest| *oldest < tombstone.stamp.counter)
            })
            .await?;
        if reclaimed > 0 {
            info!(reclaimed, horizon, "Tombstone reclamation finished");
        }
        Ok(reclaimed)
    }
}

fn unexpected(node: &NodeId, reply: PeerReply) -> ReplicationError {
    match reply {
        PeerReply::Error {
            kind: RemoteErrorKind::InvalidKey,
            message,
        } => ReplicationError::InvalidKey(message),
        PeerReply::Error {
            kind: RemoteErrorKind::InvalidValue,
            message,
        } => ReplicationError::InvalidValue(message),
        PeerReply::Error { message, .. } => ReplicationError::Replica(format!("{}: {}", node, message)),
        other => ReplicationError::Replica(format!("{} sent unexpected reply {:?}", node, other)),
    }
}
