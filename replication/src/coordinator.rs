use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::quorum::{ConsistencyLevel, QuorumDescriptor};
use crate::{ClusterContext, ReplicationError, Result};
use storage::{resolve, validate_key, validate_value, UpdateStamp, VersionedValue};
use topology::{NodeEntry, RingView};

/// Outcome of an acknowledged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub stamp: UpdateStamp,
    pub acks: usize,
    pub required: usize,
    /// Replicas known to be down that got a hint instead of the write.
    pub hinted: usize,
}

/// Fans client requests out to the replica set of each key.
///
/// Calls to replicas run as detached tasks: once the quorum is met the
/// coordinator returns, and the remaining calls finish or time out on
/// their own. Dropping a request future therefore never cancels a write
/// that is already on its way to a replica.
#[derive(Clone)]
pub struct Coordinator {
    ctx: Arc<ClusterContext>,
}

impl Coordinator {
    pub fn new(ctx: Arc<ClusterContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ClusterContext> {
        &self.ctx
    }

    pub async fn put(&self, key: Bytes, value: Bytes, level: ConsistencyLevel) -> Result<WriteReceipt> {
        let limits = &self.ctx.config().limits;
        validate_key(&key, limits)?;
        validate_value(&value, limits)?;

        let stamp = self.ctx.clock().stamp().await?;
        self.write(key, VersionedValue::data(value, stamp), level).await
    }

    /// Deletes by writing a tombstone, which wins over older values like
    /// any other write.
    pub async fn delete(&self, key: Bytes, level: ConsistencyLevel) -> Result<WriteReceipt> {
        validate_key(&key, &self.ctx.config().limits)?;

        let stamp = self.ctx.clock().stamp().await?;
        self.write(key, VersionedValue::tombstone(stamp), level).await
    }

    /// Reads the winning version of `key`. A tombstone reads as `None`.
    pub async fn get(&self, key: &[u8], level: ConsistencyLevel) -> Result<Option<VersionedValue>> {
        Ok(self.get_versioned(key, level).await?.filter(|value| !value.is_tombstone()))
    }

    /// Like [`Coordinator::get`] but returns tombstones too.
    pub async fn get_versioned(&self, key: &[u8], level: ConsistencyLevel) -> Result<Option<VersionedValue>> {
        validate_key(key, &self.ctx.config().limits)?;
        let key = Bytes::copy_from_slice(key);
        self.with_newest_ring(|view| self.read_once(view, key.clone(), level))
            .await
    }

    async fn write(&self, key: Bytes, value: VersionedValue, level: ConsistencyLevel) -> Result<WriteReceipt> {
        self.with_newest_ring(|view| self.write_once(view, key.clone(), value.clone(), level))
            .await
    }

    /// Runs `attempt` against the current ring snapshot. A quorum failure
    /// while the ring moved underneath is retried against the newer
    /// snapshot; the stamp of a retried write stays the same.
    async fn with_newest_ring<T, F, Fut>(&self, mut attempt: F) -> Result<T>
    where
        F: FnMut(Arc<RingView>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let topology = self.ctx.topology();
        let mut retries = 0;
        loop {
            let view = topology.snapshot();
            let epoch = view.epoch;
            match attempt(view).await {
                Err(ReplicationError::Unavailable { required, available }) if topology.epoch() != epoch => {
                    if retries >= self.ctx.config().max_conflict_retries {
                        warn!(
                            epoch = topology.epoch(),
                            retries, "Ring kept changing during request"
                        );
                        return Err(ReplicationError::MembershipConflict {
                            epoch: topology.epoch(),
                        });
                    }
                    retries += 1;
                    debug!(
                        from = epoch,
                        to = topology.epoch(),
                        required,
                        available,
                        "Retrying request against newer ring"
                    );
                }
                other => return other,
            }
        }
    }

    async fn write_once(
        &self,
        view: Arc<RingView>,
        key: Bytes,
        value: VersionedValue,
        level: ConsistencyLevel,
    ) -> Result<WriteReceipt> {
        let quorum = QuorumDescriptor::for_write(&view, &key, &self.ctx.config().quorum, level);
        if quorum.replicas.is_empty() {
            return Err(ReplicationError::Unavailable {
                required: self.ctx.config().quorum.w,
                available: 0,
            });
        }

        let (reachable, down) = self.split_down(quorum.replicas).await;
        if reachable.len() < quorum.required {
            warn!(
                key = %String::from_utf8_lossy(&key),
                required = quorum.required,
                available = reachable.len(),
                "Write quorum unreachable"
            );
            return Err(ReplicationError::Unavailable {
                required: quorum.required,
                available: reachable.len(),
            });
        }

        for replica in &down {
            self.ctx.hint(replica, key.clone(), value.clone());
        }

        let mut pending: FuturesUnordered<JoinHandle<Result<()>>> = reachable
            .into_iter()
            .map(|replica| {
                let ctx = self.ctx.clone();
                let key = key.clone();
                let value = value.clone();
                tokio::spawn(async move {
                    match ctx.send_write(&replica, key.clone(), value.clone()).await {
                        Ok(_) => Ok(()),
                        Err(ReplicationError::Timeout(reason)) => {
                            debug!(replica = %replica.id, reason = %reason, "Replica missed write, queueing hint");
                            ctx.hint(&replica, key, value);
                            Err(ReplicationError::Timeout(reason))
                        }
                        Err(e) => Err(e),
                    }
                })
            })
            .collect();

        let mut acks = 0;
        let mut rejection = None;
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(Ok(())) => acks += 1,
                Ok(Err(e @ ReplicationError::InvalidKey(_))) | Ok(Err(e @ ReplicationError::InvalidValue(_))) => {
                    rejection = Some(e)
                }
                Ok(Err(e)) => debug!(error = %e, "Replica write failed"),
                Err(e) => warn!(error = %e, "Replica write task failed"),
            }
            if acks >= quorum.required {
                return Ok(WriteReceipt {
                    stamp: value.stamp.clone(),
                    acks,
                    required: quorum.required,
                    hinted: down.len(),
                });
            }
        }

        if let Some(e) = rejection {
            return Err(e);
        }
        warn!(
            key = %String::from_utf8_lossy(&key),
            required = quorum.required,
            acks,
            "Write quorum not met"
        );
        Err(ReplicationError::Unavailable {
            required: quorum.required,
            available: acks,
        })
    }

    async fn read_once(
        &self,
        view: Arc<RingView>,
        key: Bytes,
        level: ConsistencyLevel,
    ) -> Result<Option<VersionedValue>> {
        let quorum = QuorumDescriptor::for_read(&view, &key, &self.ctx.config().quorum, level);
        if quorum.replicas.is_empty() {
            return Err(ReplicationError::Unavailable {
                required: self.ctx.config().quorum.r,
                available: 0,
            });
        }

        let (reachable, _) = self.split_down(quorum.replicas).await;
        if reachable.len() < quorum.required {
            return Err(ReplicationError::Unavailable {
                required: quorum.required,
                available: reachable.len(),
            });
        }

        let mut pending: FuturesUnordered<JoinHandle<(NodeEntry, Result<Option<VersionedValue>>)>> = reachable
            .into_iter()
            .map(|replica| {
                let ctx = self.ctx.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let fetched = ctx.fetch(&replica, key).await;
                    (replica, fetched)
                })
            })
            .collect();

        let mut responses = Vec::new();
        while responses.len() < quorum.required {
            match pending.next().await {
                Some(Ok((replica, Ok(value)))) => responses.push((replica, value)),
                Some(Ok((replica, Err(e)))) => debug!(replica = %replica.id, error = %e, "Replica fetch failed"),
                Some(Err(e)) => warn!(error = %e, "Replica fetch task failed"),
                None => break,
            }
        }

        if responses.len() < quorum.required {
            warn!(
                key = %String::from_utf8_lossy(&key),
                required = quorum.required,
                available = responses.len(),
                "Read quorum not met"
            );
            return Err(ReplicationError::Unavailable {
                required: quorum.required,
                available: responses.len(),
            });
        }

        let winner = resolve(responses.iter().filter_map(|(_, value)| value.as_ref())).cloned();
        tokio::spawn(repair(self.ctx.clone(), key, responses, pending));
        Ok(winner)
    }

    /// Splits replicas into those worth contacting and those known down.
    async fn split_down(&self, replicas: Vec<NodeEntry>) -> (Vec<NodeEntry>, Vec<NodeEntry>) {
        let mut reachable = Vec::with_capacity(replicas.len());
        let mut down = Vec::new();
        for replica in replicas {
            if self.ctx.is_down(&replica.id).await {
                down.push(replica);
            } else {
                reachable.push(replica);
            }
        }
        (reachable, down)
    }
}

/// Waits for the slower replicas of a read, then sends the newest version
/// seen to every replica that answered with an older one or none.
async fn repair(
    ctx: Arc<ClusterContext>,
    key: Bytes,
    mut responses: Vec<(NodeEntry, Option<VersionedValue>)>,
    mut pending: FuturesUnordered<JoinHandle<(NodeEntry, Result<Option<VersionedValue>>)>>,
) {
    while let Some(joined) = pending.next().await {
        if let Ok((replica, Ok(value))) = joined {
            responses.push((replica, value));
        }
    }

    let Some(winner) = resolve(responses.iter().filter_map(|(_, value)| value.as_ref())).cloned() else {
        return;
    };

    for (replica, value) in responses {
        let stale = match &value {
            Some(value) => winner.supersedes(value),
            None => true,
        };
        if !stale {
            continue;
        }
        match ctx.send_write(&replica, key.clone(), winner.clone()).await {
            Ok(_) => info!(
                replica = %replica.id,
                key = %String::from_utf8_lossy(&key),
                counter = winner.stamp.counter,
                "Read repair"
            ),
            Err(e) => debug!(replica = %replica.id, error = %e, "Read repair failed"),
        }
    }
}
