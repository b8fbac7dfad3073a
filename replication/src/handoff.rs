use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::{ReplicationError, Result};
use storage::{NodeId, VersionedValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hint {
    pub key: Bytes,
    pub value: VersionedValue,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
struct TargetQueue {
    addr: String,
    entries: VecDeque<Hint>,
    overflowed: u64,
    expired: u64,
    replayed: u64,
    draining: bool,
}

impl TargetQueue {
    // Entries are in enqueue order, so expired ones sit at the front.
    fn expire(&mut self, now: Instant, retention: Duration) -> u64 {
        let mut expired = 0;
        while let Some(front) = self.entries.front() {
            if now.saturating_duration_since(front.enqueued_at) < retention {
                break;
            }
            self.entries.pop_front();
            expired += 1;
        }
        self.expired += expired;
        expired
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HintStats {
    pub target: NodeId,
    pub addr: String,
    pub queued: usize,
    pub overflowed: u64,
    pub expired: u64,
    pub replayed: u64,
    pub draining: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub expired: u64,
    pub remaining: usize,
    /// Another drain for the same target was already running.
    pub skipped: bool,
}

/// Per-target FIFO queues of writes a replica missed.
///
/// Queues are bounded: a full queue drops its oldest entry. Entries older
/// than the retention window are discarded instead of replayed.
pub struct HintedHandoff {
    capacity: usize,
    retention: Duration,
    queues: Mutex<HashMap<NodeId, TargetQueue>>,
}

impl HintedHandoff {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            queues: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, TargetQueue>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues `value` for `target`. Returns `HandoffOverflow` when the
    /// queue was full; the new entry is kept and the oldest one dropped.
    pub fn enqueue(&self, target: &NodeId, addr: &str, key: Bytes, value: VersionedValue) -> Result<()> {
        let now = Instant::now();
        let mut queues = self.lock();
        let queue = queues.entry(target.clone()).or_default();
        queue.addr = addr.to_string();
        queue.expire(now, self.retention);

        queue.entries.push_back(Hint {
            key,
            value,
            enqueued_at: now,
        });
        if self.retention.is_zero() {
            // Nothing is retained; count it as expired right away.
            queue.expire(now, self.retention);
            return Ok(());
        }

        if queue.entries.len() > self.capacity {
            queue.entries.pop_front();
            queue.overflowed += 1;
            warn!(
                target = %target,
                capacity = self.capacity,
                dropped = queue.overflowed,
                "Hint queue overflow, dropped oldest hint"
            );
            return Err(ReplicationError::HandoffOverflow {
                target: target.clone(),
                dropped: queue.overflowed,
            });
        }

        debug!(target = %target, queued = queue.entries.len(), "Queued hint");
        Ok(())
    }

    pub fn pending(&self, target: &NodeId) -> usize {
        self.lock().get(target).map(|q| q.entries.len()).unwrap_or(0)
    }

    /// Targets that currently hold hints, with their last known address.
    pub fn targets(&self) -> Vec<(NodeId, String)> {
        self.lock()
            .iter()
            .filter(|(_, q)| !q.entries.is_empty())
            .map(|(id, q)| (id.clone(), q.addr.clone()))
            .collect()
    }

    /// Lowest stamp counter queued per key, across all targets.
    pub fn oldest_counters(&self) -> HashMap<Bytes, u64> {
        let mut oldest: HashMap<Bytes, u64> = HashMap::new();
        for hint in self.lock().values().flat_map(|q| q.entries.iter()) {
            let counter = hint.value.stamp.counter;
            oldest
                .entry(hint.key.clone())
                .and_modify(|c| *c = (*c).min(counter))
                .or_insert(counter);
        }
        oldest
    }

    pub fn stats(&self) -> Vec<HintStats> {
        let mut stats: Vec<HintStats> = self
            .lock()
            .iter()
            .map(|(id, q)| HintStats {
                target: id.clone(),
                addr: q.addr.clone(),
                queued: q.entries.len(),
                overflowed: q.overflowed,
                expired: q.expired,
                replayed: q.replayed,
                draining: q.draining,
            })
            .collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }

    /// Replays `target`'s hints in enqueue order through `replay`.
    ///
    /// Stops at the first failed replay and puts that hint back at the
    /// front, so the next drain resumes in the same order. Only one drain
    /// per target runs at a time.
    pub async fn drain<F, Fut>(&self, target: &NodeId, mut replay: F) -> DrainReport
    where
        F: FnMut(Hint) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = DrainReport::default();
        {
            let mut queues = self.lock();
            let Some(queue) = queues.get_mut(target) else {
                return report;
            };
            if queue.draining {
                report.skipped = true;
                return report;
            }
            queue.draining = true;
        }
        let _guard = DrainGuard {
            handoff: self,
            target,
        };

        loop {
            let next = {
                let mut queues = self.lock();
                let Some(queue) = queues.get_mut(target) else {
                    break;
                };
                report.expired += queue.expire(Instant::now(), self.retention);
                queue.entries.pop_front()
            };
            let Some(hint) = next else {
                break;
            };

            match replay(hint.clone()).await {
                Ok(()) => {
                    report.replayed += 1;
                    if let Some(queue) = self.lock().get_mut(target) {
                        queue.replayed += 1;
                    }
                }
                Err(e) => {
                    debug!(target = %target, error = %e, "Hint replay failed, requeueing");
                    if let Some(queue) = self.lock().get_mut(target) {
                        queue.entries.push_front(hint);
                    }
                    break;
                }
            }
        }

        report.remaining = self.pending(target);
        if report.replayed > 0 || report.expired > 0 {
            info!(
                target = %target,
                replayed = report.replayed,
                expired = report.expired,
                remaining = report.remaining,
                "Drained hints"
            );
        }
        report
    }
}

struct DrainGuard<'a> {
    handoff: &'a HintedHandoff,
    target: &'a NodeId,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if let Some(queue) = self.handoff.lock().get_mut(self.target) {
            queue.draining = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use storage::UpdateStamp;

    fn value(counter: u64) -> VersionedValue {
        VersionedValue::data(format!("v{}", counter), UpdateStamp::new(counter, NodeId::from("a")))
    }

    fn b() -> NodeId {
        NodeId::from("b")
    }

    #[tokio::test]
    async fn drain_replays_in_enqueue_order() {
        let handoff = HintedHandoff::new(16, Duration::from_secs(60));
        for counter in 1..=5 {
            handoff
                .enqueue(&b(), "b:6001", Bytes::from_static(b"k"), value(counter))
                .unwrap();
        }

        let mut seen = Vec::new();
        let report = handoff
            .drain(&b(), |hint| {
                seen.push(hint.value.stamp.counter);
                async { Ok(()) }
            })
            .await;
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.replayed, 5);
        assert_eq!(handoff.pending(&b()), 0);
    }

    #[tokio::test]
    async fn failed_replay_keeps_order_for_next_drain() {
        let handoff = HintedHandoff::new(16, Duration::from_secs(60));
        for counter in 1..=4 {
            handoff
                .enqueue(&b(), "b:6001", Bytes::from_static(b"k"), value(counter))
                .unwrap();
        }

        let report = handoff
            .drain(&b(), |hint| async move {
                if hint.value.stamp.counter == 3 {
                    Err(ReplicationError::Timeout("b".to_string()))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(report.replayed, 2);
        assert_eq!(report.remaining, 2);

        let mut seen = Vec::new();
        handoff
            .drain(&b(), |hint| {
                seen.push(hint.value.stamp.counter);
                async { Ok(()) }
            })
            .await;
        assert_eq!(seen, vec![3, 4]);
    }

    #[test]
    fn full_queue_drops_oldest_and_counts() {
        let handoff = HintedHandoff::new(2, Duration::from_secs(60));
        handoff.enqueue(&b(), "b", Bytes::from_static(b"k"), value(1)).unwrap();
        handoff.enqueue(&b(), "b", Bytes::from_static(b"k"), value(2)).unwrap();
        let err = handoff
            .enqueue(&b(), "b", Bytes::from_static(b"k"), value(3))
            .unwrap_err();
        assert!(matches!(err, ReplicationError::HandoffOverflow { dropped: 1, .. }));

        let stats = handoff.stats();
        assert_eq!(stats[0].queued, 2);
        assert_eq!(stats[0].overflowed, 1);
    }

    #[tokio::test]
    async fn zero_retention_keeps_nothing() {
        let handoff = HintedHandoff::new(8, Duration::ZERO);
        handoff.enqueue(&b(), "b", Bytes::from_static(b"k"), value(1)).unwrap();
        assert_eq!(handoff.pending(&b()), 0);
        assert_eq!(handoff.stats()[0].expired, 1);

        let report = handoff.drain(&b(), |_| async { Ok(()) }).await;
        assert_eq!(report.replayed, 0);
    }

    #[tokio::test]
    async fn expired_hints_are_not_replayed() {
        let handoff = HintedHandoff::new(8, Duration::from_millis(30));
        handoff.enqueue(&b(), "b", Bytes::from_static(b"old"), value(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        handoff.enqueue(&b(), "b", Bytes::from_static(b"new"), value(2)).unwrap();

        let mut keys = Vec::new();
        let report = handoff
            .drain(&b(), |hint| {
                keys.push(hint.key.clone());
                async { Ok(()) }
            })
            .await;
        assert_eq!(keys, vec![Bytes::from_static(b"new")]);
        assert_eq!(handoff.stats()[0].expired, 1);
        assert_eq!(report.replayed, 1);
    }

    #[tokio::test]
    async fn concurrent_drains_do_not_overlap() {
        let handoff = Arc::new(HintedHandoff::new(8, Duration::from_secs(60)));
        handoff.enqueue(&b(), "b", Bytes::from_static(b"k"), value(1)).unwrap();

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let first = {
            let handoff = handoff.clone();
            tokio::spawn(async move {
                let mut release = Some(release_rx);
                handoff
                    .drain(&b(), move |_| {
                        let rx = release.take();
                        async move {
                            if let Some(rx) = rx {
                                let _ = rx.await;
                            }
                            Ok(())
                        }
                    })
                    .await
            })
        };

        // Wait until the first drain has taken the queue.
        while !handoff.stats()[0].draining {
            tokio::task::yield_now().await;
        }
        let second = handoff.drain(&b(), |_| async { Ok(()) }).await;
        assert!(second.skipped);

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().replayed, 1);
        assert!(!handoff.stats()[0].draining);
    }
}
