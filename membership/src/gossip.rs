use futures::future::join_all;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, RwLock, Semaphore};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::member::{GossipDigest, MemberInfo, MemberRecord, MemberState};
use crate::table::{MemberTable, TableOutcome};
use crate::{GossipTransport, MembershipConfig, MembershipEvent, Result};
use storage::NodeId;
use topology::{MembershipDelta, NodeEntry};

const CHANNEL_CAPACITY: usize = 1024;

/// Receiving ends of the membership channels. Ring deltas feed the ring
/// rebuild task; events feed hinted-handoff draining.
pub struct MembershipChannels {
    pub deltas: mpsc::Receiver<Vec<MembershipDelta>>,
    pub events: mpsc::Receiver<MembershipEvent>,
}

pub struct Membership {
    config: MembershipConfig,
    local_addr: String,
    table: RwLock<MemberTable>,
    transport: Arc<dyn GossipTransport>,
    /// Bounds outbound exchanges and pings across rounds and leave.
    inflight: Semaphore,
    deltas_tx: mpsc::Sender<Vec<MembershipDelta>>,
    events_tx: mpsc::Sender<MembershipEvent>,
}

impl Membership {
    /// Creates the manager for the local node described by `local`.
    ///
    /// The incarnation starts at the current unix time in seconds so that a
    /// restarted node's heartbeats supersede those of its previous run.
    pub fn new(
        config: MembershipConfig,
        local: NodeEntry,
        transport: Arc<dyn GossipTransport>,
    ) -> Result<(Arc<Self>, MembershipChannels)> {
        config.validate()?;
        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1);
        Ok(Self::with_incarnation(config, local, transport, incarnation))
    }

    pub fn with_incarnation(
        config: MembershipConfig,
        local: NodeEntry,
        transport: Arc<dyn GossipTransport>,
        incarnation: u64,
    ) -> (Arc<Self>, MembershipChannels) {
        let (deltas_tx, deltas) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let local_addr = local.peer_addr.clone();
        let table = MemberTable::new(MemberRecord::new(local, incarnation), Instant::now());

        let inflight = Semaphore::new(config.max_inflight.max(1));
        let membership = Arc::new(Self {
            config,
            local_addr,
            table: RwLock::new(table),
            transport,
            inflight,
            deltas_tx,
            events_tx,
        });
        (membership, MembershipChannels { deltas, events })
    }

    pub async fn local_id(&self) -> NodeId {
        self.table.read().await.local_id().clone()
    }

    /// Runs gossip rounds until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            interval_ms = self.config.gossip_interval.as_millis() as u64,
            fanout = self.config.gossip_fanout,
            seeds = self.config.seeds.len(),
            "Starting gossip"
        );
        let mut ticker = time::interval(self.config.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.round().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Gossip stopped");
        Ok(())
    }

    /// One gossip round: beat, exchange with random peers, ping suspects,
    /// then run the failure detector.
    pub async fn round(&self) {
        let (digest, mut targets, suspects) = {
            let mut table = self.table.write().await;
            table.beat();
            let targets = table.gossip_targets(self.config.gossip_fanout, &mut rand::thread_rng());
            (table.digest(), targets, table.suspects())
        };

        if targets.is_empty() {
            targets = self
                .config
                .seeds
                .iter()
                .filter(|seed| **seed != self.local_addr)
                .cloned()
                .collect();
        }

        let exchanges = targets.iter().map(|addr| {
            let digest = digest.clone();
            async move {
                let Ok(_permit) = self.inflight.acquire().await else {
                    return (addr, None);
                };
                let reply = time::timeout(
                    self.config.ping_timeout,
                    self.transport.exchange(addr, digest),
                )
                .await;
                (addr, Some(reply))
            }
        });
        for (addr, reply) in join_all(exchanges).await {
            match reply {
                Some(Ok(Ok(remote))) => self.absorb(remote).await,
                Some(Ok(Err(e))) => debug!(peer = %addr, error = %e, "Gossip exchange failed"),
                Some(Err(_)) => debug!(peer = %addr, "Gossip exchange timed out"),
                None => debug!(peer = %addr, "Gossip exchange skipped, in-flight bound closed"),
            }
        }

        let pings = suspects.iter().map(|(id, addr)| async move {
            let Ok(_permit) = self.inflight.acquire().await else {
                return (id, false);
            };
            let ok = matches!(
                time::timeout(self.config.ping_timeout, self.transport.ping(addr)).await,
                Ok(Ok(()))
            );
            (id, ok)
        });
        let answered: Vec<&NodeId> = join_all(pings)
            .await
            .into_iter()
            .filter_map(|(id, ok)| ok.then_some(id))
            .collect();

        let outcome = {
            let mut table = self.table.write().await;
            let now = Instant::now();
            let mut events = Vec::new();
            for id in answered {
                events.extend(table.mark_alive(id, now));
            }
            let mut outcome = table.evaluate(now, &self.config);
            events.append(&mut outcome.events);
            outcome.events = events;
            outcome
        };
        self.publish(outcome).await;
    }

    /// Handles a digest pushed by a peer and returns ours.
    pub async fn handle_gossip(&self, remote: GossipDigest) -> GossipDigest {
        let mut table = self.table.write().await;
        if remote.checksum == table.checksum() {
            trace!(peer = %remote.from, "Gossip views identical");
            return GossipDigest::summary(table.local_id().clone(), remote.checksum);
        }

        let now = Instant::now();
        let mut events = table.merge(remote.records, now);
        let mut outcome = table.evaluate(now, &self.config);
        events.append(&mut outcome.events);
        outcome.events = events;
        let reply = table.digest();
        drop(table);

        self.publish(outcome).await;
        reply
    }

    async fn absorb(&self, remote: GossipDigest) {
        if remote.is_summary() {
            return;
        }
        let outcome = {
            let mut table = self.table.write().await;
            let now = Instant::now();
            let events = table.merge(remote.records, now);
            let mut outcome = table.evaluate(now, &self.config);
            let mut all = events;
            all.append(&mut outcome.events);
            outcome.events = all;
            outcome
        };
        self.publish(outcome).await;
    }

    /// Announces a graceful departure to a few peers.
    pub async fn leave(&self) {
        let (digest, targets) = {
            let mut table = self.table.write().await;
            table.leave(Instant::now());
            let targets = table.gossip_targets(self.config.gossip_fanout, &mut rand::thread_rng());
            (table.digest(), targets)
        };
        info!(peers = targets.len(), "Leaving cluster");

        let sends = targets.iter().map(|addr| {
            let digest = digest.clone();
            async move {
                let Ok(_permit) = self.inflight.acquire().await else {
                    return;
                };
                if let Err(e) = self.transport.exchange(addr, digest).await {
                    warn!(peer = %addr, error = %e, "Failed to announce leave");
                }
            }
        });
        join_all(sends).await;
    }

    pub async fn members(&self) -> Vec<MemberInfo> {
        self.table.read().await.infos()
    }

    pub async fn state_of(&self, id: &NodeId) -> Option<MemberState> {
        self.table.read().await.state_of(id)
    }

    /// True if `id` is known to be dead or departed.
    pub async fn is_down(&self, id: &NodeId) -> bool {
        self.state_of(id).await.map(MemberState::is_down).unwrap_or(false)
    }

    pub async fn checksum(&self) -> [u8; 32] {
        self.table.read().await.checksum()
    }

    async fn publish(&self, outcome: TableOutcome) {
        if outcome.is_empty() {
            return;
        }
        if !outcome.deltas.is_empty() && self.deltas_tx.send(outcome.deltas).await.is_err() {
            warn!("Ring delta channel closed, dropping deltas");
        }
        for event in outcome.events {
            if self.events_tx.send(event).await.is_err() {
                warn!("Membership event channel closed, dropping event");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MembershipError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Routes gossip straight into other in-process `Membership`s.
    #[derive(Default)]
    struct Loopback {
        peers: Mutex<HashMap<String, Arc<Membership>>>,
    }

    impl Loopback {
        fn register(&self, addr: &str, membership: Arc<Membership>) {
            self.peers.lock().unwrap().insert(addr.to_string(), membership);
        }

        fn disconnect(&self, addr: &str) {
            self.peers.lock().unwrap().remove(addr);
        }

        fn peer(&self, addr: &str) -> Result<Arc<Membership>> {
            self.peers
                .lock()
                .unwrap()
                .get(addr)
                .cloned()
                .ok_or_else(|| MembershipError::Transport(format!("{} unreachable", addr)))
        }
    }

    #[async_trait]
    impl GossipTransport for Loopback {
        async fn exchange(&self, addr: &str, digest: GossipDigest) -> Result<GossipDigest> {
            Ok(self.peer(addr)?.handle_gossip(digest).await)
        }

        async fn ping(&self, addr: &str) -> Result<()> {
            self.peer(addr).map(|_| ())
        }
    }

    fn entry(id: &str) -> NodeEntry {
        let node = NodeId::from(id);
        let tokens = topology::vnode_tokens(&node, 4);
        NodeEntry::new(node, id, format!("{}-api", id), tokens).unwrap()
    }

    fn config(seeds: &[&str]) -> MembershipConfig {
        MembershipConfig {
            gossip_interval: Duration::from_millis(10),
            gossip_fanout: 2,
            suspect_after: 2,
            dead_after: 5,
            dwell: Duration::ZERO,
            removal_grace: Duration::from_secs(60),
            ping_timeout: Duration::from_millis(50),
            max_inflight: 32,
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn nodes_discover_each_other_through_seed() {
        let net = Arc::new(Loopback::default());
        let (a, mut a_rx) = Membership::with_incarnation(config(&[]), entry("a"), net.clone(), 1);
        let (b, _b_rx) = Membership::with_incarnation(config(&["a"]), entry("b"), net.clone(), 1);
        net.register("a", a.clone());
        net.register("b", b.clone());

        b.round().await;

        assert_eq!(a.state_of(&NodeId::from("b")).await, Some(MemberState::Alive));
        assert_eq!(b.state_of(&NodeId::from("a")).await, Some(MemberState::Alive));

        let deltas = a_rx.deltas.recv().await.unwrap();
        assert!(matches!(&deltas[0], MembershipDelta::Upsert(e) if e.id == NodeId::from("b")));
        assert_eq!(
            a_rx.events.recv().await.unwrap(),
            MembershipEvent::Joined(NodeId::from("b"))
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_eventually_failed() {
        let net = Arc::new(Loopback::default());
        let (a, mut a_rx) = Membership::with_incarnation(config(&[]), entry("a"), net.clone(), 1);
        let (b, _b_rx) = Membership::with_incarnation(config(&["a"]), entry("b"), net.clone(), 1);
        net.register("a", a.clone());
        net.register("b", b.clone());
        b.round().await;
        net.disconnect("b");

        let mut failed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            a.round().await;
            if a.is_down(&NodeId::from("b")).await {
                failed = true;
                break;
            }
        }
        assert!(failed);

        let mut seen = Vec::new();
        while let Ok(event) = a_rx.events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&MembershipEvent::Failed(NodeId::from("b"))));
        assert!(!seen.contains(&MembershipEvent::Recovered(NodeId::from("b"))));
    }

    #[tokio::test]
    async fn identical_views_get_summary_reply() {
        let net = Arc::new(Loopback::default());
        let (a, _rx) = Membership::with_incarnation(config(&[]), entry("a"), net, 1);
        let digest = a.table.read().await.digest();
        let reply = a.handle_gossip(digest).await;
        assert!(reply.is_summary());
    }

    #[tokio::test]
    async fn leave_is_gossiped() {
        let net = Arc::new(Loopback::default());
        let (a, mut a_rx) = Membership::with_incarnation(config(&[]), entry("a"), net.clone(), 1);
        let (b, _b_rx) = Membership::with_incarnation(config(&["a"]), entry("b"), net.clone(), 1);
        net.register("a", a.clone());
        net.register("b", b.clone());
        b.round().await;

        b.leave().await;
        assert_eq!(a.state_of(&NodeId::from("b")).await, Some(MemberState::Left));

        let mut seen = Vec::new();
        while let Ok(event) = a_rx.events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&MembershipEvent::Left(NodeId::from("b"))));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let net = Arc::new(Loopback::default());
        let (a, _rx) = Membership::with_incarnation(config(&[]), entry("a"), net, 1);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(a.run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    /// Records how many exchanges run at once and fails every one of them.
    #[derive(Default)]
    struct Counting {
        current: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl GossipTransport for Counting {
        async fn exchange(&self, addr: &str, _digest: GossipDigest) -> Result<GossipDigest> {
            use std::sync::atomic::Ordering::SeqCst;
            self.calls.fetch_add(1, SeqCst);
            let now = self.current.fetch_add(1, SeqCst) + 1;
            self.peak.fetch_max(now, SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, SeqCst);
            Err(MembershipError::Transport(format!("{} refused", addr)))
        }

        async fn ping(&self, _addr: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn outbound_gossip_respects_inflight_bound() {
        use std::sync::atomic::Ordering::SeqCst;
        let net = Arc::new(Counting::default());
        let seeds = ["s1", "s2", "s3", "s4", "s5", "s6"];
        let config = MembershipConfig {
            max_inflight: 2,
            ..config(&seeds)
        };
        let (a, _rx) = Membership::with_incarnation(config, entry("a"), net.clone(), 1);

        a.round().await;

        assert_eq!(net.calls.load(SeqCst), seeds.len());
        assert!(net.peak.load(SeqCst) <= 2);
        assert!(net.peak.load(SeqCst) >= 1);
    }
}
