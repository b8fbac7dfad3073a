use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::member::{checksum, GossipDigest, MemberInfo, MemberRecord, MemberState};
use crate::{MembershipConfig, MembershipEvent};
use storage::NodeId;
use topology::{MembershipDelta, NodeEntry};

#[derive(Debug, Clone)]
struct Member {
    record: MemberRecord,
    state: MemberState,
    /// Last time the heartbeat advanced or a ping was answered.
    last_seen: Instant,
    state_since: Instant,
    /// What the ring currently holds for this member.
    published: Option<NodeEntry>,
}

/// Result of one evaluation pass over the table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TableOutcome {
    pub events: Vec<MembershipEvent>,
    pub deltas: Vec<MembershipDelta>,
}

impl TableOutcome {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.deltas.is_empty()
    }
}

/// Member table and failure detector. Time is always passed in, so the
/// state machine is deterministic under test.
#[derive(Debug)]
pub struct MemberTable {
    local: NodeId,
    members: BTreeMap<NodeId, Member>,
    /// Versions of removed members; older gossip about them is ignored.
    forgotten: HashMap<NodeId, MemberRecord>,
}

impl MemberTable {
    /// The local record is assumed to be in the ring already.
    pub fn new(local: MemberRecord, now: Instant) -> Self {
        let id = local.id.clone();
        let published = Some(local.entry());
        let mut members = BTreeMap::new();
        members.insert(
            id.clone(),
            Member {
                record: local,
                state: MemberState::Alive,
                last_seen: now,
                state_since: now,
                published,
            },
        );
        Self {
            local: id,
            members,
            forgotten: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    fn local_mut(&mut self) -> Option<&mut Member> {
        self.members.get_mut(&self.local)
    }

    pub fn local_record(&self) -> Option<&MemberRecord> {
        self.members.get(&self.local).map(|m| &m.record)
    }

    /// Advances the local heartbeat.
    pub fn beat(&mut self) {
        if let Some(local) = self.local_mut() {
            local.record.heartbeat += 1;
        }
    }

    /// Marks the local node as departed under a fresh incarnation.
    pub fn leave(&mut self, now: Instant) {
        if let Some(local) = self.local_mut() {
            local.record.incarnation += 1;
            local.record.left = true;
            local.state = MemberState::Left;
            local.state_since = now;
        }
    }

    pub fn state_of(&self, id: &NodeId) -> Option<MemberState> {
        self.members.get(id).map(|m| m.state)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn checksum(&self) -> [u8; 32] {
        let records: Vec<MemberRecord> = self.members.values().map(|m| m.record.clone()).collect();
        checksum(&records)
    }

    pub fn digest(&self) -> GossipDigest {
        GossipDigest::new(
            self.local.clone(),
            self.members.values().map(|m| m.record.clone()).collect(),
        )
    }

    pub fn infos(&self) -> Vec<MemberInfo> {
        self.members
            .values()
            .map(|m| MemberInfo {
                id: m.record.id.clone(),
                state: m.state,
                peer_addr: m.record.peer_addr.clone(),
                api_addr: m.record.api_addr.clone(),
                incarnation: m.record.incarnation,
                heartbeat: m.record.heartbeat,
                in_ring: m.published.is_some(),
                local: m.record.id == self.local,
            })
            .collect()
    }

    /// Peer addresses of up to `fanout` random members worth gossiping to.
    pub fn gossip_targets<R: rand::Rng>(&self, fanout: usize, rng: &mut R) -> Vec<String> {
        let candidates: Vec<&Member> = self
            .members
            .values()
            .filter(|m| m.record.id != self.local && m.state != MemberState::Left)
            .collect();
        candidates
            .choose_multiple(rng, fanout)
            .map(|m| m.record.peer_addr.clone())
            .collect()
    }

    pub fn suspects(&self) -> Vec<(NodeId, String)> {
        self.members
            .values()
            .filter(|m| m.state == MemberState::Suspect)
            .map(|m| (m.record.id.clone(), m.record.peer_addr.clone()))
            .collect()
    }

    /// Folds remote records into the table.
    pub fn merge(&mut self, records: Vec<MemberRecord>, now: Instant) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        for remote in records {
            if remote.id == self.local {
                self.refute(&remote);
                continue;
            }

            if let Some(gone) = self.forgotten.get(&remote.id) {
                if !remote.supersedes(gone) {
                    continue;
                }
                self.forgotten.remove(&remote.id);
            }

            match self.members.get_mut(&remote.id) {
                None => {
                    let state = if remote.left {
                        MemberState::Left
                    } else {
                        info!(node = %remote.id, addr = %remote.peer_addr, "Member joined");
                        events.push(MembershipEvent::Joined(remote.id.clone()));
                        MemberState::Alive
                    };
                    self.members.insert(
                        remote.id.clone(),
                        Member {
                            record: remote,
                            state,
                            last_seen: now,
                            state_since: now,
                            published: None,
                        },
                    );
                }
                Some(member) => {
                    if !remote.supersedes(&member.record) {
                        continue;
                    }
                    let id = remote.id.clone();
                    let left = remote.left;
                    member.record = remote;
                    member.last_seen = now;

                    if left {
                        if member.state != MemberState::Left {
                            info!(node = %id, "Member left");
                            member.state = MemberState::Left;
                            member.state_since = now;
                            events.push(MembershipEvent::Left(id));
                        }
                    } else if matches!(member.state, MemberState::Suspect | MemberState::Dead) {
                        info!(node = %id, was = ?member.state, "Member recovered");
                        member.state = MemberState::Alive;
                        member.state_since = now;
                        events.push(MembershipEvent::Recovered(id));
                    } else if member.state == MemberState::Left {
                        // Rejoined under a newer incarnation.
                        info!(node = %id, "Member rejoined");
                        member.state = MemberState::Alive;
                        member.state_since = now;
                        events.push(MembershipEvent::Joined(id));
                    }
                }
            }
        }
        events
    }

    // Someone holds a newer record about us than we do, typically from a
    // previous run. Jump past it so our own record wins again.
    fn refute(&mut self, remote: &MemberRecord) {
        let Some(local) = self.local_mut() else {
            return;
        };
        if local.record.left || !remote.supersedes(&local.record) {
            return;
        }
        let incarnation = remote.incarnation + 1;
        warn!(
            stale = remote.incarnation,
            incarnation, "Refuting newer record about the local node"
        );
        local.record.incarnation = incarnation;
        local.record.heartbeat = 0;
    }

    /// A direct ping reached `id`.
    pub fn mark_alive(&mut self, id: &NodeId, now: Instant) -> Vec<MembershipEvent> {
        let Some(member) = self.members.get_mut(id) else {
            return Vec::new();
        };
        member.last_seen = now;
        if matches!(member.state, MemberState::Suspect | MemberState::Dead) {
            info!(node = %id, "Ping answered, member recovered");
            member.state = MemberState::Alive;
            member.state_since = now;
            return vec![MembershipEvent::Recovered(id.clone())];
        }
        Vec::new()
    }

    /// Runs the failure detector, then publishes ring changes for states
    /// that have held for the dwell time, then forgets long-gone members.
    pub fn evaluate(&mut self, now: Instant, config: &MembershipConfig) -> TableOutcome {
        let mut outcome = TableOutcome::default();
        let interval = config.gossip_interval.as_millis().max(1);

        for (id, member) in self.members.iter_mut() {
            if *id == self.local {
                continue;
            }
            let missed = now.saturating_duration_since(member.last_seen).as_millis() / interval;
            match member.state {
                MemberState::Alive | MemberState::Suspect if missed >= u128::from(config.dead_after) => {
                    warn!(node = %id, missed = missed as u64, "Member failed");
                    member.state = MemberState::Dead;
                    member.state_since = now;
                    outcome.events.push(MembershipEvent::Failed(id.clone()));
                }
                MemberState::Alive if missed >= u128::from(config.suspect_after) => {
                    debug!(node = %id, missed = missed as u64, "Member suspected");
                    member.state = MemberState::Suspect;
                    member.state_since = now;
                    outcome.events.push(MembershipEvent::Suspected(id.clone()));
                }
                _ => {}
            }
        }

        for member in self.members.values_mut() {
            if !held_for(member, now, config.dwell) {
                continue;
            }
            let wanted = member.state.holds_ring_positions().then(|| member.record.entry());
            if wanted == member.published {
                continue;
            }
            match &wanted {
                Some(entry) => outcome.deltas.push(MembershipDelta::Upsert(entry.clone())),
                None => outcome
                    .deltas
                    .push(MembershipDelta::Remove(member.record.id.clone())),
            }
            member.published = wanted;
        }

        let expired: Vec<NodeId> = self
            .members
            .values()
            .filter(|m| {
                m.record.id != self.local
                    && m.state.is_down()
                    && m.published.is_none()
                    && held_for(m, now, config.removal_grace)
            })
            .map(|m| m.record.id.clone())
            .collect();
        for id in expired {
            if let Some(member) = self.members.remove(&id) {
                info!(node = %id, "Member removed");
                self.forgotten.insert(id.clone(), member.record);
                outcome.events.push(MembershipEvent::Removed(id));
            }
        }

        outcome
    }
}

fn held_for(member: &Member, now: Instant, span: Duration) -> bool {
    now.saturating_duration_since(member.state_since) >= span
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, incarnation: u64, heartbeat: u64) -> MemberRecord {
        let node = NodeId::from(id);
        let tokens = topology::vnode_tokens(&node, 4);
        let entry = NodeEntry::new(node, format!("{}:6001", id), format!("{}:2001", id), tokens).unwrap();
        let mut record = MemberRecord::new(entry, incarnation);
        record.heartbeat = heartbeat;
        record
    }

    fn config() -> MembershipConfig {
        MembershipConfig {
            gossip_interval: Duration::from_millis(100),
            suspect_after: 3,
            dead_after: 6,
            dwell: Duration::from_millis(250),
            removal_grace: Duration::from_secs(1),
            ..MembershipConfig::default()
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn new_member_joins_then_enters_ring_after_dwell() {
        let t0 = Instant::now();
        let mut table = MemberTable::new(record("a", 1, 0), t0);

        let events = table.merge(vec![record("b", 1, 1)], t0);
        assert_eq!(events, vec![MembershipEvent::Joined(NodeId::from("b"))]);

        assert!(table.evaluate(t0 + ms(100), &config()).deltas.is_empty());

        let outcome = table.evaluate(t0 + ms(250), &config());
        assert_eq!(outcome.deltas.len(), 1);
        assert!(matches!(&outcome.deltas[0], MembershipDelta::Upsert(e) if e.id == NodeId::from("b")));
    }

    #[test]
    fn silent_member_goes_suspect_then_dead_then_out_of_ring() {
        let t0 = Instant::now();
        let cfg = config();
        let mut table = MemberTable::new(record("a", 1, 0), t0);
        table.merge(vec![record("b", 1, 1)], t0);
        table.evaluate(t0 + ms(250), &cfg);

        let suspected = table.evaluate(t0 + ms(300), &cfg);
        assert_eq!(suspected.events, vec![MembershipEvent::Suspected(NodeId::from("b"))]);
        // Suspects keep their ring positions.
        assert!(suspected.deltas.is_empty());

        let failed = table.evaluate(t0 + ms(600), &cfg);
        assert_eq!(failed.events, vec![MembershipEvent::Failed(NodeId::from("b"))]);
        assert!(failed.deltas.is_empty());

        let removed = table.evaluate(t0 + ms(850), &cfg);
        assert_eq!(removed.deltas, vec![MembershipDelta::Remove(NodeId::from("b"))]);
        assert_eq!(table.state_of(&NodeId::from("b")), Some(MemberState::Dead));
    }

    #[test]
    fn flapping_member_does_not_rebuild_ring() {
        let t0 = Instant::now();
        let cfg = config();
        let mut table = MemberTable::new(record("a", 1, 0), t0);
        table.merge(vec![record("b", 1, 1)], t0);
        table.evaluate(t0 + ms(250), &cfg);

        let failed = table.evaluate(t0 + ms(600), &cfg);
        assert_eq!(failed.events, vec![MembershipEvent::Failed(NodeId::from("b"))]);

        // Heard from again before the dwell time elapsed.
        let events = table.merge(vec![record("b", 1, 2)], t0 + ms(700));
        assert_eq!(events, vec![MembershipEvent::Recovered(NodeId::from("b"))]);
        let outcome = table.evaluate(t0 + ms(900), &cfg);
        assert!(outcome.deltas.is_empty());
    }

    #[test]
    fn dead_member_is_forgotten_after_grace() {
        let t0 = Instant::now();
        let cfg = config();
        let mut table = MemberTable::new(record("a", 1, 0), t0);
        table.merge(vec![record("b", 1, 5)], t0);
        table.evaluate(t0 + ms(250), &cfg);
        table.evaluate(t0 + ms(600), &cfg);
        table.evaluate(t0 + ms(900), &cfg);

        let outcome = table.evaluate(t0 + ms(1600), &cfg);
        assert_eq!(outcome.events, vec![MembershipEvent::Removed(NodeId::from("b"))]);
        assert_eq!(table.state_of(&NodeId::from("b")), None);

        // Stale gossip about the removed member is ignored.
        assert!(table.merge(vec![record("b", 1, 5)], t0 + ms(1700)).is_empty());
        assert_eq!(table.state_of(&NodeId::from("b")), None);

        // A restart under a newer incarnation is a fresh join.
        let events = table.merge(vec![record("b", 2, 0)], t0 + ms(1800));
        assert_eq!(events, vec![MembershipEvent::Joined(NodeId::from("b"))]);
    }

    #[test]
    fn explicit_leave_propagates() {
        let t0 = Instant::now();
        let cfg = config();
        let mut table = MemberTable::new(record("a", 1, 0), t0);
        table.merge(vec![record("b", 1, 1)], t0);
        table.evaluate(t0 + ms(250), &cfg);

        let mut leaving = record("b", 2, 0);
        leaving.left = true;
        let events = table.merge(vec![leaving], t0 + ms(260));
        assert_eq!(events, vec![MembershipEvent::Left(NodeId::from("b"))]);

        let outcome = table.evaluate(t0 + ms(520), &cfg);
        assert_eq!(outcome.deltas, vec![MembershipDelta::Remove(NodeId::from("b"))]);
    }

    #[test]
    fn local_leave_bumps_incarnation() {
        let t0 = Instant::now();
        let mut table = MemberTable::new(record("a", 7, 3), t0);
        table.leave(t0);
        let local = table.local_record().unwrap();
        assert!(local.left);
        assert_eq!(local.incarnation, 8);
    }

    #[test]
    fn newer_record_about_self_is_refuted() {
        let t0 = Instant::now();
        let mut table = MemberTable::new(record("a", 1, 0), t0);
        table.merge(vec![record("a", 4, 10)], t0);
        assert_eq!(table.local_record().unwrap().incarnation, 5);
    }

    #[test]
    fn ping_recovers_suspect() {
        let t0 = Instant::now();
        let cfg = config();
        let mut table = MemberTable::new(record("a", 1, 0), t0);
        table.merge(vec![record("b", 1, 1)], t0);
        table.evaluate(t0 + ms(300), &cfg);
        assert_eq!(table.suspects().len(), 1);

        let events = table.mark_alive(&NodeId::from("b"), t0 + ms(350));
        assert_eq!(events, vec![MembershipEvent::Recovered(NodeId::from("b"))]);
        assert!(table.suspects().is_empty());
    }

    #[test]
    fn gossip_targets_exclude_self() {
        let t0 = Instant::now();
        let mut table = MemberTable::new(record("a", 1, 0), t0);
        table.merge(vec![record("b", 1, 1), record("c", 1, 1)], t0);
        let targets = table.gossip_targets(5, &mut rand::thread_rng());
        assert_eq!(targets.len(), 2);
        assert!(!targets.contains(&"a:6001".to_string()));
    }
}
