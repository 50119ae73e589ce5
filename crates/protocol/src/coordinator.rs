//! Coordinator role.
//!
//! The coordinator creates groups, admits one joiner at a time, picks a
//! dispatcher for fresh session keys and gates member-initiated key updates.
//! It never leaves the broadcast medium: every frame it emits goes to all
//! nodes.

use std::collections::BTreeMap;
use std::sync::Arc;

use bls12_381::G1Projective;
use group::Curve;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use sgc_crypto::{check_valid, decrypt_with, kam_delta, CryptoError, PseudoSlotKeys};
use sgc_types::{KeyVerifier, MemberState, NodeId, Sid, Timestamp};

use crate::clock::Timer;
use crate::error::ProtocolError;
use crate::group::{GroupSessionInfo, ManagedGroup};
use crate::liveness::LivenessIndex;
use crate::message::{
    Heartbeat, HeartbeatAck, Join, JoinAck, KeyDistribution, KeyEncapNotify, KeyUpdateAck,
    Message, NotifyPosition,
};
use crate::node::{encode_all, SgcContext, SgcNode};
use crate::session::SessionKeyBook;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CoordinatorState {
    #[default]
    Idle,
    /// A position was handed out and its Join is awaited.
    HandlingJoin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Assignment {
    pid: NodeId,
    sid: Sid,
    pos: u32,
}

pub struct Coordinator {
    ctx: SgcContext,
    pid: NodeId,
    /// Tier every new group is created from.
    size_param: u16,
    state: CoordinatorState,
    groups: BTreeMap<Sid, ManagedGroup>,
    /// Group new members are placed in.
    current: Option<Sid>,
    next_group_seq: u16,
    next_heartbeat_seq: u32,
    last_heartbeat_seq: Option<u32>,
    assignment: Option<Assignment>,
    /// A position was handed out since the last Heartbeat.
    assigned_this_round: bool,
    liveness: LivenessIndex,
    /// Member asked to encapsulate the next session key.
    dispatcher: Option<NodeId>,
    /// Latest accepted verifier, gossiped in every Heartbeat.
    accepted: KeyVerifier,
    last_key_update: Option<Timestamp>,
    session: SessionKeyBook,
    pseudo_keys: Arc<PseudoSlotKeys>,
    rng: StdRng,
}

impl Coordinator {
    /// Create a coordinator building groups of `ctx.config.group_size`.
    pub fn new(
        ctx: SgcContext,
        pid: NodeId,
        pseudo_keys: Arc<PseudoSlotKeys>,
    ) -> Result<Self, ProtocolError> {
        Self::with_rng(ctx, pid, pseudo_keys, StdRng::from_entropy())
    }

    pub fn with_rng(
        ctx: SgcContext,
        pid: NodeId,
        pseudo_keys: Arc<PseudoSlotKeys>,
        rng: StdRng,
    ) -> Result<Self, ProtocolError> {
        let group_size = ctx.config.group_size;
        let size_param = match ctx.params.tier_for_group_size(group_size) {
            Some(size_param) if group_size > 0 => size_param,
            _ => return Err(ProtocolError::UnsupportedGroupSize { group_size }),
        };

        info!(pid, group_size, size_param, "Coordinator ready");

        Ok(Self {
            ctx,
            pid,
            size_param,
            state: CoordinatorState::Idle,
            groups: BTreeMap::new(),
            current: None,
            next_group_seq: 0,
            next_heartbeat_seq: 0,
            last_heartbeat_seq: None,
            assignment: None,
            assigned_this_round: false,
            liveness: LivenessIndex::new(),
            dispatcher: None,
            accepted: KeyVerifier::default(),
            last_key_update: None,
            session: SessionKeyBook::new(),
            pseudo_keys,
            rng,
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn current_group(&self) -> Option<&GroupSessionInfo> {
        self.current_managed().map(|g| &g.info)
    }

    pub fn group(&self, sid: &Sid) -> Option<&GroupSessionInfo> {
        self.groups.get(sid).map(|g| &g.info)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupSessionInfo> {
        self.groups.values().map(|g| &g.info)
    }

    pub fn session(&self) -> &SessionKeyBook {
        &self.session
    }

    /// Verifier gossiped in the next Heartbeat.
    pub fn accepted_verifier(&self) -> &KeyVerifier {
        &self.accepted
    }

    pub fn dispatcher(&self) -> Option<NodeId> {
        self.dispatcher
    }

    pub fn liveness(&self) -> &LivenessIndex {
        &self.liveness
    }

    fn current_managed(&self) -> Option<&ManagedGroup> {
        self.current.and_then(|sid| self.groups.get(&sid))
    }

    // =========================
    // HEARTBEAT
    // =========================

    fn heartbeat(&mut self) -> Result<Vec<Message>, ProtocolError> {
        let now = self.ctx.now();

        if let Some(stuck) = self.assignment.take() {
            debug!(
                pid = stuck.pid,
                sid = %stuck.sid,
                pos = stuck.pos,
                "Abandoning unfinished join"
            );
            self.liveness.remove(stuck.pid);
        }
        self.state = CoordinatorState::Idle;
        self.assigned_this_round = false;

        self.groups.retain(|sid, group| {
            let expired = group.info.is_expired(now);
            if expired {
                info!(sid = %sid, members = group.info.n_member, "Group expired");
            }
            !expired
        });
        self.ensure_current_group(now)?;

        let seq = self.next_heartbeat_seq;
        self.next_heartbeat_seq = seq.wrapping_add(1);
        self.last_heartbeat_seq = Some(seq);

        Ok(vec![Message::Heartbeat(Heartbeat {
            seq,
            kv: self.accepted,
            groups: self.groups().cloned().collect(),
        })])
    }

    fn ensure_current_group(&mut self, now: Timestamp) -> Result<(), ProtocolError> {
        if self.current_managed().is_some_and(|g| !g.is_full()) {
            return Ok(());
        }

        let seq = self.next_group_seq;
        let expiry = now + self.ctx.config.group_lifetime();
        let group = ManagedGroup::bootstrap(&self.ctx.params, seq, self.size_param, expiry)?;
        self.next_group_seq = seq.wrapping_add(1);

        info!(sid = %group.info.sid, scale = group.scale, %expiry, "Created group");

        self.current = Some(group.info.sid);
        self.groups.insert(group.info.sid, group);
        Ok(())
    }

    fn handle_heartbeat_ack(&mut self, ack: HeartbeatAck) -> Vec<Message> {
        let now = self.ctx.now();
        let record = self.liveness.touch(ack.pid, now, ack.state);
        if ack.state == MemberState::Unset {
            record.joined = false;
        }

        if self.state != CoordinatorState::Idle || ack.state != MemberState::Unset {
            return Vec::new();
        }
        // Later joiners need the snapshot of the next Heartbeat
        if self.assigned_this_round {
            debug!(pid = ack.pid, seq = ack.seq, "Position already handed out this round");
            return Vec::new();
        }
        if self.last_heartbeat_seq != Some(ack.seq) {
            debug!(pid = ack.pid, seq = ack.seq, "Ack for an older heartbeat");
            return Vec::new();
        }

        let Some(group) = self.current_managed() else {
            return Vec::new();
        };
        if group.info.is_expired(now) {
            return Vec::new();
        }
        let Some(pos) = group.free_slots().next() else {
            return Vec::new();
        };
        let sid = group.info.sid;

        if let Some(record) = self.liveness.get_mut(ack.pid) {
            record.slot = Some((sid, pos));
            record.joined = false;
        }
        self.assignment = Some(Assignment {
            pid: ack.pid,
            sid,
            pos,
        });
        self.assigned_this_round = true;
        self.state = CoordinatorState::HandlingJoin;

        info!(pid = ack.pid, sid = %sid, pos, "Assigned position");
        vec![Message::NotifyPosition(NotifyPosition {
            sid,
            pos,
            pid: ack.pid,
        })]
    }

    // =========================
    // JOIN
    // =========================

    fn handle_join(&mut self, join: Join) -> Result<Vec<Message>, ProtocolError> {
        let kam = &join.kam;
        let expected = Assignment {
            pid: join.pid,
            sid: kam.sid,
            pos: kam.pos,
        };
        if self.state != CoordinatorState::HandlingJoin || self.assignment != Some(expected) {
            debug!(
                pid = join.pid,
                sid = %kam.sid,
                pos = kam.pos,
                "Join does not match the pending assignment"
            );
            return Ok(Vec::new());
        }

        let group = self
            .groups
            .get(&kam.sid)
            .ok_or(ProtocolError::UnknownGroup(kam.sid))?;
        if group.info.size_param != kam.size_param || group.info.is_occupied(kam.pos) {
            warn!(pid = join.pid, sid = %kam.sid, pos = kam.pos, "Join targets an unavailable slot");
            return Ok(Vec::new());
        }

        if !check_valid(&self.ctx.params, self.ctx.pki.as_ref(), kam, &mut self.rng) {
            warn!(pid = join.pid, pk_id = kam.pk_id, "Rejected join proof");
            return Ok(Vec::new());
        }

        let delta = kam_delta(&self.ctx.params, self.ctx.pki.as_ref(), kam)?;
        let group = self
            .groups
            .get_mut(&kam.sid)
            .ok_or(ProtocolError::UnknownGroup(kam.sid))?;
        group.info.ek = group.info.ek.apply(&delta);
        group.apply_join_shares(&self.ctx.params, kam)?;
        group.info.occupy(kam.pos);
        group.info.n_member += 1;

        let d = group
            .d
            .get(kam.pos as usize)
            .copied()
            .ok_or(CryptoError::SlotOutOfRange {
                pos: kam.pos as usize,
                scale: group.scale,
            })?;
        let ack = JoinAck {
            sid: kam.sid,
            pos: kam.pos,
            pk_id: kam.pk_id,
            d,
            ek: group.info.ek,
        };

        info!(
            pid = join.pid,
            sid = %kam.sid,
            pos = kam.pos,
            members = group.info.n_member,
            "Member joined"
        );

        let record = self
            .liveness
            .touch(join.pid, self.ctx.now(), MemberState::Joining);
        record.slot = Some((kam.sid, kam.pos));
        record.joined = true;

        self.assignment = None;
        self.state = CoordinatorState::Idle;
        Ok(vec![Message::JoinAck(ack)])
    }

    // =========================
    // SESSION KEYS
    // =========================

    fn notify_key_encap(&mut self) -> Vec<Message> {
        let now = self.ctx.now();
        for pid in self
            .liveness
            .evict_stale(now, self.ctx.config.liveness_timeout())
        {
            if self.dispatcher == Some(pid) {
                self.dispatcher = None;
            }
        }

        let groups = &self.groups;
        let Some(target) = self.liveness.most_recent(|r| {
            r.joined && r.slot.is_some_and(|(sid, _)| groups.contains_key(&sid))
        }) else {
            debug!("No live joined member to dispatch a session key");
            return Vec::new();
        };

        self.dispatcher = Some(target);
        info!(
            dispatcher = target,
            version = self.accepted.version,
            "Requesting key encapsulation"
        );
        vec![Message::KeyEncapNotify(KeyEncapNotify {
            pid: target,
            key_len: self.ctx.config.session_key_len,
            cur_version: self.accepted.version,
        })]
    }

    fn is_fresh(&self, kv: &KeyVerifier, now: Timestamp) -> bool {
        kv.is_newer_than(&self.accepted) && kv.timestamp + self.ctx.config.freshness_window() >= now
    }

    fn handle_key_encap(&mut self, dist: KeyDistribution) -> Vec<Message> {
        if self.dispatcher != Some(dist.pid) {
            debug!(pid = dist.pid, "Key encapsulation from a non-dispatcher");
            return Vec::new();
        }
        let now = self.ctx.now();
        if !self.is_fresh(&dist.kv, now) {
            debug!(pid = dist.pid, version = dist.kv.version, "Stale key encapsulation");
            return Vec::new();
        }

        self.dispatcher = None;
        self.accept(&dist, now);
        vec![Message::KeyEncap(dist)]
    }

    fn handle_key_update(&mut self, dist: KeyDistribution) -> Vec<Message> {
        let now = self.ctx.now();
        if !self.is_fresh(&dist.kv, now) {
            debug!(pid = dist.pid, version = dist.kv.version, "Stale key update");
            return Vec::new();
        }
        if let Some(last) = self.last_key_update {
            if now.saturating_since(last) < self.ctx.config.key_update_threshold() {
                debug!(pid = dist.pid, version = dist.kv.version, "Key update rate limited");
                return Vec::new();
            }
        }

        self.accept(&dist, now);
        let ack = KeyUpdateAck {
            pid: dist.pid,
            kv: dist.kv,
        };
        vec![Message::KeyUpdate(dist), Message::KeyUpdateAck(ack)]
    }

    fn accept(&mut self, dist: &KeyDistribution, now: Timestamp) {
        info!(
            pid = dist.pid,
            version = dist.kv.version,
            fingerprint = hex::encode(&dist.kv.hash[..8]),
            "Accepted session key"
        );
        self.accepted = dist.kv;
        self.last_key_update = Some(now);
        self.recover_key(dist);
        self.session.observe_verifier(&dist.kv);
    }

    /// Decrypt `dist` through a slot still held by its pseudo row.
    fn recover_key(&mut self, dist: &KeyDistribution) {
        for (index, sid) in dist.sids.iter().enumerate() {
            let Some(group) = self.groups.get(sid) else {
                continue;
            };
            let Some(pos) = group.free_slots().next() else {
                continue;
            };
            let (Some(diagonal), Some(d)) = (
                self.pseudo_keys.diagonal(group.info.size_param, pos),
                group.d.get(pos as usize),
            ) else {
                continue;
            };

            let dk = (G1Projective::from(*d) + diagonal).to_affine();
            match decrypt_with(&self.ctx.params, &dk, pos, &dist.ct, index) {
                Ok(key) if dist.kv.matches(&key) => {
                    self.session.offer_key(&dist.kv, key);
                    return;
                }
                Ok(_) => debug!(sid = %sid, "Group key out of date for this ciphertext"),
                Err(e) => debug!(sid = %sid, error = %e, "Could not decrypt component"),
            }
        }
        debug!(version = dist.kv.version, "Session key not recoverable here");
    }
}

impl SgcNode for Coordinator {
    fn pid(&self) -> NodeId {
        self.pid
    }

    fn handle_message(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let Some(msg) = self.ctx.decode(self.pid, bytes) else {
            return Ok(Vec::new());
        };

        let out = match msg {
            Message::HeartbeatAck(ack) => self.handle_heartbeat_ack(ack),
            Message::Join(join) => self.handle_join(join)?,
            Message::KeyEncap(dist) => self.handle_key_encap(dist),
            Message::KeyUpdate(dist) => self.handle_key_update(dist),
            Message::Heartbeat(_)
            | Message::NotifyPosition(_)
            | Message::JoinAck(_)
            | Message::KeyEncapNotify(_)
            | Message::KeyUpdateAck(_) => Vec::new(),
        };
        Ok(encode_all(out))
    }

    fn on_timer_tick(&mut self, timer: Timer) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let out = match timer {
            Timer::Heartbeat => self.heartbeat()?,
            Timer::KeyEncapNotify => self.notify_key_encap(),
            Timer::KeyUpdate => Vec::new(),
        };
        Ok(encode_all(out))
    }

    fn timers(&self) -> &'static [Timer] {
        &[Timer::Heartbeat, Timer::KeyEncapNotify]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::SgcConfig;
    use rand::rngs::OsRng;
    use sgc_crypto::{encrypt, BulletinBoard, PublicParameterStore, Saagka};
    use std::time::Duration;

    struct Fixture {
        ctx: SgcContext,
        clock: ManualClock,
        coordinator: Coordinator,
    }

    fn fixture(config: SgcConfig) -> Fixture {
        let clock = ManualClock::starting_at(Timestamp::from_millis(1_000));
        let mut store = PublicParameterStore::new();
        let params = store
            .setup(
                config.security_level,
                config.max_group_size,
                config.size_step,
                &mut OsRng,
            )
            .unwrap();
        let ctx = SgcContext::new(
            params,
            Arc::new(BulletinBoard::new()),
            Arc::new(clock.clone()),
            config,
        );
        let coordinator =
            Coordinator::new(ctx.clone(), 0, store.pseudo_slot_keys().unwrap()).unwrap();
        Fixture {
            ctx,
            clock,
            coordinator,
        }
    }

    fn decode(ctx: &SgcContext, frames: Vec<Vec<u8>>) -> Vec<Message> {
        frames
            .iter()
            .map(|f| Message::decode(f, &ctx.params).unwrap())
            .collect()
    }

    fn tick(f: &mut Fixture, timer: Timer) -> Vec<Message> {
        let out = f.coordinator.on_timer_tick(timer).unwrap();
        decode(&f.ctx, out)
    }

    fn deliver(f: &mut Fixture, msg: Message) -> Vec<Message> {
        let out = f.coordinator.handle_message(&msg.encode()).unwrap();
        decode(&f.ctx, out)
    }

    fn ack(pid: NodeId, state: MemberState, seq: u32) -> Message {
        Message::HeartbeatAck(HeartbeatAck { state, pid, seq })
    }

    /// Run one full join of a fresh engine through the coordinator.
    fn join_one(f: &mut Fixture, pid: NodeId) -> (Saagka, JoinAck) {
        let hb = match tick(f, Timer::Heartbeat).remove(0) {
            Message::Heartbeat(hb) => hb,
            other => panic!("expected heartbeat, got {other:?}"),
        };
        let np = match deliver(f, ack(pid, MemberState::Unset, hb.seq)).remove(0) {
            Message::NotifyPosition(np) => np,
            other => panic!("expected position, got {other:?}"),
        };
        let group = f.coordinator.group(&np.sid).unwrap().clone();

        let mut engine = Saagka::new(f.ctx.params.clone(), f.ctx.pki.clone());
        let kam = engine
            .message_gen(np.sid, &group.ek, group.size_param, np.pos, &mut OsRng)
            .unwrap();
        let join_ack = match deliver(f, Message::Join(Join { pid, kam })).remove(0) {
            Message::JoinAck(a) => a,
            other => panic!("expected join ack, got {other:?}"),
        };
        assert!(engine.asym_key_derive(join_ack.sid, join_ack.pos, &join_ack.d, &join_ack.ek));
        (engine, join_ack)
    }

    #[test]
    fn test_rejects_unsupported_group_size() {
        let f = fixture(SgcConfig::default());
        let config = SgcConfig {
            group_size: 11,
            ..SgcConfig::default()
        };
        let ctx = SgcContext { config, ..f.ctx };
        let keys = Arc::clone(&f.coordinator.pseudo_keys);

        assert!(matches!(
            Coordinator::new(ctx, 0, keys),
            Err(ProtocolError::UnsupportedGroupSize { group_size: 11 })
        ));
    }

    #[test]
    fn test_heartbeat_creates_group() {
        let mut f = fixture(SgcConfig::default());
        assert!(f.coordinator.current_group().is_none());

        let msgs = tick(&mut f, Timer::Heartbeat);
        let Message::Heartbeat(hb) = &msgs[0] else {
            panic!("expected heartbeat");
        };

        assert_eq!(hb.seq, 0);
        assert_eq!(hb.kv.version, 0);
        assert_eq!(hb.groups.len(), 1);
        assert_eq!(hb.groups[0].sid.seq(), 0);
        assert_eq!(hb.groups[0].n_member, 0);
        assert_eq!(f.coordinator.current_group(), Some(&hb.groups[0]));

        let Message::Heartbeat(hb) = tick(&mut f, Timer::Heartbeat).remove(0) else {
            panic!("expected heartbeat");
        };
        assert_eq!(hb.seq, 1);
        assert_eq!(hb.groups.len(), 1);
    }

    #[test]
    fn test_one_join_in_flight() {
        let mut f = fixture(SgcConfig::default());
        tick(&mut f, Timer::Heartbeat);

        let first = deliver(&mut f, ack(7, MemberState::Unset, 0));
        assert!(matches!(&first[..], [Message::NotifyPosition(np)] if np.pid == 7 && np.pos == 0));
        assert_eq!(f.coordinator.state(), CoordinatorState::HandlingJoin);

        assert!(deliver(&mut f, ack(8, MemberState::Unset, 0)).is_empty());
        assert_eq!(f.coordinator.liveness().len(), 2);
    }

    #[test]
    fn test_one_assignment_per_heartbeat_round() {
        let mut f = fixture(SgcConfig::default());
        join_one(&mut f, 7);
        assert_eq!(f.coordinator.state(), CoordinatorState::Idle);

        // A late ack for the same heartbeat must wait for a fresh snapshot
        assert!(deliver(&mut f, ack(8, MemberState::Unset, 0)).is_empty());
        assert_eq!(f.coordinator.state(), CoordinatorState::Idle);

        tick(&mut f, Timer::Heartbeat);
        let msgs = deliver(&mut f, ack(8, MemberState::Unset, 1));
        assert!(matches!(&msgs[..], [Message::NotifyPosition(np)] if np.pid == 8 && np.pos == 1));
    }

    #[test]
    fn test_ack_for_old_heartbeat_is_ignored() {
        let mut f = fixture(SgcConfig::default());
        tick(&mut f, Timer::Heartbeat);
        tick(&mut f, Timer::Heartbeat);

        assert!(deliver(&mut f, ack(7, MemberState::Unset, 0)).is_empty());
        assert!(deliver(&mut f, ack(7, MemberState::Joined, 1)).is_empty());
        assert_eq!(f.coordinator.state(), CoordinatorState::Idle);
    }

    #[test]
    fn test_heartbeat_abandons_stuck_join() {
        let mut f = fixture(SgcConfig::default());
        tick(&mut f, Timer::Heartbeat);
        deliver(&mut f, ack(7, MemberState::Unset, 0));
        assert_eq!(f.coordinator.state(), CoordinatorState::HandlingJoin);

        tick(&mut f, Timer::Heartbeat);

        assert_eq!(f.coordinator.state(), CoordinatorState::Idle);
        assert!(f.coordinator.liveness().get(7).is_none());
    }

    #[test]
    fn test_join_updates_group() {
        let mut f = fixture(SgcConfig::default());

        let (engine, join_ack) = join_one(&mut f, 5);
        let group = f.coordinator.group(&join_ack.sid).unwrap();

        assert_eq!(join_ack.pos, 0);
        assert_eq!(group.n_member, 1);
        assert!(group.is_occupied(0));
        assert_eq!(engine.encryption_key(), Some(&group.ek));
        assert_eq!(f.coordinator.state(), CoordinatorState::Idle);
    }

    #[test]
    fn test_unsolicited_join_is_dropped() {
        let mut f = fixture(SgcConfig::default());
        let msgs = tick(&mut f, Timer::Heartbeat);
        let Message::Heartbeat(hb) = &msgs[0] else {
            panic!("expected heartbeat");
        };
        let group = &hb.groups[0];

        let mut engine = Saagka::new(f.ctx.params.clone(), f.ctx.pki.clone());
        let kam = engine
            .message_gen(group.sid, &group.ek, group.size_param, 0, &mut OsRng)
            .unwrap();

        assert!(deliver(&mut f, Message::Join(Join { pid: 9, kam })).is_empty());
        assert_eq!(f.coordinator.current_group().unwrap().n_member, 0);
    }

    #[test]
    fn test_full_group_rolls_over() {
        let config = SgcConfig {
            max_group_size: 2,
            size_step: 2,
            group_size: 2,
            ..SgcConfig::default()
        };
        let mut f = fixture(config);

        join_one(&mut f, 1);
        let (_, second) = join_one(&mut f, 2);
        assert_eq!(second.sid.seq(), 0);

        let Message::Heartbeat(hb) = tick(&mut f, Timer::Heartbeat).remove(0) else {
            panic!("expected heartbeat");
        };
        assert_eq!(hb.groups.len(), 2);
        assert_eq!(f.coordinator.current_group().unwrap().sid.seq(), 1);
    }

    #[test]
    fn test_expired_groups_are_dropped() {
        let mut f = fixture(SgcConfig::default());
        tick(&mut f, Timer::Heartbeat);
        let first = f.coordinator.current_group().unwrap().sid;

        f.clock.advance(Duration::from_millis(60_001));
        let Message::Heartbeat(hb) = tick(&mut f, Timer::Heartbeat).remove(0) else {
            panic!("expected heartbeat");
        };

        assert_eq!(hb.groups.len(), 1);
        assert_ne!(hb.groups[0].sid, first);
        assert_eq!(hb.groups[0].sid.seq(), 1);
    }

    fn distribution(f: &Fixture, pid: NodeId, version: u32, key: &[u8]) -> KeyDistribution {
        let groups: Vec<GroupSessionInfo> = f.coordinator.groups().cloned().collect();
        let eks: Vec<_> = groups.iter().map(|g| g.ek).collect();
        KeyDistribution {
            pid,
            kv: KeyVerifier::for_key(version, f.clock.now(), key),
            sids: groups.iter().map(|g| g.sid).collect(),
            ct: encrypt(&f.ctx.params, key, &eks, &mut OsRng),
        }
    }

    #[test]
    fn test_dispatcher_selection_and_encap() {
        let mut f = fixture(SgcConfig::default());
        join_one(&mut f, 5);
        deliver(&mut f, ack(5, MemberState::Joined, 0));

        let msgs = tick(&mut f, Timer::KeyEncapNotify);
        assert!(matches!(&msgs[..], [Message::KeyEncapNotify(n)] if n.pid == 5 && n.key_len == 32));
        assert_eq!(f.coordinator.dispatcher(), Some(5));

        let key = [3u8; 32];
        let dist = distribution(&f, 5, 1, &key);

        // Only the dispatcher may answer
        let mut forged = dist.clone();
        forged.pid = 6;
        assert!(deliver(&mut f, Message::KeyEncap(forged)).is_empty());

        let relayed = deliver(&mut f, Message::KeyEncap(dist.clone()));
        assert_eq!(relayed, vec![Message::KeyEncap(dist.clone())]);
        assert_eq!(f.coordinator.accepted_verifier(), &dist.kv);
        assert_eq!(f.coordinator.session().key(), Some(&key[..]));
        assert_eq!(f.coordinator.dispatcher(), None);

        // Once only
        assert!(deliver(&mut f, Message::KeyEncap(dist)).is_empty());
    }

    #[test]
    fn test_dispatcher_must_have_joined_here() {
        let mut f = fixture(SgcConfig::default());
        tick(&mut f, Timer::Heartbeat);

        // Claiming Joined is not enough
        deliver(&mut f, ack(9, MemberState::Joined, 0));
        assert!(tick(&mut f, Timer::KeyEncapNotify).is_empty());

        join_one(&mut f, 5);
        deliver(&mut f, ack(9, MemberState::Joined, 1));
        let msgs = tick(&mut f, Timer::KeyEncapNotify);
        assert!(matches!(&msgs[..], [Message::KeyEncapNotify(n)] if n.pid == 5));

        // Reporting Unset drops the membership
        deliver(&mut f, ack(5, MemberState::Unset, 1));
        assert!(tick(&mut f, Timer::KeyEncapNotify).is_empty());
    }

    #[test]
    fn test_no_dispatcher_without_live_members() {
        let mut f = fixture(SgcConfig::default());
        join_one(&mut f, 5);
        deliver(&mut f, ack(5, MemberState::Joined, 0));

        f.clock.advance(Duration::from_millis(2_001));
        assert!(tick(&mut f, Timer::KeyEncapNotify).is_empty());
        assert!(f.coordinator.liveness().is_empty());
    }

    #[test]
    fn test_key_update_freshness_and_rate_limit() {
        let mut f = fixture(SgcConfig::default());
        tick(&mut f, Timer::Heartbeat);

        let first = distribution(&f, 4, 1, b"first key");
        let out = deliver(&mut f, Message::KeyUpdate(first.clone()));
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], Message::KeyUpdateAck(a) if a.pid == 4 && a.kv == first.kv));

        // Too soon after the last accepted update
        f.clock.advance(Duration::from_millis(500));
        let second = distribution(&f, 4, 2, b"second key");
        assert!(deliver(&mut f, Message::KeyUpdate(second)).is_empty());

        // Not newer than the accepted version
        f.clock.advance(Duration::from_millis(2_000));
        let replay = distribution(&f, 4, 1, b"replayed key");
        assert!(deliver(&mut f, Message::KeyUpdate(replay)).is_empty());

        // Issued too long ago
        let old = distribution(&f, 4, 3, b"old key");
        f.clock.advance(Duration::from_millis(1_001));
        assert!(deliver(&mut f, Message::KeyUpdate(old)).is_empty());

        let third = distribution(&f, 4, 3, b"third key");
        assert_eq!(deliver(&mut f, Message::KeyUpdate(third.clone())).len(), 2);
        assert_eq!(f.coordinator.accepted_verifier().version, 3);
        assert_eq!(f.coordinator.session().current(), &third.kv);
    }

    #[test]
    fn test_malformed_frames_are_dropped() {
        let mut f = fixture(SgcConfig::default());
        assert!(f.coordinator.handle_message(&[0, 0, 0, 2]).unwrap().is_empty());
        assert!(f.coordinator.handle_message(&[]).unwrap().is_empty());
    }
}
