//! Member role.
//!
//! A member answers every Heartbeat, joins the slot the coordinator assigns
//! it, keeps its group key pair in step with later joiners, and takes part
//! in session key distribution.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, warn};

use sgc_crypto::{check_valid, encrypt, EncryptionKey, Membership, Saagka};
use sgc_types::{KeyVerifier, MemberState, NodeId, Sid};

use crate::clock::Timer;
use crate::error::ProtocolError;
use crate::group::GroupSessionInfo;
use crate::message::{
    Heartbeat, HeartbeatAck, Join, JoinAck, KeyDistribution, KeyEncapNotify, Message,
    NotifyPosition,
};
use crate::node::{encode_all, SgcContext, SgcNode};
use crate::session::SessionKeyBook;

pub struct Member {
    ctx: SgcContext,
    pid: NodeId,
    state: MemberState,
    engine: Saagka,
    /// Latest known snapshot of every live group.
    groups: BTreeMap<Sid, GroupSessionInfo>,
    /// Slots of our own group filled by joins we have not applied.
    gap_slots: BTreeSet<u32>,
    session: SessionKeyBook,
    rng: StdRng,
}

impl Member {
    /// Create a member and publish its first public key.
    pub fn new(ctx: SgcContext, pid: NodeId) -> Result<Self, ProtocolError> {
        Self::with_rng(ctx, pid, StdRng::from_entropy())
    }

    pub fn with_rng(ctx: SgcContext, pid: NodeId, mut rng: StdRng) -> Result<Self, ProtocolError> {
        let mut engine = Saagka::new(ctx.params.clone(), ctx.pki.clone());
        let pk_id = engine.key_gen(&mut rng)?;
        debug!(pid, pk_id, "Member ready");

        Ok(Self {
            ctx,
            pid,
            state: MemberState::Unset,
            engine,
            groups: BTreeMap::new(),
            gap_slots: BTreeSet::new(),
            session: SessionKeyBook::new(),
            rng,
        })
    }

    pub fn state(&self) -> MemberState {
        self.state
    }

    pub fn session(&self) -> &SessionKeyBook {
        &self.session
    }

    pub fn membership(&self) -> Option<&Membership> {
        self.engine.membership()
    }

    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.engine.encryption_key()
    }

    pub fn group(&self, sid: &Sid) -> Option<&GroupSessionInfo> {
        self.groups.get(sid)
    }

    pub fn gap_slots(&self) -> &BTreeSet<u32> {
        &self.gap_slots
    }

    /// Group we currently hold a key pair for.
    pub fn joined_sid(&self) -> Option<Sid> {
        match self.state {
            MemberState::Joined => self.engine.membership().map(|m| m.sid),
            _ => None,
        }
    }

    fn handle_heartbeat(&mut self, hb: Heartbeat) -> Vec<Message> {
        let now = self.ctx.now();

        if self.state == MemberState::Joining {
            debug!(pid = self.pid, "Join unanswered, starting over");
            self.engine.abandon_join();
            self.state = MemberState::Unset;
        }

        self.groups.retain(|_, g| !g.is_expired(now));
        if let Some(sid) = self.joined_sid() {
            if !self.groups.contains_key(&sid) {
                info!(pid = self.pid, sid = %sid, "Own group expired");
                self.state = MemberState::Unset;
                self.gap_slots.clear();
            }
        }

        let joined = self.joined_sid();
        for info in hb.groups {
            match self.groups.entry(info.sid) {
                Entry::Vacant(slot) => {
                    slot.insert(info);
                }
                Entry::Occupied(mut slot) => {
                    let cached = slot.get_mut();
                    if info.n_member <= cached.n_member {
                        continue;
                    }
                    if joined == Some(info.sid) {
                        // Our key pair is ahead of any snapshot; remember what we missed
                        for pos in cached.slot_diff(&info) {
                            if info.is_occupied(pos) {
                                self.gap_slots.insert(pos);
                            }
                        }
                    } else {
                        *cached = info;
                    }
                }
            }
        }

        self.session.observe_verifier(&hb.kv);

        vec![Message::HeartbeatAck(HeartbeatAck {
            state: self.state,
            pid: self.pid,
            seq: hb.seq,
        })]
    }

    fn handle_notify_position(
        &mut self,
        np: NotifyPosition,
    ) -> Result<Vec<Message>, ProtocolError> {
        if np.pid != self.pid {
            return Ok(Vec::new());
        }
        if self.state != MemberState::Unset {
            debug!(pid = self.pid, state = ?self.state, "Position while not unset");
            return Ok(Vec::new());
        }
        let Some(group) = self.groups.get(&np.sid) else {
            debug!(pid = self.pid, sid = %np.sid, "Position in an unknown group");
            return Ok(Vec::new());
        };
        let scale = self.ctx.params.scale(group.size_param)?;
        if np.pos as usize >= scale || group.is_occupied(np.pos) {
            warn!(pid = self.pid, sid = %np.sid, pos = np.pos, "Assigned slot is unavailable");
            return Ok(Vec::new());
        }

        let kam = self.engine.message_gen(
            np.sid,
            &group.ek,
            group.size_param,
            np.pos,
            &mut self.rng,
        )?;
        self.state = MemberState::Joining;

        info!(pid = self.pid, sid = %np.sid, pos = np.pos, "Joining");
        Ok(vec![Message::Join(Join { pid: self.pid, kam })])
    }

    /// Fold another member's join into our key pair.
    fn handle_join(&mut self, join: Join) {
        let kam = &join.kam;
        if join.pid == self.pid || self.joined_sid() != Some(kam.sid) {
            return;
        }
        let Some(cached) = self.groups.get(&kam.sid) else {
            return;
        };
        if cached.is_occupied(kam.pos) {
            debug!(pid = self.pid, pos = kam.pos, "Join for an occupied slot");
            return;
        }
        if !check_valid(&self.ctx.params, self.ctx.pki.as_ref(), kam, &mut self.rng) {
            warn!(pid = self.pid, joiner = join.pid, "Rejected overheard join proof");
            return;
        }
        if let Err(e) = self.engine.update_key(kam) {
            warn!(pid = self.pid, error = %e, "Could not apply overheard join");
            return;
        }

        if let Some(cached) = self.groups.get_mut(&kam.sid) {
            cached.occupy(kam.pos);
            cached.n_member += 1;
            if let Some(ek) = self.engine.encryption_key() {
                cached.ek = *ek;
            }
        }
        self.gap_slots.remove(&kam.pos);
        debug!(pid = self.pid, joiner = join.pid, pos = kam.pos, "Applied join");
    }

    fn handle_join_ack(&mut self, ack: JoinAck) {
        if self.state != MemberState::Joining {
            return;
        }
        if !self
            .engine
            .asym_key_derive(ack.sid, ack.pos, &ack.d, &ack.ek)
        {
            debug!(pid = self.pid, sid = %ack.sid, pos = ack.pos, "Join acknowledgement not applicable");
            return;
        }

        self.state = MemberState::Joined;
        self.gap_slots.clear();
        if let Some(cached) = self.groups.get_mut(&ack.sid) {
            if !cached.is_occupied(ack.pos) {
                cached.occupy(ack.pos);
                cached.n_member += 1;
            }
            cached.ek = ack.ek;
        }

        info!(pid = self.pid, sid = %ack.sid, pos = ack.pos, "Joined group");
    }

    // =========================
    // SESSION KEYS
    // =========================

    /// Sample a key and encrypt it to every known group.
    fn distribute(&mut self, version: u32, key_len: usize) -> KeyDistribution {
        let mut key = vec![0u8; key_len];
        self.rng.fill_bytes(&mut key);
        let kv = KeyVerifier::for_key(version, self.ctx.now(), &key);

        let (sids, eks): (Vec<Sid>, Vec<EncryptionKey>) =
            self.groups.values().map(|g| (g.sid, g.ek)).unzip();
        let ct = encrypt(&self.ctx.params, &key, &eks, &mut self.rng);

        info!(
            pid = self.pid,
            version,
            groups = sids.len(),
            fingerprint = hex::encode(&kv.hash[..8]),
            "Distributing session key"
        );

        self.session.offer_key(&kv, key);
        KeyDistribution {
            pid: self.pid,
            kv,
            sids,
            ct,
        }
    }

    fn handle_key_encap_notify(&mut self, notify: KeyEncapNotify) -> Vec<Message> {
        if notify.pid != self.pid {
            return Vec::new();
        }
        if self.state != MemberState::Joined {
            debug!(pid = self.pid, "Dispatch request while not joined");
            return Vec::new();
        }

        let version = notify
            .cur_version
            .max(self.session.highest_version())
            .saturating_add(1);
        vec![Message::KeyEncap(
            self.distribute(version, notify.key_len as usize),
        )]
    }

    fn launch_key_update(&mut self) -> Vec<Message> {
        if self.state != MemberState::Joined {
            return Vec::new();
        }
        let version = self.session.highest_version().saturating_add(1);
        let key_len = self.ctx.config.session_key_len as usize;
        vec![Message::KeyUpdate(self.distribute(version, key_len))]
    }

    fn decapsulate(&mut self, dist: KeyDistribution) {
        if dist.pid == self.pid {
            return;
        }
        let Some(own_sid) = self.joined_sid() else {
            return;
        };
        if !dist.kv.is_newer_than(self.session.current()) || self.session.has_key_for(&dist.kv) {
            return;
        }
        let Some(index) = dist.sids.iter().position(|sid| *sid == own_sid) else {
            debug!(pid = self.pid, version = dist.kv.version, "Session key not sent to our group");
            return;
        };

        match self.engine.decrypt(&dist.ct, index) {
            Ok(key) if dist.kv.matches(&key) => {
                debug!(pid = self.pid, version = dist.kv.version, "Decrypted session key");
                self.session.offer_key(&dist.kv, key);
            }
            Ok(_) => warn!(
                pid = self.pid,
                version = dist.kv.version,
                "Decrypted key does not match its verifier"
            ),
            Err(e) => warn!(pid = self.pid, error = %e, "Could not decrypt session key"),
        }
    }
}

impl SgcNode for Member {
    fn pid(&self) -> NodeId {
        self.pid
    }

    fn handle_message(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let Some(msg) = self.ctx.decode(self.pid, bytes) else {
            return Ok(Vec::new());
        };

        let out = match msg {
            Message::Heartbeat(hb) => self.handle_heartbeat(hb),
            Message::NotifyPosition(np) => self.handle_notify_position(np)?,
            Message::Join(join) => {
                self.handle_join(join);
                Vec::new()
            }
            Message::JoinAck(ack) => {
                self.handle_join_ack(ack);
                Vec::new()
            }
            Message::KeyEncapNotify(notify) => self.handle_key_encap_notify(notify),
            Message::KeyEncap(dist) | Message::KeyUpdate(dist) => {
                self.decapsulate(dist);
                Vec::new()
            }
            Message::KeyUpdateAck(ack) => {
                self.session.observe_verifier(&ack.kv);
                Vec::new()
            }
            Message::HeartbeatAck(_) => Vec::new(),
        };
        Ok(encode_all(out))
    }

    fn on_timer_tick(&mut self, timer: Timer) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let out = match timer {
            Timer::KeyUpdate => self.launch_key_update(),
            Timer::Heartbeat | Timer::KeyEncapNotify => Vec::new(),
        };
        Ok(encode_all(out))
    }

    fn timers(&self) -> &'static [Timer] {
        &[Timer::KeyUpdate]
    }
}
