//! End-to-end integration tests for the SGC protocol.
//!
//! These tests run one coordinator and a handful of members over an
//! in-memory broadcast medium:
//! 1. Setup of the public parameters
//! 2. Sequential joins, one per Heartbeat
//! 3. Session key encapsulation by a dispatcher
//! 4. Member-initiated key updates and their rate limit
//! 5. Recovery from lost frames

#![cfg(test)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::OsRng;

use sgc_crypto::{BulletinBoard, PublicParameterStore};
use sgc_protocol::{
    Coordinator, CoordinatorState, ManualClock, Member, Message, SgcConfig, SgcContext, SgcNode,
    Timer,
};
use sgc_types::{KeyVerifier, MemberState, Timestamp};

/// Coordinator plus members wired to a synchronous broadcast pump.
struct Harness {
    ctx: SgcContext,
    clock: ManualClock,
    coordinator: Coordinator,
    members: Vec<Member>,
    /// Every frame put on the medium, in send order.
    log: Vec<Message>,
}

impl Harness {
    fn new(members: u32) -> Self {
        let clock = ManualClock::starting_at(Timestamp::from_millis(1_000));
        let config = SgcConfig::default();

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
        let members = (1..=members)
            .map(|pid| Member::new(ctx.clone(), pid).unwrap())
            .collect();

        Self {
            ctx,
            clock,
            coordinator,
            members,
            log: Vec::new(),
        }
    }

    fn node_mut(&mut self, node: usize) -> &mut dyn SgcNode {
        match node {
            0 => &mut self.coordinator,
            n => &mut self.members[n - 1],
        }
    }

    fn fire(&mut self, node: usize, timer: Timer) {
        self.fire_filtered(node, timer, &mut |_, _| true);
    }

    /// Fire `timer` at `node` and deliver everything that follows, except
    /// deliveries rejected by `deliver(receiver, msg)`.
    fn fire_filtered(
        &mut self,
        node: usize,
        timer: Timer,
        deliver: &mut dyn FnMut(usize, &Message) -> bool,
    ) {
        let frames = self.node_mut(node).on_timer_tick(timer).unwrap();
        self.pump(node, frames, deliver);
    }

    /// Put `msg` on the medium as if `from` had sent it.
    fn inject(&mut self, from: usize, msg: &Message) {
        self.pump(from, vec![msg.encode()], &mut |_, _| true);
    }

    fn pump(
        &mut self,
        from: usize,
        frames: Vec<Vec<u8>>,
        deliver: &mut dyn FnMut(usize, &Message) -> bool,
    ) {
        let mut queue: VecDeque<(usize, Vec<u8>)> =
            frames.into_iter().map(|f| (from, f)).collect();

        while let Some((from, frame)) = queue.pop_front() {
            let msg = Message::decode(&frame, &self.ctx.params).unwrap();
            for to in 0..=self.members.len() {
                if to == from || !deliver(to, &msg) {
                    continue;
                }
                for out in self.node_mut(to).handle_message(&frame).unwrap() {
                    queue.push_back((to, out));
                }
            }
            self.log.push(msg);
        }
    }

    fn heartbeat_round(&mut self) {
        self.clock.advance(Duration::from_secs(1));
        self.fire(0, Timer::Heartbeat);
    }

    fn member(&self, pid: u32) -> &Member {
        &self.members[pid as usize - 1]
    }

    fn count(&self, pred: impl Fn(&Message) -> bool) -> usize {
        self.log.iter().filter(|m| pred(m)).count()
    }
}

/// Join every member, one Heartbeat round each.
fn join_all(h: &mut Harness) {
    for _ in 0..h.members.len() {
        h.heartbeat_round();
    }
}

#[test]
fn test_three_members_join_sequentially() {
    let mut h = Harness::new(3);

    for round in 1..=3u32 {
        h.heartbeat_round();
        let member = h.member(round);
        assert_eq!(member.state(), MemberState::Joined);
        assert_eq!(member.membership().unwrap().pos, round - 1);
        println!("Round {round}: member {round} joined");
    }

    let group = h.coordinator.current_group().unwrap().clone();
    assert_eq!(group.n_member, 3);
    assert_eq!(group.occupied_slots(), vec![0, 1, 2]);
    assert_eq!(group.mem_bitmap[0], 0b1110_0000);

    for member in &h.members {
        assert_eq!(member.encryption_key(), Some(&group.ek));
        assert_eq!(member.membership().unwrap().sid, group.sid);
        assert!(member.gap_slots().is_empty());
    }
}

#[test]
fn test_at_most_one_join_per_round() {
    let mut h = Harness::new(4);

    for round in 1..=4 {
        let before = h.count(|m| matches!(m, Message::NotifyPosition(_)));
        h.heartbeat_round();
        let after = h.count(|m| matches!(m, Message::NotifyPosition(_)));

        assert_eq!(after - before, 1, "round {round}");
        assert_eq!(h.coordinator.state(), CoordinatorState::Idle);
    }

    // Every member acknowledged every Heartbeat
    assert_eq!(h.count(|m| matches!(m, Message::HeartbeatAck(_))), 16);
    assert_eq!(h.coordinator.current_group().unwrap().n_member, 4);
}

#[test]
fn test_late_ack_waits_for_next_round() {
    let mut h = Harness::new(2);

    // Hold member 2's acknowledgement back until member 1 has joined
    let mut held = None;
    h.clock.advance(Duration::from_secs(1));
    h.fire_filtered(0, Timer::Heartbeat, &mut |to, msg| match msg {
        Message::HeartbeatAck(ack) if to == 0 && ack.pid == 2 => {
            held = Some(msg.clone());
            false
        }
        _ => true,
    });
    assert_eq!(h.member(1).state(), MemberState::Joined);
    assert_eq!(h.coordinator.state(), CoordinatorState::Idle);

    let positions = h.count(|m| matches!(m, Message::NotifyPosition(_)));
    h.inject(2, &held.expect("member 2 acknowledged"));
    assert_eq!(
        h.count(|m| matches!(m, Message::NotifyPosition(_))),
        positions
    );
    assert_eq!(h.member(2).state(), MemberState::Unset);
    assert_eq!(h.coordinator.current_group().unwrap().n_member, 1);

    h.heartbeat_round();
    let group = h.coordinator.current_group().unwrap().clone();
    assert_eq!(group.n_member, 2);
    assert_eq!(h.member(2).state(), MemberState::Joined);
    for member in &h.members {
        assert_eq!(member.encryption_key(), Some(&group.ek));
    }
}

#[test]
fn test_dispatcher_key_reaches_everyone() {
    let mut h = Harness::new(3);
    join_all(&mut h);
    // Refresh liveness with every member reporting Joined
    h.heartbeat_round();

    // ========================================
    // Encapsulation
    // ========================================

    h.fire(0, Timer::KeyEncapNotify);
    let encap: Vec<_> = h
        .log
        .iter()
        .filter_map(|m| match m {
            Message::KeyEncap(dist) => Some(dist.clone()),
            _ => None,
        })
        .collect();

    // Original broadcast plus the coordinator's relay
    assert_eq!(encap.len(), 2);
    assert_eq!(encap[0], encap[1]);
    let kv: KeyVerifier = encap[0].kv;
    let dispatcher = encap[0].pid;
    assert_eq!(kv.version, 1);

    let key = h.coordinator.session().key().unwrap().to_vec();
    assert!(kv.matches(&key));
    assert_eq!(h.coordinator.session().current(), &kv);

    for member in &h.members {
        assert!(member.session().has_key_for(&kv), "member {}", member.pid());
        if member.pid() != dispatcher {
            // Nothing adopted before the verifier is gossiped
            assert_eq!(member.session().current().version, 0);
        }
    }

    // ========================================
    // Adoption on the next Heartbeat
    // ========================================

    h.heartbeat_round();
    for member in &h.members {
        assert_eq!(member.session().current(), &kv);
        assert_eq!(member.session().key(), Some(&key[..]));
    }
}

#[test]
fn test_key_updates_are_rate_limited() {
    let mut h = Harness::new(3);
    join_all(&mut h);

    h.fire(2, Timer::KeyUpdate);
    let first = *h.coordinator.accepted_verifier();
    assert_eq!(first.version, 1);
    assert_eq!(h.count(|m| matches!(m, Message::KeyUpdateAck(_))), 1);

    // The ack alone lets every member adopt the key
    for member in &h.members {
        assert_eq!(member.session().current(), &first);
    }

    // A second proposal right away is dropped by the coordinator
    h.fire(3, Timer::KeyUpdate);
    assert_eq!(h.coordinator.accepted_verifier(), &first);
    assert_eq!(h.count(|m| matches!(m, Message::KeyUpdateAck(_))), 1);
    assert_eq!(h.member(1).session().current(), &first);

    h.clock.advance(Duration::from_millis(2_000));
    h.fire(1, Timer::KeyUpdate);
    let second = *h.coordinator.accepted_verifier();

    // The dropped proposal still counts towards member 1's next version
    assert_eq!(second.version, 3);
    assert_eq!(h.count(|m| matches!(m, Message::KeyUpdateAck(_))), 2);
    for member in &h.members {
        assert_eq!(member.session().current(), &second);
    }
}

#[test]
fn test_versions_never_decrease() {
    let mut h = Harness::new(3);
    join_all(&mut h);

    let mut last = vec![0u32; 3];
    for step in 0..6u64 {
        h.clock.advance(Duration::from_millis(700));
        match step % 3 {
            0 => h.fire(0, Timer::KeyEncapNotify),
            1 => h.fire(1 + (step as usize % 3), Timer::KeyUpdate),
            _ => h.fire(0, Timer::Heartbeat),
        }

        for (i, member) in h.members.iter().enumerate() {
            let version = member.session().current().version;
            assert!(version >= last[i]);
            last[i] = version;
        }
    }
    assert!(last.iter().all(|v| *v > 0));
}

#[test]
fn test_lost_join_ack_leads_to_rejoin() {
    let mut h = Harness::new(2);

    h.clock.advance(Duration::from_secs(1));
    h.fire_filtered(0, Timer::Heartbeat, &mut |to, msg| {
        !(to == 1 && matches!(msg, Message::JoinAck(_)))
    });

    // The coordinator counted the join; the member never learned its key
    assert_eq!(h.member(1).state(), MemberState::Joining);
    assert_eq!(h.coordinator.current_group().unwrap().n_member, 1);

    h.heartbeat_round();
    let member = h.member(1);
    assert_eq!(member.state(), MemberState::Joined);
    assert_eq!(member.membership().unwrap().pos, 1);

    h.heartbeat_round();
    let group = h.coordinator.current_group().unwrap().clone();
    assert_eq!(group.n_member, 3);
    assert_eq!(h.member(2).membership().unwrap().pos, 2);
    for member in &h.members {
        assert_eq!(member.encryption_key(), Some(&group.ek));
    }
}

#[test]
fn test_missed_join_is_recorded_as_gap() {
    let mut h = Harness::new(3);
    h.heartbeat_round();

    // Member 1 misses member 2's join
    h.clock.advance(Duration::from_secs(1));
    h.fire_filtered(0, Timer::Heartbeat, &mut |to, msg| {
        !(to == 1 && matches!(msg, Message::Join(_)))
    });
    assert_eq!(h.member(2).state(), MemberState::Joined);

    h.heartbeat_round();
    let member = h.member(1);
    assert!(member.gap_slots().contains(&1));
    assert_ne!(
        member.encryption_key(),
        Some(&h.coordinator.current_group().unwrap().ek)
    );
}
