//! End-of-run summary.

use std::collections::BTreeMap;

use serde::Serialize;

use sgc_protocol::{Coordinator, Member, SessionKeyBook, SgcNode};
use sgc_types::MemberState;

use crate::network::Simulation;

#[derive(Debug, Serialize)]
pub struct SimReport {
    pub duration_ms: u64,
    pub members: usize,
    pub loss: f64,
    pub frames_sent: u64,
    pub deliveries: u64,
    pub dropped: u64,
    pub frames_by_type: BTreeMap<String, u64>,
    pub groups: Vec<GroupReport>,
    pub coordinator: KeyReport,
    pub nodes: Vec<NodeReport>,
    /// Joined members holding the coordinator's latest accepted key.
    pub members_in_sync: usize,
    pub members_joined: usize,
}

#[derive(Debug, Serialize)]
pub struct GroupReport {
    pub sid: String,
    pub n_member: u32,
    pub occupied: Vec<u32>,
}

#[derive(Debug, Serialize)]
pub struct KeyReport {
    pub version: u32,
    pub fingerprint: Option<String>,
}

impl KeyReport {
    fn of(session: &SessionKeyBook) -> Self {
        let kv = session.current();
        Self {
            version: kv.version,
            fingerprint: (kv.version > 0).then(|| hex::encode(&kv.hash[..8])),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NodeReport {
    pub pid: u32,
    pub state: MemberState,
    pub sid: Option<String>,
    pub pos: Option<u32>,
    pub gap_slots: Vec<u32>,
    pub key: KeyReport,
}

impl NodeReport {
    fn of(member: &Member) -> Self {
        let membership = member
            .membership()
            .filter(|_| member.state() == MemberState::Joined);
        Self {
            pid: member.pid(),
            state: member.state(),
            sid: membership.map(|m| m.sid.to_string()),
            pos: membership.map(|m| m.pos),
            gap_slots: member.gap_slots().iter().copied().collect(),
            key: KeyReport::of(member.session()),
        }
    }
}

impl SimReport {
    pub fn collect(sim: &Simulation, duration_ms: u64, loss: f64) -> Self {
        let coordinator: &Coordinator = &sim.coordinator;
        let accepted = coordinator.accepted_verifier();

        let nodes: Vec<NodeReport> = sim.members.iter().map(NodeReport::of).collect();
        let members_joined = nodes
            .iter()
            .filter(|n| n.state == MemberState::Joined)
            .count();
        let members_in_sync = sim
            .members
            .iter()
            .filter(|m| m.state() == MemberState::Joined)
            .filter(|m| {
                let kv = m.session().current();
                accepted.version > 0 && kv.version == accepted.version && kv.hash == accepted.hash
            })
            .count();

        Self {
            duration_ms,
            members: sim.members.len(),
            loss,
            frames_sent: sim.stats.frames_sent,
            deliveries: sim.stats.deliveries,
            dropped: sim.stats.dropped,
            frames_by_type: sim.stats.by_type.clone(),
            groups: coordinator
                .groups()
                .map(|g| GroupReport {
                    sid: g.sid.to_string(),
                    n_member: g.n_member,
                    occupied: g.occupied_slots(),
                })
                .collect(),
            coordinator: KeyReport::of(coordinator.session()),
            nodes,
            members_in_sync,
            members_joined,
        }
    }
}
