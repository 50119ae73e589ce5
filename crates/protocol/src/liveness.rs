//! Coordinator-side member liveness.
//!
//! Records are indexed both by member id and by last-heard time so that
//! stale members can be evicted oldest-first and the most recently heard
//! member found without a scan.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tracing::debug;

use sgc_types::{MemberState, NodeId, Sid, Timestamp};

/// What the coordinator knows about one member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberRecord {
    pub last_heard: Timestamp,
    pub state: MemberState,
    /// Slot assigned by the coordinator, if any.
    pub slot: Option<(Sid, u32)>,
    /// The coordinator accepted this member's Join for `slot`.
    pub joined: bool,
}

#[derive(Debug, Default)]
pub struct LivenessIndex {
    records: HashMap<NodeId, MemberRecord>,
    by_time: BTreeSet<(Timestamp, NodeId)>,
}

impl LivenessIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record that `pid` was heard at `now` reporting `state`.
    pub fn touch(&mut self, pid: NodeId, now: Timestamp, state: MemberState) -> &mut MemberRecord {
        let record = self.records.entry(pid).or_insert(MemberRecord {
            last_heard: now,
            state,
            slot: None,
            joined: false,
        });
        self.by_time.remove(&(record.last_heard, pid));
        record.last_heard = now;
        record.state = state;
        self.by_time.insert((now, pid));
        record
    }

    pub fn get(&self, pid: NodeId) -> Option<&MemberRecord> {
        self.records.get(&pid)
    }

    pub fn get_mut(&mut self, pid: NodeId) -> Option<&mut MemberRecord> {
        self.records.get_mut(&pid)
    }

    pub fn remove(&mut self, pid: NodeId) -> Option<MemberRecord> {
        let record = self.records.remove(&pid)?;
        self.by_time.remove(&(record.last_heard, pid));
        Some(record)
    }

    /// Drop every record not heard from within `timeout` of `now`.
    pub fn evict_stale(&mut self, now: Timestamp, timeout: Duration) -> Vec<NodeId> {
        let mut evicted = Vec::new();
        while let Some(&(heard, pid)) = self.by_time.first() {
            if now.saturating_since(heard) <= timeout {
                break;
            }
            self.by_time.pop_first();
            self.records.remove(&pid);
            evicted.push(pid);
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted stale members");
        }
        evicted
    }

    /// Most recently heard member satisfying `pred`.
    pub fn most_recent<F>(&self, pred: F) -> Option<NodeId>
    where
        F: Fn(&MemberRecord) -> bool,
    {
        self.by_time
            .iter()
            .rev()
            .map(|(_, pid)| *pid)
            .find(|pid| self.records.get(pid).is_some_and(&pred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn test_touch_moves_record_in_time() {
        let mut index = LivenessIndex::new();
        index.touch(1, at(100), MemberState::Unset);
        index.touch(2, at(200), MemberState::Unset);
        index.touch(1, at(300), MemberState::Joined);

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(1).unwrap().last_heard, at(300));
        assert_eq!(index.get(1).unwrap().state, MemberState::Joined);
        assert_eq!(index.most_recent(|_| true), Some(1));
    }

    #[test]
    fn test_evict_oldest_first() {
        let mut index = LivenessIndex::new();
        index.touch(1, at(0), MemberState::Unset);
        index.touch(2, at(1_000), MemberState::Unset);
        index.touch(3, at(2_500), MemberState::Unset);

        let evicted = index.evict_stale(at(3_000), Duration::from_millis(2_000));

        assert_eq!(evicted, vec![1]);
        assert!(index.get(1).is_none());
        assert!(index.get(2).is_some());
    }

    #[test]
    fn test_most_recent_joined() {
        let mut index = LivenessIndex::new();
        let joined = |r: &MemberRecord| r.state == MemberState::Joined;
        index.touch(1, at(10), MemberState::Joined);
        index.touch(2, at(20), MemberState::Joined);
        index.touch(3, at(30), MemberState::Unset);

        assert_eq!(index.most_recent(joined), Some(2));

        index.remove(2);
        assert_eq!(index.most_recent(joined), Some(1));
        assert_eq!(index.most_recent(|r| joined(r) && r.slot.is_some()), None);

        index.get_mut(1).unwrap().joined = true;
        assert_eq!(index.most_recent(|r| r.joined), Some(1));
    }
}
