//! Injected time source and timer kinds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sgc_types::Timestamp;

/// Source of the current time.
///
/// Nodes never read a wall clock; the driver decides what "now" means.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Clock advanced by hand. Clones share the same time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ts: Timestamp) -> Self {
        let clock = Self::new();
        clock.set(ts);
        clock
    }

    pub fn set(&self, ts: Timestamp) {
        self.micros.store(ts.as_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

/// Periodic actions a driver schedules on behalf of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timer {
    /// Coordinator: broadcast a Heartbeat.
    Heartbeat,
    /// Coordinator: pick a dispatcher for a fresh session key.
    KeyEncapNotify,
    /// Member: propose a new session key.
    KeyUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_shared() {
        let clock = ManualClock::starting_at(Timestamp::from_millis(10));
        let other = clock.clone();

        other.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), Timestamp::from_millis(15));

        clock.set(Timestamp::ZERO);
        assert_eq!(other.now(), Timestamp::ZERO);
    }
}
