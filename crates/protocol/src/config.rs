//! Node configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timer;

/// Tunables shared by the coordinator, the members and the driver.
///
/// Missing fields take their default when deserialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgcConfig {
    pub security_level: u32,
    /// Largest supported group; also the length of `h[]`.
    pub max_group_size: usize,
    /// Distance between size tiers.
    pub size_step: usize,
    /// Size of the groups the coordinator creates.
    pub group_size: usize,
    pub heartbeat_interval_ms: u64,
    pub key_encap_interval_ms: u64,
    pub key_update_interval_ms: u64,
    /// Minimum time between two accepted key updates.
    pub key_update_threshold_ms: u64,
    pub liveness_timeout_ms: u64,
    /// How old a key distribution's timestamp may be.
    pub freshness_window_ms: u64,
    pub group_lifetime_ms: u64,
    /// Session key length in bytes.
    pub session_key_len: u32,
}

impl Default for SgcConfig {
    fn default() -> Self {
        Self {
            security_level: 80,
            max_group_size: 10,
            size_step: 10,
            group_size: 10,
            heartbeat_interval_ms: 1_000,
            key_encap_interval_ms: 3_000,
            key_update_interval_ms: 2_000,
            key_update_threshold_ms: 2_000,
            liveness_timeout_ms: 2_000,
            freshness_window_ms: 1_000,
            group_lifetime_ms: 60_000,
            session_key_len: 32,
        }
    }
}

impl SgcConfig {
    /// Period of `timer`.
    pub fn interval(&self, timer: Timer) -> Duration {
        Duration::from_millis(match timer {
            Timer::Heartbeat => self.heartbeat_interval_ms,
            Timer::KeyEncapNotify => self.key_encap_interval_ms,
            Timer::KeyUpdate => self.key_update_interval_ms,
        })
    }

    pub fn key_update_threshold(&self) -> Duration {
        Duration::from_millis(self.key_update_threshold_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn group_lifetime(&self) -> Duration {
        Duration::from_millis(self.group_lifetime_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SgcConfig =
            serde_json::from_str(r#"{"group_size": 4, "heartbeat_interval_ms": 250}"#).unwrap();

        assert_eq!(config.group_size, 4);
        assert_eq!(config.interval(Timer::Heartbeat), Duration::from_millis(250));
        assert_eq!(config.max_group_size, 10);
        assert_eq!(config.session_key_len, 32);
    }

    #[test]
    fn test_intervals() {
        let config = SgcConfig::default();
        assert_eq!(config.interval(Timer::KeyEncapNotify), Duration::from_secs(3));
        assert_eq!(config.interval(Timer::KeyUpdate), Duration::from_secs(2));
        assert_eq!(config.freshness_window(), Duration::from_secs(1));
    }
}
