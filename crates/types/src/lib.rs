//! Core value types for the SGC group key protocol.
//!
//! This crate holds the plain data shared by the cryptographic engine, the
//! protocol state machines and the simulation driver: group session
//! identifiers, timestamps, session-key verifiers and member states. Nothing
//! here depends on the pairing library.

use std::fmt;
use std::ops::Add;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// =========================
// IDENTIFIERS
// =========================

/// Protocol-level identifier of a node (coordinator or member).
pub type NodeId = u32;

/// Length of a group session identifier on the wire.
pub const SID_LEN: usize = 16;

const SID_TAG: &[u8; 4] = b"SID-";

/// Group session identifier.
///
/// Layout: `"SID-" || seq (u16 BE) || size_param (u16 BE) || expiry (u64 BE)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sid(pub [u8; SID_LEN]);

impl Sid {
    /// Build the identifier of group `seq` in tier `size_param`.
    pub fn new(seq: u16, size_param: u16, expiry: Timestamp) -> Self {
        let mut bytes = [0u8; SID_LEN];
        bytes[..4].copy_from_slice(SID_TAG);
        bytes[4..6].copy_from_slice(&seq.to_be_bytes());
        bytes[6..8].copy_from_slice(&size_param.to_be_bytes());
        bytes[8..].copy_from_slice(&expiry.as_micros().to_be_bytes());
        Self(bytes)
    }

    /// Group sequence number.
    pub fn seq(&self) -> u16 {
        u16::from_be_bytes([self.0[4], self.0[5]])
    }

    /// Index of the size tier the group was created from.
    pub fn size_param(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }

    pub fn expiry(&self) -> Timestamp {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[8..]);
        Timestamp::from_micros(u64::from_be_bytes(raw))
    }

    /// Whether the bytes carry the expected tag.
    pub fn is_well_formed(&self) -> bool {
        &self.0[..4] == SID_TAG
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group-{}/tier-{}", self.seq(), self.size_param())
    }
}

impl fmt::Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sid({})", hex::encode(self.0))
    }
}

// =========================
// TIME
// =========================

/// Point in time, in microseconds since the driver's epoch.
///
/// The protocol never reads a wall clock; every timestamp comes from an
/// injected clock.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000))
    }

    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, zero if `earlier` is in the future.
    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let micros = u64::try_from(rhs.as_micros()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}s", self.0 / 1_000_000, self.0 % 1_000_000)
    }
}

// =========================
// SESSION KEYS
// =========================

/// Fingerprint of a symmetric session key.
///
/// Gossiped in place of the key itself so that nodes can agree on which key
/// is current. Version 0 denotes "no key yet" and carries no hash on the
/// wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyVerifier {
    pub version: u32,
    pub timestamp: Timestamp,
    pub hash: [u8; 32],
}

impl KeyVerifier {
    /// Fingerprint `key` as version `version`, issued at `timestamp`.
    ///
    /// Version 0 never carries a hash, whatever `key` is.
    pub fn for_key(version: u32, timestamp: Timestamp, key: &[u8]) -> Self {
        let hash = if version == 0 { [0u8; 32] } else { sha256(key) };
        Self {
            version,
            timestamp,
            hash,
        }
    }

    /// Whether `key` hashes to this verifier's fingerprint.
    pub fn matches(&self, key: &[u8]) -> bool {
        self.version > 0 && sha256(key) == self.hash
    }

    /// Whether this verifier carries a higher version than `other`.
    pub fn is_newer_than(&self, other: &KeyVerifier) -> bool {
        self.version > other.version
    }
}

/// Protocol state of a member, as reported in heartbeat acknowledgements.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberState {
    /// Not part of any group and not joining.
    #[default]
    Unset,
    /// Join proof sent, waiting for the coordinator's acknowledgement.
    Joining,
    /// Holds a decryption key for its group.
    Joined,
}

impl MemberState {
    pub fn code(&self) -> u32 {
        match self {
            MemberState::Unset => 1,
            MemberState::Joining => 2,
            MemberState::Joined => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(MemberState::Unset),
            2 => Some(MemberState::Joining),
            3 => Some(MemberState::Joined),
            _ => None,
        }
    }
}

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(data).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sid_layout() {
        let expiry = Timestamp::from_millis(61_000);
        let sid = Sid::new(7, 2, expiry);

        assert_eq!(&sid.0[..4], b"SID-");
        assert_eq!(sid.seq(), 7);
        assert_eq!(sid.size_param(), 2);
        assert_eq!(sid.expiry(), expiry);
        assert!(sid.is_well_formed());
        assert_ne!(sid, Sid::new(8, 2, expiry));
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::from_millis(1_500);
        let later = t + Duration::from_millis(250);

        assert_eq!(later.as_micros(), 1_750_000);
        assert_eq!(later.saturating_since(t), Duration::from_millis(250));
        assert_eq!(t.saturating_since(later), Duration::ZERO);
    }

    #[test]
    fn test_key_verifier_matches_only_its_key() {
        let key = [9u8; 32];
        let kv = KeyVerifier::for_key(3, Timestamp::ZERO, &key);

        assert!(kv.matches(&key));
        assert!(!kv.matches(&[8u8; 32]));
        assert!(!KeyVerifier::default().matches(&key));
        assert!(kv.is_newer_than(&KeyVerifier::default()));
    }

    #[test]
    fn test_version_zero_has_no_hash() {
        let kv = KeyVerifier::for_key(0, Timestamp::from_millis(7), b"ignored");

        assert_eq!(kv.hash, [0u8; 32]);
        assert!(!kv.matches(b"ignored"));
    }

    #[test]
    fn test_member_state_codes() {
        for state in [MemberState::Unset, MemberState::Joining, MemberState::Joined] {
            assert_eq!(MemberState::from_code(state.code()), Some(state));
        }
        assert_eq!(MemberState::from_code(0), None);
    }

    #[test]
    fn test_key_verifier_json() {
        let kv = KeyVerifier::for_key(1, Timestamp::from_millis(5), b"k");
        let json = serde_json::to_string(&kv).unwrap();
        let back: KeyVerifier = serde_json::from_str(&json).unwrap();
        assert_eq!(kv, back);
    }
}
