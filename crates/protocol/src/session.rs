//! Session key adoption.
//!
//! A node learns about a new session key from two independent sources: the
//! authoritative verifier (carried by Heartbeat and KeyUpdateAck) and the
//! key bytes themselves (decrypted from KeyEncap/KeyUpdate, or generated
//! locally). The key is adopted once both have been seen for the same
//! version and hash, in whichever order they arrive.

use std::collections::BTreeMap;

use tracing::{debug, info};

use sgc_types::KeyVerifier;

/// Unconfirmed candidates kept at most. The highest versions go first.
pub const MAX_UNCONFIRMED: usize = 16;

#[derive(Clone, Debug)]
struct PendingKey {
    verifier: KeyVerifier,
    key: Option<Vec<u8>>,
    confirmed: bool,
}

/// Current session key plus candidates waiting for confirmation.
#[derive(Clone, Debug, Default)]
pub struct SessionKeyBook {
    current: KeyVerifier,
    key: Option<Vec<u8>>,
    pending: BTreeMap<u32, Vec<PendingKey>>,
}

impl SessionKeyBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifier of the adopted key; version 0 before any adoption.
    pub fn current(&self) -> &KeyVerifier {
        &self.current
    }

    /// Adopted key bytes.
    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// Highest version seen, adopted or pending.
    pub fn highest_version(&self) -> u32 {
        self.pending
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(self.current.version)
    }

    /// Whether key bytes for `kv` are already held.
    pub fn has_key_for(&self, kv: &KeyVerifier) -> bool {
        (self.current.version == kv.version && self.current.hash == kv.hash && self.key.is_some())
            || self.find(kv).is_some_and(|p| p.key.is_some())
    }

    pub fn pending_versions(&self) -> usize {
        self.pending.len()
    }

    /// Record an authoritative verifier. Returns `true` if a key was adopted.
    pub fn observe_verifier(&mut self, kv: &KeyVerifier) -> bool {
        if !kv.is_newer_than(&self.current) {
            return false;
        }

        // Anything older than an authoritative version can never be adopted
        self.pending = self.pending.split_off(&kv.version);

        let candidates = self.pending.entry(kv.version).or_default();
        match candidates.iter_mut().find(|p| p.verifier.hash == kv.hash) {
            Some(pending) => pending.confirmed = true,
            None => candidates.push(PendingKey {
                verifier: *kv,
                key: None,
                confirmed: true,
            }),
        }

        self.try_adopt(kv)
    }

    /// Record key bytes for `kv`. Returns `true` if the key was adopted.
    ///
    /// Keys that do not hash to `kv` are ignored.
    pub fn offer_key(&mut self, kv: &KeyVerifier, key: Vec<u8>) -> bool {
        if !kv.is_newer_than(&self.current) || !kv.matches(&key) {
            return false;
        }

        let candidates = self.pending.entry(kv.version).or_default();
        match candidates.iter_mut().find(|p| p.verifier.hash == kv.hash) {
            Some(pending) if pending.key.is_some() => return false,
            Some(pending) => pending.key = Some(key),
            None => candidates.push(PendingKey {
                verifier: *kv,
                key: Some(key),
                confirmed: false,
            }),
        }
        self.evict_unconfirmed();

        self.try_adopt(kv)
    }

    fn unconfirmed(&self) -> usize {
        self.pending
            .values()
            .flatten()
            .filter(|p| !p.confirmed)
            .count()
    }

    fn evict_unconfirmed(&mut self) {
        while self.unconfirmed() > MAX_UNCONFIRMED {
            let Some((&version, candidates)) = self
                .pending
                .iter_mut()
                .rev()
                .find(|(_, c)| c.iter().any(|p| !p.confirmed))
            else {
                break;
            };
            if let Some(idx) = candidates.iter().rposition(|p| !p.confirmed) {
                candidates.remove(idx);
                debug!(version, "Dropped unconfirmed session key");
            }
            if self.pending.get(&version).is_some_and(Vec::is_empty) {
                self.pending.remove(&version);
            }
        }
    }

    fn find(&self, kv: &KeyVerifier) -> Option<&PendingKey> {
        self.pending
            .get(&kv.version)
            .and_then(|c| c.iter().find(|p| p.verifier.hash == kv.hash))
    }

    fn try_adopt(&mut self, kv: &KeyVerifier) -> bool {
        let Some(candidates) = self.pending.get_mut(&kv.version) else {
            return false;
        };
        let Some(idx) = candidates
            .iter()
            .position(|p| p.verifier.hash == kv.hash && p.confirmed && p.key.is_some())
        else {
            debug!(version = kv.version, "Session key buffered");
            return false;
        };

        let adopted = candidates.swap_remove(idx);
        self.current = adopted.verifier;
        self.key = adopted.key;
        self.pending = self.pending.split_off(&kv.version.saturating_add(1));

        info!(
            version = self.current.version,
            fingerprint = hex::encode(&self.current.hash[..8]),
            "Adopted session key"
        );
        true
    }
}
