//! Public-key directory.
//!
//! Nodes publish their SAAGKA public key under a numeric id; verifiers look
//! it up when checking a join proof. Entries are insert-once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::keys::PublicKey;

/// Directory of published public keys.
pub trait PkiDirectory: Send + Sync {
    /// Publish `pk` under `id`. Returns `false` if `id` is already taken.
    fn upload(&self, id: u32, pk: PublicKey) -> bool;

    fn get(&self, id: u32) -> Option<PublicKey>;
}

/// In-memory bulletin board. Clones share the same entries.
#[derive(Clone, Default)]
pub struct BulletinBoard {
    entries: Arc<RwLock<HashMap<u32, PublicKey>>>,
}

impl BulletinBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl PkiDirectory for BulletinBoard {
    fn upload(&self, id: u32, pk: PublicKey) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            return false;
        }
        entries.insert(id, pk);
        true
    }

    fn get(&self, id: u32) -> Option<PublicKey> {
        self.entries.read().get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PrivateKey;
    use rand::rngs::OsRng;

    #[test]
    fn test_first_writer_wins() {
        let board = BulletinBoard::new();
        let first = PrivateKey::random(&mut OsRng).public_key();
        let second = PrivateKey::random(&mut OsRng).public_key();

        assert!(board.upload(7, first));
        assert!(!board.upload(7, second));
        assert_eq!(board.get(7), Some(first));
        assert_eq!(board.get(8), None);
    }

    #[test]
    fn test_clones_share_entries() {
        let board = BulletinBoard::new();
        let view = board.clone();
        let pk = PrivateKey::random(&mut OsRng).public_key();

        assert!(board.upload(1, pk));
        assert_eq!(view.get(1), Some(pk));
        assert_eq!(view.len(), 1);
    }
}
