//! Error types for cryptographic operations.

use thiserror::Error;

/// Errors that can occur during key agreement operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Unsupported security level {0} (at most 128 bits)")]
    UnsupportedSecurityLevel(u32),

    #[error("Invalid size tiers: max group size {max_group_size}, step {size_step}")]
    InvalidSizeTiers { max_group_size: usize, size_step: usize },

    #[error("Unknown size tier {0}")]
    UnknownSizeTier(u16),

    #[error("Slot {pos} out of range for group of {scale}")]
    SlotOutOfRange { pos: usize, scale: usize },

    #[error("Public key {0} not found in directory")]
    UnknownPublicKey(u32),

    #[error("Could not allocate a public key id")]
    KeyIdExhausted,

    #[error("Node has not derived a group decryption key")]
    NotJoined,

    #[error("Ciphertext has no component {index} (holds {count})")]
    CiphertextIndexOutOfRange { index: usize, count: usize },
}
