//! Protocol and codec error types.

use thiserror::Error;

use sgc_crypto::CryptoError;
use sgc_types::Sid;

/// Errors raised while decoding a frame.
///
/// Frames come from a lossy broadcast medium; handlers log and drop them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Unexpected end of input: need {needed} bytes, {remaining} left")]
    UnexpectedEof { needed: usize, remaining: usize },

    #[error("Unknown message type {0}")]
    UnknownMessageType(u32),

    #[error("Length mismatch: declared {declared}, actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Invalid field length: expected {expected}, got {got}")]
    InvalidFieldLength { expected: usize, got: usize },

    #[error("Invalid G1 point encoding")]
    InvalidG1Point,

    #[error("Invalid G2 point encoding")]
    InvalidG2Point,

    #[error("Invalid member state {0}")]
    InvalidMemberState(u32),

    #[error("Malformed session id")]
    InvalidSid,

    #[error("Unknown size tier {0}")]
    UnknownSizeTier(u32),

    #[error("Slot {pos} out of range for group of {scale}")]
    SlotOutOfRange { pos: u32, scale: usize },

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Fatal protocol errors.
///
/// These signal misconfiguration or broken internal bookkeeping, never bad
/// input; the driver is expected to stop the node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Group size {group_size} exceeds every parameter tier")]
    UnsupportedGroupSize { group_size: usize },

    #[error("Unknown group {0}")]
    UnknownGroup(Sid),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}
