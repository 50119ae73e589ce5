//! Self-adaptive asymmetric group key agreement (SAAGKA) on BLS12-381.
//!
//! # Overview
//!
//! Members of a group jointly hold an asymmetric key pair without any
//! trusted dealer:
//!
//! 1. **Setup**: A one-time setup publishes generators and, per group-size
//!    tier, a matrix of pseudo-member rows. A new group starts out as if all
//!    of its slots were held by those pseudo members.
//!
//! 2. **Join**: A member claims a slot by publishing a join proof
//!    (`KaMaterial`). Anyone can check it with a batched pairing equation;
//!    the coordinator folds it into the group's encryption key and returns
//!    the member's decryption share.
//!
//! 3. **Stay in sync**: Members that already joined apply every later join
//!    to their own key pair, so the group key never has to be rebuilt.
//!
//! 4. **Broadcast**: Anyone holding group encryption keys can encrypt one
//!    message to several groups at once; each member decrypts its group's
//!    component with its private decryption key.

pub mod error;
pub mod hash;
pub mod keys;
pub mod params;
pub mod pki;
pub mod saagka;

pub use error::CryptoError;
pub use keys::{
    Ciphertext, CiphertextComponent, EkDelta, EncryptionKey, KaMaterial, PrivateKey, PublicKey,
};
pub use params::{PseudoRow, PseudoSlotKeys, PublicParameter, PublicParameterStore, SlotMatrix};
pub use pki::{BulletinBoard, PkiDirectory};
pub use saagka::{check_valid, decrypt_with, encrypt, kam_delta, Membership, Saagka};
