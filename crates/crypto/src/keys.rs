//! Key and proof types of the SAAGKA scheme.

use std::fmt;

use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Gt, Scalar};
use group::Curve;
use rand::{CryptoRng, RngCore};

use sgc_types::Sid;

use crate::hash::random_scalar;
use crate::params::PublicParameter;

/// Private key `(x1, x2)`.
#[derive(Clone)]
pub struct PrivateKey {
    x1: Scalar,
    x2: Scalar,
}

impl PrivateKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            x1: random_scalar(rng),
            x2: random_scalar(rng),
        }
    }

    /// `(y1, y2) = (g^x1, g^x2)`.
    pub fn public_key(&self) -> PublicKey {
        let g = G1Projective::generator();
        PublicKey {
            y1: (g * self.x1).to_affine(),
            y2: (g * self.x2).to_affine(),
        }
    }

    /// `x1 + v·x2`, the exponent committed to by a join proof.
    pub(crate) fn exponent(&self, v: &Scalar) -> Scalar {
        self.x1 + self.x2 * v
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Public key `(y1, y2)` published in the PKI directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub y1: G1Affine,
    pub y2: G1Affine,
}

impl PublicKey {
    /// `y1 + v·y2`.
    pub fn combined(&self, v: &Scalar) -> G1Projective {
        G1Projective::from(self.y1) + self.y2 * v
    }
}

/// Aggregate group encryption key.
///
/// `lambda = Σ u_i` over every slot of the group. The GT component is
/// `e(mu, g0)`; it is kept as its G1 preimage `mu = Σ (y1_i + v_i·y2_i)` so
/// that it has a canonical encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionKey {
    pub lambda: G2Affine,
    pub mu: G1Affine,
}

impl EncryptionKey {
    /// GT component of the key.
    pub fn mu_gt(&self, params: &PublicParameter) -> Gt {
        pairing(&self.mu, &params.g0_2)
    }

    /// Apply the change caused by a slot changing hands.
    pub fn apply(&self, delta: &EkDelta) -> EncryptionKey {
        EncryptionKey {
            lambda: (G2Projective::from(self.lambda) + delta.lambda).to_affine(),
            mu: (G1Projective::from(self.mu) + delta.mu).to_affine(),
        }
    }
}

/// Difference between a real joiner's contribution and the pseudo row it
/// displaces.
#[derive(Clone, Copy, Debug)]
pub struct EkDelta {
    pub lambda: G2Projective,
    pub mu: G1Projective,
}

/// Join proof for a target slot.
///
/// `z[pos]` is the joiner's reserved value and is always `None` here: it
/// never leaves the joiner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KaMaterial {
    pub pk_id: u32,
    pub size_param: u16,
    pub pos: u32,
    pub sid: Sid,
    pub u: G2Affine,
    pub z: Vec<Option<G1Affine>>,
}

impl KaMaterial {
    /// Number of slots of the target group.
    pub fn scale(&self) -> usize {
        self.z.len()
    }
}

/// One recipient group's share of a broadcast ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CiphertextComponent {
    pub c2: G2Affine,
    pub c3: Vec<u8>,
}

/// Broadcast ciphertext. All components share the ephemeral `c1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ciphertext {
    pub c1: G2Affine,
    pub components: Vec<CiphertextComponent>,
}

impl Ciphertext {
    /// Length of the encrypted message.
    pub fn message_len(&self) -> usize {
        self.components.first().map_or(0, |c| c.c3.len())
    }
}
