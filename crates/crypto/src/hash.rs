//! Hash functions used by the key agreement.
//!
//! - `hash_to_scalar` binds a join attempt `(sid, pk, u)` to a non-zero scalar.
//! - `hash_to_bytes` stretches a pairing output into a keystream of any
//!   length (SHA-256 in counter mode, 32 bytes per block).

use bls12_381::{G2Affine, Gt, Scalar};
use ff::Field;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::keys::PublicKey;

const SCALAR_DOMAIN: &[u8] = b"SAAGKA_HASH_TO_SCALAR_V1:";
const STREAM_DOMAIN: &[u8] = b"SAAGKA_HASH_TO_BYTES_V1:";

/// Hash a join context to a scalar in `[1, q)`.
///
/// Pseudo rows built at setup time are hashed with an empty `sid`.
pub fn hash_to_scalar(sid: &[u8], pk: &PublicKey, u: &G2Affine) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(SCALAR_DOMAIN);
    hasher.update((sid.len() as u16).to_be_bytes());
    hasher.update(sid);
    hasher.update(pk.y1.to_compressed());
    hasher.update(pk.y2.to_compressed());
    hasher.update(u.to_compressed());
    let hash = hasher.finalize();

    // Digest is read big-endian; from_bytes_wide expects little-endian
    let mut wide = [0u8; 64];
    for (dst, src) in wide.iter_mut().zip(hash.iter().rev()) {
        *dst = *src;
    }
    let v = Scalar::from_bytes_wide(&wide);

    if bool::from(v.is_zero()) {
        Scalar::ONE
    } else {
        v
    }
}

/// Derive `len` keystream bytes from a GT element.
pub fn hash_to_bytes(gt: &Gt, len: usize) -> Vec<u8> {
    let seed = gt_to_bytes(gt);
    let mut out = Vec::with_capacity(len + 32);
    let mut counter = 0u32;

    while out.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(STREAM_DOMAIN);
        hasher.update(&seed);
        hasher.update(counter.to_be_bytes());
        out.extend_from_slice(&hasher.finalize());
        counter = counter.wrapping_add(1);
    }

    out.truncate(len);
    out
}

/// Serialize a GT element to bytes.
fn gt_to_bytes(gt: &Gt) -> Vec<u8> {
    // bls12_381 exposes no GT encoding; the Debug form prints every Fp
    // coefficient in canonical big-endian hex, which is deterministic.
    format!("{:?}", gt).into_bytes()
}

/// XOR `mask` into `data`. Both must have the same length.
pub(crate) fn xor_in_place(data: &mut [u8], mask: &[u8]) {
    for (byte, m) in data.iter_mut().zip(mask) {
        *byte ^= m;
    }
}

/// Generate a random scalar.
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    let mut bytes = [0u8; 64];
    rng.fill_bytes(&mut bytes);
    Scalar::from_bytes_wide(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bls12_381::{pairing, G1Affine, G1Projective, G2Projective};
    use group::Curve;
    use rand::rngs::OsRng;

    fn random_pk() -> PublicKey {
        let mut rng = OsRng;
        PublicKey {
            y1: (G1Projective::generator() * random_scalar(&mut rng)).to_affine(),
            y2: (G1Projective::generator() * random_scalar(&mut rng)).to_affine(),
        }
    }

    #[test]
    fn test_hash_to_scalar_binds_every_input() {
        let pk = random_pk();
        let other_pk = random_pk();
        let u = G2Affine::generator();
        let other_u = (G2Projective::generator() * Scalar::from(2u64)).to_affine();

        let base = hash_to_scalar(b"sid-a", &pk, &u);
        assert_eq!(base, hash_to_scalar(b"sid-a", &pk, &u));
        assert_ne!(base, hash_to_scalar(b"sid-b", &pk, &u));
        assert_ne!(base, hash_to_scalar(b"", &pk, &u));
        assert_ne!(base, hash_to_scalar(b"sid-a", &other_pk, &u));
        assert_ne!(base, hash_to_scalar(b"sid-a", &pk, &other_u));
        assert!(!bool::from(base.is_zero()));
    }

    #[test]
    fn test_hash_to_bytes_lengths_and_prefix() {
        let gt = pairing(&G1Affine::generator(), &G2Affine::generator());

        assert!(hash_to_bytes(&gt, 0).is_empty());
        let short = hash_to_bytes(&gt, 20);
        let long = hash_to_bytes(&gt, 70);
        assert_eq!(short.len(), 20);
        assert_eq!(long.len(), 70);
        // Counter mode: a shorter stream is a prefix of a longer one
        assert_eq!(&long[..20], &short[..]);
        // Distinct blocks
        assert_ne!(&long[..32], &long[32..64]);
    }

    #[test]
    fn test_hash_to_bytes_depends_on_element() {
        let g = pairing(&G1Affine::generator(), &G2Affine::generator());
        let g2 = g + g;
        assert_ne!(hash_to_bytes(&g, 32), hash_to_bytes(&g2, 32));
    }
}
