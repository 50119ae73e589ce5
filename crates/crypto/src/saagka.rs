//! Self-adaptive asymmetric group key agreement.
//!
//! # Joining
//!
//! A joiner targeting slot `pos` of a group in tier `S`:
//! 1. Samples `w`, computes `u = g2^w` and `v = H(sid, pk, u)`
//! 2. Computes `z_j = g0^(x1 + v·x2) + h_j^w` for every slot `j`
//! 3. Publishes every `z_j` except `z_pos`, which it keeps
//!
//! The verifier checks the proof with one batched pairing equation and
//! replaces pseudo row `pos` with the joiner's contribution:
//! `ek += (u - u_pos, pk·v - pk_pos·v_pos)` and `d_j += z_j - m[pos][j]`.
//! The joiner's decryption key is `dk = d_pos + z_pos`.
//!
//! # Broadcast encryption
//!
//! With ephemeral `omega`: `c1 = g2^omega`, and per group key
//! `c2 = lambda^omega`, `c3 = msg ⊕ H(e(mu, g0)^omega)`. A member at slot
//! `pos` recovers the mask as `e(dk, c1) / e(h_pos, c2)`.

use std::sync::Arc;

use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::Curve;
use rand::{CryptoRng, RngCore};
use tracing::{debug, warn};

use sgc_types::Sid;

use crate::error::CryptoError;
use crate::hash::{hash_to_bytes, hash_to_scalar, random_scalar, xor_in_place};
use crate::keys::{
    Ciphertext, CiphertextComponent, EkDelta, EncryptionKey, KaMaterial, PrivateKey, PublicKey,
};
use crate::params::PublicParameter;
use crate::pki::PkiDirectory;

/// Attempts at finding a free directory id before giving up.
const MAX_ID_ATTEMPTS: usize = 16;

struct NodeKey {
    secret: PrivateKey,
    public: PublicKey,
    pk_id: u32,
    /// Set once the key has backed a join attempt.
    used: bool,
}

/// State stashed by `message_gen` until the coordinator answers.
struct PendingJoin {
    sid: Sid,
    pos: u32,
    reserved: G1Affine,
    ek: EncryptionKey,
}

/// A derived group key pair.
#[derive(Clone)]
pub struct Membership {
    pub sid: Sid,
    pub pos: u32,
    pub ek: EncryptionKey,
    dk: G1Affine,
}

/// Per-node key agreement engine.
pub struct Saagka {
    params: Arc<PublicParameter>,
    pki: Arc<dyn PkiDirectory>,
    key: Option<NodeKey>,
    pending: Option<PendingJoin>,
    membership: Option<Membership>,
}

impl Saagka {
    pub fn new(params: Arc<PublicParameter>, pki: Arc<dyn PkiDirectory>) -> Self {
        Self {
            params,
            pki,
            key: None,
            pending: None,
            membership: None,
        }
    }

    pub fn params(&self) -> &Arc<PublicParameter> {
        &self.params
    }

    /// Generate a fresh key pair and publish it. Returns the directory id.
    pub fn key_gen<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<u32, CryptoError> {
        let key = self.fresh_key(rng)?;
        let pk_id = key.pk_id;
        self.key = Some(key);
        Ok(pk_id)
    }

    fn fresh_key<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<NodeKey, CryptoError> {
        let secret = PrivateKey::random(rng);
        let public = secret.public_key();

        for _ in 0..MAX_ID_ATTEMPTS {
            let pk_id = rng.next_u32();
            if self.pki.upload(pk_id, public) {
                debug!(pk_id, "Published public key");
                return Ok(NodeKey {
                    secret,
                    public,
                    pk_id,
                    used: false,
                });
            }
        }

        Err(CryptoError::KeyIdExhausted)
    }

    /// Directory id of the current key, if one was generated.
    pub fn pk_id(&self) -> Option<u32> {
        self.key.as_ref().map(|k| k.pk_id)
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.key.as_ref().map(|k| k.public)
    }

    /// Build a join proof for slot `pos` of the group `sid`.
    ///
    /// A key that already backed an attempt is replaced first. The proof's
    /// effect on `current_ek` is precomputed and held until
    /// [`Saagka::asym_key_derive`].
    pub fn message_gen<R: RngCore + CryptoRng>(
        &mut self,
        sid: Sid,
        current_ek: &EncryptionKey,
        size_param: u16,
        pos: u32,
        rng: &mut R,
    ) -> Result<KaMaterial, CryptoError> {
        let scale = self.params.scale(size_param)?;
        if pos as usize >= scale {
            return Err(CryptoError::SlotOutOfRange {
                pos: pos as usize,
                scale,
            });
        }

        let mut key = match self.key.take() {
            Some(key) if !key.used => key,
            _ => self.fresh_key(rng)?,
        };

        let w = random_scalar(rng);
        let u = (G2Projective::generator() * w).to_affine();
        let v = hash_to_scalar(sid.as_bytes(), &key.public, &u);
        let base = G1Projective::from(self.params.g0_1) * key.secret.exponent(&v);

        let mut z: Vec<Option<G1Affine>> = self.params.h[..scale]
            .iter()
            .map(|h_j| Some((base + h_j * w).to_affine()))
            .collect();
        let reserved = z[pos as usize].take().unwrap_or_else(G1Affine::identity);

        let delta = join_delta(&self.params, size_param, pos, &key.public, &v, &u)?;
        self.pending = Some(PendingJoin {
            sid,
            pos,
            reserved,
            ek: current_ek.apply(&delta),
        });

        key.used = true;
        let pk_id = key.pk_id;
        self.key = Some(key);

        debug!(sid = %sid, pos, pk_id, "Generated join proof");

        Ok(KaMaterial {
            pk_id,
            size_param,
            pos,
            sid,
            u,
            z,
        })
    }

    /// Complete a join with the coordinator's share `d` for slot `pos`.
    ///
    /// Fails, leaving every field untouched, unless `(sid, pos)` match the
    /// last `message_gen` call and `expected_ek` equals the precomputed key.
    pub fn asym_key_derive(
        &mut self,
        sid: Sid,
        pos: u32,
        d: &G1Affine,
        expected_ek: &EncryptionKey,
    ) -> bool {
        let Some(pending) = &self.pending else {
            debug!("No join in progress");
            return false;
        };

        if pending.sid != sid || pending.pos != pos {
            debug!(sid = %sid, pos, "Join acknowledgement for another slot");
            return false;
        }

        if pending.ek != *expected_ek {
            warn!(sid = %sid, pos, "Coordinator encryption key differs from precomputed key");
            return false;
        }

        let dk = (G1Projective::from(*d) + pending.reserved).to_affine();
        self.membership = Some(Membership {
            sid,
            pos,
            ek: pending.ek,
            dk,
        });
        self.pending = None;
        true
    }

    /// Fold another member's join into this node's key pair.
    pub fn update_key(&mut self, kam: &KaMaterial) -> Result<(), CryptoError> {
        let membership = self.membership.as_ref().ok_or(CryptoError::NotJoined)?;
        let my_pos = membership.pos;

        let z_mine = kam
            .z
            .get(my_pos as usize)
            .copied()
            .flatten()
            .ok_or(CryptoError::SlotOutOfRange {
                pos: my_pos as usize,
                scale: kam.scale(),
            })?;
        let displaced = self
            .params
            .matrix(kam.size_param)?
            .commitment(kam.pos, my_pos)?;
        let delta = kam_delta(&self.params, self.pki.as_ref(), kam)?;

        if let Some(membership) = self.membership.as_mut() {
            membership.ek = membership.ek.apply(&delta);
            membership.dk = (G1Projective::from(membership.dk) + z_mine - displaced).to_affine();
        }
        Ok(())
    }

    /// Forget an unanswered join attempt.
    pub fn abandon_join(&mut self) {
        self.pending = None;
    }

    pub fn membership(&self) -> Option<&Membership> {
        self.membership.as_ref()
    }

    pub fn encryption_key(&self) -> Option<&EncryptionKey> {
        self.membership.as_ref().map(|m| &m.ek)
    }

    /// Decrypt component `index` of `ct` with this node's group key.
    pub fn decrypt(&self, ct: &Ciphertext, index: usize) -> Result<Vec<u8>, CryptoError> {
        let membership = self.membership.as_ref().ok_or(CryptoError::NotJoined)?;
        decrypt_with(&self.params, &membership.dk, membership.pos, ct, index)
    }
}

/// Change in `ek` caused by `pk` taking over pseudo row `pos`.
fn join_delta(
    params: &PublicParameter,
    size_param: u16,
    pos: u32,
    pk: &PublicKey,
    v: &Scalar,
    u: &G2Affine,
) -> Result<EkDelta, CryptoError> {
    let row = params.matrix(size_param)?.row(pos)?;
    Ok(EkDelta {
        lambda: G2Projective::from(*u) - row.u,
        mu: pk.combined(v) - row.combined(),
    })
}

/// Change in `ek` caused by the join described by `kam`.
pub fn kam_delta(
    params: &PublicParameter,
    pki: &dyn PkiDirectory,
    kam: &KaMaterial,
) -> Result<EkDelta, CryptoError> {
    let pk = pki
        .get(kam.pk_id)
        .ok_or(CryptoError::UnknownPublicKey(kam.pk_id))?;
    let v = hash_to_scalar(kam.sid.as_bytes(), &pk, &kam.u);
    join_delta(params, kam.size_param, kam.pos, &pk, &v, &kam.u)
}

/// Verify a join proof.
///
/// Checks, with fresh random weights `r_j` over every `j != pos`:
/// `e(Σ r_j·z_j, g2) == e((y1 + v·y2)·Σ r_j, g0) · e(Σ r_j·h_j, u)`.
pub fn check_valid<R: RngCore + CryptoRng>(
    params: &PublicParameter,
    pki: &dyn PkiDirectory,
    kam: &KaMaterial,
    rng: &mut R,
) -> bool {
    let Ok(scale) = params.scale(kam.size_param) else {
        return false;
    };
    let pos = kam.pos as usize;
    if kam.z.len() != scale || pos >= scale || kam.z[pos].is_some() {
        return false;
    }
    let Some(pk) = pki.get(kam.pk_id) else {
        debug!(pk_id = kam.pk_id, "Join proof references unknown public key");
        return false;
    };

    let v = hash_to_scalar(kam.sid.as_bytes(), &pk, &kam.u);
    let mut sum_z = G1Projective::identity();
    let mut sum_h = G1Projective::identity();
    let mut sum_r = Scalar::ZERO;

    for (j, z_j) in kam.z.iter().enumerate() {
        if j == pos {
            continue;
        }
        let Some(z_j) = z_j else {
            return false;
        };
        let r = random_scalar(rng);
        sum_z += z_j * r;
        sum_h += params.h[j] * r;
        sum_r += r;
    }

    let lhs = pairing(&sum_z.to_affine(), &params.g2);
    let rhs = pairing(&(pk.combined(&v) * sum_r).to_affine(), &params.g0_2)
        + pairing(&sum_h.to_affine(), &kam.u);

    lhs == rhs
}

/// Encrypt `msg` to every group whose key is in `eks`, in order.
pub fn encrypt<R: RngCore + CryptoRng>(
    params: &PublicParameter,
    msg: &[u8],
    eks: &[EncryptionKey],
    rng: &mut R,
) -> Ciphertext {
    let omega = random_scalar(rng);
    let c1 = (G2Projective::generator() * omega).to_affine();

    let components = eks
        .iter()
        .map(|ek| {
            let c2 = (ek.lambda * omega).to_affine();
            let shared = pairing(&(ek.mu * omega).to_affine(), &params.g0_2);
            let mut c3 = msg.to_vec();
            xor_in_place(&mut c3, &hash_to_bytes(&shared, msg.len()));
            CiphertextComponent { c2, c3 }
        })
        .collect();

    Ciphertext { c1, components }
}

/// Decrypt component `index` of `ct` with decryption key `dk` of slot `pos`.
///
/// A wrong key yields garbage, not an error; callers check the result
/// against a fingerprint.
pub fn decrypt_with(
    params: &PublicParameter,
    dk: &G1Affine,
    pos: u32,
    ct: &Ciphertext,
    index: usize,
) -> Result<Vec<u8>, CryptoError> {
    let component = ct
        .components
        .get(index)
        .ok_or(CryptoError::CiphertextIndexOutOfRange {
            index,
            count: ct.components.len(),
        })?;
    let h_pos = params.h.get(pos as usize).ok_or(CryptoError::SlotOutOfRange {
        pos: pos as usize,
        scale: params.h.len(),
    })?;

    let gt1 = pairing(dk, &ct.c1);
    let gt2 = pairing(h_pos, &component.c2);
    let mut msg = component.c3.clone();
    let len = msg.len();
    xor_in_place(&mut msg, &hash_to_bytes(&(gt1 - gt2), len));
    Ok(msg)
}
