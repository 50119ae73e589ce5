//! Public parameters and slot matrices.
//!
//! `Setup` samples the generators and, for every supported group-size tier
//! `S`, a slot matrix of `S` pseudo-member rows. A freshly created group is
//! seeded as if those `S` anonymous members had already agreed on a key;
//! every real joiner then displaces exactly one pseudo row.
//!
//! Generators live in both source groups of BLS12-381: `g0_1 = g1^e` and
//! `g0_2 = g2^e` share the exponent `e`, so `e(g0_1, g2) == e(g1, g0_2)`.

use std::sync::Arc;

use bls12_381::{G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use group::Curve;
use rand::{CryptoRng, RngCore};
use tracing::{debug, info};

use crate::error::CryptoError;
use crate::hash::{hash_to_scalar, random_scalar};
use crate::keys::{PrivateKey, PublicKey};

/// Highest security level BLS12-381 can meet.
pub const MAX_SECURITY_LEVEL: u32 = 128;

/// Pre-committed pseudo member.
#[derive(Clone, Debug)]
pub struct PseudoRow {
    /// `m[i][j] = h_j^w + g0^(x1 + v·x2)` for every `j`; `None` at `j == i`.
    pub commitments: Vec<Option<G1Affine>>,
    pub u: G2Affine,
    pub public_key: PublicKey,
    /// `Hash("", pk, u)`.
    pub v: Scalar,
}

impl PseudoRow {
    /// Combined public contribution `y1 + v·y2`.
    pub fn combined(&self) -> G1Projective {
        self.public_key.combined(&self.v)
    }
}

/// Pseudo rows of one size tier.
#[derive(Clone, Debug)]
pub struct SlotMatrix {
    pub rows: Vec<PseudoRow>,
}

impl SlotMatrix {
    pub fn scale(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, pos: u32) -> Result<&PseudoRow, CryptoError> {
        self.rows.get(pos as usize).ok_or(CryptoError::SlotOutOfRange {
            pos: pos as usize,
            scale: self.rows.len(),
        })
    }

    /// Off-diagonal commitment `m[row][col]`.
    pub fn commitment(&self, row: u32, col: u32) -> Result<G1Affine, CryptoError> {
        let scale = self.scale();
        self.row(row)?
            .commitments
            .get(col as usize)
            .copied()
            .flatten()
            .ok_or(CryptoError::SlotOutOfRange {
                pos: col as usize,
                scale,
            })
    }
}

/// Diagonal commitments `m[i][i]` of every tier.
///
/// Never published. Whoever holds them can derive the decryption key of any
/// slot still occupied by its pseudo row.
#[derive(Clone)]
pub struct PseudoSlotKeys {
    diagonals: Vec<Vec<G1Affine>>,
}

impl PseudoSlotKeys {
    pub fn diagonal(&self, size_param: u16, pos: u32) -> Option<G1Affine> {
        self.diagonals
            .get(size_param as usize)
            .and_then(|tier| tier.get(pos as usize))
            .copied()
    }
}

/// Global algebraic constants shared by every node.
#[derive(Clone, Debug)]
pub struct PublicParameter {
    pub security_level: u32,
    pub g1: G1Affine,
    pub g0_1: G1Affine,
    pub g2: G2Affine,
    pub g0_2: G2Affine,
    /// Per-slot generators `h[0..max_group_size)`.
    pub h: Vec<G1Affine>,
    /// One matrix per tier; index is the `size_param`.
    pub matrices: Vec<SlotMatrix>,
}

impl PublicParameter {
    /// Sample fresh parameters.
    ///
    /// Tiers are `size_step, 2·size_step, ...` up to and including
    /// `max_group_size`.
    pub fn setup<R: RngCore + CryptoRng>(
        security_level: u32,
        max_group_size: usize,
        size_step: usize,
        rng: &mut R,
    ) -> Result<(Self, PseudoSlotKeys), CryptoError> {
        if security_level > MAX_SECURITY_LEVEL {
            return Err(CryptoError::UnsupportedSecurityLevel(security_level));
        }
        if size_step == 0 || max_group_size < size_step || max_group_size > u32::MAX as usize {
            return Err(CryptoError::InvalidSizeTiers {
                max_group_size,
                size_step,
            });
        }

        let e = random_scalar(rng);
        let g1 = G1Affine::generator();
        let g2 = G2Affine::generator();
        let g0_1 = (G1Projective::generator() * e).to_affine();
        let g0_2 = (G2Projective::generator() * e).to_affine();

        let h: Vec<G1Affine> = (0..max_group_size)
            .map(|_| (G1Projective::generator() * random_scalar(rng)).to_affine())
            .collect();

        let mut params = Self {
            security_level,
            g1,
            g0_1,
            g2,
            g0_2,
            h,
            matrices: Vec::new(),
        };

        let mut diagonals = Vec::new();
        let mut scale = size_step;
        while scale <= max_group_size {
            let (matrix, diagonal) = params.gen_one_matrix(scale, rng);
            params.matrices.push(matrix);
            diagonals.push(diagonal);
            scale += size_step;
        }

        info!(
            security_level,
            max_group_size,
            tiers = params.matrices.len(),
            "Public parameters generated"
        );

        Ok((params, PseudoSlotKeys { diagonals }))
    }

    fn gen_one_matrix<R: RngCore + CryptoRng>(
        &self,
        scale: usize,
        rng: &mut R,
    ) -> (SlotMatrix, Vec<G1Affine>) {
        let mut rows = Vec::with_capacity(scale);
        let mut diagonal = Vec::with_capacity(scale);

        for i in 0..scale {
            let secret = PrivateKey::random(rng);
            let public_key = secret.public_key();
            let w = random_scalar(rng);
            let u = (G2Projective::generator() * w).to_affine();
            let v = hash_to_scalar(&[], &public_key, &u);
            let base = G1Projective::from(self.g0_1) * secret.exponent(&v);

            let mut commitments = Vec::with_capacity(scale);
            for (j, h_j) in self.h[..scale].iter().enumerate() {
                let m = (base + h_j * w).to_affine();
                if i == j {
                    diagonal.push(m);
                    commitments.push(None);
                } else {
                    commitments.push(Some(m));
                }
            }

            rows.push(PseudoRow {
                commitments,
                u,
                public_key,
                v,
            });
        }

        debug!(scale, "Slot matrix generated");
        (SlotMatrix { rows }, diagonal)
    }

    pub fn matrix(&self, size_param: u16) -> Result<&SlotMatrix, CryptoError> {
        self.matrices
            .get(size_param as usize)
            .ok_or(CryptoError::UnknownSizeTier(size_param))
    }

    /// Number of slots in tier `size_param`.
    pub fn scale(&self, size_param: u16) -> Result<usize, CryptoError> {
        self.matrix(size_param).map(SlotMatrix::scale)
    }

    /// Smallest tier that holds `group_size` members.
    pub fn tier_for_group_size(&self, group_size: usize) -> Option<u16> {
        self.matrices
            .iter()
            .position(|m| m.scale() >= group_size)
            .and_then(|idx| u16::try_from(idx).ok())
    }

    pub fn tier_count(&self) -> usize {
        self.matrices.len()
    }
}

/// Owner of the one-time setup.
///
/// The first `setup` call builds the parameters; later calls hand back the
/// same instance.
#[derive(Default)]
pub struct PublicParameterStore {
    built: Option<(Arc<PublicParameter>, Arc<PseudoSlotKeys>)>,
}

impl PublicParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn setup<R: RngCore + CryptoRng>(
        &mut self,
        security_level: u32,
        max_group_size: usize,
        size_step: usize,
        rng: &mut R,
    ) -> Result<Arc<PublicParameter>, CryptoError> {
        if let Some((params, _)) = &self.built {
            debug!("Setup already performed, reusing public parameters");
            return Ok(params.clone());
        }

        let (params, keys) =
            PublicParameter::setup(security_level, max_group_size, size_step, rng)?;
        let params = Arc::new(params);
        self.built = Some((params.clone(), Arc::new(keys)));
        Ok(params)
    }

    pub fn params(&self) -> Option<Arc<PublicParameter>> {
        self.built.as_ref().map(|(params, _)| params.clone())
    }

    /// Diagonal commitments, for the coordinator only.
    pub fn pseudo_slot_keys(&self) -> Option<Arc<PseudoSlotKeys>> {
        self.built.as_ref().map(|(_, keys)| keys.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bls12_381::pairing;
    use rand::rngs::OsRng;

    #[test]
    fn test_setup_tiers() {
        let (params, keys) = PublicParameter::setup(80, 6, 2, &mut OsRng).unwrap();

        assert_eq!(params.h.len(), 6);
        assert_eq!(params.tier_count(), 3);
        assert_eq!(params.scale(0).unwrap(), 2);
        assert_eq!(params.scale(2).unwrap(), 6);
        assert!(params.scale(3).is_err());

        assert_eq!(params.tier_for_group_size(1), Some(0));
        assert_eq!(params.tier_for_group_size(3), Some(1));
        assert_eq!(params.tier_for_group_size(6), Some(2));
        assert_eq!(params.tier_for_group_size(7), None);

        assert!(keys.diagonal(2, 5).is_some());
        assert!(keys.diagonal(0, 2).is_none());
    }

    #[test]
    fn test_setup_rejects_bad_arguments() {
        assert_eq!(
            PublicParameter::setup(256, 10, 10, &mut OsRng).err(),
            Some(CryptoError::UnsupportedSecurityLevel(256))
        );
        assert!(PublicParameter::setup(80, 10, 0, &mut OsRng).is_err());
        assert!(PublicParameter::setup(80, 5, 10, &mut OsRng).is_err());
    }

    #[test]
    fn test_generators_share_exponent() {
        let (params, _) = PublicParameter::setup(80, 2, 2, &mut OsRng).unwrap();
        assert_eq!(
            pairing(&params.g0_1, &params.g2),
            pairing(&params.g1, &params.g0_2)
        );
    }

    #[test]
    fn test_matrix_rows_leave_diagonal_out() {
        let (params, keys) = PublicParameter::setup(80, 3, 3, &mut OsRng).unwrap();
        let matrix = params.matrix(0).unwrap();

        for (i, row) in matrix.rows.iter().enumerate() {
            assert_eq!(row.commitments.len(), 3);
            for (j, m) in row.commitments.iter().enumerate() {
                assert_eq!(m.is_none(), i == j);
            }
            assert!(matrix.commitment(i as u32, i as u32).is_err());
            assert_eq!(row.v, hash_to_scalar(&[], &row.public_key, &row.u));
        }

        // Row commitments differ only by the h_j^w term
        let row = &matrix.rows[0];
        let d = keys.diagonal(0, 0).unwrap();
        let lhs = pairing(
            &(G1Projective::from(row.commitments[1].unwrap()) - d).to_affine(),
            &params.g2,
        );
        let rhs = pairing(
            &(G1Projective::from(params.h[1]) - params.h[0]).to_affine(),
            &row.u,
        );
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_store_setup_is_idempotent() {
        let mut store = PublicParameterStore::new();
        assert!(store.params().is_none());

        let first = store.setup(80, 4, 2, &mut OsRng).unwrap();
        let second = store.setup(80, 10, 5, &mut OsRng).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.tier_count(), 2);
        assert!(store.pseudo_slot_keys().is_some());
    }
}
