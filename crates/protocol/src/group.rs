//! Group session state.
//!
//! Every node caches one `GroupSessionInfo` per group it has heard of. The
//! coordinator additionally keeps the per-slot decryption shares `d[]` of
//! the groups it manages (see [`ManagedGroup`]).

use bls12_381::{G1Affine, G1Projective, G2Projective};
use group::Curve;

use sgc_crypto::{CryptoError, EncryptionKey, KaMaterial, PublicParameter};
use sgc_types::{Sid, Timestamp};

/// Bitmap bytes needed for `scale` slots, rounded up to whole 64-bit words.
pub fn bitmap_len(scale: usize) -> usize {
    scale.div_ceil(64) * 8
}

/// One group's public session state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSessionInfo {
    pub size_param: u16,
    pub n_member: u32,
    pub sid: Sid,
    /// Occupied slots, MSB-first within each byte.
    pub mem_bitmap: Vec<u8>,
    pub ek: EncryptionKey,
    pub expiry: Timestamp,
}

impl GroupSessionInfo {
    pub fn is_occupied(&self, pos: u32) -> bool {
        let byte = (pos / 8) as usize;
        let mask = 0x80u8 >> (pos % 8);
        self.mem_bitmap.get(byte).is_some_and(|b| b & mask != 0)
    }

    pub fn occupy(&mut self, pos: u32) {
        let byte = (pos / 8) as usize;
        if let Some(b) = self.mem_bitmap.get_mut(byte) {
            *b |= 0x80u8 >> (pos % 8);
        }
    }

    /// Occupied slots, ascending.
    pub fn occupied_slots(&self) -> Vec<u32> {
        (0..(self.mem_bitmap.len() * 8) as u32)
            .filter(|pos| self.is_occupied(*pos))
            .collect()
    }

    /// Slots whose occupancy differs between `self` and `other`.
    pub fn slot_diff(&self, other: &GroupSessionInfo) -> Vec<u32> {
        let mut slots = Vec::new();
        for (i, (a, b)) in self.mem_bitmap.iter().zip(&other.mem_bitmap).enumerate() {
            let diff = a ^ b;
            for bit in 0..8u32 {
                if diff & (0x80 >> bit) != 0 {
                    slots.push(i as u32 * 8 + bit);
                }
            }
        }
        slots
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiry < now
    }
}

/// A group as held by the coordinator.
#[derive(Clone, Debug)]
pub struct ManagedGroup {
    pub info: GroupSessionInfo,
    pub scale: usize,
    /// `d[j] = Σ_{i != j} m[i][j]`, the share handed to the holder of slot `j`.
    pub d: Vec<G1Affine>,
}

impl ManagedGroup {
    /// Seed a new group from the pseudo rows of tier `size_param`.
    pub fn bootstrap(
        params: &PublicParameter,
        seq: u16,
        size_param: u16,
        expiry: Timestamp,
    ) -> Result<Self, CryptoError> {
        let matrix = params.matrix(size_param)?;
        let scale = matrix.scale();

        let mut lambda = G2Projective::identity();
        let mut mu = G1Projective::identity();
        let mut d = vec![G1Projective::identity(); scale];

        for row in &matrix.rows {
            lambda += row.u;
            mu += row.combined();
            for (j, m) in row.commitments.iter().enumerate() {
                if let Some(m) = m {
                    d[j] += *m;
                }
            }
        }

        let info = GroupSessionInfo {
            size_param,
            n_member: 0,
            sid: Sid::new(seq, size_param, expiry),
            mem_bitmap: vec![0u8; bitmap_len(scale)],
            ek: EncryptionKey {
                lambda: lambda.to_affine(),
                mu: mu.to_affine(),
            },
            expiry,
        };

        Ok(Self {
            info,
            scale,
            d: d.iter().map(G1Projective::to_affine).collect(),
        })
    }

    pub fn is_full(&self) -> bool {
        self.info.n_member as usize >= self.scale
    }

    /// Slots still held by pseudo rows.
    pub fn free_slots(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.scale as u32).filter(|pos| !self.info.is_occupied(*pos))
    }

    /// Replace pseudo row `kam.pos` by the joiner's proof in every other
    /// slot's share.
    pub fn apply_join_shares(
        &mut self,
        params: &PublicParameter,
        kam: &KaMaterial,
    ) -> Result<(), CryptoError> {
        let matrix = params.matrix(kam.size_param)?;
        for (j, z) in kam.z.iter().enumerate() {
            let Some(z) = z else {
                continue;
            };
            let displaced = matrix.commitment(kam.pos, j as u32)?;
            if let Some(d_j) = self.d.get_mut(j) {
                *d_j = (G1Projective::from(*d_j) + z - displaced).to_affine();
            }
        }
        Ok(())
    }
}
