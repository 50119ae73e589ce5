//! Big-endian byte writer and reader.
//!
//! Cryptographic values are written as a 2-byte length followed by their
//! compressed encoding; integers are fixed-width big-endian.

use bls12_381::{G1Affine, G2Affine};

use sgc_types::{Sid, Timestamp, SID_LEN};

use crate::error::CodecError;

const G1_LEN: usize = 48;
const G2_LEN: usize = 96;

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Write `bytes` behind a 2-byte length.
    pub fn put_prefixed(&mut self, bytes: &[u8]) {
        self.put_u16(bytes.len() as u16);
        self.put_bytes(bytes);
    }

    pub fn put_g1(&mut self, point: &G1Affine) {
        self.put_prefixed(&point.to_compressed());
    }

    pub fn put_g2(&mut self, point: &G2Affine) {
        self.put_prefixed(&point.to_compressed());
    }

    pub fn put_sid(&mut self, sid: &Sid) {
        self.put_bytes(sid.as_bytes());
    }

    pub fn put_timestamp(&mut self, ts: Timestamp) {
        self.put_u64(ts.as_micros());
    }

    /// Reserve a u32 to be filled in by [`ByteWriter::patch_u32`].
    pub fn reserve_u32(&mut self) -> usize {
        let offset = self.buf.len();
        self.put_u32(0);
        offset
    }

    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an input buffer.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn get_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub fn get_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.get_bytes(N)?);
        Ok(out)
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        self.get_array().map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        self.get_array().map(u32::from_be_bytes)
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        self.get_array().map(u64::from_be_bytes)
    }

    /// Read a field written by [`ByteWriter::put_prefixed`].
    pub fn get_prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.get_u16()? as usize;
        self.get_bytes(len)
    }

    fn get_prefixed_exact<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let bytes = self.get_prefixed()?;
        bytes
            .try_into()
            .map_err(|_| CodecError::InvalidFieldLength {
                expected: N,
                got: bytes.len(),
            })
    }

    pub fn get_g1(&mut self) -> Result<G1Affine, CodecError> {
        let bytes = self.get_prefixed_exact::<G1_LEN>()?;
        G1Affine::from_compressed(&bytes)
            .into_option()
            .ok_or(CodecError::InvalidG1Point)
    }

    pub fn get_g2(&mut self) -> Result<G2Affine, CodecError> {
        let bytes = self.get_prefixed_exact::<G2_LEN>()?;
        G2Affine::from_compressed(&bytes)
            .into_option()
            .ok_or(CodecError::InvalidG2Point)
    }

    pub fn get_sid(&mut self) -> Result<Sid, CodecError> {
        let sid = Sid(self.get_array::<SID_LEN>()?);
        if !sid.is_well_formed() {
            return Err(CodecError::InvalidSid);
        }
        Ok(sid)
    }

    pub fn get_timestamp(&mut self) -> Result<Timestamp, CodecError> {
        self.get_u64().map(Timestamp::from_micros)
    }

    /// Fail if anything is left unread.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bls12_381::{G1Projective, G2Projective, Scalar};
    use group::Curve;

    #[test]
    fn test_integers_are_big_endian() {
        let mut w = ByteWriter::new();
        w.put_u16(0x0102);
        w.put_u32(0x03040506);
        w.put_u64(0x0708090a0b0c0d0e);
        let bytes = w.into_bytes();

        assert_eq!(bytes, (1u8..=14).collect::<Vec<_>>());

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_u16().unwrap(), 0x0102);
        assert_eq!(r.get_u32().unwrap(), 0x03040506);
        assert_eq!(r.get_u64().unwrap(), 0x0708090a0b0c0d0e);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_points_carry_length_prefix() {
        let p = (G1Projective::generator() * Scalar::from(5u64)).to_affine();
        let q = (G2Projective::generator() * Scalar::from(7u64)).to_affine();

        let mut w = ByteWriter::new();
        w.put_g1(&p);
        w.put_g2(&q);
        let bytes = w.into_bytes();

        assert_eq!(&bytes[..2], &[0, 48]);
        assert_eq!(&bytes[50..52], &[0, 96]);
        assert_eq!(bytes.len(), 2 + 48 + 2 + 96);

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.get_g1().unwrap(), p);
        assert_eq!(r.get_g2().unwrap(), q);
    }

    #[test]
    fn test_reader_errors() {
        let mut r = ByteReader::new(&[0, 1]);
        assert_eq!(
            r.get_u32(),
            Err(CodecError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );

        // Length prefix says 3 bytes, G1 needs 48
        let mut r = ByteReader::new(&[0, 3, 1, 2, 3]);
        assert_eq!(
            r.get_g1(),
            Err(CodecError::InvalidFieldLength {
                expected: 48,
                got: 3
            })
        );

        let mut bad = vec![0, 48];
        bad.extend_from_slice(&[0xffu8; 48]);
        assert_eq!(ByteReader::new(&bad).get_g1(), Err(CodecError::InvalidG1Point));

        assert_eq!(
            ByteReader::new(&[0u8; 16]).get_sid(),
            Err(CodecError::InvalidSid)
        );
        assert_eq!(
            ByteReader::new(&[1, 2]).finish(),
            Err(CodecError::TrailingBytes(2))
        );
    }

    #[test]
    fn test_patch_u32() {
        let mut w = ByteWriter::new();
        w.put_u16(9);
        let at = w.reserve_u32();
        w.put_bytes(&[1, 2, 3]);
        let len = w.len() as u32;
        w.patch_u32(at, len);

        let bytes = w.into_bytes();
        assert_eq!(&bytes[2..6], &9u32.to_be_bytes());
    }
}
