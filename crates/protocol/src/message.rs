//! Protocol messages and their wire encoding.
//!
//! Frame: `type (u32) || payload_len (u32) || payload`, all big-endian.
//! Decoding needs the public parameters: the number of slots of a group, and
//! so the length of bitmaps and join proofs, follows from its size tier.

use bls12_381::G1Affine;

use sgc_crypto::{Ciphertext, CiphertextComponent, EncryptionKey, KaMaterial, PublicParameter};
use sgc_types::{KeyVerifier, MemberState, NodeId, Sid};

use crate::codec::{ByteReader, ByteWriter};
use crate::error::CodecError;
use crate::group::{bitmap_len, GroupSessionInfo};

const HEADER_LEN: usize = 8;

/// Wire tag of each message kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    Heartbeat = 1,
    HeartbeatAck = 2,
    NotifyPosition = 3,
    Join = 4,
    JoinAck = 5,
    KeyEncapNotify = 6,
    KeyEncap = 7,
    KeyUpdate = 8,
    KeyUpdateAck = 9,
}

impl TryFrom<u32> for MsgType {
    type Error = CodecError;

    fn try_from(tag: u32) -> Result<Self, CodecError> {
        Ok(match tag {
            1 => MsgType::Heartbeat,
            2 => MsgType::HeartbeatAck,
            3 => MsgType::NotifyPosition,
            4 => MsgType::Join,
            5 => MsgType::JoinAck,
            6 => MsgType::KeyEncapNotify,
            7 => MsgType::KeyEncap,
            8 => MsgType::KeyUpdate,
            9 => MsgType::KeyUpdateAck,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

// =========================
// PAYLOADS
// =========================

/// Periodic coordinator broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Heartbeat {
    pub seq: u32,
    pub kv: KeyVerifier,
    pub groups: Vec<GroupSessionInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub state: MemberState,
    pub pid: NodeId,
    pub seq: u32,
}

/// Slot assignment for member `pid`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NotifyPosition {
    pub sid: Sid,
    pub pos: u32,
    pub pid: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Join {
    pub pid: NodeId,
    pub kam: KaMaterial,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinAck {
    pub sid: Sid,
    pub pos: u32,
    pub pk_id: u32,
    /// Decryption share of slot `pos`.
    pub d: G1Affine,
    pub ek: EncryptionKey,
}

/// Request for member `pid` to distribute a fresh session key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEncapNotify {
    pub pid: NodeId,
    pub key_len: u32,
    pub cur_version: u32,
}

/// Session key encrypted to every group in `sids`, in order.
///
/// Shared by `KeyEncap` and `KeyUpdate`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDistribution {
    pub pid: NodeId,
    pub kv: KeyVerifier,
    pub sids: Vec<Sid>,
    pub ct: Ciphertext,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyUpdateAck {
    pub pid: NodeId,
    pub kv: KeyVerifier,
}

/// Every message of the protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    NotifyPosition(NotifyPosition),
    Join(Join),
    JoinAck(JoinAck),
    KeyEncapNotify(KeyEncapNotify),
    KeyEncap(KeyDistribution),
    KeyUpdate(KeyDistribution),
    KeyUpdateAck(KeyUpdateAck),
}

impl Message {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Heartbeat(_) => MsgType::Heartbeat,
            Message::HeartbeatAck(_) => MsgType::HeartbeatAck,
            Message::NotifyPosition(_) => MsgType::NotifyPosition,
            Message::Join(_) => MsgType::Join,
            Message::JoinAck(_) => MsgType::JoinAck,
            Message::KeyEncapNotify(_) => MsgType::KeyEncapNotify,
            Message::KeyEncap(_) => MsgType::KeyEncap,
            Message::KeyUpdate(_) => MsgType::KeyUpdate,
            Message::KeyUpdateAck(_) => MsgType::KeyUpdateAck,
        }
    }

    /// Encode as a complete frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.put_u32(self.msg_type() as u32);
        let len_at = w.reserve_u32();

        match self {
            Message::Heartbeat(m) => {
                w.put_u32(m.seq);
                put_key_verifier(&mut w, &m.kv);
                for group in &m.groups {
                    put_group_session_info(&mut w, group);
                }
            }
            Message::HeartbeatAck(m) => {
                w.put_u32(m.state.code());
                w.put_u32(m.pid);
                w.put_u32(m.seq);
            }
            Message::NotifyPosition(m) => {
                w.put_sid(&m.sid);
                w.put_u32(m.pos);
                w.put_u32(m.pid);
            }
            Message::Join(m) => {
                w.put_u32(m.pid);
                put_ka_material(&mut w, &m.kam);
            }
            Message::JoinAck(m) => {
                w.put_sid(&m.sid);
                w.put_u32(m.pos);
                w.put_u32(m.pk_id);
                w.put_g1(&m.d);
                put_encryption_key(&mut w, &m.ek);
            }
            Message::KeyEncapNotify(m) => {
                w.put_u32(m.pid);
                w.put_u32(m.key_len);
                w.put_u32(m.cur_version);
            }
            Message::KeyEncap(m) | Message::KeyUpdate(m) => {
                w.put_u32(m.sids.len() as u32);
                w.put_u32(m.pid);
                put_key_verifier(&mut w, &m.kv);
                for sid in &m.sids {
                    w.put_sid(sid);
                }
                put_ciphertext(&mut w, &m.ct);
            }
            Message::KeyUpdateAck(m) => {
                w.put_u32(m.pid);
                put_key_verifier(&mut w, &m.kv);
            }
        }

        let payload_len = (w.len() - HEADER_LEN) as u32;
        w.patch_u32(len_at, payload_len);
        w.into_bytes()
    }

    /// Decode a complete frame.
    pub fn decode(bytes: &[u8], params: &PublicParameter) -> Result<Message, CodecError> {
        let mut header = ByteReader::new(bytes);
        let msg_type = MsgType::try_from(header.get_u32()?)?;
        let declared = header.get_u32()? as usize;
        if declared != header.remaining() {
            return Err(CodecError::LengthMismatch {
                declared,
                actual: header.remaining(),
            });
        }

        let mut r = ByteReader::new(&bytes[HEADER_LEN..]);
        let msg = match msg_type {
            MsgType::Heartbeat => {
                let seq = r.get_u32()?;
                let kv = get_key_verifier(&mut r)?;
                let mut groups = Vec::new();
                while !r.is_empty() {
                    groups.push(get_group_session_info(&mut r, params)?);
                }
                Message::Heartbeat(Heartbeat { seq, kv, groups })
            }
            MsgType::HeartbeatAck => {
                let code = r.get_u32()?;
                let state =
                    MemberState::from_code(code).ok_or(CodecError::InvalidMemberState(code))?;
                Message::HeartbeatAck(HeartbeatAck {
                    state,
                    pid: r.get_u32()?,
                    seq: r.get_u32()?,
                })
            }
            MsgType::NotifyPosition => Message::NotifyPosition(NotifyPosition {
                sid: r.get_sid()?,
                pos: r.get_u32()?,
                pid: r.get_u32()?,
            }),
            MsgType::Join => {
                let pid = r.get_u32()?;
                let kam = get_ka_material(&mut r, params)?;
                Message::Join(Join { pid, kam })
            }
            MsgType::JoinAck => Message::JoinAck(JoinAck {
                sid: r.get_sid()?,
                pos: r.get_u32()?,
                pk_id: r.get_u32()?,
                d: r.get_g1()?,
                ek: get_encryption_key(&mut r)?,
            }),
            MsgType::KeyEncapNotify => Message::KeyEncapNotify(KeyEncapNotify {
                pid: r.get_u32()?,
                key_len: r.get_u32()?,
                cur_version: r.get_u32()?,
            }),
            MsgType::KeyEncap => Message::KeyEncap(get_key_distribution(&mut r)?),
            MsgType::KeyUpdate => Message::KeyUpdate(get_key_distribution(&mut r)?),
            MsgType::KeyUpdateAck => Message::KeyUpdateAck(KeyUpdateAck {
                pid: r.get_u32()?,
                kv: get_key_verifier(&mut r)?,
            }),
        };

        r.finish()?;
        Ok(msg)
    }
}

// =========================
// FIELD ENCODINGS
// =========================

fn put_key_verifier(w: &mut ByteWriter, kv: &KeyVerifier) {
    w.put_u32(kv.version);
    w.put_timestamp(kv.timestamp);
    if kv.version > 0 {
        w.put_bytes(&kv.hash);
    }
}

fn get_key_verifier(r: &mut ByteReader<'_>) -> Result<KeyVerifier, CodecError> {
    let version = r.get_u32()?;
    let timestamp = r.get_timestamp()?;
    let hash = if version > 0 { r.get_array()? } else { [0u8; 32] };
    Ok(KeyVerifier {
        version,
        timestamp,
        hash,
    })
}

fn put_encryption_key(w: &mut ByteWriter, ek: &EncryptionKey) {
    w.put_g2(&ek.lambda);
    w.put_g1(&ek.mu);
}

fn get_encryption_key(r: &mut ByteReader<'_>) -> Result<EncryptionKey, CodecError> {
    Ok(EncryptionKey {
        lambda: r.get_g2()?,
        mu: r.get_g1()?,
    })
}

fn put_group_session_info(w: &mut ByteWriter, info: &GroupSessionInfo) {
    let start = w.len();
    let len_at = w.reserve_u32();
    w.put_u32(info.n_member);
    w.put_sid(&info.sid);
    w.put_timestamp(info.expiry);
    w.put_bytes(&info.mem_bitmap);
    put_encryption_key(w, &info.ek);
    let total = (w.len() - start) as u32;
    w.patch_u32(len_at, total);
}

fn get_group_session_info(
    r: &mut ByteReader<'_>,
    params: &PublicParameter,
) -> Result<GroupSessionInfo, CodecError> {
    let start = r.position();
    let declared = r.get_u32()? as usize;
    let n_member = r.get_u32()?;
    let sid = r.get_sid()?;
    let expiry = r.get_timestamp()?;
    let size_param = sid.size_param();
    let scale = params
        .scale(size_param)
        .map_err(|_| CodecError::UnknownSizeTier(size_param as u32))?;
    let mem_bitmap = r.get_bytes(bitmap_len(scale))?.to_vec();
    let ek = get_encryption_key(r)?;

    let actual = r.position() - start;
    if declared != actual {
        return Err(CodecError::LengthMismatch { declared, actual });
    }

    Ok(GroupSessionInfo {
        size_param,
        n_member,
        sid,
        mem_bitmap,
        ek,
        expiry,
    })
}

fn put_ka_material(w: &mut ByteWriter, kam: &KaMaterial) {
    w.put_u32(kam.pk_id);
    w.put_u32(kam.size_param as u32);
    w.put_u32(kam.pos);
    w.put_sid(&kam.sid);
    w.put_g2(&kam.u);
    // z[pos] is None and never written
    for z in kam.z.iter().flatten() {
        w.put_g1(z);
    }
}

fn get_ka_material(
    r: &mut ByteReader<'_>,
    params: &PublicParameter,
) -> Result<KaMaterial, CodecError> {
    let pk_id = r.get_u32()?;
    let raw_size_param = r.get_u32()?;
    let pos = r.get_u32()?;
    let size_param =
        u16::try_from(raw_size_param).map_err(|_| CodecError::UnknownSizeTier(raw_size_param))?;
    let scale = params
        .scale(size_param)
        .map_err(|_| CodecError::UnknownSizeTier(raw_size_param))?;
    if pos as usize >= scale {
        return Err(CodecError::SlotOutOfRange { pos, scale });
    }
    let sid = r.get_sid()?;
    let u = r.get_g2()?;

    let mut z = Vec::with_capacity(scale);
    for j in 0..scale {
        if j == pos as usize {
            z.push(None);
        } else {
            z.push(Some(r.get_g1()?));
        }
    }

    Ok(KaMaterial {
        pk_id,
        size_param,
        pos,
        sid,
        u,
        z,
    })
}

fn put_ciphertext(w: &mut ByteWriter, ct: &Ciphertext) {
    w.put_u32(ct.message_len() as u32);
    w.put_g2(&ct.c1);
    for component in &ct.components {
        w.put_g2(&component.c2);
        w.put_bytes(&component.c3);
    }
}

fn get_ciphertext(r: &mut ByteReader<'_>, count: usize) -> Result<Ciphertext, CodecError> {
    let len = r.get_u32()? as usize;
    let c1 = r.get_g2()?;
    let mut components = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        let c2 = r.get_g2()?;
        let c3 = r.get_bytes(len)?.to_vec();
        components.push(CiphertextComponent { c2, c3 });
    }
    Ok(Ciphertext { c1, components })
}

fn get_key_distribution(r: &mut ByteReader<'_>) -> Result<KeyDistribution, CodecError> {
    let count = r.get_u32()? as usize;
    let pid = r.get_u32()?;
    let kv = get_key_verifier(r)?;
    let mut sids = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        sids.push(r.get_sid()?);
    }
    let ct = get_ciphertext(r, count)?;
    Ok(KeyDistribution { pid, kv, sids, ct })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::ManagedGroup;
    use bls12_381::{G1Projective, G2Projective, Scalar};
    use group::Curve;
    use rand::rngs::OsRng;
    use sgc_crypto::{encrypt, BulletinBoard, Saagka};
    use sgc_types::Timestamp;
    use std::sync::Arc;

    fn params() -> Arc<PublicParameter> {
        let (params, _) = PublicParameter::setup(80, 10, 5, &mut OsRng).unwrap();
        Arc::new(params)
    }

    fn roundtrip(msg: Message, params: &PublicParameter) -> Vec<u8> {
        let bytes = msg.encode();
        assert_eq!(Message::decode(&bytes, params).unwrap(), msg);
        bytes
    }

    fn kv(version: u32) -> KeyVerifier {
        KeyVerifier::for_key(version, Timestamp::from_millis(1234), b"session key")
    }

    #[test]
    fn test_header_layout() {
        let params = params();
        let bytes = roundtrip(
            Message::KeyEncapNotify(KeyEncapNotify {
                pid: 5,
                key_len: 32,
                cur_version: 2,
            }),
            &params,
        );

        assert_eq!(&bytes[..4], &6u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &12u32.to_be_bytes());
        assert_eq!(bytes.len(), 20);
    }

    #[test]
    fn test_heartbeat_with_groups() {
        let params = params();
        let mut g0 = ManagedGroup::bootstrap(&params, 0, 0, Timestamp::from_millis(60_000)).unwrap();
        g0.info.occupy(1);
        g0.info.n_member = 1;
        let g1 = ManagedGroup::bootstrap(&params, 1, 1, Timestamp::from_millis(61_000)).unwrap();

        let bytes = roundtrip(
            Message::Heartbeat(Heartbeat {
                seq: 41,
                kv: kv(3),
                groups: vec![g0.info.clone(), g1.info.clone()],
            }),
            &params,
        );

        // Each group record: len + n_member + sid + expiry + bitmap + ek
        let record = 4 + 4 + 16 + 8 + 8 + (2 + 96) + (2 + 48);
        assert_eq!(bytes.len(), 8 + 4 + (4 + 8 + 32) + 2 * record);
    }

    #[test]
    fn test_empty_heartbeat_omits_hash() {
        let params = params();
        let bytes = roundtrip(
            Message::Heartbeat(Heartbeat {
                seq: 0,
                kv: KeyVerifier::default(),
                groups: Vec::new(),
            }),
            &params,
        );
        assert_eq!(bytes.len(), 8 + 4 + 4 + 8);
    }

    #[test]
    fn test_unversioned_verifier_survives_the_wire() {
        let params = params();
        let msg = Message::KeyUpdateAck(KeyUpdateAck { pid: 3, kv: kv(0) });

        let bytes = roundtrip(msg, &params);
        assert_eq!(bytes.len(), 8 + 4 + 4 + 8);
    }

    #[test]
    fn test_small_messages() {
        let params = params();
        let sid = Sid::new(4, 1, Timestamp::from_millis(9));

        roundtrip(
            Message::HeartbeatAck(HeartbeatAck {
                state: MemberState::Joined,
                pid: 12,
                seq: 99,
            }),
            &params,
        );
        roundtrip(
            Message::NotifyPosition(NotifyPosition { sid, pos: 3, pid: 12 }),
            &params,
        );
        roundtrip(
            Message::KeyUpdateAck(KeyUpdateAck { pid: 12, kv: kv(8) }),
            &params,
        );

        let g = ManagedGroup::bootstrap(&params, 4, 1, Timestamp::from_millis(9)).unwrap();
        roundtrip(
            Message::JoinAck(JoinAck {
                sid,
                pos: 3,
                pk_id: 77,
                d: g.d[3],
                ek: g.info.ek,
            }),
            &params,
        );
    }

    #[test]
    fn test_join_omits_reserved_slot() {
        let params = params();
        let pki = Arc::new(BulletinBoard::new());
        let g = ManagedGroup::bootstrap(&params, 0, 1, Timestamp::from_millis(60_000)).unwrap();
        let mut node = Saagka::new(params.clone(), pki);
        let kam = node
            .message_gen(g.info.sid, &g.info.ek, 1, 4, &mut OsRng)
            .unwrap();

        let bytes = roundtrip(Message::Join(Join { pid: 3, kam }), &params);

        // pid + pk_id + size_param + pos + sid + u + 9 of 10 z values
        assert_eq!(bytes.len(), 8 + 4 + 12 + 16 + (2 + 96) + 9 * (2 + 48));
    }

    #[test]
    fn test_key_distribution_variants() {
        let params = params();
        let g0 = ManagedGroup::bootstrap(&params, 0, 0, Timestamp::from_millis(60_000)).unwrap();
        let g1 = ManagedGroup::bootstrap(&params, 1, 0, Timestamp::from_millis(60_000)).unwrap();
        let ct = encrypt(&params, &[7u8; 32], &[g0.info.ek, g1.info.ek], &mut OsRng);
        let dist = KeyDistribution {
            pid: 2,
            kv: kv(5),
            sids: vec![g0.info.sid, g1.info.sid],
            ct,
        };

        let encap = roundtrip(Message::KeyEncap(dist.clone()), &params);
        let update = roundtrip(Message::KeyUpdate(dist), &params);

        assert_eq!(&encap[..4], &7u32.to_be_bytes());
        assert_eq!(&update[..4], &8u32.to_be_bytes());
        assert_eq!(encap[4..], update[4..]);
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        let params = params();
        let bytes = Message::HeartbeatAck(HeartbeatAck {
            state: MemberState::Unset,
            pid: 1,
            seq: 1,
        })
        .encode();

        let mut unknown = bytes.clone();
        unknown[3] = 0;
        assert_eq!(
            Message::decode(&unknown, &params),
            Err(CodecError::UnknownMessageType(0))
        );

        assert!(matches!(
            Message::decode(&bytes[..bytes.len() - 1], &params),
            Err(CodecError::LengthMismatch { .. })
        ));

        let mut bad_state = bytes.clone();
        bad_state[11] = 9;
        assert_eq!(
            Message::decode(&bad_state, &params),
            Err(CodecError::InvalidMemberState(9))
        );

        let mut padded = bytes.clone();
        padded.push(0);
        padded[7] += 1;
        assert_eq!(
            Message::decode(&padded, &params),
            Err(CodecError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_decode_rejects_corrupted_points() {
        let params = params();
        let d = (G1Projective::generator() * Scalar::from(3u64)).to_affine();
        let ek = EncryptionKey {
            lambda: (G2Projective::generator() * Scalar::from(4u64)).to_affine(),
            mu: d,
        };
        let mut bytes = Message::JoinAck(JoinAck {
            sid: Sid::new(0, 0, Timestamp::ZERO),
            pos: 0,
            pk_id: 1,
            d,
            ek,
        })
        .encode();

        // Flip a bit in the compressed x-coordinate of d
        let d_offset = 8 + 16 + 4 + 4 + 2;
        bytes[d_offset + 20] ^= 0x01;
        assert!(Message::decode(&bytes, &params).is_err());
    }
}
