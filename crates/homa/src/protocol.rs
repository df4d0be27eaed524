//! Wire format.
//!
//! Every packet begins with a common header (sender id, source port, dest
//! port, type, doff) followed by a per-type payload. All integers are
//! little-endian. `DATA` headers are padded to a multiple of 4 bytes for
//! TSO compatibility; every header is `<= HOMA_MAX_HEADER` bytes.
//!
//! Layout mirrors the offset-table style of a raw frame parser: named byte
//! offsets, explicit bounds checks, no panics on malformed input — short or
//! unrecognized packets are reported to the caller as `None`/`Err`, never
//! unwrapped.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::HOMA_MAX_HEADER;

/// Common header fields shared by every packet kind.
const COMMON_HDR_LEN: usize = 20;
const OFF_SENDER_ID: usize = 0; // u64
const OFF_SRC_PORT: usize = 8; // u16
const OFF_DST_PORT: usize = 10; // u16
const OFF_TYPE: usize = 12; // u8
const OFF_DOFF: usize = 13; // u8, header length in 4-byte words
// Bytes 14..20: checksum (u16, filled by the IP layer) + reserved pad (u32).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Data = 0,
    Grant = 1,
    Resend = 2,
    RpcUnknown = 3,
    Busy = 4,
    Cutoffs = 5,
    NeedAck = 6,
    Ack = 7,
    Freeze = 8,
}

impl PacketKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => PacketKind::Data,
            1 => PacketKind::Grant,
            2 => PacketKind::Resend,
            3 => PacketKind::RpcUnknown,
            4 => PacketKind::Busy,
            5 => PacketKind::Cutoffs,
            6 => PacketKind::NeedAck,
            7 => PacketKind::Ack,
            8 => PacketKind::Freeze,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommonHeader {
    pub sender_id: u64,
    pub src_port: u16,
    pub dst_port: u16,
    pub kind: PacketKind,
}

impl CommonHeader {
    pub fn parse(bytes: &[u8]) -> Option<(Self, &[u8])> {
        if bytes.len() < COMMON_HDR_LEN {
            return None;
        }
        let sender_id = u64::from_le_bytes(bytes[OFF_SENDER_ID..OFF_SENDER_ID + 8].try_into().ok()?);
        let src_port = u16::from_le_bytes(bytes[OFF_SRC_PORT..OFF_SRC_PORT + 2].try_into().ok()?);
        let dst_port = u16::from_le_bytes(bytes[OFF_DST_PORT..OFF_DST_PORT + 2].try_into().ok()?);
        let kind = PacketKind::from_u8(bytes[OFF_TYPE])?;
        let doff = bytes[OFF_DOFF] as usize * 4;
        if doff < COMMON_HDR_LEN || doff > HOMA_MAX_HEADER || doff > bytes.len() {
            return None;
        }
        Some((
            CommonHeader { sender_id, src_port, dst_port, kind },
            &bytes[doff..],
        ))
    }

    fn write(&self, buf: &mut BytesMut, doff_words: u8) {
        buf.put_u64_le(self.sender_id);
        buf.put_u16_le(self.src_port);
        buf.put_u16_le(self.dst_port);
        buf.put_u8(self.kind as u8);
        buf.put_u8(doff_words);
        buf.put_u16_le(0); // checksum, filled by the IP layer
        buf.put_u32_le(0); // reserved pad
    }
}

/// A segment of a message, carried by a `DATA` packet.
#[derive(Debug, Clone)]
pub struct DataHeader {
    pub common: CommonHeader,
    pub message_length: u32,
    pub offset: u32,
    pub unscheduled_bytes: u32,
    pub retransmit: bool,
    pub segment: Bytes,
}

const DATA_HDR_LEN: usize = COMMON_HDR_LEN + 16; // +message_length,offset,unsched,flags(u32)
const RETRANSMIT_FLAG: u32 = 1;

impl DataHeader {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(DATA_HDR_LEN + self.segment.len());
        self.common.write(&mut buf, (DATA_HDR_LEN / 4) as u8);
        buf.put_u32_le(self.message_length);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.unscheduled_bytes);
        buf.put_u32_le(if self.retransmit { RETRANSMIT_FLAG } else { 0 });
        buf.extend_from_slice(&self.segment);
        buf
    }

    pub fn parse(common: CommonHeader, rest: &[u8], full: &[u8]) -> Option<Self> {
        // `rest` starts right after the common header; the per-type fields
        // below live in the fixed region before `doff`, and the payload
        // starts at `doff` in `full`.
        if rest.len() < 16 {
            return None;
        }
        let message_length = u32::from_le_bytes(rest[0..4].try_into().ok()?);
        let offset = u32::from_le_bytes(rest[4..8].try_into().ok()?);
        let unscheduled_bytes = u32::from_le_bytes(rest[8..12].try_into().ok()?);
        let flags = u32::from_le_bytes(rest[12..16].try_into().ok()?);
        let payload_start = DATA_HDR_LEN;
        if payload_start > full.len() {
            return None;
        }
        let segment = Bytes::copy_from_slice(&full[payload_start..]);
        Some(DataHeader {
            common,
            message_length,
            offset,
            unscheduled_bytes,
            retransmit: flags & RETRANSMIT_FLAG != 0,
            segment,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GrantHeader {
    pub common: CommonHeader,
    pub offset: u32,
    pub priority: u8,
}

impl GrantHeader {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(COMMON_HDR_LEN + 8);
        self.common.write(&mut buf, ((COMMON_HDR_LEN + 8) / 4) as u8);
        buf.put_u32_le(self.offset);
        buf.put_u8(self.priority);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf
    }

    pub fn parse(common: CommonHeader, rest: &[u8]) -> Option<Self> {
        if rest.len() < 8 {
            return None;
        }
        let offset = u32::from_le_bytes(rest[0..4].try_into().ok()?);
        let priority = rest[4];
        Some(GrantHeader { common, offset, priority })
    }
}

#[derive(Debug, Clone)]
pub struct ResendHeader {
    pub common: CommonHeader,
    pub offset: u32,
    pub length: u32,
    pub priority: u8,
}

impl ResendHeader {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(COMMON_HDR_LEN + 12);
        self.common.write(&mut buf, ((COMMON_HDR_LEN + 12) / 4) as u8);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.length);
        buf.put_u8(self.priority);
        buf.put_u8(0);
        buf.put_u16_le(0);
        buf
    }

    pub fn parse(common: CommonHeader, rest: &[u8]) -> Option<Self> {
        if rest.len() < 12 {
            return None;
        }
        let offset = u32::from_le_bytes(rest[0..4].try_into().ok()?);
        let length = u32::from_le_bytes(rest[4..8].try_into().ok()?);
        let priority = rest[8];
        Some(ResendHeader { common, offset, length, priority })
    }
}

#[derive(Debug, Clone)]
pub struct RpcUnknownHeader {
    pub common: CommonHeader,
}

#[derive(Debug, Clone)]
pub struct BusyHeader {
    pub common: CommonHeader,
}

#[derive(Debug, Clone)]
pub struct CutoffsHeader {
    pub common: CommonHeader,
    pub version: u32,
    pub cutoffs: [u32; 8],
}

impl CutoffsHeader {
    pub fn encode(&self) -> BytesMut {
        let len = COMMON_HDR_LEN + 4 + 32;
        let mut buf = BytesMut::with_capacity(len);
        self.common.write(&mut buf, (len / 4) as u8);
        buf.put_u32_le(self.version);
        for c in &self.cutoffs {
            buf.put_u32_le(*c);
        }
        buf
    }

    pub fn parse(common: CommonHeader, rest: &[u8]) -> Option<Self> {
        if rest.len() < 36 {
            return None;
        }
        let version = u32::from_le_bytes(rest[0..4].try_into().ok()?);
        let mut cutoffs = [0u32; 8];
        for (i, c) in cutoffs.iter_mut().enumerate() {
            let off = 4 + i * 4;
            *c = u32::from_le_bytes(rest[off..off + 4].try_into().ok()?);
        }
        Some(CutoffsHeader { common, version, cutoffs })
    }
}

#[derive(Debug, Clone)]
pub struct NeedAckHeader {
    pub common: CommonHeader,
}

#[derive(Debug, Clone)]
pub struct AckHeader {
    pub common: CommonHeader,
    pub acked_ids: Vec<u64>,
}

impl AckHeader {
    pub fn encode(&self) -> BytesMut {
        let len = COMMON_HDR_LEN + 2 + self.acked_ids.len() * 8;
        let padded = (len + 3) / 4 * 4;
        let mut buf = BytesMut::with_capacity(padded);
        self.common.write(&mut buf, (padded / 4) as u8);
        buf.put_u16_le(self.acked_ids.len() as u16);
        for id in &self.acked_ids {
            buf.put_u64_le(*id);
        }
        while buf.len() < padded {
            buf.put_u8(0);
        }
        buf
    }

    pub fn parse(common: CommonHeader, rest: &[u8]) -> Option<Self> {
        if rest.len() < 2 {
            return None;
        }
        let count = u16::from_le_bytes(rest[0..2].try_into().ok()?) as usize;
        let mut acked_ids = Vec::with_capacity(count);
        let mut off = 2;
        for _ in 0..count {
            if rest.len() < off + 8 {
                return None;
            }
            acked_ids.push(u64::from_le_bytes(rest[off..off + 8].try_into().ok()?));
            off += 8;
        }
        Some(AckHeader { common, acked_ids })
    }
}

#[derive(Debug, Clone)]
pub struct FreezeHeader {
    pub common: CommonHeader,
}

/// A fully decoded packet of any kind.
#[derive(Debug, Clone)]
pub enum Packet {
    Data(DataHeader),
    Grant(GrantHeader),
    Resend(ResendHeader),
    RpcUnknown(RpcUnknownHeader),
    Busy(BusyHeader),
    Cutoffs(CutoffsHeader),
    NeedAck(NeedAckHeader),
    Ack(AckHeader),
    Freeze(FreezeHeader),
}

impl Packet {
    pub fn common(&self) -> &CommonHeader {
        match self {
            Packet::Data(h) => &h.common,
            Packet::Grant(h) => &h.common,
            Packet::Resend(h) => &h.common,
            Packet::RpcUnknown(h) => &h.common,
            Packet::Busy(h) => &h.common,
            Packet::Cutoffs(h) => &h.common,
            Packet::NeedAck(h) => &h.common,
            Packet::Ack(h) => &h.common,
            Packet::Freeze(h) => &h.common,
        }
    }

    /// Parse a datagram into a typed packet. Returns `None` for short or
    /// unrecognized packets; the incoming engine counts and drops these
    /// rather than propagating an error.
    pub fn parse(bytes: &[u8]) -> Option<Packet> {
        let (common, rest) = CommonHeader::parse(bytes)?;
        Some(match common.kind {
            PacketKind::Data => Packet::Data(DataHeader::parse(common, rest, bytes)?),
            PacketKind::Grant => Packet::Grant(GrantHeader::parse(common, rest)?),
            PacketKind::Resend => Packet::Resend(ResendHeader::parse(common, rest)?),
            PacketKind::RpcUnknown => Packet::RpcUnknown(RpcUnknownHeader { common }),
            PacketKind::Busy => Packet::Busy(BusyHeader { common }),
            PacketKind::Cutoffs => Packet::Cutoffs(CutoffsHeader::parse(common, rest)?),
            PacketKind::NeedAck => Packet::NeedAck(NeedAckHeader { common }),
            PacketKind::Ack => Packet::Ack(AckHeader::parse(common, rest)?),
            PacketKind::Freeze => Packet::Freeze(FreezeHeader { common }),
        })
    }

    /// Serialize whichever variant this is. A real NIC-facing `IpSend` only
    /// ever has a `Packet`, not the concrete header type, so it needs one
    /// encode path across all nine kinds.
    pub fn encode(&self) -> BytesMut {
        match self {
            Packet::Data(h) => h.encode(),
            Packet::Grant(h) => h.encode(),
            Packet::Resend(h) => h.encode(),
            Packet::RpcUnknown(h) => encode_simple(&h.common),
            Packet::Busy(h) => encode_simple(&h.common),
            Packet::Cutoffs(h) => h.encode(),
            Packet::NeedAck(h) => encode_simple(&h.common),
            Packet::Ack(h) => h.encode(),
            Packet::Freeze(h) => encode_simple(&h.common),
        }
    }
}

pub fn encode_simple(common: &CommonHeader) -> BytesMut {
    let mut buf = BytesMut::with_capacity(COMMON_HDR_LEN);
    common.write(&mut buf, (COMMON_HDR_LEN / 4) as u8);
    buf
}

/// Peek at just enough of a buffer to read the varint-free `doff`/`type`
/// bytes without committing to a full parse; used by callers that want to
/// drop unroutable packets before touching any lock.
pub fn peek_kind(bytes: &[u8]) -> Option<PacketKind> {
    bytes.get(OFF_TYPE).copied().and_then(PacketKind::from_u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_common(kind: PacketKind) -> CommonHeader {
        CommonHeader { sender_id: 42, src_port: 1000, dst_port: 2000, kind }
    }

    #[test]
    fn data_round_trips() {
        let hdr = DataHeader {
            common: mk_common(PacketKind::Data),
            message_length: 1000,
            offset: 0,
            unscheduled_bytes: 500,
            retransmit: false,
            segment: Bytes::from_static(b"hello world"),
        };
        let encoded = hdr.encode();
        let parsed = Packet::parse(&encoded).expect("parses");
        match parsed {
            Packet::Data(d) => {
                assert_eq!(d.common.sender_id, 42);
                assert_eq!(d.message_length, 1000);
                assert_eq!(&d.segment[..], b"hello world");
                assert!(!d.retransmit);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn grant_round_trips() {
        let hdr = GrantHeader { common: mk_common(PacketKind::Grant), offset: 200_000, priority: 3 };
        let encoded = hdr.encode();
        match Packet::parse(&encoded).unwrap() {
            Packet::Grant(g) => {
                assert_eq!(g.offset, 200_000);
                assert_eq!(g.priority, 3);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn ack_round_trips_with_multiple_ids() {
        let hdr = AckHeader { common: mk_common(PacketKind::Ack), acked_ids: vec![2, 4, 100] };
        let encoded = hdr.encode();
        match Packet::parse(&encoded).unwrap() {
            Packet::Ack(a) => assert_eq!(a.acked_ids, vec![2, 4, 100]),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn short_packet_is_rejected_not_panicking() {
        assert!(Packet::parse(&[0u8; 4]).is_none());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = vec![0u8; COMMON_HDR_LEN];
        bytes[OFF_TYPE] = 200;
        bytes[OFF_DOFF] = (COMMON_HDR_LEN / 4) as u8;
        assert!(Packet::parse(&bytes).is_none());
    }
}
