//! Packet and flow record codec
//!
//! Decodes the fixed-width records emitted by the capture program and derives
//! the symmetric flow identity used to key the flow table.

use bytes::Buf;
use flow_common::{constants::*, FlowKey, FlowMetrics};
use serde::Serialize;
use std::{
    fmt,
    net::{IpAddr, Ipv6Addr},
};
use thiserror::Error;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Per-event decoding failure
///
/// Never fatal: the caller logs it and drops the single event.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown protocol number {0}")]
    UnknownProtocol(u8),
}

/// Transport protocols tracked by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = DecodeError;

    fn try_from(number: u8) -> Result<Self, Self::Error> {
        match number {
            IPPROTO_TCP => Ok(Protocol::Tcp),
            IPPROTO_UDP => Ok(Protocol::Udp),
            other => Err(DecodeError::UnknownProtocol(other)),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Symmetric 64-bit identity of a flow
///
/// Both directions of one connection produce the same identity. Collisions
/// are accepted; no secondary disambiguation is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FlowIdentity(pub u64);

impl FlowIdentity {
    /// Compute the identity from both endpoints and the protocol number
    ///
    /// Each component is hashed on its own with FNV-1a and the three hashes
    /// are summed, so swapping the endpoints yields the same value.
    pub fn of(a: &Ipv6Addr, a_port: u16, b: &Ipv6Addr, b_port: u16, protocol: u8) -> Self {
        let proto = fnv1a(&u16::from(protocol).to_be_bytes());
        Self(
            endpoint_hash(a, a_port)
                .wrapping_add(endpoint_hash(b, b_port))
                .wrapping_add(proto),
        )
    }

    /// Identity of an in-kernel aggregation map key
    pub fn of_key(key: &FlowKey) -> Self {
        Self::of(
            &Ipv6Addr::from(key.local_addr),
            u16::from_be(key.local_port),
            &Ipv6Addr::from(key.remote_addr),
            u16::from_be(key.remote_port),
            key.protocol,
        )
    }
}

impl fmt::Display for FlowIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

fn endpoint_hash(addr: &Ipv6Addr, port: u16) -> u64 {
    let mut buf = [0u8; ADDR_LEN + 2];
    buf[..ADDR_LEN].copy_from_slice(&addr.octets());
    buf[ADDR_LEN..].copy_from_slice(&port.to_be_bytes());
    fnv1a(&buf)
}

/// Convert a 16-byte wire address to the address family it represents
///
/// IPv4-mapped addresses (`::ffff:a.b.c.d`) become plain IPv4.
pub fn unmap(addr: &Ipv6Addr) -> IpAddr {
    match addr.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(*addr),
    }
}

/// One observed packet, as delivered by the capture program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    pub src_addr: Ipv6Addr,
    pub dst_addr: Ipv6Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Raw IP protocol number; validated by the statistics engine
    pub protocol: u8,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    /// Monotonic timestamp (nanoseconds since boot)
    pub ts_ns: u64,
    /// True when the packet left through the monitored interface
    pub outbound: bool,
    /// Frame length in bytes
    pub len: u32,
}

impl PacketRecord {
    /// Decode a packet event
    ///
    /// Trailing bytes past the fixed layout are ignored.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        ensure_len(raw, PACKET_EVENT_LEN)?;

        Ok(Self {
            src_addr: addr_at(raw, PKT_SRC_ADDR),
            dst_addr: addr_at(raw, PKT_DST_ADDR),
            src_port: be_u16_at(raw, PKT_SRC_PORT),
            dst_port: be_u16_at(raw, PKT_DST_PORT),
            protocol: raw[PKT_PROTOCOL],
            syn: flag_at(raw, PKT_SYN),
            ack: flag_at(raw, PKT_ACK),
            fin: flag_at(raw, PKT_FIN),
            ts_ns: (&raw[PKT_TIMESTAMP..]).get_u64_le(),
            outbound: flag_at(raw, PKT_OUTBOUND),
            len: (&raw[PKT_LEN..]).get_u32(),
        })
    }

    /// Flow identity of this packet; identical for both directions
    pub fn identity(&self) -> FlowIdentity {
        FlowIdentity::of(
            &self.src_addr,
            self.src_port,
            &self.dst_addr,
            self.dst_port,
            self.protocol,
        )
    }
}

/// One flow sampled from the in-kernel aggregation map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub metrics: FlowMetrics,
    /// A FIN was seen on this flow by the capture program
    pub fin: bool,
}

impl FlowRecord {
    /// Decode a streamed flow record
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        ensure_len(raw, FLOW_RECORD_LEN)?;

        // Ports are kept in network byte order, like the kernel map key.
        let key = FlowKey {
            local_addr: addr_at(raw, FLOW_LOCAL_ADDR).octets(),
            remote_addr: addr_at(raw, FLOW_REMOTE_ADDR).octets(),
            local_port: be_u16_at(raw, FLOW_LOCAL_PORT).to_be(),
            remote_port: be_u16_at(raw, FLOW_REMOTE_PORT).to_be(),
            protocol: raw[FLOW_PROTOCOL],
            _padding: [0; 3],
        };

        let metrics = FlowMetrics {
            packets_in: (&raw[FLOW_PACKETS_IN..]).get_u32(),
            packets_out: (&raw[FLOW_PACKETS_OUT..]).get_u32(),
            bytes_in: (&raw[FLOW_BYTES_IN..]).get_u64(),
            bytes_out: (&raw[FLOW_BYTES_OUT..]).get_u64(),
            ts_start: (&raw[FLOW_TS_START..]).get_u64(),
            ts_current: (&raw[FLOW_TS_CURRENT..]).get_u64(),
        };

        Ok(Self {
            key,
            metrics,
            fin: flag_at(raw, FLOW_FIN),
        })
    }

    pub fn identity(&self) -> FlowIdentity {
        FlowIdentity::of_key(&self.key)
    }
}

fn ensure_len(raw: &[u8], expected: usize) -> Result<(), DecodeError> {
    if raw.len() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: raw.len(),
        });
    }
    Ok(())
}

fn addr_at(raw: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; ADDR_LEN];
    octets.copy_from_slice(&raw[offset..offset + ADDR_LEN]);
    Ipv6Addr::from(octets)
}

fn be_u16_at(raw: &[u8], offset: usize) -> u16 {
    (&raw[offset..]).get_u16()
}

fn flag_at(raw: &[u8], offset: usize) -> bool {
    raw[offset] == FLAG_SET
}

/// Encode a packet event in the capture program's layout
#[cfg(test)]
pub(crate) fn encode_packet(record: &PacketRecord) -> Vec<u8> {
    use bytes::BufMut;

    let mut out = Vec::with_capacity(PACKET_EVENT_LEN);
    out.put_slice(&record.src_addr.octets());
    out.put_slice(&record.dst_addr.octets());
    out.put_u16(record.src_port);
    out.put_u16(record.dst_port);
    out.put_u8(record.protocol);
    out.put_u8(record.syn as u8);
    out.put_u8(record.ack as u8);
    out.put_u8(record.fin as u8);
    out.put_u64_le(record.ts_ns);
    out.put_u8(record.outbound as u8);
    out.put_u32(record.len);
    out
}
