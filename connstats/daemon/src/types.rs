//! Userspace type definitions
//!
//! Defines the records held in the flow table and the data structures
//! produced for export.
//!
//! ## Organization
//!
//! - **Table Types**: `Connection` and its per-flow TCP close progress
//! - **Export Types**: serializable snapshots handed to exporters

use crate::packet::{unmap, DecodeError, FlowIdentity, PacketRecord, Protocol};
use flow_common::{constants::TCP_CLOSE_FINS, FlowKey, FlowMetrics};
use serde::Serialize;
use std::{
    fmt,
    net::{IpAddr, Ipv6Addr},
    sync::atomic::{AtomicU64, Ordering},
};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// One side of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    /// Build an endpoint from a 16-byte wire address
    pub fn from_wire(addr: &Ipv6Addr, port: u16) -> Self {
        Self {
            addr: unmap(addr),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(addr) => write!(f, "{}:{}", addr, self.port),
            IpAddr::V6(addr) => write!(f, "[{}]:{}", addr, self.port),
        }
    }
}

/// Per-connection TCP teardown progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpClose {
    /// FIN-flagged packets seen on this connection
    pub fins_seen: u8,
    /// Both FINs were seen; the next pure ACK closes the connection
    pub awaiting_final_ack: bool,
}

impl TcpClose {
    /// Advance close tracking with one packet's flags
    ///
    /// Returns true when this packet completes the close sequence.
    pub fn observe(&mut self, syn: bool, ack: bool, fin: bool) -> bool {
        if fin {
            self.fins_seen = self.fins_seen.saturating_add(1);
            if self.fins_seen >= TCP_CLOSE_FINS {
                self.awaiting_final_ack = true;
            }
            return false;
        }

        self.awaiting_final_ack && ack && !syn
    }
}

/// One live flow in the flow table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub protocol: Protocol,
    /// Source of the packet that created the entry
    pub a: Endpoint,
    pub b: Endpoint,
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Monotonic timestamp of the first packet (nanoseconds)
    pub ts_start: u64,
    /// Monotonic timestamp of the latest packet (nanoseconds)
    pub ts_last: u64,
    pub close: TcpClose,
}

impl Connection {
    /// Create a connection from the packet that opens it
    pub fn open(record: &PacketRecord, protocol: Protocol) -> Self {
        let mut conn = Self {
            protocol,
            a: Endpoint::from_wire(&record.src_addr, record.src_port),
            b: Endpoint::from_wire(&record.dst_addr, record.dst_port),
            packets_in: 0,
            packets_out: 0,
            bytes_in: 0,
            bytes_out: 0,
            ts_start: record.ts_ns,
            ts_last: record.ts_ns,
            close: TcpClose::default(),
        };
        conn.account(record);
        if protocol == Protocol::Tcp {
            conn.close.observe(record.syn, record.ack, record.fin);
        }
        conn
    }

    /// Create a connection from an in-kernel aggregation entry
    ///
    /// Endpoint A is the local side of the monitored interface.
    pub fn from_flow(key: &FlowKey, metrics: &FlowMetrics) -> Result<Self, DecodeError> {
        let protocol = Protocol::try_from(key.protocol)?;
        let ts_start = metrics.ts_start.min(metrics.ts_current);

        Ok(Self {
            protocol,
            a: Endpoint::from_wire(&Ipv6Addr::from(key.local_addr), u16::from_be(key.local_port)),
            b: Endpoint::from_wire(
                &Ipv6Addr::from(key.remote_addr),
                u16::from_be(key.remote_port),
            ),
            packets_in: u64::from(metrics.packets_in),
            packets_out: u64::from(metrics.packets_out),
            bytes_in: metrics.bytes_in,
            bytes_out: metrics.bytes_out,
            ts_start,
            ts_last: metrics.ts_current,
            close: TcpClose::default(),
        })
    }

    /// Attribute one packet to the inbound or outbound counters
    ///
    /// Events from different CPUs can arrive out of order, so `ts_last` only
    /// moves forward.
    pub fn account(&mut self, record: &PacketRecord) {
        let len = u64::from(record.len);
        if record.outbound {
            self.packets_out = self.packets_out.saturating_add(1);
            self.bytes_out = self.bytes_out.saturating_add(len);
        } else {
            self.packets_in = self.packets_in.saturating_add(1);
            self.bytes_in = self.bytes_in.saturating_add(len);
        }
        self.ts_last = self.ts_last.max(record.ts_ns);
    }

    /// Nanoseconds this connection has been idle at `now_ns`
    pub fn idle_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.ts_last)
    }

    /// Derived rates and ratios
    pub fn stats(&self) -> ConnectionStats {
        let elapsed_secs = self.ts_last.saturating_sub(self.ts_start) as f64 / NANOS_PER_SEC;
        let (packets_in, packets_out) = (self.packets_in as f64, self.packets_out as f64);
        let (bytes_in, bytes_out) = (self.bytes_in as f64, self.bytes_out as f64);

        ConnectionStats {
            in_pps: ratio(packets_in, elapsed_secs),
            out_pps: ratio(packets_out, elapsed_secs),
            in_bytes_per_packet: ratio(bytes_in, packets_in),
            out_bytes_per_packet: ratio(bytes_out, packets_out),
            in_out_bytes_ratio: ratio(bytes_in, bytes_out),
            in_out_packets_ratio: ratio(packets_in, packets_out),
        }
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Derived per-connection metrics; never stored, computed on demand
#[derive(Serialize, Debug, Default, Clone, Copy, PartialEq)]
pub struct ConnectionStats {
    /// Inbound packets per second over the connection lifetime
    pub in_pps: f64,
    /// Outbound packets per second over the connection lifetime
    pub out_pps: f64,
    pub in_bytes_per_packet: f64,
    pub out_bytes_per_packet: f64,
    /// Inbound bytes divided by outbound bytes
    pub in_out_bytes_ratio: f64,
    /// Inbound packets divided by outbound packets
    pub in_out_packets_ratio: f64,
}

/// Immutable copy of a connection for export
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub hash: FlowIdentity,
    pub protocol: Protocol,
    pub a_addr: IpAddr,
    pub a_port: u16,
    pub b_addr: IpAddr,
    pub b_port: u16,
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub ts_start: u64,
    pub ts_last: u64,
    pub stats: ConnectionStats,
}

impl ConnectionSnapshot {
    pub fn new(hash: FlowIdentity, conn: &Connection) -> Self {
        Self {
            hash,
            protocol: conn.protocol,
            a_addr: conn.a.addr,
            a_port: conn.a.port,
            b_addr: conn.b.addr,
            b_port: conn.b.port,
            packets_in: conn.packets_in,
            packets_out: conn.packets_out,
            bytes_in: conn.bytes_in,
            bytes_out: conn.bytes_out,
            ts_start: conn.ts_start,
            ts_last: conn.ts_last,
            stats: conn.stats(),
        }
    }
}

/// Engine-wide event counters, shared by every task
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub events: AtomicU64,
    pub decode_failures: AtomicU64,
    pub unknown_protocol: AtomicU64,
    /// Mid-stream TCP packets for unknown flows
    pub orphan_tcp: AtomicU64,
    pub opened: AtomicU64,
    pub tcp_closed: AtomicU64,
    pub pruned: AtomicU64,
    pub merged: AtomicU64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        EngineStats {
            events: load(&self.events),
            decode_failures: load(&self.decode_failures),
            unknown_protocol: load(&self.unknown_protocol),
            orphan_tcp: load(&self.orphan_tcp),
            opened: load(&self.opened),
            tcp_closed: load(&self.tcp_closed),
            pruned: load(&self.pruned),
            merged: load(&self.merged),
        }
    }
}

/// Point-in-time copy of [`EngineCounters`]
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub events: u64,
    pub decode_failures: u64,
    pub unknown_protocol: u64,
    pub orphan_tcp: u64,
    pub opened: u64,
    pub tcp_closed: u64,
    pub pruned: u64,
    pub merged: u64,
}

/// Export document
#[derive(Serialize, Debug, Clone)]
pub struct FlowsReport {
    /// RFC 3339 timestamp when the report was generated
    pub timestamp: String,
    /// Seconds since the daemon started collecting
    pub uptime_seconds: u64,
    /// Ingestion mode name
    pub mode: String,
    pub active_connections: usize,
    pub engine: EngineStats,
    pub connections: Vec<ConnectionSnapshot>,
}

impl FlowsReport {
    pub fn new(
        connections: Vec<ConnectionSnapshot>,
        engine: EngineStats,
        mode: &str,
        uptime_seconds: u64,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            uptime_seconds,
            mode: mode.to_string(),
            active_connections: connections.len(),
            engine,
            connections,
        }
    }
}
