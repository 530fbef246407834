//! Per-packet statistics engine
//!
//! Turns decoded packet events into connection entries: opens flows, keeps
//! the direction-partitioned counters, and removes TCP flows once their
//! close sequence completes.

use crate::{
    config::TcpOpenPolicy,
    flowtable::{FlowTable, Upsert},
    packet::{PacketRecord, Protocol},
    types::{Connection, EngineCounters},
};
use log::{debug, info, warn};
use std::sync::Arc;

/// Why an event did not touch the flow table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The event bytes could not be decoded
    Malformed,
    UnknownProtocol,
    /// A non-opening TCP packet for a flow the table does not know
    OrphanTcp,
}

/// What ingesting one packet did to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    Updated,
    /// The packet completed a TCP close and the entry was removed
    Closed,
    Dropped(DropReason),
}

/// Statistics engine for the per-packet ingestion mode
#[derive(Clone)]
pub struct FlowCollector {
    table: FlowTable,
    tcp_open: TcpOpenPolicy,
    counters: Arc<EngineCounters>,
}

impl FlowCollector {
    /// Create a collector writing into `table`
    ///
    /// # Arguments
    ///
    /// * `table` - Shared flow table
    /// * `tcp_open` - Which TCP packets may create an entry
    /// * `counters` - Shared engine counters
    pub fn new(table: FlowTable, tcp_open: TcpOpenPolicy, counters: Arc<EngineCounters>) -> Self {
        Self {
            table,
            tcp_open,
            counters,
        }
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// Decode raw event bytes and ingest them
    ///
    /// Malformed events are logged and dropped.
    pub fn ingest_bytes(&self, raw: &[u8]) -> IngestOutcome {
        match PacketRecord::decode(raw) {
            Ok(record) => self.ingest(&record),
            Err(e) => {
                EngineCounters::bump(&self.counters.events);
                EngineCounters::bump(&self.counters.decode_failures);
                warn!("Could not decode packet event ({} bytes): {}", raw.len(), e);
                IngestOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Apply one packet to the flow table
    pub fn ingest(&self, record: &PacketRecord) -> IngestOutcome {
        EngineCounters::bump(&self.counters.events);

        let protocol = match Protocol::try_from(record.protocol) {
            Ok(protocol) => protocol,
            Err(e) => {
                EngineCounters::bump(&self.counters.unknown_protocol);
                warn!("Dropping event: {}", e);
                return IngestOutcome::Dropped(DropReason::UnknownProtocol);
            }
        };

        let id = record.identity();
        let may_open = match protocol {
            Protocol::Udp => true,
            Protocol::Tcp => record.syn || self.tcp_open == TcpOpenPolicy::Any,
        };

        let outcome = self.table.upsert(
            id,
            || may_open.then(|| Connection::open(record, protocol)),
            |conn| {
                conn.account(record);
                protocol == Protocol::Tcp && conn.close.observe(record.syn, record.ack, record.fin)
            },
        );

        match outcome {
            Upsert::Inserted => {
                EngineCounters::bump(&self.counters.opened);
                debug!(
                    "New connection ({}) ({}) Flow | A: {}:{} B: {}:{}",
                    protocol,
                    id,
                    crate::packet::unmap(&record.src_addr),
                    record.src_port,
                    crate::packet::unmap(&record.dst_addr),
                    record.dst_port
                );
                IngestOutcome::Created
            }
            Upsert::Updated => IngestOutcome::Updated,
            Upsert::Removed => {
                EngineCounters::bump(&self.counters.tcp_closed);
                info!("TCP connection {} closed", id);
                IngestOutcome::Closed
            }
            Upsert::Skipped => {
                EngineCounters::bump(&self.counters.orphan_tcp);
                debug!("Dropping mid-stream TCP packet for unknown flow {}", id);
                IngestOutcome::Dropped(DropReason::OrphanTcp)
            }
        }
    }
}
