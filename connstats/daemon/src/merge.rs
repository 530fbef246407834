//! Kernel aggregation map reconciliation
//!
//! In aggregate mode the capture program keeps per-flow counters in a kernel
//! hash map. This module pulls that map, folds its entries into the flow
//! table, and prunes stale kernel entries.

use crate::{
    config::MergePolicy,
    flowtable::{FlowTable, Upsert},
    packet::{FlowIdentity, FlowRecord},
    types::{Connection, EngineCounters},
};
use anyhow::{Context, Result};
use aya::maps::{HashMap, Map, MapData};
use flow_common::{FlowKey, FlowMetrics};
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};

/// The in-kernel flow aggregation map, seen from userspace
pub trait AggregationTable: Send {
    /// Current contents of the map
    fn entries(&self) -> Result<Vec<(FlowKey, FlowMetrics)>>;

    /// Delete one entry
    fn remove(&mut self, key: &FlowKey) -> Result<()>;
}

/// [`AggregationTable`] backed by the capture program's hash map
pub struct KernelFlowMap {
    map: HashMap<MapData, FlowKey, FlowMetrics>,
}

impl KernelFlowMap {
    pub fn new(map: Map) -> Result<Self> {
        let map = HashMap::try_from(map).context("Flow map has unexpected type")?;
        Ok(Self { map })
    }
}

impl AggregationTable for KernelFlowMap {
    fn entries(&self) -> Result<Vec<(FlowKey, FlowMetrics)>> {
        self.map
            .iter()
            .map(|entry| entry.context("Failed to read flow map entry"))
            .collect()
    }

    fn remove(&mut self, key: &FlowKey) -> Result<()> {
        self.map
            .remove(key)
            .context("Failed to delete flow map entry")
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    /// Entries that were new to the flow table
    pub inserted: usize,
    /// Entries folded into an existing connection
    pub merged: usize,
    /// Entries with an unknown protocol
    pub skipped: usize,
}

/// Reconciles kernel aggregation data into the flow table
#[derive(Clone)]
pub struct FlowMerger {
    table: FlowTable,
    policy: MergePolicy,
    counters: Arc<EngineCounters>,
}

impl FlowMerger {
    pub fn new(table: FlowTable, policy: MergePolicy, counters: Arc<EngineCounters>) -> Self {
        Self {
            table,
            policy,
            counters,
        }
    }

    /// Whether streamed flow records are folded into the table
    ///
    /// Under [`MergePolicy::Drain`] the kernel map is the single source:
    /// folding streamed cumulative counters as well would count the same
    /// kernel traffic twice.
    pub fn accepts_stream(&self) -> bool {
        self.policy == MergePolicy::Replace
    }

    /// Fold a batch of kernel entries into the flow table
    pub fn reconcile<I>(&self, batch: I) -> MergeSummary
    where
        I: IntoIterator<Item = (FlowKey, FlowMetrics)>,
    {
        let mut summary = MergeSummary::default();

        for (key, metrics) in batch {
            match self.fold(&key, &metrics, self.policy) {
                Some(Upsert::Inserted) => summary.inserted += 1,
                Some(_) => summary.merged += 1,
                None => summary.skipped += 1,
            }
        }

        EngineCounters::add(&self.counters.merged, summary.inserted + summary.merged);
        summary
    }

    /// Pull the kernel map and reconcile it
    ///
    /// Under [`MergePolicy::Drain`] every merged entry is deleted from the
    /// kernel map, so the next pass only sees traffic counted since.
    pub fn evict(&self, kernel: &mut dyn AggregationTable) -> Result<MergeSummary> {
        let batch = kernel.entries()?;
        let summary = self.reconcile(batch.iter().copied());

        if self.policy == MergePolicy::Drain {
            for (key, _) in &batch {
                if let Err(e) = kernel.remove(key) {
                    warn!("Could not drain flow {}: {:#}", FlowIdentity::of_key(key), e);
                }
            }
        }

        debug!(
            "Evicted {} kernel flows ({} new, {} merged, {} skipped)",
            batch.len(),
            summary.inserted,
            summary.merged,
            summary.skipped
        );
        Ok(summary)
    }

    /// Apply a streamed flow record
    ///
    /// Streamed records carry the kernel's cumulative counters and are only
    /// folded under [`MergePolicy::Replace`]; otherwise they are ignored and
    /// `None` is returned. The FIN flag does not end a flow here, pruning
    /// reclaims it.
    pub fn apply_record(&self, record: &FlowRecord) -> Option<Upsert> {
        if !self.accepts_stream() {
            debug!("Ignoring streamed record for flow {} under drain", record.identity());
            return None;
        }
        if record.fin {
            debug!("FIN seen on flow {}", record.identity());
        }
        let outcome = self.fold(&record.key, &record.metrics, MergePolicy::Replace);
        if outcome.is_some() {
            EngineCounters::bump(&self.counters.merged);
        }
        outcome
    }

    /// Decode a streamed flow record and apply it
    ///
    /// A malformed record is logged and counted, never propagated.
    pub fn apply_bytes(&self, raw: &[u8]) -> Option<Upsert> {
        EngineCounters::bump(&self.counters.events);
        match FlowRecord::decode(raw) {
            Ok(record) => self.apply_record(&record),
            Err(e) => {
                EngineCounters::bump(&self.counters.decode_failures);
                warn!("Could not decode flow record ({} bytes): {}", raw.len(), e);
                None
            }
        }
    }

    /// Delete kernel entries idle for longer than `threshold`
    pub fn prune_kernel(
        &self,
        kernel: &mut dyn AggregationTable,
        now_ns: u64,
        threshold: Duration,
    ) -> Result<usize> {
        let threshold_ns = u64::try_from(threshold.as_nanos()).unwrap_or(u64::MAX);
        let mut pruned = 0;

        for (key, metrics) in kernel.entries()? {
            let idle = now_ns.saturating_sub(metrics.ts_current);
            if idle <= threshold_ns {
                continue;
            }
            info!(
                "Pruning stale entry from kernel flow map: {} after {}ms",
                FlowIdentity::of_key(&key),
                idle / 1_000_000
            );
            match kernel.remove(&key) {
                Ok(()) => pruned += 1,
                Err(e) => warn!("{:#}", e),
            }
        }

        Ok(pruned)
    }

    fn fold(&self, key: &FlowKey, metrics: &FlowMetrics, policy: MergePolicy) -> Option<Upsert> {
        let incoming = match Connection::from_flow(key, metrics) {
            Ok(conn) => conn,
            Err(e) => {
                EngineCounters::bump(&self.counters.unknown_protocol);
                warn!("Skipping kernel flow {}: {}", FlowIdentity::of_key(key), e);
                return None;
            }
        };

        let outcome = self.table.upsert(
            FlowIdentity::of_key(key),
            || Some(incoming.clone()),
            |existing| {
                merge_into(existing, &incoming, policy);
                false
            },
        );
        Some(outcome)
    }
}

/// Reconcile `incoming` into `existing`
///
/// Timestamps always widen: earliest start, latest activity. Counters are
/// summed under `Drain` and take the larger value under `Replace`, so they
/// never decrease.
fn merge_into(existing: &mut Connection, incoming: &Connection, policy: MergePolicy) {
    match policy {
        MergePolicy::Drain => {
            existing.packets_in = existing.packets_in.saturating_add(incoming.packets_in);
            existing.packets_out = existing.packets_out.saturating_add(incoming.packets_out);
            existing.bytes_in = existing.bytes_in.saturating_add(incoming.bytes_in);
            existing.bytes_out = existing.bytes_out.saturating_add(incoming.bytes_out);
        }
        MergePolicy::Replace => {
            existing.packets_in = existing.packets_in.max(incoming.packets_in);
            existing.packets_out = existing.packets_out.max(incoming.packets_out);
            existing.bytes_in = existing.bytes_in.max(incoming.bytes_in);
            existing.bytes_out = existing.bytes_out.max(incoming.bytes_out);
        }
    }
    existing.ts_start = existing.ts_start.min(incoming.ts_start);
    existing.ts_last = existing.ts_last.max(incoming.ts_last);
}

/// In-memory [`AggregationTable`] for tests
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryFlowMap {
    pub entries: std::collections::HashMap<FlowKey, FlowMetrics>,
}

#[cfg(test)]
impl AggregationTable for MemoryFlowMap {
    fn entries(&self) -> Result<Vec<(FlowKey, FlowMetrics)>> {
        Ok(self.entries.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn remove(&mut self, key: &FlowKey) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_key(local_port: u16, protocol: u8) -> FlowKey {
    use std::net::Ipv4Addr;

    FlowKey {
        local_addr: Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped().octets(),
        remote_addr: Ipv4Addr::new(10, 0, 0, 2).to_ipv6_mapped().octets(),
        local_port: local_port.to_be(),
        remote_port: 80u16.to_be(),
        protocol,
        _padding: [0; 3],
    }
}

#[cfg(test)]
pub(crate) fn test_metrics(packets: u32, bytes: u64, ts_start: u64, ts_current: u64) -> FlowMetrics {
    FlowMetrics {
        packets_in: packets,
        packets_out: packets,
        bytes_in: bytes,
        bytes_out: bytes,
        ts_start,
        ts_current,
    }
}
