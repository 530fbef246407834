//! Event processing from eBPF perf buffers
//!
//! Reads capture events from per-CPU perf buffers and hands each record to
//! the active ingestion sink.

use crate::{
    collector::FlowCollector, flowtable::FlowTable, merge::FlowMerger, types::EngineCounters,
};
use anyhow::Result;
use aya::{
    maps::{perf::AsyncPerfEventArray, MapData},
    util::online_cpus,
};
use bytes::BytesMut;
use flow_common::constants::{FLOW_RECORD_LEN, PACKET_EVENT_LEN};
use log::{info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

/// Receiver of raw capture records
///
/// One implementation per ingestion mode, so the readers stay agnostic of
/// what the records contain.
pub trait EventSink: Send + Sync {
    /// Handle one raw record; failures are logged, never returned
    fn handle(&self, raw: &[u8]);

    /// Buffer size needed for one record
    fn record_len(&self) -> usize;
}

impl EventSink for FlowCollector {
    fn handle(&self, raw: &[u8]) {
        self.ingest_bytes(raw);
    }

    fn record_len(&self) -> usize {
        PACKET_EVENT_LEN
    }
}

impl EventSink for FlowMerger {
    fn handle(&self, raw: &[u8]) {
        self.apply_bytes(raw);
    }

    fn record_len(&self) -> usize {
        FLOW_RECORD_LEN
    }
}

/// Event processor that reads from perf buffers
pub struct EventProcessor {
    sink: Arc<dyn EventSink>,
    shutdown: broadcast::Sender<()>,
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `sink` - Receiver of every raw record
    /// * `shutdown` - Signal that stops the readers
    pub fn new(sink: Arc<dyn EventSink>, shutdown: broadcast::Sender<()>) -> Self {
        Self { sink, shutdown }
    }

    /// Spawn per-CPU event readers
    ///
    /// Creates a task for each CPU to read events from its perf buffer.
    pub fn spawn_cpu_readers(
        &self,
        mut perf_array: AsyncPerfEventArray<MapData>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let cpus = online_cpus()?;
        info!("Spawning event readers for {} CPUs", cpus.len());

        let mut handles = Vec::with_capacity(cpus.len());
        for cpu_id in cpus {
            let mut buf = perf_array.open(cpu_id, None)?;
            let sink = Arc::clone(&self.sink);
            let mut shutdown = self.shutdown.subscribe();

            handles.push(tokio::spawn(async move {
                // Pre-allocate buffers for reading events
                let mut buffers = (0..10)
                    .map(|_| BytesMut::with_capacity(sink.record_len()))
                    .collect::<Vec<_>>();

                loop {
                    let events = tokio::select! {
                        result = buf.read_events(&mut buffers) => match result {
                            Ok(events) => events,
                            Err(e) => {
                                warn!("Error reading events from CPU {}: {}", cpu_id, e);
                                continue;
                            }
                        },
                        _ = shutdown.recv() => break,
                    };

                    if events.lost > 0 {
                        warn!("CPU {} lost {} events", cpu_id, events.lost);
                    }

                    for record in buffers.iter().take(events.read) {
                        sink.handle(record);
                    }
                }

                info!("Event reader for CPU {} stopped", cpu_id);
            }));
        }

        Ok(handles)
    }
}

/// Spawn progress reporter
///
/// Periodically logs the number of live connections and engine counters.
pub fn spawn_progress_reporter(
    table: FlowTable,
    counters: Arc<EngineCounters>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = counters.snapshot();
                    info!(
                        "Progress: {} events, {} active connections ({} opened, {} closed, {} pruned, {} dropped)",
                        stats.events,
                        table.count(),
                        stats.opened,
                        stats.tcp_closed,
                        stats.pruned,
                        stats.decode_failures + stats.unknown_protocol + stats.orphan_tcp
                    );
                }
                _ = shutdown.recv() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{MergePolicy, TcpOpenPolicy},
        merge::{test_key, test_metrics},
        packet::{encode_packet, FlowIdentity, PacketRecord},
    };
    use flow_common::constants::IPPROTO_UDP;
    use std::net::Ipv4Addr;

    #[test]
    fn test_collector_sink_ingests_packets() {
        let table = FlowTable::new();
        let counters = Arc::new(EngineCounters::new());
        let sink: Arc<dyn EventSink> = Arc::new(FlowCollector::new(
            table.clone(),
            TcpOpenPolicy::SynOnly,
            Arc::clone(&counters),
        ));

        let packet = PacketRecord {
            src_addr: Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped(),
            dst_addr: Ipv4Addr::new(8, 8, 8, 8).to_ipv6_mapped(),
            src_port: 53000,
            dst_port: 53,
            protocol: IPPROTO_UDP,
            syn: false,
            ack: false,
            fin: false,
            ts_ns: 10,
            outbound: true,
            len: 80,
        };
        sink.handle(&encode_packet(&packet));
        sink.handle(&[1, 2, 3]);

        assert_eq!(sink.record_len(), PACKET_EVENT_LEN);
        assert_eq!(table.count(), 1);
        let stats = counters.snapshot();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.decode_failures, 1);
    }

    #[test]
    fn test_merger_sink_applies_flow_records() {
        let table = FlowTable::new();
        let counters = Arc::new(EngineCounters::new());
        let sink: Arc<dyn EventSink> = Arc::new(FlowMerger::new(
            table.clone(),
            MergePolicy::Replace,
            Arc::clone(&counters),
        ));

        let key = test_key(4000, IPPROTO_UDP);
        let metrics = test_metrics(7, 700, 1, 2);
        let mut raw = Vec::with_capacity(FLOW_RECORD_LEN);
        raw.extend_from_slice(&key.local_addr);
        raw.extend_from_slice(&key.remote_addr);
        raw.extend_from_slice(&u16::from_be(key.local_port).to_be_bytes());
        raw.extend_from_slice(&u16::from_be(key.remote_port).to_be_bytes());
        raw.push(key.protocol);
        raw.extend_from_slice(&metrics.packets_in.to_be_bytes());
        raw.extend_from_slice(&metrics.packets_out.to_be_bytes());
        raw.extend_from_slice(&metrics.bytes_in.to_be_bytes());
        raw.extend_from_slice(&metrics.bytes_out.to_be_bytes());
        raw.extend_from_slice(&metrics.ts_start.to_be_bytes());
        raw.extend_from_slice(&metrics.ts_current.to_be_bytes());
        raw.push(0);

        sink.handle(&raw);
        sink.handle(&raw[..30]);

        let conn = table.get(FlowIdentity::of_key(&key)).unwrap();
        assert_eq!(conn.packets_in, 7);
        assert_eq!(sink.record_len(), FLOW_RECORD_LEN);
        let stats = counters.snapshot();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.decode_failures, 1);
    }

    #[tokio::test]
    async fn test_progress_reporter_stops_on_shutdown() {
        let (tx, rx) = broadcast::channel(1);
        let handle = spawn_progress_reporter(
            FlowTable::new(),
            Arc::new(EngineCounters::new()),
            Duration::from_millis(5),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
