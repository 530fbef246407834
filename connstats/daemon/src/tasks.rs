//! Periodic background tasks
//!
//! Pruning, kernel map merging and report export each run on their own
//! ticker until the shutdown signal fires. A pass that has started always
//! completes; shutdown is only observed between passes.

use crate::{
    clock::monotonic_now_ns,
    config::{FlowConfig, IngestMode},
    exporter::{collect_report, MetricsExporter},
    flowtable::FlowTable,
    merge::{AggregationTable, FlowMerger},
    types::EngineCounters,
};
use anyhow::Result;
use log::{debug, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{interval, Instant, Interval, MissedTickBehavior},
};

/// Kernel aggregation map shared between the merge and prune tasks
pub type SharedAggregationTable = Arc<Mutex<Box<dyn AggregationTable>>>;

/// The kernel side of aggregate mode
#[derive(Clone)]
pub struct KernelAggregation {
    pub merger: FlowMerger,
    pub map: SharedAggregationTable,
}

impl KernelAggregation {
    pub fn new(merger: FlowMerger, map: Box<dyn AggregationTable>) -> Self {
        Self {
            merger,
            map: Arc::new(Mutex::new(map)),
        }
    }
}

fn delayed_interval(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// One pruning pass over the flow table and, if present, the kernel map
///
/// Returns the number of flow table entries deleted.
pub async fn prune_once(
    table: &FlowTable,
    kernel: Option<&KernelAggregation>,
    threshold: Duration,
    counters: &EngineCounters,
) -> Result<usize> {
    let now = monotonic_now_ns()?;
    let pruned = table.prune(now, threshold);
    EngineCounters::add(&counters.pruned, pruned);

    if let Some(kernel) = kernel {
        let mut map = kernel.map.lock().await;
        let removed = kernel.merger.prune_kernel(&mut **map, now, threshold)?;
        if removed > 0 {
            debug!("Pruned {} kernel flow map entries", removed);
        }
    }

    Ok(pruned)
}

/// Spawn the pruning task
///
/// # Arguments
///
/// * `table` - Flow table to prune
/// * `kernel` - Kernel map to prune as well, in aggregate mode
/// * `config` - Source of the prune interval and staleness threshold
/// * `counters` - Engine counters; deletions are added to `pruned`
/// * `shutdown` - Stops the task between passes
pub fn spawn_prune_task(
    table: FlowTable,
    kernel: Option<KernelAggregation>,
    config: &FlowConfig,
    counters: Arc<EngineCounters>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let period = config.prune_interval;
    let threshold = config.stale_threshold;

    tokio::spawn(async move {
        let mut ticker = delayed_interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match prune_once(&table, kernel.as_ref(), threshold, &counters).await {
                        Ok(0) => {}
                        Ok(n) => info!("Pruned {} stale connections", n),
                        Err(e) => warn!("Prune pass failed: {:#}", e),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        debug!("Prune task stopped");
    })
}

/// Spawn the kernel map merge task
pub fn spawn_merge_task(
    kernel: KernelAggregation,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = delayed_interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let mut map = kernel.map.lock().await;
                    if let Err(e) = kernel.merger.evict(&mut **map) {
                        warn!("Merge pass failed: {:#}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        debug!("Merge task stopped");
    })
}

/// Spawn the periodic report export task
pub fn spawn_export_task(
    table: FlowTable,
    counters: Arc<EngineCounters>,
    exporter: Arc<dyn MetricsExporter>,
    mode: IngestMode,
    started: Instant,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = delayed_interval(period);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = collect_report(&table, &counters, mode, started.elapsed().as_secs());
                    if let Err(e) = exporter.export(&report) {
                        warn!("Periodic export failed: {:#}", e);
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        debug!("Export task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::MergePolicy,
        merge::{test_key, test_metrics, MemoryFlowMap},
        packet::{FlowIdentity, PacketRecord, Protocol},
        types::{Connection, FlowsReport},
    };
    use flow_common::constants::{IPPROTO_TCP, IPPROTO_UDP};
    use std::{net::Ipv4Addr, sync::Mutex as StdMutex};

    const SECOND: u64 = 1_000_000_000;

    fn udp_connection(src_port: u16, ts_ns: u64) -> (FlowIdentity, Connection) {
        let packet = PacketRecord {
            src_addr: Ipv4Addr::new(10, 2, 0, 1).to_ipv6_mapped(),
            dst_addr: Ipv4Addr::new(10, 2, 0, 2).to_ipv6_mapped(),
            src_port,
            dst_port: 5353,
            protocol: IPPROTO_UDP,
            syn: false,
            ack: false,
            fin: false,
            ts_ns,
            outbound: false,
            len: 100,
        };
        (packet.identity(), Connection::open(&packet, Protocol::Udp))
    }

    fn test_config(period: Duration) -> FlowConfig {
        FlowConfig {
            prune_interval: period,
            merge_interval: period,
            export_interval: period,
            stale_threshold: Duration::from_secs(60),
            ..FlowConfig::default()
        }
    }

    #[derive(Default)]
    struct RecordingExporter {
        reports: StdMutex<Vec<FlowsReport>>,
    }

    impl MetricsExporter for RecordingExporter {
        fn export(&self, report: &FlowsReport) -> Result<()> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_prune_once_removes_only_stale_entries() {
        let now = monotonic_now_ns().unwrap();
        let table = FlowTable::new();
        let counters = EngineCounters::new();

        let (stale_id, stale) = udp_connection(1000, now.saturating_sub(120 * SECOND));
        let (fresh_id, fresh) = udp_connection(1001, now);
        table.insert(stale_id, stale);
        table.insert(fresh_id, fresh);

        let pruned = prune_once(&table, None, Duration::from_secs(60), &counters)
            .await
            .unwrap();

        assert_eq!(pruned, 1);
        assert!(table.get(stale_id).is_none());
        assert!(table.get(fresh_id).is_some());
        assert_eq!(counters.snapshot().pruned, 1);
    }

    #[tokio::test]
    async fn test_prune_once_covers_kernel_map() {
        let now = monotonic_now_ns().unwrap();
        let table = FlowTable::new();
        let counters = Arc::new(EngineCounters::new());
        let merger = FlowMerger::new(table.clone(), MergePolicy::Replace, Arc::clone(&counters));

        let mut map = MemoryFlowMap::default();
        map.entries.insert(
            test_key(1000, IPPROTO_TCP),
            test_metrics(1, 64, 0, now.saturating_sub(120 * SECOND)),
        );
        map.entries
            .insert(test_key(1001, IPPROTO_TCP), test_metrics(1, 64, 0, now));
        let kernel = KernelAggregation::new(merger, Box::new(map));

        prune_once(&table, Some(&kernel), Duration::from_secs(60), &counters)
            .await
            .unwrap();

        let entries = kernel.map.lock().await.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, test_key(1001, IPPROTO_TCP));
    }

    #[tokio::test]
    async fn test_prune_task_runs_until_shutdown() {
        let now = monotonic_now_ns().unwrap();
        let table = FlowTable::new();
        let counters = Arc::new(EngineCounters::new());
        let (tx, rx) = broadcast::channel(1);

        let (stale_id, stale) = udp_connection(1000, now.saturating_sub(120 * SECOND));
        table.insert(stale_id, stale);

        let handle = spawn_prune_task(
            table.clone(),
            None,
            &test_config(Duration::from_millis(10)),
            Arc::clone(&counters),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(table.count(), 0);
        assert_eq!(counters.snapshot().pruned, 1);
    }

    #[tokio::test]
    async fn test_merge_task_drains_kernel_map() {
        let table = FlowTable::new();
        let counters = Arc::new(EngineCounters::new());
        let merger = FlowMerger::new(table.clone(), MergePolicy::Drain, Arc::clone(&counters));
        let (tx, rx) = broadcast::channel(1);

        let key = test_key(2000, IPPROTO_UDP);
        let mut map = MemoryFlowMap::default();
        map.entries.insert(key, test_metrics(4, 400, 1, 2));
        let kernel = KernelAggregation::new(merger, Box::new(map));

        let handle = spawn_merge_task(kernel.clone(), Duration::from_millis(10), rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        assert!(kernel.map.lock().await.entries().unwrap().is_empty());
        let conn = table.get(FlowIdentity::of_key(&key)).unwrap();
        assert_eq!(conn.packets_in, 4);
        assert_eq!(conn.bytes_out, 400);
    }

    #[tokio::test]
    async fn test_export_task_writes_reports() {
        let table = FlowTable::new();
        let (id, conn) = udp_connection(3000, 1);
        table.insert(id, conn);
        let exporter = Arc::new(RecordingExporter::default());
        let (tx, rx) = broadcast::channel(1);

        let handle = spawn_export_task(
            table,
            Arc::new(EngineCounters::new()),
            exporter.clone(),
            IngestMode::Packet,
            Instant::now(),
            Duration::from_millis(10),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();

        let reports = exporter.reports.lock().unwrap();
        assert!(!reports.is_empty());
        assert_eq!(reports[0].active_connections, 1);
        assert_eq!(reports[0].mode, "packet");
    }
}
