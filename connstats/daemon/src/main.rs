//! Connection Stats - Userspace Daemon
//!
//! Loads the traffic control capture program, attaches it to an interface,
//! tracks per-connection statistics, and exports them periodically.
//!
//! ## Usage
//!
//! ```bash
//! # Track every packet on eth0 and export JSON every 10 seconds
//! sudo ./connstats --interface eth0 --ebpf-object connstats.o
//!
//! # Use in-kernel aggregation, merged every 5 seconds
//! sudo ./connstats --interface eth0 --ebpf-object connstats.o --mode aggregate
//!
//! # Run for 60 seconds and export to Prometheus format
//! sudo ./connstats --interface eth0 --ebpf-object connstats.o \
//!     --duration 60 --format prometheus --output flows.prom
//! ```

use anyhow::Result;
use clap::Parser;
use connstats::{
    collector::FlowCollector,
    config::{FlowConfig, IngestMode, MergePolicy, TcpOpenPolicy},
    events::{spawn_progress_reporter, EventProcessor, EventSink},
    exporter::{collect_report, ExporterType, MetricsExporter},
    flowtable::FlowTable,
    loader::ProbeLoader,
    merge::FlowMerger,
    tasks::{spawn_export_task, spawn_merge_task, spawn_prune_task, KernelAggregation},
    types::{EngineCounters, FlowsReport},
};
use log::{info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal,
    sync::broadcast,
    time::{sleep, Instant},
};

/// Per-connection network statistics using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Network interface to attach the classifiers to
    #[clap(short, long)]
    interface: String,

    /// Path to the compiled eBPF object file
    #[clap(long)]
    ebpf_object: PathBuf,

    /// Ingestion mode
    #[clap(short, long, value_enum, default_value_t = IngestMode::Packet)]
    mode: IngestMode,

    /// Which TCP packets may open a connection
    #[clap(long, value_enum, default_value_t = TcpOpenPolicy::SynOnly)]
    tcp_open: TcpOpenPolicy,

    /// How kernel aggregation entries are merged (aggregate mode)
    #[clap(long, value_enum, default_value_t = MergePolicy::Drain)]
    merge_policy: MergePolicy,

    /// Idle time in seconds after which a connection is pruned
    #[clap(long, default_value_t = 60)]
    stale_threshold: u64,

    /// Pruning interval in seconds
    #[clap(long, default_value_t = 10)]
    prune_interval: u64,

    /// Kernel map merge interval in seconds (aggregate mode)
    #[clap(long, default_value_t = 5)]
    merge_interval: u64,

    /// Export interval in seconds
    #[clap(long, default_value_t = 10)]
    export_interval: u64,

    /// Progress reporting interval in seconds
    #[clap(long, default_value_t = 10)]
    progress_interval: u64,

    /// Output file for the connection report
    #[clap(short, long, default_value = "connstats.json")]
    output: PathBuf,

    /// Output format
    #[clap(short, long, value_enum, default_value_t = ExporterType::Json)]
    format: ExporterType,

    /// Duration to run (in seconds, 0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    duration: u64,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

impl Args {
    fn flow_config(&self) -> FlowConfig {
        FlowConfig {
            stale_threshold: Duration::from_secs(self.stale_threshold),
            prune_interval: Duration::from_secs(self.prune_interval),
            merge_interval: Duration::from_secs(self.merge_interval),
            export_interval: Duration::from_secs(self.export_interval),
            progress_interval: Duration::from_secs(self.progress_interval),
            mode: self.mode,
            tcp_open: self.tcp_open,
            merge_policy: self.merge_policy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    print_banner();

    let config = args.flow_config();
    config.validate()?;

    info!("Starting connstats...");
    info!("   Interface: {}", args.interface);
    info!("   Mode: {}", config.mode.name());
    info!(
        "   Duration: {} seconds",
        if args.duration == 0 {
            "infinite".to_string()
        } else {
            args.duration.to_string()
        }
    );
    info!("   Output: {:?} ({:?})", args.output, args.format);
    info!("   Stale threshold: {:?}", config.stale_threshold);

    // Load and attach the capture program
    let mut loader = ProbeLoader::load(&args.ebpf_object)?;
    loader.init_logger();
    loader.attach_classifiers(&args.interface)?;
    let perf_array = loader.take_event_array()?;

    let table = FlowTable::new();
    let counters = Arc::new(EngineCounters::new());
    let exporter: Arc<dyn MetricsExporter> = Arc::from(args.format.build(args.output.clone()));
    let (shutdown, _) = broadcast::channel(1);
    let mut handles = Vec::new();

    // Pick the ingestion sink for the selected mode
    let (sink, kernel): (Option<Arc<dyn EventSink>>, Option<KernelAggregation>) = match config.mode {
        IngestMode::Packet => {
            let collector: Arc<dyn EventSink> = Arc::new(FlowCollector::new(
                table.clone(),
                config.tcp_open,
                Arc::clone(&counters),
            ));
            (Some(collector), None)
        }
        IngestMode::Aggregate => {
            let merger = FlowMerger::new(table.clone(), config.merge_policy, Arc::clone(&counters));
            let kernel = KernelAggregation::new(merger.clone(), Box::new(loader.take_flow_map()?));
            handles.push(spawn_merge_task(
                kernel.clone(),
                config.merge_interval,
                shutdown.subscribe(),
            ));
            let sink = if merger.accepts_stream() {
                let merger: Arc<dyn EventSink> = Arc::new(merger);
                Some(merger)
            } else {
                info!("Drain merge policy: kernel flow map is the only source, streamed records ignored");
                None
            };
            (sink, Some(kernel))
        }
    };

    info!("Collecting connection statistics...");

    if let Some(sink) = sink {
        let processor = EventProcessor::new(sink, shutdown.clone());
        handles.extend(processor.spawn_cpu_readers(perf_array)?);
    }

    handles.push(spawn_prune_task(
        table.clone(),
        kernel,
        &config,
        Arc::clone(&counters),
        shutdown.subscribe(),
    ));

    let start_time = Instant::now();
    handles.push(spawn_export_task(
        table.clone(),
        Arc::clone(&counters),
        Arc::clone(&exporter),
        config.mode,
        start_time,
        config.export_interval,
        shutdown.subscribe(),
    ));
    handles.push(spawn_progress_reporter(
        table.clone(),
        Arc::clone(&counters),
        config.progress_interval,
        shutdown.subscribe(),
    ));

    // Run for specified duration or until interrupted
    if args.duration > 0 {
        tokio::select! {
            _ = sleep(Duration::from_secs(args.duration)) => {
                info!("Duration reached, shutting down...");
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
            }
        }
    } else {
        signal::ctrl_c().await?;
        info!("Interrupted, shutting down...");
    }

    let _ = shutdown.send(());
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Task ended abnormally: {}", e);
        }
    }

    info!("Generating connection report...");

    let report = collect_report(&table, &counters, config.mode, start_time.elapsed().as_secs());
    exporter.export(&report)?;

    info!("Report written to {:?}", args.output);

    print_summary(&report);

    Ok(())
}

fn print_banner() {
    println!(
        r#"
╔═══════════════════════════════════════════════════╗
║        connstats - Connection Statistics          ║
║              eBPF Flow Tracker                    ║
╚═══════════════════════════════════════════════════╝
    "#
    );
}

fn print_summary(report: &FlowsReport) {
    let engine = &report.engine;

    info!("");
    info!("============================================");
    info!("             Summary Report");
    info!("============================================");
    info!("");
    info!("  Mode:               {}", report.mode);
    info!("  Duration:           {} seconds", report.uptime_seconds);
    info!("  Total events:       {}", engine.events);
    info!("  Active connections: {}", report.active_connections);
    info!("");
    info!("  Connections:");
    info!("    opened:      {:>8}", engine.opened);
    info!("    tcp closed:  {:>8}", engine.tcp_closed);
    info!("    pruned:      {:>8}", engine.pruned);
    info!("    merged:      {:>8}", engine.merged);
    info!("");
    info!("  Dropped events:");
    info!("    malformed:        {:>8}", engine.decode_failures);
    info!("    unknown protocol: {:>8}", engine.unknown_protocol);
    info!("    orphan tcp:       {:>8}", engine.orphan_tcp);
    info!("");

    let mut busiest: Vec<_> = report.connections.iter().collect();
    busiest.sort_by_key(|conn| std::cmp::Reverse(conn.bytes_in.saturating_add(conn.bytes_out)));
    if !busiest.is_empty() {
        info!("  Busiest connections:");
        for conn in busiest.iter().take(5) {
            info!(
                "    {} {}:{} <-> {}:{}  in {} B / out {} B",
                conn.protocol,
                conn.a_addr,
                conn.a_port,
                conn.b_addr,
                conn.b_port,
                conn.bytes_in,
                conn.bytes_out
            );
        }
        info!("");
    }
    info!("============================================");
}
