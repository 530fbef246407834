//! Connection Stats Library
//!
//! Flow-tracking engine for traffic captured by the connstats eBPF
//! classifiers: per-connection counters, TCP close detection, kernel
//! aggregation merging, pruning and export.

pub mod clock;
pub mod collector;
pub mod config;
pub mod events;
pub mod exporter;
pub mod flowtable;
pub mod loader;
pub mod merge;
pub mod packet;
pub mod tasks;
pub mod types;

pub use collector::{FlowCollector, IngestOutcome};
pub use config::{FlowConfig, IngestMode, MergePolicy, TcpOpenPolicy};
pub use events::{EventProcessor, EventSink};
pub use exporter::{ExporterType, JsonExporter, MetricsExporter, PrometheusExporter};
pub use flowtable::FlowTable;
pub use loader::ProbeLoader;
pub use merge::{AggregationTable, FlowMerger, KernelFlowMap};
pub use packet::{DecodeError, FlowIdentity, FlowRecord, PacketRecord, Protocol};
pub use types::*;
