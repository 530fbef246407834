//! Report exporters
//!
//! Writes the connection table as JSON or Prometheus text exposition.

use crate::{
    config::IngestMode,
    flowtable::FlowTable,
    types::{ConnectionSnapshot, EngineCounters, Endpoint, FlowsReport},
};
use anyhow::{Context, Result};
use clap::ValueEnum;
use std::{
    fmt::Write as _,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

/// Trait for report exporters
pub trait MetricsExporter: Send + Sync {
    /// Export a report
    ///
    /// # Arguments
    ///
    /// * `report` - Connection table snapshot to export
    ///
    /// # Returns
    ///
    /// Result indicating success or failure
    fn export(&self, report: &FlowsReport) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus format
    #[value(alias = "prom")]
    Prometheus,
}

impl ExporterType {
    /// Build the exporter writing to `output_path`
    pub fn build(self, output_path: PathBuf) -> Box<dyn MetricsExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
        }
    }
}

/// Snapshot the flow table and engine counters into a report
pub fn collect_report(
    table: &FlowTable,
    counters: &EngineCounters,
    mode: IngestMode,
    uptime_seconds: u64,
) -> FlowsReport {
    FlowsReport::new(
        table.list_connections(),
        counters.snapshot(),
        mode.name(),
        uptime_seconds,
    )
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, report: &FlowsReport) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(report)?
        } else {
            serde_json::to_string(report)?
        };

        write_file(&self.output_path, json.as_bytes())
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Convert a report to Prometheus text format
    fn to_prometheus_format(report: &FlowsReport) -> String {
        let mut output = String::new();
        let engine = &report.engine;

        metric_header(&mut output, "connstats_events_total", "Capture records received", "counter");
        let _ = writeln!(output, "connstats_events_total {}\n", engine.events);

        metric_header(&mut output, "connstats_dropped_total", "Capture records dropped", "counter");
        for (reason, count) in [
            ("malformed", engine.decode_failures),
            ("unknown_protocol", engine.unknown_protocol),
            ("orphan_tcp", engine.orphan_tcp),
        ] {
            let _ = writeln!(output, "connstats_dropped_total{{reason=\"{}\"}} {}", reason, count);
        }
        output.push('\n');

        metric_header(&mut output, "connstats_connections_opened_total", "Connections created", "counter");
        let _ = writeln!(output, "connstats_connections_opened_total {}\n", engine.opened);

        metric_header(&mut output, "connstats_tcp_closed_total", "TCP connections closed by handshake", "counter");
        let _ = writeln!(output, "connstats_tcp_closed_total {}\n", engine.tcp_closed);

        metric_header(&mut output, "connstats_pruned_total", "Idle connections pruned", "counter");
        let _ = writeln!(output, "connstats_pruned_total {}\n", engine.pruned);

        metric_header(&mut output, "connstats_merged_total", "Kernel flow entries merged", "counter");
        let _ = writeln!(output, "connstats_merged_total {}\n", engine.merged);

        metric_header(&mut output, "connstats_uptime_seconds", "Seconds since collection started", "gauge");
        let _ = writeln!(output, "connstats_uptime_seconds {}\n", report.uptime_seconds);

        metric_header(&mut output, "connstats_active_connections", "Connections in the flow table", "gauge");
        let _ = writeln!(output, "connstats_active_connections {}\n", report.active_connections);

        metric_header(&mut output, "connstats_connection_packets", "Packets per connection", "gauge");
        for conn in &report.connections {
            let labels = connection_labels(conn);
            let _ = writeln!(output, "connstats_connection_packets{{{},direction=\"in\"}} {}", labels, conn.packets_in);
            let _ = writeln!(output, "connstats_connection_packets{{{},direction=\"out\"}} {}", labels, conn.packets_out);
        }
        output.push('\n');

        metric_header(&mut output, "connstats_connection_bytes", "Bytes per connection", "gauge");
        for conn in &report.connections {
            let labels = connection_labels(conn);
            let _ = writeln!(output, "connstats_connection_bytes{{{},direction=\"in\"}} {}", labels, conn.bytes_in);
            let _ = writeln!(output, "connstats_connection_bytes{{{},direction=\"out\"}} {}", labels, conn.bytes_out);
        }
        output.push('\n');

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, report: &FlowsReport) -> Result<()> {
        let prometheus_data = Self::to_prometheus_format(report);
        write_file(&self.output_path, prometheus_data.as_bytes())
    }
}

fn metric_header(output: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
}

fn connection_labels(conn: &ConnectionSnapshot) -> String {
    format!(
        "hash=\"{}\",protocol=\"{}\",a=\"{}\",b=\"{}\"",
        conn.hash,
        conn.protocol.name(),
        Endpoint {
            addr: conn.a_addr,
            port: conn.a_port
        },
        Endpoint {
            addr: conn.b_addr,
            port: conn.b_port
        },
    )
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(data)
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        packet::{PacketRecord, Protocol},
        types::{Connection, EngineStats},
    };
    use flow_common::constants::IPPROTO_TCP;
    use std::net::Ipv4Addr;

    fn create_test_report() -> FlowsReport {
        let packet = PacketRecord {
            src_addr: Ipv4Addr::new(192, 168, 1, 10).to_ipv6_mapped(),
            dst_addr: Ipv4Addr::new(93, 184, 216, 34).to_ipv6_mapped(),
            src_port: 51000,
            dst_port: 443,
            protocol: IPPROTO_TCP,
            syn: true,
            ack: false,
            fin: false,
            ts_ns: 1_000,
            outbound: true,
            len: 74,
        };
        let conn = Connection::open(&packet, Protocol::Tcp);
        let snapshot = ConnectionSnapshot::new(packet.identity(), &conn);

        let engine = EngineStats {
            events: 1000,
            decode_failures: 2,
            opened: 1,
            ..EngineStats::default()
        };

        FlowsReport::new(vec![snapshot], engine, "packet", 60)
    }

    #[test]
    fn test_prometheus_format() {
        let report = create_test_report();
        let prometheus = PrometheusExporter::to_prometheus_format(&report);

        assert!(prometheus.contains("connstats_events_total 1000"));
        assert!(prometheus.contains("connstats_uptime_seconds 60"));
        assert!(prometheus.contains("connstats_active_connections 1"));
        assert!(prometheus.contains("connstats_dropped_total{reason=\"malformed\"} 2"));
        assert!(prometheus.contains("a=\"192.168.1.10:51000\""));
        assert!(prometheus.contains("b=\"93.184.216.34:443\""));
        assert!(prometheus.contains("protocol=\"TCP\",a=\"192.168.1.10:51000\",b=\"93.184.216.34:443\",direction=\"out\"} 1"));
    }

    #[test]
    fn test_json_export_writes_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.json");
        let report = create_test_report();

        JsonExporter::new(path.clone(), false).export(&report).unwrap();

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["active_connections"], 1);
        assert_eq!(written["mode"], "packet");
        assert_eq!(written["engine"]["events"], 1000);
        assert_eq!(written["connections"][0]["protocol"], "TCP");
        assert_eq!(written["connections"][0]["a_port"], 51000);
        assert_eq!(written["connections"][0]["packets_out"], 1);
    }

    #[test]
    fn test_export_to_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("flows.prom");
        let report = create_test_report();

        assert!(ExporterType::Prometheus.build(path).export(&report).is_err());
    }

    #[test]
    fn test_collect_report_counts_table() {
        let table = FlowTable::new();
        let counters = EngineCounters::new();
        let report = collect_report(&table, &counters, IngestMode::Aggregate, 5);

        assert_eq!(report.active_connections, 0);
        assert_eq!(report.mode, "aggregate");
        assert_eq!(report.uptime_seconds, 5);
    }
}
