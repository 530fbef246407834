//! Engine configuration
//!
//! Every interval and threshold the engine uses lives here; the binary maps
//! its command-line flags onto [`FlowConfig`].

use anyhow::{ensure, Result};
use clap::ValueEnum;
use flow_common::constants::*;
use std::time::Duration;

/// Where flow data comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IngestMode {
    /// One event per observed packet, fed to the statistics engine
    Packet,
    /// Flows aggregated in the kernel, periodically evicted and merged
    Aggregate,
}

impl IngestMode {
    pub fn name(self) -> &'static str {
        match self {
            IngestMode::Packet => "packet",
            IngestMode::Aggregate => "aggregate",
        }
    }
}

/// Which packets may create a TCP entry for an unknown flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TcpOpenPolicy {
    /// Only a SYN opens a TCP connection; mid-stream packets are dropped
    #[default]
    SynOnly,
    /// Any TCP packet opens a connection, including flows seen mid-stream
    Any,
}

/// How kernel aggregation entries are reconciled into the flow table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum MergePolicy {
    /// Add incoming counters to the table and delete the merged entries
    /// from the kernel map in the same pass. The kernel map is the only
    /// source; streamed flow records are ignored.
    #[default]
    Drain,
    /// Treat kernel counters as cumulative; keep the kernel map intact.
    /// The larger of the table and kernel value wins, so counters never
    /// decrease. Streamed flow records are folded the same way.
    Replace,
}

/// Runtime configuration of the flow-tracking engine
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Idle time after which an entry is pruned
    pub stale_threshold: Duration,
    pub prune_interval: Duration,
    /// Kernel map eviction interval (aggregate mode only)
    pub merge_interval: Duration,
    pub export_interval: Duration,
    pub progress_interval: Duration,
    pub mode: IngestMode,
    pub tcp_open: TcpOpenPolicy,
    pub merge_policy: MergePolicy,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(DEFAULT_STALE_THRESHOLD_SECS),
            prune_interval: Duration::from_secs(DEFAULT_PRUNE_INTERVAL_SECS),
            merge_interval: Duration::from_secs(DEFAULT_MERGE_INTERVAL_SECS),
            export_interval: Duration::from_secs(DEFAULT_EXPORT_INTERVAL_SECS),
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
            mode: IngestMode::Packet,
            tcp_open: TcpOpenPolicy::SynOnly,
            merge_policy: MergePolicy::Drain,
        }
    }
}

impl FlowConfig {
    /// Reject configurations that would spin or prune everything
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.stale_threshold.is_zero(),
            "stale threshold must be greater than zero"
        );
        ensure!(
            !self.prune_interval.is_zero(),
            "prune interval must be greater than zero"
        );
        ensure!(
            !self.merge_interval.is_zero(),
            "merge interval must be greater than zero"
        );
        ensure!(
            !self.export_interval.is_zero(),
            "export interval must be greater than zero"
        );
        ensure!(
            !self.progress_interval.is_zero(),
            "progress interval must be greater than zero"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FlowConfig::default();
        assert_eq!(config.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.prune_interval, Duration::from_secs(10));
        assert_eq!(config.merge_interval, Duration::from_secs(5));
        assert_eq!(config.export_interval, Duration::from_secs(10));
        assert_eq!(
            config.progress_interval,
            Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS)
        );
        assert_eq!(config.tcp_open, TcpOpenPolicy::SynOnly);
        assert_eq!(config.merge_policy, MergePolicy::Drain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = FlowConfig {
            prune_interval: Duration::ZERO,
            ..FlowConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("prune interval"));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = FlowConfig {
            stale_threshold: Duration::ZERO,
            ..FlowConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
