//! Shared constants for the capture program and the userspace daemon
//!
//! Offsets and sizes here must match what the classifier programs write.

// ============================================================================
// Map and Program Names
// ============================================================================

/// Perf event array carrying per-packet events (or streamed flow records)
pub const EVENTS_MAP: &str = "EVENTS";

/// In-kernel flow aggregation hash map
pub const FLOWS_MAP: &str = "FLOWSTRACKER";

/// Classifier attached to the ingress hook
pub const INGRESS_PROGRAM: &str = "connstats_ingress";

/// Classifier attached to the egress hook
pub const EGRESS_PROGRAM: &str = "connstats_egress";

// ============================================================================
// Packet Event Layout
// ============================================================================

/// Size of an IPv6 (or IPv4-mapped) address on the wire
pub const ADDR_LEN: usize = 16;

/// Total size of a packet event record
pub const PACKET_EVENT_LEN: usize = 53;

pub const PKT_SRC_ADDR: usize = 0;
pub const PKT_DST_ADDR: usize = 16;
/// Source port, big-endian u16
pub const PKT_SRC_PORT: usize = 32;
/// Destination port, big-endian u16
pub const PKT_DST_PORT: usize = 34;
pub const PKT_PROTOCOL: usize = 36;
pub const PKT_SYN: usize = 37;
pub const PKT_ACK: usize = 38;
pub const PKT_FIN: usize = 39;
/// Monotonic timestamp in nanoseconds, little-endian u64
pub const PKT_TIMESTAMP: usize = 40;
pub const PKT_OUTBOUND: usize = 48;
/// Frame length, big-endian u32
pub const PKT_LEN: usize = 49;

// ============================================================================
// Flow Record Layout (aggregation variant)
// ============================================================================

/// Total size of a streamed flow record
pub const FLOW_RECORD_LEN: usize = 78;

pub const FLOW_LOCAL_ADDR: usize = 0;
pub const FLOW_REMOTE_ADDR: usize = 16;
pub const FLOW_LOCAL_PORT: usize = 32;
pub const FLOW_REMOTE_PORT: usize = 34;
pub const FLOW_PROTOCOL: usize = 36;
/// Counters and timestamps that follow are all big-endian
pub const FLOW_PACKETS_IN: usize = 37;
pub const FLOW_PACKETS_OUT: usize = 41;
pub const FLOW_BYTES_IN: usize = 45;
pub const FLOW_BYTES_OUT: usize = 53;
pub const FLOW_TS_START: usize = 61;
pub const FLOW_TS_CURRENT: usize = 69;
pub const FLOW_FIN: usize = 77;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

// ============================================================================
// Flag Encoding
// ============================================================================

/// A flag byte equal to this value means "set"; anything else means "clear"
pub const FLAG_SET: u8 = 1;

/// FIN packets needed (one per direction) before the final ACK closes a flow
pub const TCP_CLOSE_FINS: u8 = 2;

// ============================================================================
// Default Timings (seconds)
// ============================================================================

/// Idle time after which a flow is pruned
pub const DEFAULT_STALE_THRESHOLD_SECS: u64 = 60;

/// Interval between pruning passes
pub const DEFAULT_PRUNE_INTERVAL_SECS: u64 = 10;

/// Interval between kernel aggregation map evictions
pub const DEFAULT_MERGE_INTERVAL_SECS: u64 = 5;

/// Interval between snapshot exports
pub const DEFAULT_EXPORT_INTERVAL_SECS: u64 = 10;

/// Interval between progress log lines
pub const DEFAULT_PROGRESS_INTERVAL_SECS: u64 = 10;
