//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between the capture program and userspace code.

/// Key of the in-kernel flow aggregation map
///
/// Endpoints are oriented relative to the monitored interface: "local" is the
/// interface side, "remote" is the peer. Ports are in network byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Local address (IPv6 or IPv4-mapped IPv6)
    pub local_addr: [u8; 16],
    /// Remote address (IPv6 or IPv4-mapped IPv6)
    pub remote_addr: [u8; 16],
    /// Local port (network byte order)
    pub local_port: u16,
    /// Remote port (network byte order)
    pub remote_port: u16,
    /// IP protocol number
    pub protocol: u8,
    /// Padding for alignment
    pub _padding: [u8; 3],
}

/// Value of the in-kernel flow aggregation map
///
/// Counters are cumulative since the entry was created in the kernel.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlowMetrics {
    pub packets_in: u32,
    pub packets_out: u32,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Monotonic timestamp of the first packet (nanoseconds)
    pub ts_start: u64,
    /// Monotonic timestamp of the latest packet (nanoseconds)
    pub ts_current: u64,
}

// Compile-time alignment checks
const _: () = {
    assert!(core::mem::size_of::<FlowKey>() % core::mem::align_of::<FlowKey>() == 0);
    assert!(core::mem::size_of::<FlowMetrics>() % core::mem::align_of::<FlowMetrics>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod trait implementations for reading the aggregation map in userspace
    unsafe impl aya::Pod for FlowKey {}
    unsafe impl aya::Pod for FlowMetrics {}
}
