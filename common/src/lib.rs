//! Shared types and constants for the connstats capture pipeline
//!
//! This crate describes the wire layouts produced by the kernel-side capture
//! program and the key/value types of its in-kernel flow aggregation map.

#![no_std]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{FlowKey, FlowMetrics};
