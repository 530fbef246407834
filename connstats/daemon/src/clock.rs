//! Monotonic clock shared with the capture program
//!
//! The kernel stamps events with `bpf_ktime_get_ns`, which reads
//! `CLOCK_MONOTONIC`. Idle times are computed against the same clock so wall
//! clock adjustments never affect pruning.

use anyhow::{Context, Result};
use nix::time::{clock_gettime, ClockId};

/// Nanoseconds on `CLOCK_MONOTONIC`
pub fn monotonic_now_ns() -> Result<u64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).context("Failed to read monotonic clock")?;
    let secs = u64::try_from(now.tv_sec()).context("Monotonic clock returned negative seconds")?;
    let nanos = u64::try_from(now.tv_nsec()).context("Monotonic clock returned negative nanoseconds")?;
    Ok(secs * 1_000_000_000 + nanos)
}
