//! Process memory sampling.
//!
//! Reads resident set size and its high-water mark from `/proc/self/status`.
//! On platforms without procfs both figures are reported as unknown.

use std::fmt;

const STATUS_PATH: &str = "/proc/self/status";

/// Memory usage of the current process, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    /// Current resident set size.
    pub current: Option<u64>,
    /// Peak resident set size since process start.
    pub peak: Option<u64>,
}

impl MemorySnapshot {
    /// Sample the current process.
    pub fn capture() -> Self {
        match std::fs::read_to_string(STATUS_PATH) {
            Ok(status) => Self::parse_status(&status),
            Err(_) => Self::default(),
        }
    }

    /// Parse the contents of a `/proc/<pid>/status` file.
    pub fn parse_status(status: &str) -> Self {
        let mut snapshot = Self::default();
        for line in status.lines() {
            if let Some(value) = line.strip_prefix("VmRSS:") {
                snapshot.current = parse_kib(value);
            } else if let Some(value) = line.strip_prefix("VmHWM:") {
                snapshot.peak = parse_kib(value);
            }
        }
        snapshot
    }
}

/// Parses `"   1234 kB"` into bytes.
fn parse_kib(value: &str) -> Option<u64> {
    let mut parts = value.split_whitespace();
    let amount: u64 = parts.next()?.parse().ok()?;
    match parts.next() {
        Some("kB") | None => Some(amount * 1024),
        Some(_) => None,
    }
}

/// Displays a byte figure, or `unknown` when no figure could be read.
pub struct Bytes(pub Option<u64>);

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(bytes) => write!(f, "{}", bytes),
            None => f.write_str("unknown"),
        }
    }
}
