//! Execution record: timing and memory measurements around one invocation.

use crate::core::duration::format_clock;
use crate::core::memory::MemorySnapshot;
use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

/// Timestamp format used in start/end log lines (`MM-DD-YYYY HH:MM:SS`).
pub const TIMESTAMP_FORMAT: &str = "%m-%d-%Y %H:%M:%S";

/// Measurements collected around a single run.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub duration: Duration,
    pub memory_at_start: Option<u64>,
    pub memory_at_end: Option<u64>,
    pub peak_memory: Option<u64>,
}

impl ExecutionRecord {
    /// Duration as `HH:MM:SS`.
    pub fn duration_clock(&self) -> String {
        format_clock(self.duration)
    }
}

/// Start half of an [`ExecutionRecord`], completed by [`RecordBuilder::finish`].
#[derive(Debug)]
pub(crate) struct RecordBuilder {
    started_at: DateTime<Local>,
    started: Instant,
    memory_at_start: Option<u64>,
}

impl RecordBuilder {
    pub(crate) fn start() -> Self {
        Self {
            started_at: Local::now(),
            started: Instant::now(),
            memory_at_start: MemorySnapshot::capture().current,
        }
    }

    pub(crate) fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    pub(crate) fn memory_at_start(&self) -> Option<u64> {
        self.memory_at_start
    }

    pub(crate) fn finish(self) -> ExecutionRecord {
        let memory = MemorySnapshot::capture();
        ExecutionRecord {
            started_at: self.started_at,
            ended_at: Local::now(),
            duration: self.started.elapsed(),
            memory_at_start: self.memory_at_start,
            memory_at_end: memory.current,
            peak_memory: memory.peak,
        }
    }
}
