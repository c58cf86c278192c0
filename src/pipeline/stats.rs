//! Pipeline counters.
//!
//! Updated lock-free from every stage; read by the status reporter and
//! by tests. Counters are cumulative, deltas are computed from
//! snapshots.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineStats {
    batches_in: AtomicU64,
    records_in: AtomicU64,
    records_resolved: AtomicU64,
    dropped_unknown_node: AtomicU64,
    dropped_unknown_metric: AtomicU64,
    records_written: AtomicU64,
    records_failed: AtomicU64,
    write_errors: AtomicU64,
    flushes: AtomicU64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// One batch arrived carrying `records` records.
    pub fn add_batch(&self, records: u64) {
        self.batches_in.fetch_add(1, Ordering::Relaxed);
        self.records_in.fetch_add(records, Ordering::Relaxed);
    }

    pub fn add_resolved(&self, n: u64) {
        self.records_resolved.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_unknown_node(&self, n: u64) {
        self.dropped_unknown_node.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_unknown_metric(&self) {
        self.dropped_unknown_metric.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) {
        self.records_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    /// One flush transaction failed, losing `rows` rows.
    pub fn add_write_error(&self, rows: u64) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
        self.records_failed.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches_in: self.batches_in.load(Ordering::Relaxed),
            records_in: self.records_in.load(Ordering::Relaxed),
            records_resolved: self.records_resolved.load(Ordering::Relaxed),
            dropped_unknown_node: self.dropped_unknown_node.load(Ordering::Relaxed),
            dropped_unknown_metric: self.dropped_unknown_metric.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub batches_in: u64,
    pub records_in: u64,
    pub records_resolved: u64,
    pub dropped_unknown_node: u64,
    pub dropped_unknown_metric: u64,
    pub records_written: u64,
    pub records_failed: u64,
    pub write_errors: u64,
    pub flushes: u64,
}

impl StatsSnapshot {
    /// Counter movement since `prev`.
    pub fn delta(&self, prev: &StatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            batches_in: self.batches_in.saturating_sub(prev.batches_in),
            records_in: self.records_in.saturating_sub(prev.records_in),
            records_resolved: self.records_resolved.saturating_sub(prev.records_resolved),
            dropped_unknown_node: self
                .dropped_unknown_node
                .saturating_sub(prev.dropped_unknown_node),
            dropped_unknown_metric: self
                .dropped_unknown_metric
                .saturating_sub(prev.dropped_unknown_metric),
            records_written: self.records_written.saturating_sub(prev.records_written),
            records_failed: self.records_failed.saturating_sub(prev.records_failed),
            write_errors: self.write_errors.saturating_sub(prev.write_errors),
            flushes: self.flushes.saturating_sub(prev.flushes),
        }
    }
}
