//! In-memory store backend.
//!
//! Backs integration tests and dry runs. Mirrors the gap-fill
//! semantics of the TimescaleDB rollup query so the two backends can
//! be asserted against each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::model::{AggregatedRecord, MetricRecord, MetricValue};
use crate::reduce::aggregate::{aggregate, bucket_start};

use super::{MetricStore, ReductionRun, ReplaceOutcome, RollupRow};

/// Thread-safe in-memory [`MetricStore`].
///
/// `stall` makes `insert_batch` block until released, which lets tests
/// hold the write path open and observe backpressure upstream.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<String, Vec<MetricRecord>>>,
    rollups: Mutex<HashMap<String, Vec<AggregatedRecord>>>,
    runs: Mutex<Vec<ReductionRun>>,
    inserted: AtomicU64,
    insert_calls: AtomicU64,
    stalled: AtomicBool,
    resume: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks or releases all inserts.
    pub fn stall(&self, on: bool) {
        self.stalled.store(on, Ordering::SeqCst);
        if !on {
            self.resume.notify_waiters();
        }
    }

    /// Total records accepted by `insert_batch`.
    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::SeqCst)
    }

    /// Number of `insert_batch` calls, one per transaction.
    pub fn insert_calls(&self) -> u64 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Pre-populates a table.
    pub fn seed(&self, table: &str, rows: Vec<MetricRecord>) {
        self.tables.lock().insert(table.to_string(), rows);
    }

    /// Copy of a table's records.
    pub fn rows(&self, table: &str) -> Vec<MetricRecord> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// Copy of a rollup table's records.
    pub fn rollup_rows(&self, table: &str) -> Vec<AggregatedRecord> {
        self.rollups.lock().get(table).cloned().unwrap_or_default()
    }

    /// Copy of recorded reduction runs.
    pub fn runs(&self) -> Vec<ReductionRun> {
        self.runs.lock().clone()
    }

    async fn wait_ready(&self) {
        loop {
            let notified = self.resume.notified();
            if !self.stalled.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

impl MetricStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_batch(&self, table: &str, rows: &[MetricRecord]) -> Result<u64> {
        self.wait_ready().await;

        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());

        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.inserted.fetch_add(rows.len() as u64, Ordering::SeqCst);
        Ok(rows.len() as u64)
    }

    async fn fetch_window(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricRecord>> {
        let mut rows: Vec<MetricRecord> = self
            .tables
            .lock()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.timestamp >= start && r.timestamp < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        rows.sort_by(|a, b| {
            (a.node_id, &a.fqdd, a.timestamp).cmp(&(b.node_id, &b.fqdd, b.timestamp))
        });

        Ok(rows)
    }

    async fn replace_window(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        rows: &[MetricRecord],
    ) -> Result<ReplaceOutcome> {
        let mut tables = self.tables.lock();
        let stored = tables.entry(table.to_string()).or_default();

        let before = stored.len();
        stored.retain(|r| r.timestamp < start || r.timestamp >= end);
        let deleted = (before - stored.len()) as u64;

        stored.extend(rows.iter().cloned());

        Ok(ReplaceOutcome {
            deleted,
            inserted: rows.len() as u64,
        })
    }

    async fn rollup_window(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        width: Duration,
    ) -> Result<Vec<RollupRow>> {
        let window = self.fetch_window(table, start, end).await?;

        let mut stats: HashMap<(DateTime<Utc>, i32, String, String), AggregatedRecord> =
            HashMap::new();
        for agg in aggregate(&window, width) {
            stats.insert(
                (
                    agg.bucket_start,
                    agg.node_id,
                    agg.source.clone(),
                    agg.fqdd.clone(),
                ),
                agg,
            );
        }

        // Every series seen in the window gets a row per grid bucket,
        // matching time_bucket_gapfill.
        let series: BTreeSet<(i32, String, String)> = window
            .iter()
            .map(|r| (r.node_id, r.source.clone(), r.fqdd.clone()))
            .collect();

        let mut grid = Vec::new();
        let mut bucket = bucket_start(start, width);
        let step = chrono::Duration::seconds((width.as_secs() as i64).max(1));
        while bucket < end {
            grid.push(bucket);
            bucket += step;
        }

        let mut out = Vec::new();
        for bucket in &grid {
            for (node_id, source, fqdd) in &series {
                let key = (*bucket, *node_id, source.clone(), fqdd.clone());
                out.push(match stats.get(&key) {
                    Some(agg) => RollupRow {
                        bucket_start: agg.bucket_start,
                        node_id: agg.node_id,
                        source: agg.source.clone(),
                        fqdd: agg.fqdd.clone(),
                        avg: Some(agg.avg),
                        min: Some(agg.min),
                        max: Some(agg.max),
                        samples: agg.samples,
                    },
                    None => RollupRow {
                        bucket_start: *bucket,
                        node_id: *node_id,
                        source: source.clone(),
                        fqdd: fqdd.clone(),
                        avg: None,
                        min: None,
                        max: None,
                        samples: 0,
                    },
                });
            }
        }

        Ok(out)
    }

    async fn insert_rollup(&self, table: &str, rows: &[AggregatedRecord]) -> Result<u64> {
        self.rollups
            .lock()
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn record_run(&self, run: &ReductionRun) -> Result<()> {
        self.runs.lock().push(run.clone());
        Ok(())
    }
}

/// Convenience for tests: a float record.
pub fn float_record(
    timestamp: DateTime<Utc>,
    node_id: i32,
    source: &str,
    fqdd: &str,
    value: f64,
) -> MetricRecord {
    MetricRecord {
        timestamp,
        node_id,
        source: source.to_string(),
        fqdd: fqdd.to_string(),
        value: MetricValue::Float(value),
    }
}
