//! Offline passes over stored series.
//!
//! These run from the command line against destination tables:
//! `reduce` rewrites a window in place as a change-of-value stream,
//! `rollup` materializes bucketed statistics, `validate` scores a
//! dry-run reduction without writing, and `reconstruct` streams a
//! dense rebuild as CSV.

pub mod accuracy;
pub mod aggregate;
pub mod dedup;
pub mod reconstruct;
pub mod tolerance;

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Write;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::config::ReductionConfig;
use crate::model::{MetricRecord, SeriesKey};
use crate::store::{MetricStore, ReductionRun, RollupRow};

use self::tolerance::BucketedTolerance;

/// Result of reducing one table's window.
#[derive(Debug, Clone)]
pub struct TableReduction {
    pub table: String,
    pub rows_before: u64,
    pub rows_after: u64,
}

impl TableReduction {
    /// Fraction of rows removed, zero for an empty window.
    pub fn removed_ratio(&self) -> f64 {
        if self.rows_before == 0 {
            0.0
        } else {
            1.0 - self.rows_after as f64 / self.rows_before as f64
        }
    }
}

/// Result of rolling up one table's window.
#[derive(Debug, Clone)]
pub struct TableRollup {
    pub table: String,
    pub rollup_table: String,
    pub buckets_written: u64,
    pub gap_buckets: u64,
}

/// Dry-run reduction scores for one table.
#[derive(Debug, Clone)]
pub struct TableValidation {
    pub table: String,
    pub rows_before: u64,
    pub rows_after: u64,
    pub series_scored: usize,
    pub mean_error_pct: f64,
    pub worst_error_pct: f64,
    pub worst_series: Option<SeriesKey>,
}

impl TableValidation {
    /// True when every scored series sits at or below the bound.
    pub fn within(&self, bound_pct: f64) -> bool {
        self.worst_error_pct <= bound_pct
    }
}

/// Reduces each table's window in place and records a bookkeeping row
/// per table.
pub async fn run_reduce<S: MetricStore>(
    store: &S,
    tables: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cfg: &ReductionConfig,
) -> Result<Vec<TableReduction>> {
    check_window(start, end)?;

    let mut outcomes = Vec::with_capacity(tables.len());
    for table in tables {
        let started_at = Utc::now();

        let rows = store
            .fetch_window(table, start, end)
            .await
            .with_context(|| format!("fetching window of {table}"))?;
        let rows_before = rows.len() as u64;

        let kept = reduce_rows(rows, cfg);
        let rows_after = kept.len() as u64;

        store
            .replace_window(table, start, end, &kept)
            .await
            .with_context(|| format!("replacing window of {table}"))?;

        store
            .record_run(&ReductionRun {
                table: table.clone(),
                window_start: start,
                window_end: end,
                formula: cfg.formula.to_string(),
                rows_before: rows_before as i64,
                rows_after: rows_after as i64,
                started_at,
                finished_at: Utc::now(),
            })
            .await?;

        let outcome = TableReduction {
            table: table.clone(),
            rows_before,
            rows_after,
        };
        tracing::info!(
            table = %table,
            rows_before,
            rows_after,
            removed_ratio = outcome.removed_ratio(),
            "reduced window",
        );
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

/// In-memory reduction of one window.
///
/// Tolerances are derived from the window's own rows per alignment
/// bucket, the rows are deduplicated against them, and each series'
/// closing record is re-appended when the walk dropped it, so a later
/// reconstruction can anchor the tail of the window.
pub fn reduce_rows(rows: Vec<MetricRecord>, cfg: &ReductionConfig) -> Vec<MetricRecord> {
    let tolerance = BucketedTolerance::build(&rows, cfg.tolerance_bucket, cfg.formula);
    let closers = closing_records(&rows);

    let mut kept = dedup::deduplicate_bucketed(rows, &tolerance);
    reappend_closers(&mut kept, closers);
    kept
}

/// Latest record of every series.
fn closing_records(rows: &[MetricRecord]) -> HashMap<SeriesKey, MetricRecord> {
    let mut last: HashMap<SeriesKey, MetricRecord> = HashMap::new();
    for record in rows {
        let entry = last
            .entry(record.key())
            .or_insert_with(|| record.clone());
        if record.timestamp >= entry.timestamp {
            *entry = record.clone();
        }
    }
    last
}

fn reappend_closers(kept: &mut Vec<MetricRecord>, closers: HashMap<SeriesKey, MetricRecord>) {
    let mut kept_last: HashMap<SeriesKey, DateTime<Utc>> = HashMap::new();
    for record in kept.iter() {
        let entry = kept_last.entry(record.key()).or_insert(record.timestamp);
        if record.timestamp > *entry {
            *entry = record.timestamp;
        }
    }

    for (key, closer) in closers {
        match kept_last.get(&key) {
            Some(&ts) if ts >= closer.timestamp => {}
            _ => kept.push(closer),
        }
    }
}

/// Materializes bucketed statistics of each table into its rollup
/// table. Gap buckets are counted but not written.
pub async fn run_rollup<S: MetricStore>(
    store: &S,
    tables: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cfg: &ReductionConfig,
) -> Result<Vec<TableRollup>> {
    check_window(start, end)?;

    let mut outcomes = Vec::with_capacity(tables.len());
    for table in tables {
        let rows = store
            .rollup_window(table, start, end, cfg.rollup_width)
            .await
            .with_context(|| format!("rolling up window of {table}"))?;

        let filled: Vec<_> = rows.iter().filter_map(RollupRow::to_aggregated).collect();
        let gap_buckets = (rows.len() - filled.len()) as u64;

        let rollup_table = rollup_table_name(table);
        let buckets_written = store
            .insert_rollup(&rollup_table, &filled)
            .await
            .with_context(|| format!("writing rollup of {table}"))?;

        tracing::info!(
            table = %table,
            rollup_table = %rollup_table,
            buckets_written,
            gap_buckets,
            "rolled up window",
        );
        outcomes.push(TableRollup {
            table: table.clone(),
            rollup_table,
            buckets_written,
            gap_buckets,
        });
    }

    Ok(outcomes)
}

/// Destination of a table's rollup rows.
pub fn rollup_table_name(table: &str) -> String {
    format!("{table}_rollup")
}

/// Scores a dry-run reduction of each table without writing anything:
/// reduce in memory, reconstruct at the configured tick, and compare
/// against the fetched rows.
pub async fn run_validate<S: MetricStore>(
    store: &S,
    tables: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cfg: &ReductionConfig,
) -> Result<Vec<TableValidation>> {
    check_window(start, end)?;

    let mut reports = Vec::with_capacity(tables.len());
    for table in tables {
        let rows = store
            .fetch_window(table, start, end)
            .await
            .with_context(|| format!("fetching window of {table}"))?;

        let kept = reduce_rows(rows.clone(), cfg);
        let dense = reconstruct::reconstruct(&kept, start, end, cfg.reconstruct_gap);
        let scores = accuracy::mape(&rows, &dense);

        let mean_error_pct = accuracy::overall(&scores).unwrap_or(0.0);
        let (worst_series, worst_error_pct) = match accuracy::worst(&scores) {
            Some((key, score)) => (Some(key.clone()), score),
            None => (None, 0.0),
        };

        let report = TableValidation {
            table: table.clone(),
            rows_before: rows.len() as u64,
            rows_after: kept.len() as u64,
            series_scored: scores.len(),
            mean_error_pct,
            worst_error_pct,
            worst_series,
        };

        if report.within(cfg.error_bound_pct) {
            tracing::info!(
                table = %table,
                series = report.series_scored,
                mean_error_pct = report.mean_error_pct,
                worst_error_pct = report.worst_error_pct,
                "validated reduction",
            );
        } else {
            tracing::warn!(
                table = %table,
                series = report.series_scored,
                worst_error_pct = report.worst_error_pct,
                worst_series = report.worst_series.as_ref().map(|k| k.to_string()),
                bound_pct = cfg.error_bound_pct,
                "reconstruction error above bound",
            );
        }
        reports.push(report);
    }

    Ok(reports)
}

/// Streams a dense rebuild of one table's window as CSV. Returns the
/// number of data rows written.
pub async fn run_reconstruct<S: MetricStore, W: Write>(
    store: &S,
    table: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cfg: &ReductionConfig,
    out: &mut W,
) -> Result<u64> {
    check_window(start, end)?;

    let rows = store
        .fetch_window(table, start, end)
        .await
        .with_context(|| format!("fetching window of {table}"))?;
    let dense = reconstruct::reconstruct(&rows, start, end, cfg.reconstruct_gap);

    write_csv(out, &dense)?;

    Ok(dense.len() as u64)
}

/// Writes records as CSV with a header row.
pub fn write_csv<W: Write>(out: &mut W, rows: &[MetricRecord]) -> Result<()> {
    writeln!(out, "time,node_id,source,fqdd,value")?;
    for record in rows {
        writeln!(
            out,
            "{},{},{},{},{}",
            record.timestamp.to_rfc3339(),
            record.node_id,
            csv_field(&record.source),
            csv_field(&record.fqdd),
            csv_field(&record.value.to_string()),
        )?;
    }
    Ok(())
}

fn csv_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn check_window(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if start >= end {
        bail!("window start {start} is not before end {end}");
    }
    Ok(())
}
