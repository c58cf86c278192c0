//! Fixed-width time-bucket aggregation.
//!
//! Buckets are aligned to absolute time so that two runs over
//! overlapping windows produce identical bucket boundaries. The same
//! alignment is used by the storage-side rollup query; the two paths
//! must agree on which bucket a record falls into.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{AggregatedRecord, MetricRecord};

/// Start of the absolute-aligned bucket containing `ts`.
pub fn bucket_start(ts: DateTime<Utc>, width: Duration) -> DateTime<Utc> {
    let width_secs = (width.as_secs() as i64).max(1);
    let aligned = ts.timestamp().div_euclid(width_secs) * width_secs;
    DateTime::from_timestamp(aligned, 0).unwrap_or(ts)
}

struct Acc {
    sum: f64,
    min: f64,
    max: f64,
    count: i64,
}

/// Aggregates numeric records into buckets keyed by
/// (bucket, node, source, fqdd).
///
/// Non-numeric and non-finite readings contribute nothing; a group
/// only exists where at least one numeric sample landed. Output is
/// sorted by bucket, node, source and fqdd.
pub fn aggregate(records: &[MetricRecord], width: Duration) -> Vec<AggregatedRecord> {
    let mut groups: HashMap<(DateTime<Utc>, i32, String, String), Acc> = HashMap::new();

    for record in records {
        let Some(value) = record.numeric() else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }

        let bucket = bucket_start(record.timestamp, width);
        let acc = groups
            .entry((
                bucket,
                record.node_id,
                record.source.clone(),
                record.fqdd.clone(),
            ))
            .or_insert(Acc {
                sum: 0.0,
                min: value,
                max: value,
                count: 0,
            });
        acc.sum += value;
        acc.min = acc.min.min(value);
        acc.max = acc.max.max(value);
        acc.count += 1;
    }

    let mut out: Vec<AggregatedRecord> = groups
        .into_iter()
        .map(|((bucket_start, node_id, source, fqdd), acc)| AggregatedRecord {
            bucket_start,
            node_id,
            source,
            fqdd,
            avg: acc.sum / acc.count as f64,
            min: acc.min,
            max: acc.max,
            samples: acc.count,
        })
        .collect();

    out.sort_by(|a, b| {
        (a.bucket_start, a.node_id, &a.source, &a.fqdd)
            .cmp(&(b.bucket_start, b.node_id, &b.source, &b.fqdd))
    });

    out
}
