//! Change-of-value deduplication.
//!
//! Walks a time-ordered slice of records and keeps only the ones that
//! carry information: the first numeric reading of every series, any
//! reading outside the tolerance band around the last kept one, and
//! every null or negative sentinel. Kept records are bit-identical to
//! their originals and stay in input order.

use std::collections::HashMap;

use crate::model::{MetricRecord, SeriesKey};

use super::tolerance::{BucketedTolerance, ToleranceTable};

/// Deduplicates against a single tolerance table.
pub fn deduplicate(records: Vec<MetricRecord>, table: &ToleranceTable) -> Vec<MetricRecord> {
    keep_changes(records, |_, key, last_kept| table.band(key, last_kept))
}

/// Deduplicates against per-bucket tolerance tables.
///
/// The band for each comparison comes from the bucket covering the
/// record's own timestamp, while the last kept value carries across
/// bucket boundaries.
pub fn deduplicate_bucketed(
    records: Vec<MetricRecord>,
    tolerance: &BucketedTolerance,
) -> Vec<MetricRecord> {
    keep_changes(records, |record, key, last_kept| {
        tolerance.band(record.timestamp, key, last_kept)
    })
}

fn keep_changes<F>(mut records: Vec<MetricRecord>, mut band: F) -> Vec<MetricRecord>
where
    F: FnMut(&MetricRecord, &SeriesKey, f64) -> (f64, f64),
{
    let mut last_kept: HashMap<SeriesKey, f64> = HashMap::new();
    // Reused for lookups so the hot path does not allocate per record.
    let mut scratch = SeriesKey {
        node_id: 0,
        fqdd: String::new(),
    };

    records.retain(|record| {
        let Some(value) = record.numeric() else {
            // Null and non-numeric readings always pass through.
            return true;
        };
        if value < 0.0 || !value.is_finite() {
            // Sentinel readings pass through and never become the
            // comparison base.
            return true;
        }

        scratch.node_id = record.node_id;
        scratch.fqdd.clear();
        scratch.fqdd.push_str(&record.fqdd);

        match last_kept.get(&scratch) {
            None => {
                last_kept.insert(scratch.clone(), value);
                true
            }
            Some(&last) => {
                let (floor, ceiling) = band(record, &scratch, last);
                if value < floor || value > ceiling {
                    last_kept.insert(scratch.clone(), value);
                    true
                } else {
                    false
                }
            }
        }
    });

    records
}
