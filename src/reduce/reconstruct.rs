//! Dense series reconstruction from change-of-value streams.
//!
//! The inverse of deduplication: between two kept records the series is
//! assumed to hold its last observed value, so the dense form is
//! rebuilt by re-emitting the previous record at every missing tick.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::model::{MetricRecord, SeriesKey};

/// Rebuilds dense per-series sequences at a fixed tick.
///
/// For each series, in four passes over the window:
/// ticks before the first record carry the first value backward, every
/// real record is emitted verbatim at its own timestamp, ticks between
/// two records repeat the earlier one, and ticks after the last record
/// carry it to the end of the window. The fill grid restarts at each
/// real record, stepping `gap` from its timestamp.
///
/// Output is grouped by series in first-seen order, each group ordered
/// by time. `window_end` is exclusive.
pub fn reconstruct(
    records: &[MetricRecord],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    gap: std::time::Duration,
) -> Vec<MetricRecord> {
    let step = chrono::Duration::seconds((gap.as_secs() as i64).max(1));

    let mut order: Vec<SeriesKey> = Vec::new();
    let mut groups: HashMap<SeriesKey, Vec<&MetricRecord>> = HashMap::new();
    for record in records {
        let key = record.key();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(record);
    }

    let mut out = Vec::new();
    for key in &order {
        if let Some(mut group) = groups.remove(key) {
            group.sort_by_key(|r| r.timestamp);
            fill_series(&group, window_start, window_end, step, &mut out);
        }
    }
    out
}

fn fill_series(
    group: &[&MetricRecord],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    step: chrono::Duration,
    out: &mut Vec<MetricRecord>,
) {
    let Some(first) = group.first() else {
        return;
    };

    // The value before the first observation is taken to be the first
    // observation itself.
    let mut tick = window_start;
    while tick < first.timestamp {
        out.push(at_tick(first, tick));
        tick += step;
    }

    out.push((*first).clone());
    let mut prev: &MetricRecord = first;

    for record in &group[1..] {
        let mut tick = prev.timestamp + step;
        while tick < record.timestamp {
            out.push(at_tick(prev, tick));
            tick += step;
        }
        out.push((*record).clone());
        prev = record;
    }

    let mut tick = prev.timestamp + step;
    while tick < window_end {
        out.push(at_tick(prev, tick));
        tick += step;
    }
}

/// Copy of `template` re-timestamped at `tick`.
fn at_tick(template: &MetricRecord, tick: DateTime<Utc>) -> MetricRecord {
    let mut filled = template.clone();
    filled.timestamp = tick;
    filled
}
