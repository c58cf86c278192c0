//! Reconstruction accuracy scoring.

use std::collections::{BTreeMap, HashMap};

use crate::model::{MetricRecord, SeriesKey};

/// Mean absolute percentage error per series between a reference
/// stream and its reconstruction.
///
/// Each numeric reference sample is paired with the reconstructed
/// record of the same series nearest in time. Reference samples with a
/// true value of zero are skipped so the relative error stays defined,
/// and series with no scored pair are omitted from the result.
pub fn mape(
    reference: &[MetricRecord],
    reconstructed: &[MetricRecord],
) -> HashMap<SeriesKey, f64> {
    let mut by_series: HashMap<SeriesKey, BTreeMap<i64, f64>> = HashMap::new();
    for record in reconstructed {
        if let Some(value) = record.numeric() {
            by_series
                .entry(record.key())
                .or_default()
                .insert(record.timestamp.timestamp_millis(), value);
        }
    }

    let mut sums: HashMap<SeriesKey, (f64, u64)> = HashMap::new();
    for record in reference {
        let Some(truth) = record.numeric() else {
            continue;
        };
        if truth == 0.0 {
            continue;
        }
        let key = record.key();
        let Some(series) = by_series.get(&key) else {
            continue;
        };
        let Some(estimate) = nearest(series, record.timestamp.timestamp_millis()) else {
            continue;
        };

        let (sum, count) = sums.entry(key).or_insert((0.0, 0));
        *sum += ((truth - estimate) / truth).abs();
        *count += 1;
    }

    sums.into_iter()
        .map(|(key, (sum, count))| (key, sum / count as f64 * 100.0))
        .collect()
}

/// Mean of per-series errors.
pub fn overall(scores: &HashMap<SeriesKey, f64>) -> Option<f64> {
    if scores.is_empty() {
        return None;
    }
    Some(scores.values().sum::<f64>() / scores.len() as f64)
}

/// Series with the highest error.
pub fn worst(scores: &HashMap<SeriesKey, f64>) -> Option<(&SeriesKey, f64)> {
    scores
        .iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(key, score)| (key, *score))
}

/// Value at the timestamp nearest to `at`, preferring the earlier
/// neighbor on a tie.
fn nearest(series: &BTreeMap<i64, f64>, at: i64) -> Option<f64> {
    let before = series.range(..=at).next_back();
    let after = series.range(at..).next();
    match (before, after) {
        (Some((bt, bv)), Some((at_ms, av))) => {
            if at - bt <= at_ms - at {
                Some(*bv)
            } else {
                Some(*av)
            }
        }
        (Some((_, value)), None) | (None, Some((_, value))) => Some(*value),
        (None, None) => None,
    }
}
