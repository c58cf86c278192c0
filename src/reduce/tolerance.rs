//! Per-series deviation tolerances for change-of-value reduction.
//!
//! A tolerance bounds how far a sample may drift from the last kept
//! sample of its series before it must be kept again. Tolerances are
//! derived from the observed samples themselves, per series key and per
//! alignment bucket, so the band re-tunes as a series' operating range
//! drifts over a long window.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::{MetricRecord, SeriesKey};

/// Formula deriving a series tolerance from its positive samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToleranceFormula {
    /// Coefficient of variation, `stddev / mean`. Applied as a band
    /// relative to the last kept value.
    Cv,
    /// `floor(sqrt(stddev))`, applied as an absolute band.
    Stddev,
    /// `floor(sqrt(mean))`, applied as an absolute band.
    Mean,
}

impl ToleranceFormula {
    /// Returns the configuration name of the formula.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToleranceFormula::Cv => "cv",
            ToleranceFormula::Stddev => "stddev",
            ToleranceFormula::Mean => "mean",
        }
    }

    /// Parses a formula from its configuration name.
    pub fn from_name(name: &str) -> Option<ToleranceFormula> {
        match name {
            "cv" => Some(ToleranceFormula::Cv),
            "stddev" => Some(ToleranceFormula::Stddev),
            "mean" => Some(ToleranceFormula::Mean),
            _ => None,
        }
    }

    /// Relative formulas scale the band by the last kept value,
    /// absolute formulas offset it by a fixed amount.
    pub fn is_relative(&self) -> bool {
        matches!(self, ToleranceFormula::Cv)
    }

    /// Returns all formulas.
    pub fn all() -> &'static [ToleranceFormula] {
        &[
            ToleranceFormula::Cv,
            ToleranceFormula::Stddev,
            ToleranceFormula::Mean,
        ]
    }
}

impl Default for ToleranceFormula {
    fn default() -> Self {
        ToleranceFormula::Cv
    }
}

impl fmt::Display for ToleranceFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tolerances for one alignment bucket, keyed by series.
#[derive(Debug, Clone)]
pub struct ToleranceTable {
    formula: ToleranceFormula,
    entries: HashMap<SeriesKey, f64>,
}

impl ToleranceTable {
    /// Creates an empty table. Unknown series get tolerance zero.
    pub fn new(formula: ToleranceFormula) -> Self {
        Self {
            formula,
            entries: HashMap::new(),
        }
    }

    /// Derives a table from the numeric samples in `records`.
    ///
    /// Only strictly positive samples contribute. Nulls, zeros and
    /// negative sentinel readings carry no information about a series'
    /// normal operating band and are excluded.
    pub fn build<'a, I>(records: I, formula: ToleranceFormula) -> Self
    where
        I: IntoIterator<Item = &'a MetricRecord>,
    {
        let mut samples: HashMap<SeriesKey, Vec<f64>> = HashMap::new();
        for record in records {
            if let Some(v) = record.numeric() {
                if v > 0.0 {
                    samples.entry(record.key()).or_default().push(v);
                }
            }
        }

        let entries = samples
            .into_iter()
            .map(|(key, values)| (key, derive(&values, formula)))
            .collect();

        Self { formula, entries }
    }

    /// Returns the formula this table was built with.
    pub fn formula(&self) -> ToleranceFormula {
        self.formula
    }

    /// Returns the tolerance for a series, zero if unknown.
    pub fn get(&self, key: &SeriesKey) -> f64 {
        self.entries.get(key).copied().unwrap_or(0.0)
    }

    /// Sets the tolerance for a series.
    pub fn set(&mut self, key: SeriesKey, tolerance: f64) {
        self.entries.insert(key, tolerance);
    }

    /// Returns the number of series with a derived tolerance.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when no series has a derived tolerance.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Floor and ceiling around the last kept value of a series.
    /// Samples inside the closed band are considered unchanged.
    pub fn band(&self, key: &SeriesKey, last_kept: f64) -> (f64, f64) {
        let tolerance = self.get(key);
        if self.formula.is_relative() {
            (
                last_kept - last_kept * tolerance,
                last_kept + last_kept * tolerance,
            )
        } else {
            (last_kept - tolerance, last_kept + tolerance)
        }
    }
}

/// Tolerance tables per absolute-time bucket of a reduction window.
///
/// A record at `ts` falls in bucket `floor(unix(ts) / width)`, so the
/// bucket grid does not depend on where the window starts.
#[derive(Debug)]
pub struct BucketedTolerance {
    width_secs: i64,
    formula: ToleranceFormula,
    buckets: HashMap<i64, ToleranceTable>,
}

impl BucketedTolerance {
    /// Derives one table per bucket from `records`.
    pub fn build<'a, I>(records: I, width: Duration, formula: ToleranceFormula) -> Self
    where
        I: IntoIterator<Item = &'a MetricRecord>,
    {
        let width_secs = (width.as_secs() as i64).max(1);

        let mut grouped: HashMap<i64, Vec<&MetricRecord>> = HashMap::new();
        for record in records {
            let bucket = record.timestamp.timestamp().div_euclid(width_secs);
            grouped.entry(bucket).or_default().push(record);
        }

        let buckets = grouped
            .into_iter()
            .map(|(bucket, members)| (bucket, ToleranceTable::build(members, formula)))
            .collect();

        Self {
            width_secs,
            formula,
            buckets,
        }
    }

    /// Returns the formula the tables were built with.
    pub fn formula(&self) -> ToleranceFormula {
        self.formula
    }

    /// Returns the bucket width in seconds.
    pub fn width_secs(&self) -> i64 {
        self.width_secs
    }

    /// Returns the number of non-empty buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Returns true when no bucket holds a table.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Returns the table covering `ts`, if any records fell in its bucket.
    pub fn table_for(&self, ts: DateTime<Utc>) -> Option<&ToleranceTable> {
        let bucket = ts.timestamp().div_euclid(self.width_secs);
        self.buckets.get(&bucket)
    }

    /// Band around the last kept value, using the table of the bucket
    /// that covers `ts`. Falls back to a zero-width band so any change
    /// is kept when the bucket derived no tolerance.
    pub fn band(&self, ts: DateTime<Utc>, key: &SeriesKey, last_kept: f64) -> (f64, f64) {
        match self.table_for(ts) {
            Some(table) => table.band(key, last_kept),
            None => (last_kept, last_kept),
        }
    }
}

/// Derives a single tolerance from a series' positive samples.
///
/// A series with exactly one positive sample has no spread to measure,
/// so its tolerance is `floor(sqrt(sample))` regardless of formula. A
/// series with none gets zero, which keeps every change.
fn derive(samples: &[f64], formula: ToleranceFormula) -> f64 {
    match samples {
        [] => 0.0,
        [only] => only.sqrt().floor(),
        _ => {
            let mean = samples.iter().sum::<f64>() / samples.len() as f64;
            match formula {
                ToleranceFormula::Cv => {
                    if mean > 0.0 {
                        stddev(samples, mean) / mean
                    } else {
                        0.0
                    }
                }
                ToleranceFormula::Stddev => stddev(samples, mean).sqrt().floor(),
                ToleranceFormula::Mean => mean.sqrt().floor(),
            }
        }
    }
}

/// Sample standard deviation around a precomputed mean.
fn stddev(samples: &[f64], mean: f64) -> f64 {
    let variance = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
        / (samples.len() - 1) as f64;
    variance.sqrt()
}
