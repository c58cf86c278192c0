use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Declared logical type for a metric, supplied by the metric catalogue.
/// Drives value coercion in the report decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Int,
    Real,
    Text,
    Timestamp,
    Bool,
}

impl ValueKind {
    /// Returns the canonical catalogue/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Real => "real",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
            Self::Bool => "bool",
        }
    }

    /// Convert from a catalogue label. Accepts both the canonical lowercase
    /// names and the uppercase spellings vendor metric definitions use.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => Some(Self::Int),
            "real" | "float" | "double" | "decimal" => Some(Self::Real),
            "text" | "string" => Some(Self::Text),
            "timestamp" | "datetime" => Some(Self::Timestamp),
            "bool" | "boolean" => Some(Self::Bool),
            _ => None,
        }
    }

    /// Return all value kinds.
    pub fn all() -> &'static [Self] {
        &[
            Self::Int,
            Self::Real,
            Self::Text,
            Self::Timestamp,
            Self::Bool,
        ]
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An observed metric value.
///
/// Coercion failures and absent readings are preserved rather than discarded
/// so downstream consumers can tell "no data" apart from "the sensor reported
/// something anomalous": a numeric metric whose raw value does not parse stays
/// a `Text`, an empty reading becomes `Missing`.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Float(f64),
    Int(i64),
    Text(String),
    Bool(bool),
    Missing,
}

impl MetricValue {
    /// Numeric view of the value. `Int` widens to `f64`; `Text`, `Bool`, and
    /// `Missing` have no numeric reading.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Text(_) | Self::Bool(_) | Self::Missing => None,
        }
    }

    /// True when the value carries no reading at all.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    /// Textual payload, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Missing => Ok(()),
        }
    }
}

/// Identity key for deduplication and aggregation: `(node_id, fqdd)`.
/// `source` is metadata and deliberately not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub node_id: i32,
    pub fqdd: String,
}

impl SeriesKey {
    pub fn new(node_id: i32, fqdd: impl Into<String>) -> Self {
        Self {
            node_id,
            fqdd: fqdd.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id, self.fqdd)
    }
}

/// One fully resolved telemetry observation.
///
/// Created by the processing stage from a decoded raw record; immutable and
/// consumed read-only by every downstream stage.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub timestamp: DateTime<Utc>,
    pub node_id: i32,
    pub source: String,
    pub fqdd: String,
    pub value: MetricValue,
}

impl MetricRecord {
    /// Series identity for dedup/aggregation grouping.
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.node_id, self.fqdd.clone())
    }

    /// Numeric reading, if the value has one.
    pub fn numeric(&self) -> Option<f64> {
        self.value.as_f64()
    }
}

/// A decoded metric entry before catalogue resolution: the vendor metric
/// identifier plus timestamp and coerced value. `node_id`, `source`, and
/// `fqdd` are attached later by the processing stage.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub metric_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: MetricValue,
}

/// A decoded report's records tagged with the originating node address.
/// Unit of transfer on the pipeline's read queue.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub node_addr: String,
    pub records: Vec<RawRecord>,
}

/// A fully resolved record routed to its destination table.
/// Unit of transfer on the pipeline's write queue.
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub table: String,
    pub record: MetricRecord,
}

/// One aggregation bucket's statistics for a `(bucket, node, source, fqdd)`
/// group that had at least one numeric observation. Empty buckets are
/// gap-filled with nulls by the store's query layer, never fabricated here.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedRecord {
    pub bucket_start: DateTime<Utc>,
    pub node_id: i32,
    pub source: String,
    pub fqdd: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub samples: i64,
}
