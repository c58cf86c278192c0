//! Decoding of vendor telemetry reports.
//!
//! A report is one JSON object carrying a `MetricValues` array; each entry
//! supplies a timestamp, a metric identifier, and a raw value string. Entries
//! are decoded independently so one malformed entry never poisons the rest of
//! the report.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::model::{MetricValue, RawRecord, ValueKind};

/// Errors that fail a report as a whole. Per-entry problems are skipped and
/// counted instead.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload has no MetricValues array")]
    MissingMetricArray,
}

/// Resolves a metric identifier to its declared logical type.
///
/// Implemented by the metric catalogue; tests supply a plain map. Metrics the
/// lookup does not know are coerced as [`ValueKind::Real`]; resolution (and
/// dropping of unregistered metrics) happens later, in the processing stage.
pub trait KindLookup {
    fn kind_of(&self, metric_id: &str) -> Option<ValueKind>;
}

impl KindLookup for HashMap<String, ValueKind> {
    fn kind_of(&self, metric_id: &str) -> Option<ValueKind> {
        self.get(metric_id).copied()
    }
}

/// A decoded report: the usable records plus the count of entries skipped for
/// missing or unparseable required fields.
#[derive(Debug, Default)]
pub struct DecodedReport {
    pub records: Vec<RawRecord>,
    pub skipped: usize,
}

/// Decode one raw report payload into metric records.
///
/// Fails only if the payload is not parseable JSON, not an object, or lacks
/// the metric array entirely. Entries missing `MetricId` or a parseable
/// `Timestamp` are skipped individually.
pub fn decode_report(payload: &[u8], kinds: &impl KindLookup) -> Result<DecodedReport, DecodeError> {
    let root: Value = serde_json::from_slice(payload)?;

    let obj = root.as_object().ok_or(DecodeError::NotAnObject)?;

    let entries = metric_entries(obj).ok_or(DecodeError::MissingMetricArray)?;

    let mut report = DecodedReport {
        records: Vec::with_capacity(entries.len()),
        skipped: 0,
    };

    for entry in entries {
        match decode_entry(entry, kinds) {
            Some(record) => report.records.push(record),
            None => report.skipped += 1,
        }
    }

    Ok(report)
}

/// The metric array sits at the top level on current firmware; older
/// releases nest it under the vendor OEM section.
fn metric_entries(obj: &serde_json::Map<String, Value>) -> Option<&Vec<Value>> {
    if let Some(entries) = obj.get("MetricValues").and_then(Value::as_array) {
        return Some(entries);
    }
    obj.get("Oem")?
        .get("Dell")?
        .get("MetricValues")
        .and_then(Value::as_array)
}

/// Decode a single metric entry. Returns `None` when a required field is
/// missing or invalid.
fn decode_entry(entry: &Value, kinds: &impl KindLookup) -> Option<RawRecord> {
    let metric_id = entry.get("MetricId").and_then(Value::as_str)?;
    if metric_id.is_empty() {
        return None;
    }

    let raw_ts = entry.get("Timestamp").and_then(Value::as_str)?;
    let timestamp = parse_timestamp(raw_ts)?;

    let kind = kinds.kind_of(metric_id).unwrap_or(ValueKind::Real);
    let value = coerce_value(entry.get("MetricValue"), kind);

    Some(RawRecord {
        metric_id: metric_id.to_string(),
        timestamp,
        value,
    })
}

/// Coerce a raw JSON value per the declared logical type.
///
/// The contract downstream storage depends on: a numeric kind whose raw value
/// does not parse keeps the raw string, it never errors. Absent and empty
/// values become [`MetricValue::Missing`].
fn coerce_value(raw: Option<&Value>, kind: ValueKind) -> MetricValue {
    let raw = match raw {
        Some(Value::Null) | None => return MetricValue::Missing,
        Some(v) => v,
    };

    // Fast paths for already-typed JSON values.
    match (raw, kind) {
        (Value::Number(n), ValueKind::Int) => {
            if let Some(v) = n.as_i64() {
                return MetricValue::Int(v);
            }
        }
        (Value::Number(n), ValueKind::Real) => {
            if let Some(v) = n.as_f64() {
                return MetricValue::Float(v);
            }
        }
        (Value::Bool(b), ValueKind::Bool) => return MetricValue::Bool(*b),
        _ => {}
    }

    let text = match raw {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };

    if text.is_empty() {
        return MetricValue::Missing;
    }

    match kind {
        ValueKind::Int => match text.parse::<i64>() {
            Ok(v) => MetricValue::Int(v),
            Err(_) => MetricValue::Text(text),
        },
        ValueKind::Real => match text.parse::<f64>() {
            Ok(v) => MetricValue::Float(v),
            Err(_) => MetricValue::Text(text),
        },
        ValueKind::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "1" => MetricValue::Bool(true),
            "false" | "0" => MetricValue::Bool(false),
            _ => MetricValue::Text(text),
        },
        // Timestamps and free text are stored in their textual form.
        ValueKind::Timestamp | ValueKind::Text => MetricValue::Text(text),
    }
}

/// Parse the timestamp formats seen on real BMC firmware: RFC 3339 (with or
/// without fractional seconds), RFC 3339 with a compact offset, and a naive
/// `YYYY-MM-DD HH:MM:SS` form treated as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    if let Ok(ts) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(ts.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds() -> HashMap<String, ValueKind> {
        let mut m = HashMap::new();
        m.insert("TemperatureReading".to_string(), ValueKind::Int);
        m.insert("SystemInputPower".to_string(), ValueKind::Real);
        m.insert("FanHealth".to_string(), ValueKind::Text);
        m.insert("PSURedundancy".to_string(), ValueKind::Bool);
        m.insert("LastUpdateTime".to_string(), ValueKind::Timestamp);
        m
    }

    fn decode(payload: &str) -> Result<DecodedReport, DecodeError> {
        decode_report(payload.as_bytes(), &kinds())
    }

    #[test]
    fn test_decode_well_formed_report() {
        let payload = r#"{
            "Id": "PowerMetrics",
            "MetricValues": [
                {"MetricId": "TemperatureReading", "Timestamp": "2024-03-01T12:00:00-06:00", "MetricValue": "36"},
                {"MetricId": "SystemInputPower", "Timestamp": "2024-03-01T12:00:00-06:00", "MetricValue": "212.5"}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.skipped, 0);

        assert_eq!(report.records[0].metric_id, "TemperatureReading");
        assert_eq!(report.records[0].value, MetricValue::Int(36));
        assert_eq!(report.records[1].value, MetricValue::Float(212.5));

        // -06:00 normalizes to UTC.
        assert_eq!(
            report.records[0].timestamp.to_rfc3339(),
            "2024-03-01T18:00:00+00:00"
        );
    }

    #[test]
    fn test_decode_missing_metric_array_fails() {
        let err = decode(r#"{"Id": "PowerMetrics"}"#).expect_err("should fail");
        assert!(matches!(err, DecodeError::MissingMetricArray));
    }

    #[test]
    fn test_decode_oem_nested_metric_array() {
        let payload = r#"{
            "Id": "PowerMetrics",
            "Oem": {
                "Dell": {
                    "MetricValues": [
                        {"MetricId": "SystemInputPower", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "198.0"}
                    ]
                }
            }
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.records[0].value, MetricValue::Float(198.0));
    }

    #[test]
    fn test_decode_metric_array_wrong_type_fails() {
        let err = decode(r#"{"MetricValues": "nope"}"#).expect_err("should fail");
        assert!(matches!(err, DecodeError::MissingMetricArray));
    }

    #[test]
    fn test_decode_invalid_json_fails() {
        let err = decode("{not json").expect_err("should fail");
        assert!(matches!(err, DecodeError::InvalidJson(_)));
    }

    #[test]
    fn test_decode_non_object_fails() {
        let err = decode(r#"[1, 2, 3]"#).expect_err("should fail");
        assert!(matches!(err, DecodeError::NotAnObject));
    }

    #[test]
    fn test_decode_skips_malformed_entry_keeps_good_one() {
        let payload = r#"{
            "MetricValues": [
                {"Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "36"},
                {"MetricId": "TemperatureReading", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "36"}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.records[0].metric_id, "TemperatureReading");
    }

    #[test]
    fn test_decode_skips_unparseable_timestamp() {
        let payload = r#"{
            "MetricValues": [
                {"MetricId": "TemperatureReading", "Timestamp": "whenever", "MetricValue": "36"}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert!(report.records.is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[test]
    fn test_decode_empty_metric_array() {
        let report = decode(r#"{"MetricValues": []}"#).expect("valid report");
        assert!(report.records.is_empty());
        assert_eq!(report.skipped, 0);
    }

    #[test]
    fn test_coerce_numeric_parse_failure_keeps_raw_string() {
        let payload = r#"{
            "MetricValues": [
                {"MetricId": "TemperatureReading", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "Not Available"},
                {"MetricId": "SystemInputPower", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "n/a"}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(
            report.records[0].value,
            MetricValue::Text("Not Available".to_string())
        );
        assert_eq!(report.records[1].value, MetricValue::Text("n/a".to_string()));
    }

    #[test]
    fn test_coerce_absent_and_empty_values_are_missing() {
        let payload = r#"{
            "MetricValues": [
                {"MetricId": "TemperatureReading", "Timestamp": "2024-03-01T12:00:00Z"},
                {"MetricId": "TemperatureReading", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": ""},
                {"MetricId": "TemperatureReading", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": null}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(report.records.len(), 3);
        for record in &report.records {
            assert!(record.value.is_missing());
        }
    }

    #[test]
    fn test_coerce_json_typed_values() {
        let payload = r#"{
            "MetricValues": [
                {"MetricId": "TemperatureReading", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": 36},
                {"MetricId": "SystemInputPower", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": 212.5},
                {"MetricId": "PSURedundancy", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": true}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(report.records[0].value, MetricValue::Int(36));
        assert_eq!(report.records[1].value, MetricValue::Float(212.5));
        assert_eq!(report.records[2].value, MetricValue::Bool(true));
    }

    #[test]
    fn test_coerce_int_kind_rejects_fractional_raw() {
        // A fractional reading for an INT metric is a data-quality signal,
        // not something to round away.
        let payload = r#"{
            "MetricValues": [
                {"MetricId": "TemperatureReading", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "36.5"}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(report.records[0].value, MetricValue::Text("36.5".to_string()));
    }

    #[test]
    fn test_coerce_bool_variants() {
        let payload = r#"{
            "MetricValues": [
                {"MetricId": "PSURedundancy", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "1"},
                {"MetricId": "PSURedundancy", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "False"},
                {"MetricId": "PSURedundancy", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "degraded"}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(report.records[0].value, MetricValue::Bool(true));
        assert_eq!(report.records[1].value, MetricValue::Bool(false));
        assert_eq!(
            report.records[2].value,
            MetricValue::Text("degraded".to_string())
        );
    }

    #[test]
    fn test_coerce_unknown_metric_defaults_to_real() {
        let payload = r#"{
            "MetricValues": [
                {"MetricId": "SomethingNew", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "1.25"}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(report.records[0].value, MetricValue::Float(1.25));
    }

    #[test]
    fn test_coerce_timestamp_kind_stored_as_text() {
        let payload = r#"{
            "MetricValues": [
                {"MetricId": "LastUpdateTime", "Timestamp": "2024-03-01T12:00:00Z", "MetricValue": "2024-02-29T23:59:59Z"}
            ]
        }"#;

        let report = decode(payload).expect("valid report");
        assert_eq!(
            report.records[0].value,
            MetricValue::Text("2024-02-29T23:59:59Z".to_string())
        );
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert!(parse_timestamp("2024-03-01T12:00:00Z").is_some());
        assert!(parse_timestamp("2024-03-01T12:00:00.125-06:00").is_some());
        assert!(parse_timestamp("2024-03-01T12:00:00-0600").is_some());
        assert!(parse_timestamp("2024-03-01 12:00:00").is_some());
        assert!(parse_timestamp("03/01/2024").is_none());
        assert!(parse_timestamp("").is_none());
    }
}
