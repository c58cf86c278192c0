use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use reductoor::config::ReductionConfig;
use reductoor::decode::decode_report;
use reductoor::model::{MetricRecord, ValueKind};
use reductoor::reduce::aggregate::aggregate;
use reductoor::reduce::dedup::deduplicate_bucketed;
use reductoor::reduce::reconstruct::reconstruct;
use reductoor::reduce::reduce_rows;
use reductoor::reduce::tolerance::{BucketedTolerance, ToleranceFormula};
use reductoor::store::memory::float_record;

fn kinds() -> HashMap<String, ValueKind> {
    let mut m = HashMap::new();
    m.insert("TemperatureReading".to_string(), ValueKind::Int);
    m.insert("SystemInputPower".to_string(), ValueKind::Real);
    m
}

fn report_payload(entries: usize) -> Vec<u8> {
    let values: Vec<serde_json::Value> = (0..entries)
        .map(|i| {
            let ts = format!("2026-02-10T08:{:02}:{:02}-06:00", i / 60, i % 60);
            if i % 2 == 0 {
                serde_json::json!({
                    "MetricId": "TemperatureReading",
                    "Timestamp": ts,
                    "MetricValue": "36"
                })
            } else {
                serde_json::json!({
                    "MetricId": "SystemInputPower",
                    "Timestamp": ts,
                    "MetricValue": "212.5"
                })
            }
        })
        .collect();

    serde_json::to_vec(&serde_json::json!({
        "Id": "TelemetryReport",
        "MetricValues": values
    }))
    .expect("serialize payload")
}

/// Two hours of drifting readings for eight series, five-second cadence.
fn drifting_window() -> Vec<MetricRecord> {
    let base: DateTime<Utc> = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
    let mut rows = Vec::new();
    for s in 0..8i32 {
        let fqdd = format!("Sensor{s:02}");
        for i in 0..1_440i64 {
            let t = 5 * i;
            let value = 100.0 + s as f64 + 3.0 * ((t + 200 * s as i64) as f64 / 300.0).sin();
            rows.push(float_record(
                base + chrono::Duration::seconds(t),
                1,
                "idrac",
                &fqdd,
                value,
            ));
        }
    }
    rows
}

fn bench_decode(c: &mut Criterion) {
    let kinds = kinds();
    let small = report_payload(4);
    let large = report_payload(64);

    c.bench_function("decode_report/small_report", |b| {
        b.iter(|| decode_report(black_box(&small), &kinds).expect("decode"))
    });

    c.bench_function("decode_report/large_report", |b| {
        b.iter(|| decode_report(black_box(&large), &kinds).expect("decode"))
    });
}

fn bench_reduce(c: &mut Criterion) {
    let rows = drifting_window();
    let tolerance =
        BucketedTolerance::build(&rows, Duration::from_secs(3600), ToleranceFormula::Cv);
    let cfg = ReductionConfig::default();

    c.bench_function("reduce/dedup_two_hour_window", |b| {
        b.iter_batched(
            || rows.clone(),
            |rows| deduplicate_bucketed(rows, &tolerance),
            BatchSize::LargeInput,
        )
    });

    c.bench_function("reduce/reduce_two_hour_window", |b| {
        b.iter_batched(
            || rows.clone(),
            |rows| reduce_rows(rows, &cfg),
            BatchSize::LargeInput,
        )
    });
}

fn bench_rollup_and_rebuild(c: &mut Criterion) {
    let rows = drifting_window();
    let cfg = ReductionConfig::default();
    let reduced = reduce_rows(rows.clone(), &cfg);
    let start = Utc.with_ymd_and_hms(2026, 2, 10, 0, 0, 0).unwrap();
    let end = start + chrono::Duration::seconds(7_200);

    c.bench_function("rollup/aggregate_minute_buckets", |b| {
        b.iter(|| aggregate(black_box(&rows), Duration::from_secs(60)))
    });

    c.bench_function("reconstruct/one_second_ticks", |b| {
        b.iter(|| {
            let rebuilt = reconstruct(black_box(&reduced), start, end, Duration::from_secs(1));
            black_box(rebuilt.len())
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_decode(c);
    bench_reduce(c);
    bench_rollup_and_rebuild(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
