use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use reductoor::catalog::{Catalog, MetricDef};
use reductoor::config::WriterConfig;
use reductoor::decode::decode_report;
use reductoor::listen::{data_payload, SseFramer};
use reductoor::model::{MetricValue, RawBatch, RawRecord, ValueKind};
use reductoor::pipeline::process::ProcessingStage;
use reductoor::pipeline::stats::PipelineStats;
use reductoor::pipeline::writer::PersistenceWriter;
use reductoor::store::memory::MemoryStore;

const NODE_A: &str = "10.20.0.11";
const NODE_B: &str = "10.20.0.12";

fn catalog() -> Arc<Catalog> {
    let nodes = HashMap::from([(NODE_A.to_string(), 1), (NODE_B.to_string(), 2)]);
    let metrics = vec![
        MetricDef {
            metric_id: "TemperatureReading".to_string(),
            source: "idrac".to_string(),
            fqdd: "CPU1 Temp".to_string(),
            kind: ValueKind::Int,
            table: "cpu_temp".to_string(),
        },
        MetricDef {
            metric_id: "SystemInputPower".to_string(),
            source: "idrac".to_string(),
            fqdd: "System Board Pwr Consumption".to_string(),
            kind: ValueKind::Real,
            table: "power".to_string(),
        },
        MetricDef {
            metric_id: "RPMReading".to_string(),
            source: "idrac".to_string(),
            fqdd: "Fan.Embedded.1A".to_string(),
            kind: ValueKind::Int,
            table: "fan_speed".to_string(),
        },
        MetricDef {
            metric_id: "FanHealth".to_string(),
            source: "idrac".to_string(),
            fqdd: "Fan.Embedded.1A Health".to_string(),
            kind: ValueKind::Text,
            table: "fan_speed".to_string(),
        },
    ];
    Arc::new(Catalog::new(nodes, metrics).expect("catalog"))
}

fn writer_cfg(batch_size: usize) -> WriterConfig {
    WriterConfig {
        batch_size,
        // Long enough that only size and shutdown trigger flushes.
        flush_interval: Duration::from_secs(3600),
        workers: 1,
    }
}

/// Runs raw SSE chunks through the framer exactly as the listener does
/// and decodes every `data:` payload into one batch.
fn batches_from_sse(addr: &str, chunks: &[&[u8]], catalog: &Catalog) -> (Vec<RawBatch>, usize) {
    let mut framer = SseFramer::new();
    let mut batches = Vec::new();
    let mut skipped = 0;

    for chunk in chunks {
        framer.extend(chunk);
        while let Some(line) = framer.next_line() {
            if let Some(payload) = data_payload(&line) {
                let report = decode_report(payload.as_bytes(), catalog).expect("decode report");
                skipped += report.skipped;
                batches.push(RawBatch {
                    node_addr: addr.to_string(),
                    records: report.records,
                });
            }
        }
    }

    (batches, skipped)
}

fn node_a_wire() -> String {
    let report = serde_json::json!({
        "Id": "TelemetryReport",
        "Name": "Custom Telemetry Report",
        "MetricValues": [
            {"MetricId": "TemperatureReading", "Timestamp": "2026-02-10T08:00:00-06:00", "MetricValue": "36"},
            {"MetricId": "TemperatureReading", "Timestamp": "2026-02-10T08:01:00-06:00", "MetricValue": 37},
            {"MetricId": "SystemInputPower", "Timestamp": "2026-02-10T08:00:00-06:00", "MetricValue": "212.5"},
            {"MetricId": "BoardVoltage", "Timestamp": "2026-02-10T08:00:00-06:00", "MetricValue": "12.1"},
            {"MetricId": "FanHealth", "Timestamp": "2026-02-10T08:00:00-06:00", "MetricValue": "OK"},
            {"MetricId": "TemperatureReading", "Timestamp": "2026-02-10T08:02:00-06:00", "MetricValue": "Not Available"},
            {"Timestamp": "2026-02-10T08:00:00-06:00", "MetricValue": "3"},
            {"MetricId": "TemperatureReading", "Timestamp": "whenever", "MetricValue": "3"}
        ]
    });
    format!(": keep-alive\r\nid: 42\r\nevent: metricreport\r\ndata: {report}\r\n\r\n")
}

fn node_b_wire() -> String {
    let report = serde_json::json!({
        "Id": "TelemetryReport",
        "MetricValues": [
            {"MetricId": "RPMReading", "Timestamp": "2026-02-10T08:00:30-06:00", "MetricValue": "8400"},
            {"MetricId": "RPMReading", "Timestamp": "2026-02-10T08:01:30-06:00", "MetricValue": "8460"}
        ]
    });
    format!("data: {report}\n\n")
}

fn unknown_node_batch() -> RawBatch {
    let ts = Utc.with_ymd_and_hms(2026, 2, 10, 14, 0, 0).unwrap();
    RawBatch {
        node_addr: "10.20.9.99".to_string(),
        records: vec![
            RawRecord {
                metric_id: "TemperatureReading".to_string(),
                timestamp: ts,
                value: MetricValue::Int(40),
            },
            RawRecord {
                metric_id: "TemperatureReading".to_string(),
                timestamp: ts,
                value: MetricValue::Int(41),
            },
        ],
    }
}

#[tokio::test]
async fn pipeline_blackbox_correctness_and_invariants() {
    let catalog = catalog();
    let stats = Arc::new(PipelineStats::new());
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();

    // Frame and decode node A's stream from chunks split mid-report to
    // prove reassembly, node B's from a single chunk.
    let wire_a = node_a_wire();
    let (head, tail) = wire_a.as_bytes().split_at(wire_a.len() / 2);
    let (batches_a, skipped_a) = batches_from_sse(NODE_A, &[head, tail], &catalog);
    let (batches_b, skipped_b) = batches_from_sse(NODE_B, &[node_b_wire().as_bytes()], &catalog);

    assert_eq!(batches_a.len(), 1);
    assert_eq!(batches_b.len(), 1);
    // Entry without MetricId plus entry with an unparseable timestamp.
    assert_eq!(skipped_a + skipped_b, 2);
    assert_eq!(batches_a[0].records.len(), 6);
    assert_eq!(batches_b[0].records.len(), 2);

    let (raw_tx, raw_rx) = mpsc::channel(8);
    let (norm_tx, norm_rx) = mpsc::channel(64);

    let stage = ProcessingStage::new(catalog.clone(), stats.clone());
    let stage_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { stage.run(raw_rx, norm_tx, cancel).await })
    };

    let writer = PersistenceWriter::new(writer_cfg(4), store.clone(), stats.clone(), None);
    let writer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { writer.run(norm_rx, cancel).await })
    };

    for batch in batches_a {
        raw_tx.send(batch).await.expect("send");
    }
    raw_tx.send(unknown_node_batch()).await.expect("send");
    for batch in batches_b {
        raw_tx.send(batch).await.expect("send");
    }
    drop(raw_tx);

    stage_task.await.expect("stage");
    writer_task.await.expect("writer");

    let snap = stats.snapshot();
    assert_eq!(snap.batches_in, 3);
    assert_eq!(snap.records_in, 10);
    assert_eq!(snap.records_resolved, 7);
    assert_eq!(snap.dropped_unknown_node, 2);
    assert_eq!(snap.dropped_unknown_metric, 1);
    assert_eq!(snap.records_written, 7);
    assert_eq!(snap.records_failed, 0);
    assert_eq!(snap.write_errors, 0);
    // Four records trip the size flush, the rest go out on shutdown.
    assert_eq!(snap.flushes, 2);
    // One insert per (node, table) group touched per flush.
    assert_eq!(store.insert_calls(), 5);

    let cpu = store.rows("cpu_temp");
    assert_eq!(cpu.len(), 3);
    for row in &cpu {
        assert_eq!(row.node_id, 1);
        assert_eq!(row.source, "idrac");
        assert_eq!(row.fqdd, "CPU1 Temp");
    }
    assert_eq!(cpu[0].value, MetricValue::Int(36));
    assert_eq!(cpu[1].value, MetricValue::Int(37));
    // An unparseable reading survives as text instead of vanishing.
    assert_eq!(cpu[2].value, MetricValue::Text("Not Available".to_string()));
    // -06:00 offsets normalized to UTC.
    assert_eq!(
        cpu[0].timestamp,
        Utc.with_ymd_and_hms(2026, 2, 10, 14, 0, 0).unwrap()
    );
    assert_eq!(
        cpu[1].timestamp,
        Utc.with_ymd_and_hms(2026, 2, 10, 14, 1, 0).unwrap()
    );
    assert_eq!(
        cpu[2].timestamp,
        Utc.with_ymd_and_hms(2026, 2, 10, 14, 2, 0).unwrap()
    );

    let power = store.rows("power");
    assert_eq!(power.len(), 1);
    assert_eq!(power[0].value, MetricValue::Float(212.5));
    assert_eq!(power[0].fqdd, "System Board Pwr Consumption");

    let fans = store.rows("fan_speed");
    assert_eq!(fans.len(), 3);
    assert_eq!(fans[0].node_id, 1);
    assert_eq!(fans[0].value, MetricValue::Text("OK".to_string()));
    assert_eq!(fans[1].node_id, 2);
    assert_eq!(fans[1].value, MetricValue::Int(8400));
    assert_eq!(fans[2].value, MetricValue::Int(8460));
}

#[tokio::test]
async fn backpressure_bounds_in_flight_records_without_loss() {
    const READ_CAP: usize = 4;
    const WRITE_CAP: usize = 8;
    const BATCH: usize = 2;
    const TOTAL: u64 = 300;

    let catalog = catalog();
    let stats = Arc::new(PipelineStats::new());
    let store = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    store.stall(true);

    let (raw_tx, raw_rx) = mpsc::channel(READ_CAP);
    let (norm_tx, norm_rx) = mpsc::channel(WRITE_CAP);

    let stage = ProcessingStage::new(catalog.clone(), stats.clone());
    let stage_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { stage.run(raw_rx, norm_tx, cancel).await })
    };

    let writer = PersistenceWriter::new(writer_cfg(BATCH), store.clone(), stats.clone(), None);
    let writer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { writer.run(norm_rx, cancel).await })
    };

    let base = Utc.with_ymd_and_hms(2026, 2, 10, 14, 0, 0).unwrap();
    let sent = Arc::new(AtomicU64::new(0));
    let producer = {
        let sent = sent.clone();
        tokio::spawn(async move {
            for i in 0..TOTAL {
                let batch = RawBatch {
                    node_addr: NODE_A.to_string(),
                    records: vec![RawRecord {
                        metric_id: "TemperatureReading".to_string(),
                        timestamp: base + chrono::Duration::seconds(i as i64),
                        value: MetricValue::Int(30 + (i % 10) as i64),
                    }],
                };
                if raw_tx.send(batch).await.is_err() {
                    return;
                }
                sent.fetch_add(1, Ordering::SeqCst);
            }
        })
    };

    // With the store stalled, accepted-but-unwritten records can sit in
    // the two channels, one record in the stage's hand, one batch in
    // the blocked flush and one more waiting on the worker permit.
    let budget = (READ_CAP + WRITE_CAP + 2 * BATCH + 2) as u64;
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        let in_flight = sent.load(Ordering::SeqCst) - store.inserted();
        assert!(
            in_flight <= budget,
            "in-flight records {} exceed buffering budget {}",
            in_flight,
            budget
        );
    }
    assert!(
        sent.load(Ordering::SeqCst) < TOTAL,
        "producer should be blocked by backpressure"
    );

    store.stall(false);
    producer.await.expect("producer");
    stage_task.await.expect("stage");
    writer_task.await.expect("writer");

    // Every accepted record reaches the store once the stall clears.
    assert_eq!(store.inserted(), TOTAL);
    assert_eq!(store.rows("cpu_temp").len() as u64, TOTAL);

    let snap = stats.snapshot();
    assert_eq!(snap.records_resolved, TOTAL);
    assert_eq!(snap.records_written, TOTAL);
    assert_eq!(snap.records_failed, 0);
    assert_eq!(snap.write_errors, 0);
    assert_eq!(snap.dropped_unknown_node, 0);
    assert_eq!(snap.dropped_unknown_metric, 0);
}
