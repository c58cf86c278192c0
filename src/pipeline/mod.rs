//! Ingestion pipeline orchestration.
//!
//! Wires the per-node stream listeners, the resolution stage and the
//! persistence writer together with bounded channels, runs them under
//! one cancellation token, and reports progress while they run.

pub mod process;
pub mod stats;
pub mod writer;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::health::HealthMetrics;
use crate::listen::{ListenerRegistry, ListenerStatus, ListenerTotals, StreamListener};
use crate::model::{NormalizedRecord, RawBatch};
use crate::pipeline::process::ProcessingStage;
use crate::pipeline::stats::{PipelineStats, StatsSnapshot};
use crate::pipeline::writer::PersistenceWriter;
use crate::store::MetricStore;

/// Owns the running ingestion pipeline.
///
/// Listeners feed raw batches into a bounded channel; the resolution
/// stage normalizes them into a second bounded channel; the writer
/// drains that into the store. When the store slows down the channels
/// fill and the listeners block, so ingest never outruns persistence.
pub struct Pipeline<S> {
    cfg: Config,
    catalog: Arc<Catalog>,
    store: Arc<S>,
    health: Arc<HealthMetrics>,
    stats: Arc<PipelineStats>,
    registry: Arc<ListenerRegistry>,
    cancel: CancellationToken,
    listener_tasks: Vec<JoinHandle<()>>,
    processor_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl<S: MetricStore + Send + Sync + 'static> Pipeline<S> {
    pub fn new(cfg: Config, catalog: Arc<Catalog>, store: Arc<S>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            catalog,
            store,
            health,
            stats: Arc::new(PipelineStats::new()),
            registry: Arc::new(ListenerRegistry::new()),
            cancel: CancellationToken::new(),
            listener_tasks: Vec::new(),
            processor_task: None,
            writer_task: None,
        })
    }

    /// Start all stages and begin ingesting.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Start health metrics server (before listeners so probes respond).
        self.health
            .start()
            .await
            .context("starting health metrics server")?;
        self.health
            .nodes_configured
            .set(self.catalog.node_count() as f64);
        self.health.store_up.set(1.0);

        // 2. Create the bounded channels between the stages.
        let (raw_tx, raw_rx) = mpsc::channel::<RawBatch>(self.cfg.channels.read_capacity);
        let (write_tx, write_rx) =
            mpsc::channel::<NormalizedRecord>(self.cfg.channels.write_capacity);

        // 3. Start the persistence writer.
        let writer = PersistenceWriter::new(
            self.cfg.writer.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.stats),
            Some(Arc::clone(&self.health)),
        );
        let writer_cancel = self.cancel.child_token();
        self.writer_task = Some(tokio::spawn(async move {
            writer.run(write_rx, writer_cancel).await;
        }));

        // 4. Start the resolution stage.
        let processor = ProcessingStage::new(Arc::clone(&self.catalog), Arc::clone(&self.stats));
        let processor_cancel = self.cancel.child_token();
        let processor_tx = write_tx.clone();
        self.processor_task = Some(tokio::spawn(async move {
            processor.run(raw_rx, processor_tx, processor_cancel).await;
        }));

        // 5. Start one listener per configured node.
        for (addr, _) in self.catalog.node_addrs() {
            let listener = StreamListener::new(
                addr.to_string(),
                self.cfg.listen.clone(),
                raw_tx.clone(),
                Arc::clone(&self.catalog),
                Arc::clone(&self.registry),
                self.cancel.child_token(),
            )
            .with_context(|| format!("creating listener for {addr}"))?;
            self.listener_tasks.push(tokio::spawn(listener.run()));
        }
        info!(nodes = self.listener_tasks.len(), "listeners started");

        // 6. Start the status reporter. It keeps one sender per channel
        // alive solely to read queue depths.
        self.spawn_status_reporter(raw_tx, write_tx);

        info!("pipeline fully started");

        Ok(())
    }

    /// Gracefully stop all stages.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // Listeners first so no new batches arrive while draining.
        for task in self.listener_tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "listener task failed");
            }
        }

        // The processor drains queued batches, then the writer runs its
        // final flush.
        if let Some(task) = self.processor_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "processing task failed");
            }
        }
        if let Some(task) = self.writer_task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "writer task failed");
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        info!("pipeline stopped");
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn listeners(&self) -> Vec<(String, ListenerStatus)> {
        self.registry.snapshot()
    }

    /// Spawn the periodic status reporter.
    ///
    /// Logs one line per interval and mirrors the counter deltas into
    /// the Prometheus metrics, keeping the hot path free of metric
    /// updates.
    fn spawn_status_reporter(
        &self,
        raw_tx: mpsc::Sender<RawBatch>,
        write_tx: mpsc::Sender<NormalizedRecord>,
    ) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let registry = Arc::clone(&self.registry);
        let health = Arc::clone(&self.health);
        let report_interval = self.cfg.status_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(report_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut last = StatsSnapshot::default();
            let mut last_totals = ListenerTotals::default();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snap = stats.snapshot();
                        let delta = snap.delta(&last);
                        let totals = registry.totals();

                        health.reports_received
                            .inc_by(totals.reports.saturating_sub(last_totals.reports) as f64);
                        health.decode_errors
                            .inc_by(totals.decode_errors.saturating_sub(last_totals.decode_errors) as f64);
                        health.stream_reconnects
                            .inc_by(totals.reconnects.saturating_sub(last_totals.reconnects) as f64);
                        health.records_received.inc_by(delta.records_in as f64);
                        health.records_written.inc_by(delta.records_written as f64);
                        health.flushes.inc_by(delta.flushes as f64);
                        health.write_errors.inc_by(delta.write_errors as f64);
                        health.records_dropped
                            .with_label_values(&["unknown_node"])
                            .inc_by(delta.dropped_unknown_node as f64);
                        health.records_dropped
                            .with_label_values(&["unknown_metric"])
                            .inc_by(delta.dropped_unknown_metric as f64);
                        health.records_dropped
                            .with_label_values(&["write_failed"])
                            .inc_by(delta.records_failed as f64);

                        health.listeners_streaming.set(totals.streaming as f64);
                        health.listeners_backoff.set(totals.backoff as f64);

                        let read_queued = raw_tx.max_capacity().saturating_sub(raw_tx.capacity());
                        let write_queued =
                            write_tx.max_capacity().saturating_sub(write_tx.capacity());
                        health.channel_length
                            .with_label_values(&["read"])
                            .set(read_queued as f64);
                        health.channel_capacity
                            .with_label_values(&["read"])
                            .set(raw_tx.max_capacity() as f64);
                        health.channel_length
                            .with_label_values(&["write"])
                            .set(write_queued as f64);
                        health.channel_capacity
                            .with_label_values(&["write"])
                            .set(write_tx.max_capacity() as f64);

                        info!(
                            streaming = totals.streaming,
                            backoff = totals.backoff,
                            reports = totals.reports,
                            records_in = delta.records_in,
                            written = delta.records_written,
                            dropped = delta.dropped_unknown_node
                                + delta.dropped_unknown_metric
                                + delta.records_failed,
                            read_queue = read_queued,
                            write_queue = write_queued,
                            "pipeline status",
                        );

                        last = snap;
                        last_totals = totals;
                    }
                }
            }
        });
    }
}
