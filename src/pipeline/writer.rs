//! Persistence stage.
//!
//! Accumulates normalized records and flushes them to the store in
//! batched transactions, one insert per `(node, table)` group. A flush
//! is triggered by size or by the flush interval, whichever comes
//! first. Flushes run on a `JoinSet` capped by a semaphore; with a
//! single worker they are strictly serialized, which keeps per-series
//! write order intact. A failed group drops its rows and is counted,
//! it never stalls the stage or the other nodes' groups.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::WriterConfig;
use crate::health::HealthMetrics;
use crate::model::{MetricRecord, NormalizedRecord};
use crate::pipeline::stats::PipelineStats;
use crate::store::MetricStore;

pub struct PersistenceWriter<S> {
    cfg: WriterConfig,
    store: Arc<S>,
    stats: Arc<PipelineStats>,
    health: Option<Arc<HealthMetrics>>,
}

/// Records waiting for the next flush, grouped by `(node_id, table)`
/// so one node's poison row cannot roll back another node's batch.
#[derive(Default)]
struct Pending {
    groups: HashMap<(i32, String), Vec<MetricRecord>>,
    total: usize,
}

impl Pending {
    fn push(&mut self, item: NormalizedRecord) {
        self.groups
            .entry((item.record.node_id, item.table))
            .or_default()
            .push(item.record);
        self.total += 1;
    }

    fn take(&mut self) -> HashMap<(i32, String), Vec<MetricRecord>> {
        self.total = 0;
        std::mem::take(&mut self.groups)
    }
}

impl<S: MetricStore + Send + Sync + 'static> PersistenceWriter<S> {
    pub fn new(
        cfg: WriterConfig,
        store: Arc<S>,
        stats: Arc<PipelineStats>,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            cfg,
            store,
            stats,
            health,
        }
    }

    /// Consumes `rx` until the processing stage hangs up or `cancel`
    /// fires. Both exits drain the queue and wait for in-flight
    /// flushes before returning, so accepted records are not lost on
    /// shutdown.
    pub async fn run(&self, mut rx: mpsc::Receiver<NormalizedRecord>, cancel: CancellationToken) {
        let batch_size = self.cfg.batch_size.max(1);
        let mut pending = Pending::default();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let limit = Arc::new(Semaphore::new(self.cfg.workers.max(1)));

        let mut ticker = tokio::time::interval(self.cfg.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    while let Ok(item) = rx.try_recv() {
                        pending.push(item);
                    }
                    self.flush(&mut pending, &limit, &mut tasks).await;
                    while tasks.join_next().await.is_some() {}
                    info!("persistence writer stopped");
                    return;
                }
                item = rx.recv() => {
                    match item {
                        Some(item) => {
                            pending.push(item);
                            if pending.total >= batch_size {
                                self.flush(&mut pending, &limit, &mut tasks).await;
                            }
                        }
                        None => {
                            self.flush(&mut pending, &limit, &mut tasks).await;
                            while tasks.join_next().await.is_some() {}
                            info!("persistence writer input closed");
                            return;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if pending.total > 0 {
                        self.flush(&mut pending, &limit, &mut tasks).await;
                    }
                }
                Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = res {
                        error!(error = %e, "write task failed");
                    }
                }
            }
        }
    }

    /// Spawns one insert per `(node, table)` group. Waiting for a
    /// worker permit here is what pushes back on the channel when the
    /// store is slow.
    async fn flush(
        &self,
        pending: &mut Pending,
        limit: &Arc<Semaphore>,
        tasks: &mut JoinSet<()>,
    ) {
        let total = pending.total;
        let groups = pending.take();
        if groups.is_empty() {
            return;
        }
        self.stats.add_flush();
        if let Some(health) = &self.health {
            health.flush_batch_size.observe(total as f64);
        }

        for ((node_id, table), rows) in groups {
            // The semaphore is never closed while the writer runs.
            let Ok(permit) = limit.clone().acquire_owned().await else {
                return;
            };
            let store = self.store.clone();
            let stats = self.stats.clone();
            let health = self.health.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let started = Instant::now();
                match store.insert_batch(&table, &rows).await {
                    Ok(written) => {
                        stats.add_written(written);
                        if let Some(health) = &health {
                            health
                                .flush_duration
                                .observe(started.elapsed().as_secs_f64());
                        }
                        debug!(node_id, table = %table, rows = written, "flushed batch");
                    }
                    Err(e) => {
                        stats.add_write_error(rows.len() as u64);
                        error!(
                            node_id,
                            table = %table,
                            rows = rows.len(),
                            error = %e,
                            "batch write failed, dropping rows"
                        );
                    }
                }
            });
        }
    }
}
