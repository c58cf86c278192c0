//! Resolution stage.
//!
//! Sits between the listeners and the writer: takes raw batches keyed
//! by node address and metric id, resolves them against the catalog
//! and forwards normalized records. Records that cannot be resolved
//! are dropped here, counted, and never reach the store.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::model::{MetricRecord, NormalizedRecord, RawBatch};
use crate::pipeline::stats::PipelineStats;

pub struct ProcessingStage {
    catalog: Arc<Catalog>,
    stats: Arc<PipelineStats>,
}

impl ProcessingStage {
    pub fn new(catalog: Arc<Catalog>, stats: Arc<PipelineStats>) -> Self {
        Self { catalog, stats }
    }

    /// Consumes `rx` until all listeners hang up or `cancel` fires,
    /// then drains whatever is already queued before returning.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<RawBatch>,
        tx: mpsc::Sender<NormalizedRecord>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Listeners are shutting down too; resolve what they
                    // already handed us so it is not lost.
                    while let Ok(batch) = rx.try_recv() {
                        if self.handle(batch, &tx).await.is_err() {
                            break;
                        }
                    }
                    info!("processing stage stopped");
                    return;
                }
                batch = rx.recv() => {
                    let Some(batch) = batch else {
                        info!("processing stage input closed");
                        return;
                    };
                    if self.handle(batch, &tx).await.is_err() {
                        // Writer side is gone, nothing left to feed.
                        return;
                    }
                }
            }
        }
    }

    async fn handle(
        &self,
        batch: RawBatch,
        tx: &mpsc::Sender<NormalizedRecord>,
    ) -> Result<(), mpsc::error::SendError<NormalizedRecord>> {
        self.stats.add_batch(batch.records.len() as u64);

        let Some(node_id) = self.catalog.node_id(&batch.node_addr) else {
            warn!(
                node = %batch.node_addr,
                records = batch.records.len(),
                "dropping batch from unknown node"
            );
            self.stats.add_unknown_node(batch.records.len() as u64);
            return Ok(());
        };

        for raw in batch.records {
            let Some(def) = self.catalog.metric(&raw.metric_id) else {
                debug!(metric = %raw.metric_id, "dropping record for unknown metric");
                self.stats.add_unknown_metric();
                continue;
            };

            let normalized = NormalizedRecord {
                table: def.table.clone(),
                record: MetricRecord {
                    timestamp: raw.timestamp,
                    node_id,
                    source: def.source.clone(),
                    fqdd: def.fqdd.clone(),
                    value: raw.value,
                },
            };
            self.stats.add_resolved(1);
            tx.send(normalized).await?;
        }
        Ok(())
    }
}
