//! Orphan cleanup: deletes local documents this shard neither owns nor is
//! receiving.
//!
//! ```text
//!            refresh                 per batch, under the store lock
//!  store ─────────────► cache ──► snapshot ──► delete !owns(key)
//!                                   ▲
//!  schedule_range_deletion ─────────┘ (after delay, same path)
//! ```
//!
//! Every batch classifies keys against the snapshot current at that moment,
//! so a range that became pending or owned mid-pass is left alone. An
//! invalidated snapshot deletes nothing; the pass refreshes before the next
//! batch or stops. Passes
//! are idempotent and can be cut between batches; with a checkpoint
//! directory the cursor survives a restart.

mod checkpoint;
mod metrics;

pub use checkpoint::{CheckpointStore, CleanupCheckpoint};
pub use metrics::{CleanupMetrics, CleanupMetricsSnapshot};

use crate::config::CleanupConfig;
use crate::error::{Error, Result};
use crate::metadata::ChunkRange;
use crate::ownership::RangeOwnershipCache;
use crate::storage::ShardStore;
use crate::types::{CollectionId, ShardId, ShardKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result of a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Documents examined.
    pub scanned: u64,
    /// Documents deleted.
    pub deleted: u64,
}

#[derive(Debug)]
struct ScheduledDeletion {
    collection: CollectionId,
    range: ChunkRange,
    expedite: CancellationToken,
}

/// Handle on a scheduled range deletion.
#[derive(Debug)]
pub struct RangeDeletionTask {
    id: Uuid,
    collection: CollectionId,
    range: ChunkRange,
    result: watch::Receiver<Option<Result<CleanupStats>>>,
}

impl RangeDeletionTask {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn range(&self) -> &ChunkRange {
        &self.range
    }

    /// Wait until the deletion ran.
    pub async fn wait(mut self) -> Result<CleanupStats> {
        let outcome = match self.result.wait_for(|r| r.is_some()).await {
            Ok(done) => done.clone().unwrap_or(Err(Error::Cancelled)),
            Err(_) => Err(Error::Cancelled),
        };
        outcome
    }
}

/// Per-shard orphan cleanup and range deletion queue.
pub struct OrphanCleanupService {
    shard: ShardId,
    config: CleanupConfig,
    store: Arc<ShardStore>,
    cache: Arc<RangeOwnershipCache>,
    checkpoints: Option<CheckpointStore>,
    metrics: CleanupMetrics,
    scheduled: Mutex<HashMap<Uuid, ScheduledDeletion>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for OrphanCleanupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanCleanupService")
            .field("shard", &self.shard)
            .field("scheduled", &self.scheduled.lock().len())
            .finish()
    }
}

impl OrphanCleanupService {
    /// Create the service. Opens the checkpoint directory if configured.
    pub async fn new(
        shard: ShardId,
        config: CleanupConfig,
        store: Arc<ShardStore>,
        cache: Arc<RangeOwnershipCache>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let checkpoints = match &config.checkpoint_dir {
            Some(dir) => Some(CheckpointStore::open(dir.clone()).await?),
            None => None,
        };
        Ok(Self {
            shard,
            config,
            store,
            cache,
            checkpoints,
            metrics: CleanupMetrics::new(),
            scheduled: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(None),
            shutdown,
        })
    }

    pub fn metrics(&self) -> &CleanupMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &CleanupConfig {
        &self.config
    }

    /// Delete orphans of `collection` inside `bounds`, or everywhere.
    #[tracing::instrument(skip(self), fields(shard = self.shard))]
    pub async fn cleanup_orphans(
        &self,
        collection: &str,
        bounds: Option<ChunkRange>,
    ) -> Result<CleanupStats> {
        let bounds = bounds.unwrap_or_else(ChunkRange::full);
        self.cache.refresh(collection).await?;
        self.run_pass(collection, bounds, None, CleanupStats::default())
            .await
    }

    async fn run_pass(
        &self,
        collection: &str,
        bounds: ChunkRange,
        mut cursor: Option<ShardKey>,
        mut stats: CleanupStats,
    ) -> Result<CleanupStats> {
        let started = Instant::now();
        let limit = self.config.batch_size;

        loop {
            if self.shutdown.is_cancelled() {
                self.save_checkpoint(collection, &bounds, &cursor, stats).await;
                tracing::info!(collection, range = %bounds, "Cleanup interrupted by shutdown");
                return Err(Error::Cancelled);
            }

            if self.cache.snapshot(collection).is_some_and(|s| s.is_invalidated()) {
                tracing::info!(collection, "Ownership invalidated mid-pass, refreshing");
                if let Err(e) = self.cache.refresh(collection).await {
                    self.save_checkpoint(collection, &bounds, &cursor, stats).await;
                    tracing::warn!(collection, error = %e, "Cleanup stopped, ownership unknown");
                    return Err(e);
                }
            }

            let batch = self
                .store
                .delete_batch(collection, &bounds, cursor.as_ref(), limit, || {
                    let snapshot = self.cache.snapshot(collection);
                    move |key: &ShardKey| snapshot.as_ref().is_some_and(|s| s.is_orphan(key))
                });
            stats.scanned += batch.scanned;
            stats.deleted += batch.deleted;
            self.metrics.record_batch(batch.scanned, batch.deleted);
            if batch.deleted > 0 {
                tracing::debug!(
                    collection,
                    scanned = batch.scanned,
                    deleted = batch.deleted,
                    "Deleted orphan batch"
                );
            }

            match batch.last_key {
                Some(last) if batch.scanned as usize >= limit => cursor = Some(last),
                _ => break,
            }
            self.save_checkpoint(collection, &bounds, &cursor, stats).await;
            tokio::task::yield_now().await;
        }

        if let Some(checkpoints) = &self.checkpoints {
            if let Err(e) = checkpoints.remove(collection).await {
                tracing::warn!(collection, error = %e, "Failed to clear cleanup checkpoint");
            }
        }
        self.metrics.record_pass(started.elapsed());
        tracing::info!(
            collection,
            range = %bounds,
            scanned = stats.scanned,
            deleted = stats.deleted,
            "Orphan cleanup finished"
        );
        Ok(stats)
    }

    async fn save_checkpoint(
        &self,
        collection: &str,
        bounds: &ChunkRange,
        cursor: &Option<ShardKey>,
        stats: CleanupStats,
    ) {
        let Some(checkpoints) = &self.checkpoints else {
            return;
        };
        let checkpoint = CleanupCheckpoint {
            collection: collection.to_string(),
            bounds: bounds.clone(),
            cursor: cursor.clone(),
            scanned: stats.scanned,
            deleted: stats.deleted,
        };
        if let Err(e) = checkpoints.save(&checkpoint).await {
            tracing::warn!(collection, error = %e, "Failed to save cleanup checkpoint");
        }
    }

    /// Finish passes a previous process left half done.
    pub async fn resume_interrupted_cleanups(&self) -> Result<Vec<(CollectionId, CleanupStats)>> {
        let Some(checkpoints) = &self.checkpoints else {
            return Ok(Vec::new());
        };
        let mut resumed = Vec::new();
        for checkpoint in checkpoints.list().await? {
            tracing::info!(
                collection = %checkpoint.collection,
                range = %checkpoint.bounds,
                cursor = ?checkpoint.cursor,
                "Resuming interrupted cleanup"
            );
            self.cache.refresh(&checkpoint.collection).await?;
            let stats = CleanupStats {
                scanned: checkpoint.scanned,
                deleted: checkpoint.deleted,
            };
            let stats = self
                .run_pass(&checkpoint.collection, checkpoint.bounds, checkpoint.cursor, stats)
                .await?;
            resumed.push((checkpoint.collection, stats));
        }
        Ok(resumed)
    }

    /// Delete the orphans of `range` once `delay` has passed.
    pub fn schedule_range_deletion(
        self: &Arc<Self>,
        collection: &str,
        range: ChunkRange,
        delay: Duration,
    ) -> RangeDeletionTask {
        let id = Uuid::new_v4();
        let expedite = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        self.scheduled.lock().insert(
            id,
            ScheduledDeletion {
                collection: collection.to_string(),
                range: range.clone(),
                expedite: expedite.clone(),
            },
        );
        tracing::info!(
            shard = self.shard,
            collection,
            range = %range,
            delay_ms = delay.as_millis() as u64,
            "Scheduled range deletion"
        );

        let service = self.clone();
        let task_collection = collection.to_string();
        let task_range = range.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = tokio::time::sleep(delay) => service.run_range_deletion(&task_collection, &task_range).await,
                _ = expedite.cancelled() => service.run_range_deletion(&task_collection, &task_range).await,
                _ = service.shutdown.cancelled() => Err(Error::Cancelled),
            };
            service.scheduled.lock().remove(&id);
            let _ = tx.send(Some(result));
        });

        RangeDeletionTask {
            id,
            collection: collection.to_string(),
            range,
            result: rx,
        }
    }

    async fn run_range_deletion(&self, collection: &str, range: &ChunkRange) -> Result<CleanupStats> {
        let result = self.cleanup_orphans(collection, Some(range.clone())).await;
        match &result {
            Ok(stats) => {
                self.metrics.record_range_deletion();
                tracing::info!(
                    shard = self.shard,
                    collection,
                    range = %range,
                    deleted = stats.deleted,
                    "Range deletion finished"
                );
            }
            Err(e) => {
                tracing::warn!(shard = self.shard, collection, range = %range, error = %e, "Range deletion failed");
            }
        }
        result
    }

    /// Run every scheduled deletion now.
    pub fn expedite_all(&self) -> usize {
        let scheduled = self.scheduled.lock();
        for deletion in scheduled.values() {
            deletion.expedite.cancel();
        }
        scheduled.len()
    }

    /// Ranges waiting for deletion.
    pub fn pending_deletions(&self) -> Vec<(CollectionId, ChunkRange)> {
        let mut out: Vec<_> = self
            .scheduled
            .lock()
            .values()
            .map(|d| (d.collection.clone(), d.range.clone()))
            .collect();
        out.sort_by(|a, b| (&a.0, &a.1.min).cmp(&(&b.0, &b.1.min)));
        out
    }

    /// Start the periodic sweep over every local collection, if configured.
    pub fn start(self: &Arc<Self>) {
        let Some(interval) = self.config.sweep_interval else {
            return;
        };
        let service = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for collection in service.store.collections() {
                            if let Err(e) = service.cleanup_orphans(&collection, None).await {
                                tracing::warn!(shard = service.shard, collection = %collection, error = %e, "Orphan sweep failed");
                            }
                        }
                    }
                    _ = service.shutdown.cancelled() => {
                        tracing::debug!(shard = service.shard, "Orphan sweep stopped");
                        break;
                    }
                }
            }
        });
        *self.sweeper.lock() = Some(handle);
    }

    /// Stop the sweep and drop scheduled deletions.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
