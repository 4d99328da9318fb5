//! A storage shard: local documents plus the migration and cleanup roles.
//!
//! ```text
//!                 ┌──────────────────── ShardNode ────────────────────┐
//!  Router ──────► │ ShardService: read / write / count / moveRange /  │
//!                 │               cleanupOrphans / getRangeOwnership  │
//!                 │                                                   │
//!  Other shard ─► │ MigrationHandler ─► DonorCoordinator              │
//!                 │                  └► RecipientWorker               │
//!                 │                                                   │
//!                 │ ShardStore ◄── WriteObserver (donor)              │
//!                 │ RangeOwnershipCache ◄── MetadataStore             │
//!                 │ OrphanCleanupService                              │
//!                 └───────────────────────────────────────────────────┘
//! ```
//!
//! Every routed request carries the router's idea of this shard's version.
//! A router that is ahead makes the shard refresh; a router that is behind,
//! or a key that is not owned here, gets `StaleShardVersion`.

use crate::cleanup::{CleanupStats, OrphanCleanupService};
use crate::config::ShardConfig;
use crate::error::{Error, Result};
use crate::lock::{Clock, DistLockManager, LockCatalog};
use crate::metadata::{ChunkRange, CollectionVersion, MetadataStore};
use crate::migration::{
    CloneBatch, DonorCoordinator, MigrationContext, MigrationHandler, MigrationMetrics,
    MigrationSession, RecipientStatus, RecipientWorker, SequencedOp, SessionId, ShardTransport,
};
use crate::ownership::{OwnershipSnapshot, RangeOwnershipCache, RangeOwnershipReport, RangeStatus};
use crate::storage::{ShardStore, WriteObserver, WriteOutcome};
use crate::types::{Document, ShardId, ShardKey, WriteOp};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Operations the router invokes on a shard.
#[async_trait::async_trait]
pub trait ShardService: Send + Sync + std::fmt::Debug {
    /// Shard id.
    fn shard_id(&self) -> ShardId;

    /// Read one document.
    async fn read(
        &self,
        collection: &str,
        key: &ShardKey,
        version: Option<CollectionVersion>,
    ) -> Result<Option<Document>>;

    /// Apply one write. Returns whether the key existed before.
    async fn write(&self, collection: &str, op: WriteOp, version: Option<CollectionVersion>) -> Result<bool>;

    /// Count documents this shard owns.
    async fn count_owned(&self, collection: &str, version: Option<CollectionVersion>) -> Result<u64>;

    /// Move `range` from this shard to `to`.
    async fn move_range(&self, collection: &str, range: ChunkRange, to: ShardId) -> Result<CollectionVersion>;

    /// Delete local orphans.
    async fn cleanup_orphans(&self, collection: &str, bounds: Option<ChunkRange>) -> Result<CleanupStats>;

    /// Report owned and pending ranges.
    async fn get_range_ownership(&self, collection: &str) -> Result<RangeOwnershipReport>;
}

/// One shard process.
#[derive(Debug)]
pub struct ShardNode {
    config: ShardConfig,
    store: Arc<ShardStore>,
    cache: Arc<RangeOwnershipCache>,
    donor: Arc<DonorCoordinator>,
    recipient: Arc<RecipientWorker>,
    cleanup: Arc<OrphanCleanupService>,
    metrics: Arc<MigrationMetrics>,
    shutdown: CancellationToken,
}

impl ShardNode {
    /// Build a shard and wire the donor in as the store's write observer.
    pub async fn new(
        config: ShardConfig,
        metadata: Arc<dyn MetadataStore>,
        catalog: Arc<dyn LockCatalog>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn ShardTransport>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let shard = config.shard_id;
        let shutdown = CancellationToken::new();

        let store = Arc::new(ShardStore::new(shard));
        let cache = Arc::new(RangeOwnershipCache::new(shard, metadata.clone()));
        let cleanup = Arc::new(
            OrphanCleanupService::new(
                shard,
                config.cleanup.clone(),
                store.clone(),
                cache.clone(),
                shutdown.child_token(),
            )
            .await?,
        );
        let locks = Arc::new(DistLockManager::new(
            format!("shard-{}", shard),
            clock,
            catalog,
            config.lock.clone(),
        ));
        let metrics = Arc::new(MigrationMetrics::new());
        let ctx = MigrationContext {
            shard,
            config: config.migration.clone(),
            store: store.clone(),
            cache: cache.clone(),
            metadata,
            transport,
            cleanup: cleanup.clone(),
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
        };

        let donor = Arc::new(DonorCoordinator::new(ctx.clone(), locks));
        let observer: Arc<dyn WriteObserver> = donor.clone();
        store.set_observer(Arc::downgrade(&observer));
        let recipient = Arc::new(RecipientWorker::new(ctx));

        tracing::info!(shard, "Shard node created");
        Ok(Arc::new(Self {
            config,
            store,
            cache,
            donor,
            recipient,
            cleanup,
            metrics,
            shutdown,
        }))
    }

    pub fn id(&self) -> ShardId {
        self.config.shard_id
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<RangeOwnershipCache> {
        &self.cache
    }

    pub fn donor(&self) -> &Arc<DonorCoordinator> {
        &self.donor
    }

    pub fn recipient(&self) -> &Arc<RecipientWorker> {
        &self.recipient
    }

    pub fn cleanup(&self) -> &Arc<OrphanCleanupService> {
        &self.cleanup
    }

    pub fn metrics(&self) -> &MigrationMetrics {
        &self.metrics
    }

    /// Migration and cleanup metrics in the exposition format.
    pub fn render_metrics(&self) -> String {
        let mut out = self.metrics.render();
        out.push_str(&self.cleanup.metrics().render());
        out
    }

    /// Resume interrupted cleanups and start the background sweep.
    pub async fn start(&self) -> Result<()> {
        let resumed = self.cleanup.resume_interrupted_cleanups().await?;
        if !resumed.is_empty() {
            tracing::info!(shard = self.id(), passes = resumed.len(), "Resumed interrupted cleanups");
        }
        self.cleanup.start();
        Ok(())
    }

    /// Cancel running sessions and background tasks.
    pub async fn shutdown(&self) {
        tracing::info!(shard = self.id(), "Shutting down shard");
        self.shutdown.cancel();
        self.cleanup.shutdown().await;
    }

    /// Snapshot to check a request against, refreshed first if the router
    /// knows a newer version than the cache.
    async fn prepare(
        &self,
        collection: &str,
        received: Option<CollectionVersion>,
    ) -> Result<Arc<OwnershipSnapshot>> {
        let cached = self.cache.snapshot(collection);
        let stale = match (&cached, &received) {
            (None, _) => true,
            (Some(snap), Some(v)) => {
                !snap.shard_version().is_same_epoch(v) || snap.shard_version().is_older_than(v)
            }
            (Some(_), None) => false,
        };
        match cached {
            Some(snap) if !stale => Ok(snap),
            _ => {
                self.cache.refresh(collection).await?;
                self.cache
                    .snapshot(collection)
                    .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
            }
        }
    }

    fn stale(snap: &OwnershipSnapshot, received: Option<CollectionVersion>) -> Error {
        Error::StaleShardVersion {
            collection: snap.collection().to_string(),
            wanted: Some(snap.shard_version()),
            received,
        }
    }

    /// Reject a router that is behind this shard.
    fn check_version(&self, snap: &OwnershipSnapshot, received: Option<CollectionVersion>) -> Result<()> {
        let mine = snap.shard_version();
        if received.is_some_and(|v| !v.is_same_epoch(&mine) || v.is_older_than(&mine)) {
            return Err(Self::stale(snap, received));
        }
        Ok(())
    }

    fn verify(
        &self,
        snap: &OwnershipSnapshot,
        key: &ShardKey,
        received: Option<CollectionVersion>,
    ) -> Result<()> {
        self.check_version(snap, received)?;
        if snap.status(key) != RangeStatus::Owned {
            return Err(Self::stale(snap, received));
        }
        Ok(())
    }

    fn verify_current(
        &self,
        collection: &str,
        key: &ShardKey,
        received: Option<CollectionVersion>,
    ) -> Result<()> {
        match self.cache.snapshot(collection) {
            Some(snap) => self.verify(&snap, key, received),
            None => Err(Error::StaleShardVersion {
                collection: collection.to_string(),
                wanted: None,
                received,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ShardService for ShardNode {
    fn shard_id(&self) -> ShardId {
        self.id()
    }

    async fn read(
        &self,
        collection: &str,
        key: &ShardKey,
        version: Option<CollectionVersion>,
    ) -> Result<Option<Document>> {
        let snap = self.prepare(collection, version).await?;
        self.verify(&snap, key, version)?;
        Ok(self.store.get(collection, key))
    }

    async fn write(&self, collection: &str, op: WriteOp, version: Option<CollectionVersion>) -> Result<bool> {
        let deadline = Instant::now() + self.config.migration.critical_section_timeout;
        let key = op.key().clone();
        loop {
            self.prepare(collection, version).await?;
            let outcome = self
                .store
                .apply(collection, op.clone(), || self.verify_current(collection, &key, version))?;
            let mut released = match outcome {
                WriteOutcome::Applied { existed } => return Ok(existed),
                WriteOutcome::Blocked(rx) => rx,
            };
            tracing::debug!(shard = self.id(), collection, key = %key, "Write waiting on critical section");
            let waited = tokio::time::timeout_at(deadline, released.wait_for(|done| *done))
                .await
                .is_ok();
            if !waited {
                return Err(Error::Timeout(format!(
                    "write to {} held by a migration critical section",
                    key
                )));
            }
        }
    }

    async fn count_owned(&self, collection: &str, version: Option<CollectionVersion>) -> Result<u64> {
        let snap = self.prepare(collection, version).await?;
        self.check_version(&snap, version)?;
        let count = self
            .store
            .count_matching(collection, |k| snap.status(k) == RangeStatus::Owned);
        Ok(count as u64)
    }

    async fn move_range(&self, collection: &str, range: ChunkRange, to: ShardId) -> Result<CollectionVersion> {
        self.donor.move_range(collection, range, to).await
    }

    async fn cleanup_orphans(&self, collection: &str, bounds: Option<ChunkRange>) -> Result<CleanupStats> {
        self.cleanup.cleanup_orphans(collection, bounds).await
    }

    async fn get_range_ownership(&self, collection: &str) -> Result<RangeOwnershipReport> {
        self.cache.refresh(collection).await?;
        self.cache.report(collection)
    }
}

#[async_trait::async_trait]
impl MigrationHandler for ShardNode {
    async fn handle_begin_clone(&self, session: MigrationSession) -> Result<()> {
        self.recipient.begin_clone(session).await
    }

    async fn handle_clone_batch(&self, session: SessionId, limit: usize) -> Result<CloneBatch> {
        self.donor.serve_clone_batch(session, limit)
    }

    async fn handle_push_modifications(&self, session: SessionId, ops: Vec<SequencedOp>) -> Result<u64> {
        self.recipient.push_modifications(session, ops).await
    }

    async fn handle_recipient_status(&self, session: SessionId) -> Result<RecipientStatus> {
        Ok(self.recipient.status(session))
    }

    async fn handle_start_commit(&self, session: SessionId, last_seq: u64) -> Result<()> {
        self.recipient.start_commit(session, last_seq).await
    }

    async fn handle_commit(&self, session: SessionId) -> Result<()> {
        self.recipient.commit(session).await
    }

    async fn handle_abort(&self, session: SessionId) -> Result<()> {
        self.recipient.abort(session).await
    }
}
