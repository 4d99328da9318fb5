//! Stateless request router.
//!
//! The router caches one routing table per collection and sends each keyed
//! request to the shard it believes owns the key, together with the shard
//! version it believes that shard is at. A `StaleShardVersion` reply means
//! the table is out of date: the router refreshes it from the metadata store
//! and retries.
//!
//! ```text
//!   get/insert/update/delete ──► table.owner_of(key) ──► shard.read/write(version)
//!                                      ▲                        │
//!                                      └──── refresh ◄── StaleShardVersion
//! ```

use crate::cleanup::CleanupStats;
use crate::config::RouterConfig;
use crate::error::{Error, Result};
use crate::metadata::{ChunkRange, CollectionMetadata, CollectionVersion, MetadataStore};
use crate::ownership::RangeOwnershipReport;
use crate::shard::ShardService;
use crate::types::{CollectionId, Document, ShardId, ShardKey, WriteOp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Routes client operations to the believed owner of each key.
#[derive(Debug)]
pub struct Router {
    config: RouterConfig,
    metadata: Arc<dyn MetadataStore>,
    shards: RwLock<HashMap<ShardId, Arc<dyn ShardService>>>,
    tables: RwLock<HashMap<CollectionId, Arc<CollectionMetadata>>>,
}

impl Router {
    pub fn new(config: RouterConfig, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            config,
            metadata,
            shards: RwLock::new(HashMap::new()),
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Make a shard reachable through this router.
    pub fn add_shard(&self, shard: Arc<dyn ShardService>) {
        let id = shard.shard_id();
        self.shards.write().insert(id, shard);
        tracing::debug!(shard = id, "Router registered shard");
    }

    fn shard(&self, id: ShardId) -> Result<Arc<dyn ShardService>> {
        self.shards
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::ShardNotFound(id))
    }

    /// Reload the routing table of `collection`.
    pub async fn refresh(&self, collection: &str) -> Result<Arc<CollectionMetadata>> {
        let meta = Arc::new(self.metadata.read_chunks(collection).await?);
        let mut tables = self.tables.write();
        // A concurrent refresh may already have installed something newer.
        if let Some(current) = tables.get(collection) {
            if current.epoch == meta.epoch && meta.version().is_older_than(&current.version()) {
                return Ok(current.clone());
            }
        }
        tracing::debug!(collection, version = %meta.version(), "Router table refreshed");
        tables.insert(collection.to_string(), meta.clone());
        Ok(meta)
    }

    /// Cached routing table, loaded on first use.
    pub async fn table(&self, collection: &str) -> Result<Arc<CollectionMetadata>> {
        let cached = self.tables.read().get(collection).cloned();
        match cached {
            Some(table) => Ok(table),
            None => self.refresh(collection).await,
        }
    }

    /// Believed owner of `key` and that shard's version.
    pub async fn route(&self, collection: &str, key: &ShardKey) -> Result<(ShardId, CollectionVersion)> {
        let table = self.table(collection).await?;
        let owner = table
            .owner_of(key)
            .ok_or_else(|| Error::Internal(format!("no chunk of {} covers {}", collection, key)))?;
        Ok((owner, table.shard_version(owner)))
    }

    /// Run `op` against the owner of `key`, refreshing and retrying while the
    /// shard reports the table as stale.
    async fn with_routing<T, F, Fut>(&self, collection: &str, key: &ShardKey, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ShardService>, CollectionVersion) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let (owner, version) = self.route(collection, key).await?;
            let shard = self.shard(owner)?;
            match op(shard, version).await {
                Err(Error::StaleShardVersion { wanted, .. }) if attempt < self.config.max_stale_retries => {
                    attempt += 1;
                    tracing::debug!(
                        collection,
                        key = %key,
                        shard = owner,
                        sent = %version,
                        wanted = ?wanted,
                        attempt,
                        "Stale routing table, refreshing"
                    );
                    self.refresh(collection).await?;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Read one document.
    pub async fn get(&self, collection: &str, key: impl Into<ShardKey>) -> Result<Option<Document>> {
        let key = key.into();
        self.with_routing(collection, &key, |shard, version| {
            let key = key.clone();
            async move { shard.read(collection, &key, Some(version)).await }
        })
        .await
    }

    /// Apply one write. Returns whether the key existed before.
    pub async fn write(&self, collection: &str, op: WriteOp) -> Result<bool> {
        let key = op.key().clone();
        self.with_routing(collection, &key, |shard, version| {
            let op = op.clone();
            async move { shard.write(collection, op, Some(version)).await }
        })
        .await
    }

    pub async fn insert(&self, collection: &str, doc: Document) -> Result<bool> {
        self.write(collection, WriteOp::Insert(doc)).await
    }

    pub async fn update(&self, collection: &str, doc: Document) -> Result<bool> {
        self.write(collection, WriteOp::Update(doc)).await
    }

    pub async fn delete(&self, collection: &str, key: impl Into<ShardKey>) -> Result<bool> {
        self.write(collection, WriteOp::Delete(key.into())).await
    }

    /// Scatter a count to every shard holding chunks. Each shard counts only
    /// documents it owns, so orphans and pending clones are never included.
    /// Every shard checks the version it was sent, so all partial counts come
    /// from one routing table.
    pub async fn count(&self, collection: &str) -> Result<u64> {
        let mut attempt = 0;
        loop {
            let table = self.table(collection).await?;
            match self.scatter_count(collection, &table).await {
                Err(Error::StaleShardVersion { .. }) if attempt < self.config.max_stale_retries => {
                    attempt += 1;
                    tracing::debug!(collection, attempt, "Stale routing table during count, refreshing");
                    self.refresh(collection).await?;
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn scatter_count(&self, collection: &str, table: &CollectionMetadata) -> Result<u64> {
        let mut total = 0;
        for id in table.shards() {
            total += self
                .shard(id)?
                .count_owned(collection, Some(table.shard_version(id)))
                .await?;
        }
        Ok(total)
    }

    /// Move `range` to shard `to`. The donor is whichever shard owns
    /// `range.min` in a freshly loaded table.
    #[tracing::instrument(skip(self), fields(range = %range))]
    pub async fn move_range(&self, collection: &str, range: ChunkRange, to: ShardId) -> Result<CollectionVersion> {
        let table = self.refresh(collection).await?;
        let donor = table
            .owner_of(&range.min)
            .ok_or_else(|| Error::InvalidRange(format!("no chunk of {} covers {}", collection, range.min)))?;
        self.shard(to)?;
        let result = self.shard(donor)?.move_range(collection, range, to).await;
        // Either way the table may have moved.
        if let Err(e) = self.refresh(collection).await {
            tracing::warn!(collection, error = %e, "Router refresh after move failed");
        }
        result
    }

    /// Delete orphans on `shard`, optionally limited to `bounds`.
    pub async fn cleanup_orphans(
        &self,
        collection: &str,
        shard: ShardId,
        bounds: Option<ChunkRange>,
    ) -> Result<CleanupStats> {
        self.shard(shard)?.cleanup_orphans(collection, bounds).await
    }

    /// Ownership view of `shard`.
    pub async fn get_range_ownership(&self, collection: &str, shard: ShardId) -> Result<RangeOwnershipReport> {
        self.shard(shard)?.get_range_ownership(collection).await
    }

    /// Split the chunk containing `key`, retrying once on a version race.
    pub async fn split_chunk(&self, collection: &str, key: impl Into<ShardKey>) -> Result<CollectionVersion> {
        let key = key.into();
        let mut expected = self.table(collection).await?.version();
        for _ in 0..=self.config.max_stale_retries {
            match self.metadata.split_chunk(collection, &key, expected).await {
                Err(Error::VersionMismatch { actual, .. }) => expected = actual,
                Ok(version) => {
                    self.refresh(collection).await?;
                    return Ok(version);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::VersionMismatch {
            expected,
            actual: self.refresh(collection).await?.version(),
        })
    }
}
