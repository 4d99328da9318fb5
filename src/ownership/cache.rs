//! Per-shard range ownership cache.

use super::snapshot::{OwnershipSnapshot, RangeStatus};
use crate::error::{Error, Result};
use crate::metadata::{ChunkRange, CollectionVersion, MetadataStore};
use crate::types::{CollectionId, ShardId, ShardKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Result of `getRangeOwnership`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeOwnershipReport {
    /// Shard reporting.
    pub shard: ShardId,
    /// Collection version of the cached snapshot.
    pub version: CollectionVersion,
    /// This shard's version.
    pub shard_version: CollectionVersion,
    /// Owned ranges.
    pub owned_ranges: Vec<ChunkRange>,
    /// Ranges currently being received.
    pub pending_ranges: Vec<ChunkRange>,
}

/// Serializes store reads for one collection.
///
/// `started` counts refreshes that began reading the store. A caller that
/// finds a successful refresh which started after it arrived reuses that
/// result instead of issuing its own read.
#[derive(Debug, Default)]
struct RefreshGate {
    started: AtomicU64,
    last_ok: tokio::sync::Mutex<Option<u64>>,
}

/// Cached, refreshable ownership snapshots for one shard.
#[derive(Debug)]
pub struct RangeOwnershipCache {
    shard: ShardId,
    store: Arc<dyn MetadataStore>,
    snapshots: RwLock<HashMap<CollectionId, Arc<OwnershipSnapshot>>>,
    gates: Mutex<HashMap<CollectionId, Arc<RefreshGate>>>,
}

impl RangeOwnershipCache {
    /// Create an empty cache for `shard`.
    pub fn new(shard: ShardId, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            shard,
            store,
            snapshots: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Shard this cache belongs to.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Current snapshot, if the collection was ever refreshed.
    pub fn snapshot(&self, collection: &str) -> Option<Arc<OwnershipSnapshot>> {
        self.snapshots.read().get(collection).cloned()
    }

    /// Owned or pending.
    pub fn owns(&self, collection: &str, key: &ShardKey) -> bool {
        self.status(collection, key) != RangeStatus::Unowned
    }

    /// Classify a key against the current snapshot.
    pub fn status(&self, collection: &str, key: &ShardKey) -> RangeStatus {
        self.snapshot(collection)
            .map(|s| s.status(key))
            .unwrap_or(RangeStatus::Unowned)
    }

    /// Cached shard version, if known.
    pub fn shard_version(&self, collection: &str) -> Option<CollectionVersion> {
        self.snapshot(collection).map(|s| s.shard_version())
    }

    /// Re-read the metadata store and swap in a new snapshot.
    ///
    /// Concurrent callers share one in-flight store read.
    pub async fn refresh(&self, collection: &str) -> Result<CollectionVersion> {
        let gate = self.gate(collection);
        let arrival = gate.started.load(Ordering::SeqCst);
        let mut last_ok = gate.last_ok.lock().await;

        if let Some(ticket) = *last_ok {
            if ticket > arrival {
                if let Some(snapshot) = self.snapshot(collection) {
                    return Ok(snapshot.collection_version());
                }
            }
        }

        let ticket = gate.started.fetch_add(1, Ordering::SeqCst) + 1;
        let meta = self.store.read_chunks(collection).await?;
        let version = self.install(&meta);
        *last_ok = Some(ticket);
        Ok(version)
    }

    /// Refresh only if `wanted` is newer than the cached collection version
    /// or comes from another epoch.
    pub async fn refresh_if_behind(
        &self,
        collection: &str,
        wanted: &CollectionVersion,
    ) -> Result<CollectionVersion> {
        match self.snapshot(collection) {
            Some(snap)
                if snap.collection_version().is_same_epoch(wanted)
                    && !snap.collection_version().is_older_than(wanted) =>
            {
                Ok(snap.collection_version())
            }
            _ => self.refresh(collection).await,
        }
    }

    fn gate(&self, collection: &str) -> Arc<RefreshGate> {
        self.gates
            .lock()
            .entry(collection.to_string())
            .or_default()
            .clone()
    }

    fn install(&self, meta: &crate::metadata::CollectionMetadata) -> CollectionVersion {
        let mut snapshots = self.snapshots.write();
        let current = snapshots.get(&meta.collection).cloned();

        let pending = match &current {
            Some(cur) if cur.collection_version().epoch == meta.epoch => {
                if meta.version().is_older_than(&cur.collection_version()) {
                    return cur.collection_version();
                }
                cur.pending_ranges().to_vec()
            }
            Some(cur) => {
                if !cur.pending_ranges().is_empty() {
                    tracing::warn!(
                        collection = %meta.collection,
                        shard = self.shard,
                        dropped = cur.pending_ranges().len(),
                        "Epoch changed, discarding pending ranges"
                    );
                }
                Vec::new()
            }
            None => Vec::new(),
        };

        let next = OwnershipSnapshot::from_metadata(self.shard, meta, pending);
        let version = next.collection_version();
        if current.as_deref() != Some(&next) {
            tracing::debug!(
                collection = %meta.collection,
                shard = self.shard,
                version = %version,
                shard_version = %next.shard_version(),
                pending = next.pending_ranges().len(),
                "Installed ownership snapshot"
            );
        }
        snapshots.insert(meta.collection.clone(), Arc::new(next));
        version
    }

    /// Register a range being received.
    pub fn add_pending(&self, collection: &str, range: ChunkRange) -> Result<()> {
        let mut snapshots = self.snapshots.write();
        let current = snapshots
            .get(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        let next = current.with_pending(range.clone())?;
        snapshots.insert(collection.to_string(), Arc::new(next));
        tracing::debug!(collection, shard = self.shard, range = %range, "Registered pending range");
        Ok(())
    }

    /// Drop a pending range. Returns whether it was registered.
    pub fn forget_pending(&self, collection: &str, range: &ChunkRange) -> bool {
        let mut snapshots = self.snapshots.write();
        let Some(current) = snapshots.get(collection) else {
            return false;
        };
        if !current.pending_ranges().contains(range) {
            return false;
        }
        let next = current.without_pending(range);
        snapshots.insert(collection.to_string(), Arc::new(next));
        tracing::debug!(collection, shard = self.shard, range = %range, "Forgot pending range");
        true
    }

    /// Pending ranges of a collection.
    pub fn pending_ranges(&self, collection: &str) -> Vec<ChunkRange> {
        self.snapshot(collection)
            .map(|s| s.pending_ranges().to_vec())
            .unwrap_or_default()
    }

    /// Next range at or after `from` that is neither owned nor pending.
    pub fn next_orphan_range(&self, collection: &str, from: &ShardKey) -> Option<ChunkRange> {
        self.snapshot(collection)
            .and_then(|s| s.next_orphan_range(from))
    }

    /// Ownership report for the router.
    pub fn report(&self, collection: &str) -> Result<RangeOwnershipReport> {
        let snap = self
            .snapshot(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        Ok(RangeOwnershipReport {
            shard: self.shard,
            version: snap.collection_version(),
            shard_version: snap.shard_version(),
            owned_ranges: snap.owned_ranges().to_vec(),
            pending_ranges: snap.pending_ranges().to_vec(),
        })
    }

    /// Forget owned ranges until the next successful refresh.
    ///
    /// Used when a refresh after a metadata write failed and the cached view
    /// is known to be wrong. Pending ranges survive.
    pub fn invalidate(&self, collection: &str) {
        let mut snapshots = self.snapshots.write();
        if let Some(current) = snapshots.get(collection) {
            let next = current.invalidated();
            snapshots.insert(collection.to_string(), Arc::new(next));
            tracing::info!(collection, shard = self.shard, "Invalidated ownership snapshot");
        }
    }

    /// Collections with a cached snapshot.
    pub fn collections(&self) -> Vec<CollectionId> {
        self.snapshots.read().keys().cloned().collect()
    }
}
