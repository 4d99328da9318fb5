//! Metadata store: the authoritative chunk layout per collection.
//!
//! Every write is a compare-and-swap against the collection version the
//! caller last read. A committed move rewrites the chunk list in one step:
//!
//! ```text
//!   before:  [Min, 0) s1 1|0   [0, 40) s1 1|1   [40, Max) s2 1|2
//!   move [0, 20) s1 -> s3, expected 1|2
//!   after:   [Min, 0) s1 1|0   [0, 20) s3 2|0   [20, 40) s1 2|1   [40, Max) s2 1|2
//! ```

use super::chunk::{Chunk, ChunkRange, CollectionMetadata, CollectionVersion};
use crate::error::{Error, Result};
use crate::types::{CollectionId, ShardId, ShardKey};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

/// Durable, versioned record of chunk placement.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    /// Read the current chunk layout of a collection.
    async fn read_chunks(&self, collection: &str) -> Result<CollectionMetadata>;

    /// Reassign `range` from `from` to `to`.
    ///
    /// `range` must lie inside a single chunk owned by `from`; the chunk is
    /// split at the range bounds if needed. Fails with `VersionMismatch` if
    /// the collection version is no longer `expected`.
    async fn commit_chunk_move(
        &self,
        collection: &str,
        range: &ChunkRange,
        from: ShardId,
        to: ShardId,
        expected: CollectionVersion,
    ) -> Result<CollectionVersion>;

    /// Split the chunk containing `split_key` so that a new chunk starts there.
    async fn split_chunk(
        &self,
        collection: &str,
        split_key: &ShardKey,
        expected: CollectionVersion,
    ) -> Result<CollectionVersion>;

    /// Shard a new collection with a single chunk owned by `owner`.
    async fn create_collection(&self, collection: &str, owner: ShardId) -> Result<CollectionVersion>;

    /// Drop the collection's layout and start over under a new epoch.
    async fn reshard_collection(&self, collection: &str, owner: ShardId) -> Result<CollectionVersion>;
}

/// In-memory metadata store.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    collections: RwLock<HashMap<CollectionId, CollectionMetadata>>,
    reads: AtomicU64,
    commits: AtomicU64,
    unavailable: AtomicBool,
    read_delay: parking_lot::Mutex<Option<Duration>>,
}

impl InMemoryMetadataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install an explicit layout, e.g. a collection pre-split across shards.
    pub fn install(
        &self,
        collection: &str,
        layout: Vec<(ChunkRange, ShardId)>,
    ) -> Result<CollectionVersion> {
        let epoch = Uuid::new_v4();
        let chunks = layout
            .into_iter()
            .enumerate()
            .map(|(i, (range, owner))| Chunk {
                range,
                owner,
                lastmod: CollectionVersion::new(epoch, 1, i as u32),
            })
            .collect();
        let meta = CollectionMetadata {
            collection: collection.to_string(),
            epoch,
            chunks,
        };
        meta.validate()?;
        let version = meta.version();
        self.collections.write().insert(collection.to_string(), meta);
        Ok(version)
    }

    /// Make every call fail with a timeout until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every `read_chunks` call, simulating a remote round trip.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        *self.read_delay.lock() = delay;
    }

    /// Number of `read_chunks` calls served.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of successful move commits.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Timeout("metadata store unavailable".into()));
        }
        Ok(())
    }
}

fn check_expected(meta: &CollectionMetadata, expected: CollectionVersion) -> Result<()> {
    let actual = meta.version();
    if actual != expected {
        return Err(Error::VersionMismatch { expected, actual });
    }
    Ok(())
}

#[async_trait::async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn read_chunks(&self, collection: &str) -> Result<CollectionMetadata> {
        self.check_available()?;
        self.reads.fetch_add(1, Ordering::Relaxed);
        let delay = *self.read_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.collections
            .read()
            .get(collection)
            .cloned()
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))
    }

    async fn commit_chunk_move(
        &self,
        collection: &str,
        range: &ChunkRange,
        from: ShardId,
        to: ShardId,
        expected: CollectionVersion,
    ) -> Result<CollectionVersion> {
        self.check_available()?;
        if from == to {
            return Err(Error::InvalidRange(format!(
                "cannot move {} onto its own shard {}",
                range, from
            )));
        }

        let mut collections = self.collections.write();
        let meta = collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        check_expected(meta, expected)?;

        let idx = meta
            .chunk_index(&range.min)
            .filter(|&i| meta.chunks[i].range.contains_range(range))
            .ok_or_else(|| {
                Error::InvalidRange(format!("{} does not fit inside a single chunk", range))
            })?;
        let source = meta.chunks[idx].clone();
        if source.owner != from {
            return Err(Error::RangeNotOwned {
                collection: collection.to_string(),
                range: range.clone(),
                shard: from,
            });
        }

        let major = expected.major + 1;
        let epoch = meta.epoch;
        let mut minor = 0;
        let mut next = || {
            minor += 1;
            CollectionVersion::new(epoch, major, minor)
        };

        let mut pieces = Vec::with_capacity(3);
        if source.range.min < range.min {
            pieces.push(Chunk {
                range: ChunkRange {
                    min: source.range.min.clone(),
                    max: range.min.clone(),
                },
                owner: from,
                lastmod: next(),
            });
        }
        pieces.push(Chunk {
            range: range.clone(),
            owner: to,
            lastmod: CollectionVersion::new(epoch, major, 0),
        });
        if range.max < source.range.max {
            pieces.push(Chunk {
                range: ChunkRange {
                    min: range.max.clone(),
                    max: source.range.max.clone(),
                },
                owner: from,
                lastmod: next(),
            });
        }
        let split = pieces.len() > 1;

        let mut updated = meta.clone();
        updated.chunks.splice(idx..=idx, pieces);

        // Donor keeps other chunks: bump one so its shard version moves too.
        if !split {
            if let Some(control) = updated.chunks.iter_mut().find(|c| c.owner == from) {
                control.lastmod = next();
            }
        }

        updated.validate()?;
        let version = updated.version();
        *meta = updated;
        self.commits.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            collection,
            range = %range,
            from,
            to,
            version = %version,
            "Chunk move committed"
        );
        Ok(version)
    }

    async fn split_chunk(
        &self,
        collection: &str,
        split_key: &ShardKey,
        expected: CollectionVersion,
    ) -> Result<CollectionVersion> {
        self.check_available()?;
        let mut collections = self.collections.write();
        let meta = collections
            .get_mut(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        check_expected(meta, expected)?;

        let idx = meta
            .chunk_index(split_key)
            .ok_or_else(|| Error::InvalidRange(format!("no chunk contains {}", split_key)))?;
        let chunk = meta.chunks[idx].clone();
        if chunk.range.min == *split_key {
            return Err(Error::InvalidRange(format!(
                "{} is already a chunk boundary",
                split_key
            )));
        }

        let left = Chunk {
            range: ChunkRange {
                min: chunk.range.min.clone(),
                max: split_key.clone(),
            },
            owner: chunk.owner,
            lastmod: CollectionVersion::new(meta.epoch, expected.major, expected.minor + 1),
        };
        let right = Chunk {
            range: ChunkRange {
                min: split_key.clone(),
                max: chunk.range.max.clone(),
            },
            owner: chunk.owner,
            lastmod: CollectionVersion::new(meta.epoch, expected.major, expected.minor + 2),
        };
        meta.chunks.splice(idx..=idx, [left, right]);

        let version = meta.version();
        tracing::debug!(collection, split_key = %split_key, version = %version, "Chunk split");
        Ok(version)
    }

    async fn create_collection(&self, collection: &str, owner: ShardId) -> Result<CollectionVersion> {
        self.check_available()?;
        if self.collections.read().contains_key(collection) {
            return Err(Error::Internal(format!("{} is already sharded", collection)));
        }
        self.install(collection, vec![(ChunkRange::full(), owner)])
    }

    async fn reshard_collection(&self, collection: &str, owner: ShardId) -> Result<CollectionVersion> {
        self.check_available()?;
        if !self.collections.read().contains_key(collection) {
            return Err(Error::CollectionNotFound(collection.to_string()));
        }
        let version = self.install(collection, vec![(ChunkRange::full(), owner)])?;
        tracing::info!(collection, version = %version, "Collection resharded");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(min, max).unwrap()
    }

    async fn three_chunks(store: &InMemoryMetadataStore) -> CollectionVersion {
        store
            .install(
                "db.users",
                vec![
                    (ChunkRange::new(ShardKey::Min, 0).unwrap(), 1),
                    (range(0, 40), 1),
                    (ChunkRange::new(40, ShardKey::Max).unwrap(), 2),
                ],
            )
            .unwrap()
    }

    #[tokio::test]
    async fn test_commit_whole_chunk_bumps_major_and_donor() {
        let store = InMemoryMetadataStore::new();
        let v = three_chunks(&store).await;

        let new = store
            .commit_chunk_move("db.users", &range(0, 40), 1, 3, v)
            .await
            .unwrap();
        assert_eq!(new.major, v.major + 1);

        let meta = store.read_chunks("db.users").await.unwrap();
        meta.validate().unwrap();
        assert_eq!(meta.owner_of(&ShardKey::Int(10)), Some(3));
        assert_eq!(meta.shard_version(3).major, 2);
        assert_eq!(meta.shard_version(3).minor, 0);
        // Donor control chunk.
        assert_eq!(meta.shard_version(1).major, 2);
        assert_eq!(meta.shard_version(1).minor, 1);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_sub_range_splits_chunk() {
        let store = InMemoryMetadataStore::new();
        let v = three_chunks(&store).await;

        store
            .commit_chunk_move("db.users", &range(10, 20), 1, 2, v)
            .await
            .unwrap();

        let meta = store.read_chunks("db.users").await.unwrap();
        meta.validate().unwrap();
        assert_eq!(meta.chunks.len(), 5);
        assert_eq!(meta.owner_of(&ShardKey::Int(9)), Some(1));
        assert_eq!(meta.owner_of(&ShardKey::Int(10)), Some(2));
        assert_eq!(meta.owner_of(&ShardKey::Int(20)), Some(1));
    }

    #[tokio::test]
    async fn test_commit_rejects_stale_version() {
        let store = InMemoryMetadataStore::new();
        let v = three_chunks(&store).await;
        store
            .commit_chunk_move("db.users", &range(0, 40), 1, 2, v)
            .await
            .unwrap();

        let err = store
            .commit_chunk_move("db.users", &range(0, 40), 2, 1, v)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_commit_rejects_wrong_owner_and_spanning_range() {
        let store = InMemoryMetadataStore::new();
        let v = three_chunks(&store).await;

        let err = store
            .commit_chunk_move("db.users", &range(0, 40), 2, 3, v)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RangeNotOwned");

        let err = store
            .commit_chunk_move("db.users", &range(30, 50), 1, 3, v)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
    }

    #[tokio::test]
    async fn test_split_bumps_minor_only() {
        let store = InMemoryMetadataStore::new();
        let v = store.create_collection("db.users", 1).await.unwrap();
        assert_eq!((v.major, v.minor), (1, 0));

        let split = store
            .split_chunk("db.users", &ShardKey::Int(100), v)
            .await
            .unwrap();
        assert_eq!((split.major, split.minor), (1, 2));

        let meta = store.read_chunks("db.users").await.unwrap();
        assert_eq!(meta.chunks.len(), 2);
        assert_eq!(meta.shards(), vec![1]);

        let err = store
            .split_chunk("db.users", &ShardKey::Int(100), split)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
    }

    #[tokio::test]
    async fn test_reshard_changes_epoch() {
        let store = InMemoryMetadataStore::new();
        let v = store.create_collection("db.users", 1).await.unwrap();
        let resharded = store.reshard_collection("db.users", 2).await.unwrap();

        assert!(!v.is_same_epoch(&resharded));
        let meta = store.read_chunks("db.users").await.unwrap();
        assert_eq!(meta.owner_of(&ShardKey::Int(0)), Some(2));
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = InMemoryMetadataStore::new();
        store.create_collection("db.users", 1).await.unwrap();
        store.set_unavailable(true);
        assert!(matches!(
            store.read_chunks("db.users").await,
            Err(Error::Timeout(_))
        ));
        store.set_unavailable(false);
        assert!(store.read_chunks("db.users").await.is_ok());
        assert!(matches!(
            store.read_chunks("db.other").await,
            Err(Error::CollectionNotFound(_))
        ));
    }
}
