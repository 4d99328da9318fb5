//! Chunk ranges, versions and per-collection routing metadata.

use crate::error::{Error, Result};
use crate::types::{ShardId, ShardKey};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Half-open key range `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    /// Inclusive lower bound.
    pub min: ShardKey,
    /// Exclusive upper bound.
    pub max: ShardKey,
}

impl ChunkRange {
    /// Create a range, rejecting empty or inverted bounds.
    pub fn new(min: impl Into<ShardKey>, max: impl Into<ShardKey>) -> Result<Self> {
        let (min, max) = (min.into(), max.into());
        if min >= max {
            return Err(Error::InvalidRange(format!(
                "min {} must be below max {}",
                min, max
            )));
        }
        if min == ShardKey::Max || max == ShardKey::Min {
            return Err(Error::InvalidRange("sentinel used on the wrong side".into()));
        }
        Ok(Self { min, max })
    }

    /// The whole key space, `[MinKey, MaxKey)`.
    pub fn full() -> Self {
        Self {
            min: ShardKey::Min,
            max: ShardKey::Max,
        }
    }

    /// Check if a key falls inside this range.
    pub fn contains(&self, key: &ShardKey) -> bool {
        *key >= self.min && *key < self.max
    }

    /// Check if another range lies entirely inside this one.
    pub fn contains_range(&self, other: &ChunkRange) -> bool {
        other.min >= self.min && other.max <= self.max
    }

    /// Check if two ranges share at least one key.
    pub fn overlaps(&self, other: &ChunkRange) -> bool {
        self.min < other.max && other.min < self.max
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Version of a collection's chunk layout (also used as a chunk's `lastmod`).
///
/// Versions from different epochs are incomparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionVersion {
    /// Changes only when the collection is dropped and resharded.
    pub epoch: Uuid,
    /// Bumped by every committed migration.
    pub major: u32,
    /// Bumped by splits that do not move ownership.
    pub minor: u32,
}

impl CollectionVersion {
    /// Create a version.
    pub fn new(epoch: Uuid, major: u32, minor: u32) -> Self {
        Self { epoch, major, minor }
    }

    /// First version of a freshly sharded collection.
    pub fn initial(epoch: Uuid) -> Self {
        Self::new(epoch, 1, 0)
    }

    /// Version reported by a shard that owns no chunk of the collection.
    pub fn unowned(epoch: Uuid) -> Self {
        Self::new(epoch, 0, 0)
    }

    /// Check if both versions belong to the same epoch.
    pub fn is_same_epoch(&self, other: &CollectionVersion) -> bool {
        self.epoch == other.epoch
    }

    /// Compare within an epoch. Returns `None` across epochs.
    pub fn cmp_within_epoch(&self, other: &CollectionVersion) -> Option<Ordering> {
        if !self.is_same_epoch(other) {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }

    /// Check if this version is strictly older than `other` in the same epoch.
    pub fn is_older_than(&self, other: &CollectionVersion) -> bool {
        self.cmp_within_epoch(other) == Some(Ordering::Less)
    }
}

impl fmt::Display for CollectionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let epoch = self.epoch.simple().to_string();
        write!(f, "{}|{}||{}", self.major, self.minor, &epoch[..8])
    }
}

/// A contiguous key range assigned to one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Keys covered by this chunk.
    pub range: ChunkRange,
    /// Shard that owns the range.
    pub owner: ShardId,
    /// Version at which this chunk was last modified.
    pub lastmod: CollectionVersion,
}

/// The full chunk layout of one collection, as read from the metadata store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    /// Collection name.
    pub collection: String,
    /// Current epoch.
    pub epoch: Uuid,
    /// Chunks sorted by `range.min`.
    pub chunks: Vec<Chunk>,
}

impl CollectionMetadata {
    /// Collection version: the highest `lastmod` of any chunk.
    pub fn version(&self) -> CollectionVersion {
        self.chunks
            .iter()
            .map(|c| c.lastmod)
            .max_by_key(|v| (v.major, v.minor))
            .unwrap_or_else(|| CollectionVersion::unowned(self.epoch))
    }

    /// Shard version: the highest `lastmod` among the chunks a shard owns.
    pub fn shard_version(&self, shard: ShardId) -> CollectionVersion {
        self.chunks
            .iter()
            .filter(|c| c.owner == shard)
            .map(|c| c.lastmod)
            .max_by_key(|v| (v.major, v.minor))
            .unwrap_or_else(|| CollectionVersion::unowned(self.epoch))
    }

    /// Index of the chunk containing `key`.
    pub fn chunk_index(&self, key: &ShardKey) -> Option<usize> {
        let idx = self.chunks.partition_point(|c| c.range.max <= *key);
        self.chunks
            .get(idx)
            .filter(|c| c.range.contains(key))
            .map(|_| idx)
    }

    /// Chunk containing `key`.
    pub fn chunk_for(&self, key: &ShardKey) -> Option<&Chunk> {
        self.chunk_index(key).map(|i| &self.chunks[i])
    }

    /// Shard owning `key`.
    pub fn owner_of(&self, key: &ShardKey) -> Option<ShardId> {
        self.chunk_for(key).map(|c| c.owner)
    }

    /// Ranges owned by a shard, in key order.
    pub fn ranges_for(&self, shard: ShardId) -> Vec<ChunkRange> {
        self.chunks
            .iter()
            .filter(|c| c.owner == shard)
            .map(|c| c.range.clone())
            .collect()
    }

    /// Distinct shards owning at least one chunk.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.chunks.iter().map(|c| c.owner).collect();
        shards.sort_unstable();
        shards.dedup();
        shards
    }

    /// Check that chunks cover the whole key space without overlap or gaps.
    pub fn validate(&self) -> Result<()> {
        let first = self
            .chunks
            .first()
            .ok_or_else(|| Error::InvalidRange(format!("{} has no chunks", self.collection)))?;
        if first.range.min != ShardKey::Min {
            return Err(Error::InvalidRange(format!(
                "first chunk of {} starts at {}",
                self.collection, first.range.min
            )));
        }
        for pair in self.chunks.windows(2) {
            if pair[0].range.max != pair[1].range.min {
                return Err(Error::InvalidRange(format!(
                    "chunks {} and {} of {} are not contiguous",
                    pair[0].range, pair[1].range, self.collection
                )));
            }
        }
        for chunk in &self.chunks {
            if chunk.lastmod.epoch != self.epoch {
                return Err(Error::InvalidRange(format!(
                    "chunk {} carries a foreign epoch",
                    chunk.range
                )));
            }
        }
        match self.chunks.last() {
            Some(last) if last.range.max == ShardKey::Max => Ok(()),
            _ => Err(Error::InvalidRange(format!(
                "last chunk of {} does not end at MaxKey",
                self.collection
            ))),
        }
    }
}
