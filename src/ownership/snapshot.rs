//! Immutable ownership view of one collection on one shard.

use crate::error::{Error, Result};
use crate::metadata::{ChunkRange, CollectionMetadata, CollectionVersion};
use crate::types::{CollectionId, ShardId, ShardKey};
use serde::{Deserialize, Serialize};

/// Classification of a key against an ownership snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeStatus {
    /// Neither owned nor being received. Local documents here are orphans.
    Unowned,
    /// Being received by an in-flight migration. Not served, not deleted.
    Pending,
    /// Owned according to the last refresh.
    Owned,
}

/// Snapshot of the ranges a shard owns or is receiving for one collection.
///
/// Snapshots are never mutated in place; every change builds a new one that
/// is swapped in atomically, so readers finish against the view they started
/// with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipSnapshot {
    collection: CollectionId,
    shard: ShardId,
    collection_version: CollectionVersion,
    shard_version: CollectionVersion,
    owned: Vec<ChunkRange>,
    pending: Vec<ChunkRange>,
    /// Set on views that stand in for a failed refresh.
    invalidated: bool,
}

impl OwnershipSnapshot {
    /// Project store metadata onto `shard`, carrying over pending ranges.
    ///
    /// Pending ranges now fully covered by owned chunks are dropped: they
    /// were promoted by a committed migration.
    pub fn from_metadata(shard: ShardId, meta: &CollectionMetadata, pending: Vec<ChunkRange>) -> Self {
        let owned = meta.ranges_for(shard);
        let pending = pending
            .into_iter()
            .filter(|p| !covered_by(&owned, p))
            .collect();
        Self {
            collection: meta.collection.clone(),
            shard,
            collection_version: meta.version(),
            shard_version: meta.shard_version(shard),
            owned,
            pending,
            invalidated: false,
        }
    }

    /// Collection name.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Shard this view belongs to.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Collection version at the time of the refresh.
    pub fn collection_version(&self) -> CollectionVersion {
        self.collection_version
    }

    /// Highest chunk version owned by this shard.
    pub fn shard_version(&self) -> CollectionVersion {
        self.shard_version
    }

    /// Owned ranges in key order.
    pub fn owned_ranges(&self) -> &[ChunkRange] {
        &self.owned
    }

    /// Pending ranges in key order.
    pub fn pending_ranges(&self) -> &[ChunkRange] {
        &self.pending
    }

    /// Classify a key.
    pub fn status(&self, key: &ShardKey) -> RangeStatus {
        if self.owned.iter().any(|r| r.contains(key)) {
            RangeStatus::Owned
        } else if self.pending.iter().any(|r| r.contains(key)) {
            RangeStatus::Pending
        } else {
            RangeStatus::Unowned
        }
    }

    /// Owned or pending. Documents for which this is false are orphans.
    pub fn owns(&self, key: &ShardKey) -> bool {
        self.status(key) != RangeStatus::Unowned
    }

    /// Check if this view replaced one known to be wrong and awaits a refresh.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Check if a local document at `key` may be deleted as an orphan.
    /// An invalidated view never answers yes.
    pub fn is_orphan(&self, key: &ShardKey) -> bool {
        !self.invalidated && !self.owns(key)
    }

    /// Check if every key of `range` is in an owned chunk.
    pub fn owns_range(&self, range: &ChunkRange) -> bool {
        covered_by(&self.owned, range)
    }

    /// New snapshot with `range` registered as pending.
    pub fn with_pending(&self, range: ChunkRange) -> Result<Self> {
        if let Some(existing) = self.pending.iter().find(|p| p.overlaps(&range)) {
            tracing::debug!(range = %range, existing = %existing, "Pending range overlap");
            return Err(Error::MigrationAlreadyInProgress {
                collection: self.collection.clone(),
                range,
            });
        }
        if let Some(owned) = self.owned.iter().find(|o| o.overlaps(&range)) {
            return Err(Error::InvalidRange(format!(
                "{} overlaps owned chunk {} on shard {}",
                range, owned, self.shard
            )));
        }
        let mut next = self.clone();
        let pos = next.pending.partition_point(|p| p.min < range.min);
        next.pending.insert(pos, range);
        Ok(next)
    }

    /// New snapshot that owns nothing and sorts before every real version of
    /// the epoch, keeping pending ranges. Any refresh replaces it. Cleanup
    /// treats it as unusable and deletes nothing through it.
    pub fn invalidated(&self) -> Self {
        let unowned = CollectionVersion::unowned(self.collection_version.epoch);
        Self {
            collection: self.collection.clone(),
            shard: self.shard,
            collection_version: unowned,
            shard_version: unowned,
            owned: Vec::new(),
            pending: self.pending.clone(),
            invalidated: true,
        }
    }

    /// New snapshot without `range` in the pending list.
    pub fn without_pending(&self, range: &ChunkRange) -> Self {
        let mut next = self.clone();
        next.pending.retain(|p| p != range);
        next
    }

    /// Next gap in owned and pending coverage at or after `from`.
    pub fn next_orphan_range(&self, from: &ShardKey) -> Option<ChunkRange> {
        if self.invalidated {
            return None;
        }
        let mut covered: Vec<&ChunkRange> = self.owned.iter().chain(self.pending.iter()).collect();
        covered.sort_by(|a, b| a.min.cmp(&b.min));

        let mut cursor = from.clone();
        for range in covered {
            if range.max <= cursor {
                continue;
            }
            if range.min > cursor {
                return Some(ChunkRange {
                    min: cursor,
                    max: range.min.clone(),
                });
            }
            cursor = range.max.clone();
        }
        if cursor < ShardKey::Max {
            Some(ChunkRange {
                min: cursor,
                max: ShardKey::Max,
            })
        } else {
            None
        }
    }
}

/// Check if the union of sorted, non-overlapping `ranges` covers `target`.
fn covered_by(ranges: &[ChunkRange], target: &ChunkRange) -> bool {
    let mut cursor = &target.min;
    for range in ranges {
        if range.max <= *cursor {
            continue;
        }
        if range.min > *cursor {
            return false;
        }
        cursor = &range.max;
        if *cursor >= target.max {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::Chunk;
    use uuid::Uuid;

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(min, max).unwrap()
    }

    fn meta(layout: Vec<(ChunkRange, ShardId)>) -> CollectionMetadata {
        let epoch = Uuid::new_v4();
        CollectionMetadata {
            collection: "db.users".into(),
            epoch,
            chunks: layout
                .into_iter()
                .enumerate()
                .map(|(i, (range, owner))| Chunk {
                    range,
                    owner,
                    lastmod: CollectionVersion::new(epoch, 1, i as u32),
                })
                .collect(),
        }
    }

    fn split_layout() -> CollectionMetadata {
        meta(vec![
            (ChunkRange::new(ShardKey::Min, 0).unwrap(), 1),
            (range(0, 20), 2),
            (range(20, 40), 1),
            (ChunkRange::new(40, ShardKey::Max).unwrap(), 2),
        ])
    }

    #[test]
    fn test_status_classification() {
        let snap = OwnershipSnapshot::from_metadata(1, &split_layout(), vec![]);
        assert_eq!(snap.status(&ShardKey::Int(-1)), RangeStatus::Owned);
        assert_eq!(snap.status(&ShardKey::Int(5)), RangeStatus::Unowned);

        let snap = snap.with_pending(range(0, 10)).unwrap();
        assert_eq!(snap.status(&ShardKey::Int(5)), RangeStatus::Pending);
        assert!(snap.owns(&ShardKey::Int(5)));
        assert!(!snap.owns(&ShardKey::Int(10)));
    }

    #[test]
    fn test_pending_overlap_rejected() {
        let snap = OwnershipSnapshot::from_metadata(1, &split_layout(), vec![range(0, 10)]);
        assert!(matches!(
            snap.with_pending(range(5, 15)),
            Err(Error::MigrationAlreadyInProgress { .. })
        ));
        assert!(matches!(
            snap.with_pending(range(15, 25)),
            Err(Error::InvalidRange(_))
        ));
        let cleared = snap.without_pending(&range(0, 10));
        assert!(cleared.pending_ranges().is_empty());
    }

    #[test]
    fn test_pending_promoted_when_owned() {
        let committed = meta(vec![
            (ChunkRange::new(ShardKey::Min, 0).unwrap(), 1),
            (range(0, 20), 1),
            (ChunkRange::new(20, ShardKey::Max).unwrap(), 2),
        ]);
        let snap = OwnershipSnapshot::from_metadata(1, &committed, vec![range(0, 20), range(30, 35)]);
        assert_eq!(snap.pending_ranges(), &[range(30, 35)]);
        assert!(snap.owns_range(&ChunkRange::new(ShardKey::Min, 20).unwrap()));
        assert!(!snap.owns_range(&range(10, 30)));
    }

    #[test]
    fn test_next_orphan_range() {
        let snap = OwnershipSnapshot::from_metadata(1, &split_layout(), vec![range(0, 5)]);

        assert_eq!(snap.next_orphan_range(&ShardKey::Min), Some(range(5, 20)));
        assert_eq!(snap.next_orphan_range(&ShardKey::Int(25)), Some(ChunkRange::new(40, ShardKey::Max).unwrap()));
        assert_eq!(snap.next_orphan_range(&ShardKey::Int(10)), Some(range(10, 20)));

        let whole = meta(vec![(ChunkRange::full(), 1)]);
        let snap = OwnershipSnapshot::from_metadata(1, &whole, vec![]);
        assert_eq!(snap.next_orphan_range(&ShardKey::Min), None);
    }

    #[test]
    fn test_invalidated_view_reports_no_orphans() {
        let snap = OwnershipSnapshot::from_metadata(1, &split_layout(), vec![range(0, 5)]);
        assert!(snap.is_orphan(&ShardKey::Int(10)));
        assert!(!snap.is_orphan(&ShardKey::Int(-1)));

        let stale = snap.invalidated();
        assert!(stale.is_invalidated());
        assert_eq!(stale.status(&ShardKey::Int(-1)), RangeStatus::Unowned);
        assert_eq!(stale.status(&ShardKey::Int(3)), RangeStatus::Pending);
        assert!(!stale.is_orphan(&ShardKey::Int(-1)));
        assert!(!stale.is_orphan(&ShardKey::Int(10)));
        assert_eq!(stale.next_orphan_range(&ShardKey::Min), None);
    }
}
