//! Core types used throughout the migration subsystem.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Storage shard identifier in the cluster.
pub type ShardId = u64;

/// Name of a partitioned collection.
pub type CollectionId = String;

/// Value of the shard key of a document.
///
/// Variant order defines the key ordering: `Min` sorts before every value,
/// integers before strings, and `Max` closes the top of the key space.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShardKey {
    /// Lower sentinel, inclusive bound of the first chunk.
    Min,
    /// Integer key.
    Int(i64),
    /// String key.
    Str(String),
    /// Upper sentinel, exclusive bound of the last chunk.
    Max,
}

impl ShardKey {
    /// Check if this key is one of the two sentinels.
    pub fn is_sentinel(&self) -> bool {
        matches!(self, ShardKey::Min | ShardKey::Max)
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Min => write!(f, "MinKey"),
            ShardKey::Int(v) => write!(f, "{}", v),
            ShardKey::Str(s) => write!(f, "{:?}", s),
            ShardKey::Max => write!(f, "MaxKey"),
        }
    }
}

impl From<i64> for ShardKey {
    fn from(v: i64) -> Self {
        ShardKey::Int(v)
    }
}

impl From<&str> for ShardKey {
    fn from(v: &str) -> Self {
        ShardKey::Str(v.to_string())
    }
}

impl From<String> for ShardKey {
    fn from(v: String) -> Self {
        ShardKey::Str(v)
    }
}

/// A stored document, addressed by its shard key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Shard key value.
    pub key: ShardKey,
    /// Opaque document body.
    pub body: Bytes,
}

impl Document {
    /// Create a new document.
    pub fn new(key: impl Into<ShardKey>, body: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
        }
    }

    /// Approximate size in bytes, used for transfer accounting.
    pub fn size(&self) -> usize {
        self.body.len() + std::mem::size_of::<ShardKey>()
    }
}

/// A write applied to a shard, as forwarded to a migration recipient.
///
/// Updates carry the full post-image so replay never depends on the
/// recipient's prior state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Insert a new document.
    Insert(Document),
    /// Replace an existing document.
    Update(Document),
    /// Delete the document with this key.
    Delete(ShardKey),
}

impl WriteOp {
    /// Key touched by this operation.
    pub fn key(&self) -> &ShardKey {
        match self {
            WriteOp::Insert(doc) | WriteOp::Update(doc) => &doc.key,
            WriteOp::Delete(key) => key,
        }
    }

    /// Fold a later operation on the same key into this one.
    ///
    /// The later operation always wins, except that an update following an
    /// insert stays an insert.
    pub fn fold(self, later: WriteOp) -> WriteOp {
        match (self, later) {
            (WriteOp::Insert(_), WriteOp::Update(doc)) => WriteOp::Insert(doc),
            (_, later) => later,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_key_ordering() {
        assert!(ShardKey::Min < ShardKey::Int(i64::MIN));
        assert!(ShardKey::Int(5) < ShardKey::Int(19));
        assert!(ShardKey::Int(i64::MAX) < ShardKey::Str(String::new()));
        assert!(ShardKey::Str("zzz".into()) < ShardKey::Max);
    }

    #[test]
    fn test_write_op_fold() {
        let insert = WriteOp::Insert(Document::new(1, "a"));
        let update = WriteOp::Update(Document::new(1, "b"));
        let delete = WriteOp::Delete(ShardKey::Int(1));

        assert_eq!(
            insert.clone().fold(update.clone()),
            WriteOp::Insert(Document::new(1, "b"))
        );
        assert_eq!(insert.fold(delete.clone()), delete);
        assert_eq!(delete.fold(update.clone()), update);
    }
}
