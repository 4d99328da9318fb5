//! Local document storage for a shard.
//!
//! Documents are kept per collection in key order. User writes go through
//! [`ShardStore::apply`], which runs the caller's ownership check and the
//! registered [`WriteObserver`] under the store's write lock, so the order
//! in which writes hit the store is exactly the order observers see them.
//! Migration and cleanup use the unobserved batch methods.

use crate::error::Result;
use crate::metadata::ChunkRange;
use crate::types::{CollectionId, Document, ShardId, ShardKey, WriteOp};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Weak;
use tokio::sync::watch;

/// Decision of a [`WriteObserver`] about an incoming user write.
#[derive(Debug)]
pub enum Admission {
    /// Apply the write.
    Admit,
    /// The key is frozen; retry once the receiver reports release.
    Wait(watch::Receiver<bool>),
}

/// Hook that sees every user write before it is applied.
pub trait WriteObserver: Send + Sync {
    /// Called under the store's write lock.
    fn admit(&self, collection: &str, op: &WriteOp) -> Admission;
}

/// Result of [`ShardStore::apply`].
#[derive(Debug)]
pub enum WriteOutcome {
    /// The write was applied. `existed` tells whether the key was present.
    Applied { existed: bool },
    /// The write was held back by the observer.
    Blocked(watch::Receiver<bool>),
}

/// Outcome of one [`ShardStore::delete_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBatch {
    /// Documents examined.
    pub scanned: u64,
    /// Documents removed.
    pub deleted: u64,
    /// Last key examined, the resume point for the next batch.
    pub last_key: Option<ShardKey>,
}

type Collection = BTreeMap<ShardKey, Bytes>;

/// In-memory document store of one shard.
pub struct ShardStore {
    shard: ShardId,
    data: RwLock<HashMap<CollectionId, Collection>>,
    observer: RwLock<Option<Weak<dyn WriteObserver>>>,
}

impl std::fmt::Debug for ShardStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("shard", &self.shard)
            .field("collections", &self.data.read().len())
            .finish()
    }
}

/// Bounds for `BTreeMap::range`, or `None` if the cursor is past the range.
fn range_bounds<'a>(
    range: &'a ChunkRange,
    after: Option<&'a ShardKey>,
) -> Option<(Bound<&'a ShardKey>, Bound<&'a ShardKey>)> {
    let lower = match after {
        Some(key) if *key >= range.max => return None,
        Some(key) if *key >= range.min => Bound::Excluded(key),
        _ => Bound::Included(&range.min),
    };
    Some((lower, Bound::Excluded(&range.max)))
}

fn apply_op(docs: &mut Collection, op: WriteOp) -> bool {
    match op {
        WriteOp::Insert(doc) | WriteOp::Update(doc) => docs.insert(doc.key, doc.body).is_some(),
        WriteOp::Delete(key) => docs.remove(&key).is_some(),
    }
}

impl ShardStore {
    /// Create an empty store.
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            data: RwLock::new(HashMap::new()),
            observer: RwLock::new(None),
        }
    }

    /// Shard this store belongs to.
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Register the observer that admits user writes.
    pub fn set_observer(&self, observer: Weak<dyn WriteObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Apply a user write.
    ///
    /// `check` runs first, under the store lock; its error aborts the write.
    /// Inserts and updates are upserts.
    pub fn apply(
        &self,
        collection: &str,
        op: WriteOp,
        check: impl FnOnce() -> Result<()>,
    ) -> Result<WriteOutcome> {
        let mut data = self.data.write();
        check()?;

        let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            if let Admission::Wait(rx) = observer.admit(collection, &op) {
                return Ok(WriteOutcome::Blocked(rx));
            }
        }

        let docs = data.entry(collection.to_string()).or_default();
        let existed = apply_op(docs, op);
        Ok(WriteOutcome::Applied { existed })
    }

    /// Apply operations without notifying the observer.
    pub fn apply_unobserved(&self, collection: &str, ops: Vec<WriteOp>) -> usize {
        let mut data = self.data.write();
        let docs = data.entry(collection.to_string()).or_default();
        let count = ops.len();
        for op in ops {
            apply_op(docs, op);
        }
        count
    }

    /// Insert or replace documents without notifying the observer.
    pub fn upsert_batch(&self, collection: &str, batch: Vec<Document>) -> usize {
        let mut data = self.data.write();
        let docs = data.entry(collection.to_string()).or_default();
        let count = batch.len();
        for doc in batch {
            docs.insert(doc.key, doc.body);
        }
        count
    }

    /// Read one document.
    pub fn get(&self, collection: &str, key: &ShardKey) -> Option<Document> {
        self.data
            .read()
            .get(collection)
            .and_then(|docs| docs.get(key))
            .map(|body| Document {
                key: key.clone(),
                body: body.clone(),
            })
    }

    /// Up to `limit` documents of `range` with keys strictly after `after`.
    pub fn scan(
        &self,
        collection: &str,
        range: &ChunkRange,
        after: Option<&ShardKey>,
        limit: usize,
    ) -> Vec<Document> {
        let data = self.data.read();
        let (Some(docs), Some(bounds)) = (data.get(collection), range_bounds(range, after)) else {
            return Vec::new();
        };
        docs.range(bounds)
            .take(limit)
            .map(|(key, body)| Document {
                key: key.clone(),
                body: body.clone(),
            })
            .collect()
    }

    /// Count documents, optionally restricted to a range.
    pub fn count(&self, collection: &str, range: Option<&ChunkRange>) -> usize {
        let data = self.data.read();
        let Some(docs) = data.get(collection) else {
            return 0;
        };
        match range {
            Some(range) => range_bounds(range, None).map_or(0, |b| docs.range(b).count()),
            None => docs.len(),
        }
    }

    /// Count documents whose key satisfies `pred`.
    pub fn count_matching(&self, collection: &str, pred: impl Fn(&ShardKey) -> bool) -> usize {
        self.data
            .read()
            .get(collection)
            .map(|docs| docs.keys().filter(|k| pred(k)).count())
            .unwrap_or(0)
    }

    /// Examine up to `limit` documents of `range` after `after` and delete
    /// those selected by the predicate.
    ///
    /// `prepare` is called once under the store's write lock and returns the
    /// predicate, so it can capture state that must not change during the
    /// batch.
    pub fn delete_batch<P>(
        &self,
        collection: &str,
        range: &ChunkRange,
        after: Option<&ShardKey>,
        limit: usize,
        prepare: impl FnOnce() -> P,
    ) -> DeleteBatch
    where
        P: Fn(&ShardKey) -> bool,
    {
        let mut data = self.data.write();
        let (Some(docs), Some(bounds)) = (data.get_mut(collection), range_bounds(range, after))
        else {
            return DeleteBatch::default();
        };
        let should_delete = prepare();

        let mut batch = DeleteBatch::default();
        let mut doomed = Vec::new();
        for key in docs.range(bounds).take(limit).map(|(k, _)| k) {
            batch.scanned += 1;
            if should_delete(key) {
                doomed.push(key.clone());
            }
            batch.last_key = Some(key.clone());
        }
        for key in doomed {
            docs.remove(&key);
            batch.deleted += 1;
        }
        batch
    }

    /// All keys of a collection.
    pub fn keys(&self, collection: &str) -> Vec<ShardKey> {
        self.data
            .read()
            .get(collection)
            .map(|docs| docs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Collections with at least one stored document.
    pub fn collections(&self) -> Vec<CollectionId> {
        self.data
            .read()
            .iter()
            .filter(|(_, docs)| !docs.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(min, max).unwrap()
    }

    fn seeded() -> ShardStore {
        let store = ShardStore::new(1);
        store.upsert_batch(
            "db.users",
            (0..30).map(|i| Document::new(i, format!("doc-{}", i))).collect(),
        );
        store
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<ShardKey>>,
        frozen: Mutex<Option<watch::Receiver<bool>>>,
    }

    impl WriteObserver for Recorder {
        fn admit(&self, _collection: &str, op: &WriteOp) -> Admission {
            if let Some(rx) = self.frozen.lock().clone() {
                return Admission::Wait(rx);
            }
            self.seen.lock().push(op.key().clone());
            Admission::Admit
        }
    }

    #[test]
    fn test_scan_and_count() {
        let store = seeded();
        assert_eq!(store.count("db.users", None), 30);
        assert_eq!(store.count("db.users", Some(&range(0, 20))), 20);

        let first = store.scan("db.users", &range(0, 20), None, 5);
        assert_eq!(first.len(), 5);
        let next = store.scan("db.users", &range(0, 20), first.last().map(|d| &d.key), 100);
        assert_eq!(next.len(), 15);
        assert_eq!(next[0].key, ShardKey::Int(5));
        assert_eq!(store.count("db.missing", None), 0);
    }

    #[test]
    fn test_apply_notifies_observer() {
        let store = seeded();
        let recorder = Arc::new(Recorder::default());
        let observer: Arc<dyn WriteObserver> = recorder.clone();
        store.set_observer(Arc::downgrade(&observer));

        let outcome = store
            .apply("db.users", WriteOp::Delete(ShardKey::Int(3)), || Ok(()))
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Applied { existed: true }));
        assert_eq!(recorder.seen.lock().as_slice(), &[ShardKey::Int(3)]);

        let (_tx, rx) = watch::channel(false);
        *recorder.frozen.lock() = Some(rx);
        let outcome = store
            .apply("db.users", WriteOp::Insert(Document::new(99, "x")), || Ok(()))
            .unwrap();
        assert!(matches!(outcome, WriteOutcome::Blocked(_)));
        assert!(store.get("db.users", &ShardKey::Int(99)).is_none());
    }

    #[test]
    fn test_apply_check_rejects() {
        let store = seeded();
        let err = store
            .apply("db.users", WriteOp::Delete(ShardKey::Int(3)), || {
                Err(Error::Internal("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(store.get("db.users", &ShardKey::Int(3)).is_some());
    }

    #[test]
    fn test_delete_batch_resumes_from_cursor() {
        let store = seeded();
        let bounds = ChunkRange::full();
        let even = || |k: &ShardKey| matches!(k, ShardKey::Int(v) if v % 2 == 0);

        let first = store.delete_batch("db.users", &bounds, None, 10, even);
        assert_eq!(first.scanned, 10);
        assert_eq!(first.deleted, 5);
        assert_eq!(first.last_key, Some(ShardKey::Int(9)));

        let rest = store.delete_batch("db.users", &bounds, first.last_key.as_ref(), 100, even);
        assert_eq!(rest.scanned, 20);
        assert_eq!(rest.deleted, 10);
        assert_eq!(store.count("db.users", None), 15);
    }
}
