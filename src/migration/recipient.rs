//! Recipient side of a migration.
//!
//! A session registers its range as pending before any document arrives,
//! pulls clone batches from the donor, and replays the donor's modification
//! stream: buffered and folded per key while cloning, applied in sequence
//! order afterwards. Ownership is taken from the metadata store only; the
//! donor's word is never enough to keep or drop data.

use super::session::{MigrationSession, RecipientState, RecipientStatus, SequencedOp, SessionId};
use super::MigrationContext;
use crate::error::{Error, Result};
use crate::metadata::ChunkRange;
use crate::types::{ShardKey, WriteOp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Mutable recipient-side bookkeeping of one session.
#[derive(Debug)]
struct Progress {
    /// Where the session stands on this shard.
    state: RecipientState,
    /// Modifications received while cloning, folded per key.
    buffered: HashMap<ShardKey, WriteOp>,
    /// Highest modification sequence number received.
    received_seq: u64,
    /// Highest modification sequence number written to the store.
    applied_seq: u64,
    /// Documents written from clone batches.
    cloned: u64,
    /// Last contact from the donor. Drives the watchdog.
    last_heard: Instant,
}

/// A range being received.
#[derive(Debug)]
struct RecipientSession {
    /// Session as announced by the donor.
    info: MigrationSession,
    /// Progress, guarded separately from the apply lock.
    progress: Mutex<Progress>,
    /// Stops the clone task and the watchdog.
    cancel: CancellationToken,
    /// Serializes writes into the store for this session.
    apply: tokio::sync::Mutex<()>,
}

impl RecipientSession {
    fn new(info: MigrationSession, cancel: CancellationToken) -> Self {
        Self {
            info,
            progress: Mutex::new(Progress {
                state: RecipientState::Cloning,
                buffered: HashMap::new(),
                received_seq: 0,
                applied_seq: 0,
                cloned: 0,
                last_heard: Instant::now(),
            }),
            cancel,
            apply: tokio::sync::Mutex::new(()),
        }
    }

    fn touch(&self) {
        self.progress.lock().last_heard = Instant::now();
    }

    /// Current state and time since the donor was last heard from.
    fn silence(&self) -> (RecipientState, Duration) {
        let p = self.progress.lock();
        (p.state, p.last_heard.elapsed())
    }

    fn status(&self) -> RecipientStatus {
        let p = self.progress.lock();
        RecipientStatus {
            active: p.state.is_active(),
            state: Some(p.state),
            range: Some(self.info.range.clone()),
            lag_estimate: p.received_seq - p.applied_seq,
            applied_seq: p.applied_seq,
            cloned_docs: p.cloned,
        }
    }

    fn set_state(&self, state: RecipientState) {
        self.progress.lock().state = state;
    }
}

/// Receives migrations into this shard.
#[derive(Debug)]
pub struct RecipientWorker {
    ctx: MigrationContext,
    sessions: Mutex<HashMap<SessionId, Arc<RecipientSession>>>,
}

impl RecipientWorker {
    pub fn new(ctx: MigrationContext) -> Self {
        Self {
            ctx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, id: SessionId) -> Result<Arc<RecipientSession>> {
        self.sessions
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound(id))
    }

    /// Sessions currently being received.
    pub fn active_sessions(&self) -> Vec<MigrationSession> {
        self.sessions.lock().values().map(|s| s.info.clone()).collect()
    }

    /// Start receiving `info`. Repeated calls for the same session are no-ops.
    #[tracing::instrument(skip(self, info), fields(shard = self.ctx.shard, session_id = %info.id))]
    pub async fn begin_clone(self: &Arc<Self>, info: MigrationSession) -> Result<()> {
        if self.sessions.lock().contains_key(&info.id) {
            return Ok(());
        }
        if info.recipient != self.ctx.shard {
            return Err(Error::InvalidRange(format!(
                "session {} targets shard {}, not {}",
                info.id, info.recipient, self.ctx.shard
            )));
        }

        self.ctx.cache.refresh(&info.collection).await?;
        self.ctx.cache.add_pending(&info.collection, info.range.clone())?;

        let session = Arc::new(RecipientSession::new(
            info.clone(),
            self.ctx.shutdown.child_token(),
        ));
        self.sessions.lock().insert(info.id, session.clone());
        tracing::info!(
            collection = %info.collection,
            range = %info.range,
            donor = info.donor,
            "Receiving range"
        );

        tokio::spawn(self.clone().clone_task(session.clone()));
        tokio::spawn(self.clone().watchdog(session));
        Ok(())
    }

    async fn clone_task(self: Arc<Self>, session: Arc<RecipientSession>) {
        if let Err(e) = self.clone_all(&session).await {
            if !session.cancel.is_cancelled() {
                tracing::warn!(session_id = %session.info.id, error = %e, "Clone failed");
                self.abort_local(session.info.id, &e.to_string()).await;
            }
        }
    }

    /// Documents already in the range are leftovers of an earlier attempt.
    fn purge_range(&self, session: &RecipientSession) -> u64 {
        let info = &session.info;
        let limit = self.ctx.cleanup.config().batch_size;
        let mut purged = 0;
        loop {
            let batch = self
                .ctx
                .store
                .delete_batch(&info.collection, &info.range, None, limit, || {
                    |_: &ShardKey| true
                });
            purged += batch.deleted;
            if (batch.scanned as usize) < limit {
                return purged;
            }
        }
    }

    async fn clone_all(&self, session: &RecipientSession) -> Result<()> {
        let info = &session.info;
        let purged = self.purge_range(session);
        if purged > 0 {
            tracing::info!(session_id = %info.id, purged, "Removed stale documents before cloning");
        }

        loop {
            let batch = tokio::select! {
                batch = self.ctx.transport.clone_batch(info.donor, info.id, self.ctx.config.clone_batch_size) => batch?,
                _ = session.cancel.cancelled() => return Err(Error::Cancelled),
            };
            session.touch();

            let _guard = session.apply.lock().await;
            if session.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let count = self.ctx.store.upsert_batch(&info.collection, batch.docs);
            session.progress.lock().cloned += count as u64;
            self.ctx.metrics.record_received(count);
            if batch.done {
                break;
            }
        }

        let _guard = session.apply.lock().await;
        if session.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let buffered: Vec<WriteOp> = {
            let mut p = session.progress.lock();
            p.buffered.drain().map(|(_, op)| op).collect()
        };
        let replayed = self.ctx.store.apply_unobserved(&info.collection, buffered);
        let cloned = {
            let mut p = session.progress.lock();
            p.applied_seq = p.received_seq;
            p.state = RecipientState::Steady;
            p.cloned
        };
        tracing::info!(session_id = %info.id, cloned, replayed, "Clone complete, applying modifications");
        Ok(())
    }

    async fn watchdog(self: Arc<Self>, session: Arc<RecipientSession>) {
        let timeout = self.ctx.config.heartbeat_timeout;
        let mut ticker = tokio::time::interval(self.ctx.config.status_poll_interval);
        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let (state, silent) = session.silence();
            // A donor past start_commit may still land the move while it holds
            // the collection lock.
            let limit = match state {
                RecipientState::CommitPending => timeout + self.ctx.config.lock_ttl,
                _ => timeout,
            };
            if silent >= limit {
                tracing::warn!(
                    session_id = %session.info.id,
                    silent_ms = silent.as_millis() as u64,
                    state = ?state,
                    "Donor silent, aborting"
                );
                self.abort_local(session.info.id, "heartbeat timeout").await;
                return;
            }
        }
    }

    /// Accept forwarded modifications. Returns the highest sequence number
    /// received.
    pub async fn push_modifications(&self, id: SessionId, ops: Vec<SequencedOp>) -> Result<u64> {
        let session = self.get(id)?;
        let _guard = session.apply.lock().await;
        if session.cancel.is_cancelled() {
            return Err(Error::Aborted(format!("session {} discarded", id)));
        }
        session.touch();

        let (state, fresh, received) = {
            let mut p = session.progress.lock();
            let fresh: Vec<SequencedOp> = ops.into_iter().filter(|o| o.seq > p.received_seq).collect();
            if let Some(last) = fresh.last() {
                p.received_seq = last.seq;
            }
            if p.state == RecipientState::Cloning {
                for SequencedOp { op, .. } in fresh.iter().cloned() {
                    let key = op.key().clone();
                    let folded = match p.buffered.remove(&key) {
                        Some(earlier) => earlier.fold(op),
                        None => op,
                    };
                    p.buffered.insert(key, folded);
                }
            }
            (p.state, fresh, p.received_seq)
        };

        match state {
            RecipientState::Cloning => {}
            RecipientState::Steady | RecipientState::CommitPending => {
                let ops = fresh.into_iter().map(|o| o.op).collect();
                self.ctx.store.apply_unobserved(&session.info.collection, ops);
                session.progress.lock().applied_seq = received;
            }
            RecipientState::Done | RecipientState::Aborted => {
                return Err(Error::Aborted(format!("session {} is finished", id)));
            }
        }
        Ok(received)
    }

    /// Progress of `id`; unknown sessions report inactive.
    pub fn status(&self, id: SessionId) -> RecipientStatus {
        match self.get(id) {
            Ok(session) => {
                session.touch();
                session.status()
            }
            Err(_) => RecipientStatus::inactive(),
        }
    }

    /// Accept the donor's announcement that it is about to write the move to
    /// the metadata store. Refused unless cloning finished and every
    /// modification up to `last_seq` is applied.
    #[tracing::instrument(skip(self), fields(shard = self.ctx.shard))]
    pub async fn start_commit(&self, id: SessionId, last_seq: u64) -> Result<()> {
        let session = self.get(id).map_err(|_| {
            Error::Aborted(format!("recipient {} no longer runs session {}", self.ctx.shard, id))
        })?;
        let _guard = session.apply.lock().await;
        if session.cancel.is_cancelled() {
            return Err(Error::Aborted(format!("session {} discarded", id)));
        }
        {
            let mut p = session.progress.lock();
            let ready = matches!(p.state, RecipientState::Steady | RecipientState::CommitPending)
                && p.applied_seq >= last_seq;
            if !ready {
                return Err(Error::Aborted(format!(
                    "session {} not ready to commit: {:?}, applied {} of {}",
                    id, p.state, p.applied_seq, last_seq
                )));
            }
            p.state = RecipientState::CommitPending;
            p.last_heard = Instant::now();
        }
        tracing::info!(session_id = %id, last_seq, "Commit started");
        Ok(())
    }

    /// Finish `id` after the donor committed. The range is kept only if the
    /// metadata store confirms this shard owns it.
    #[tracing::instrument(skip(self), fields(shard = self.ctx.shard))]
    pub async fn commit(&self, id: SessionId) -> Result<()> {
        let session = self.get(id)?;
        let info = &session.info;
        self.ctx.cache.refresh(&info.collection).await?;
        let owned = self
            .ctx
            .cache
            .snapshot(&info.collection)
            .is_some_and(|s| s.owns_range(&info.range));
        if !owned {
            return Err(Error::RangeNotOwned {
                collection: info.collection.clone(),
                range: info.range.clone(),
                shard: self.ctx.shard,
            });
        }

        session.set_state(RecipientState::Done);
        session.cancel.cancel();
        self.sessions.lock().remove(&id);
        tracing::info!(collection = %info.collection, range = %info.range, "Range received");
        Ok(())
    }

    /// Discard `id` because the donor asked to.
    pub async fn abort(&self, id: SessionId) -> Result<()> {
        self.abort_local(id, "aborted by donor").await;
        Ok(())
    }

    async fn abort_local(&self, id: SessionId, reason: &str) {
        let Some(session) = self.sessions.lock().remove(&id) else {
            return;
        };
        session.cancel.cancel();
        let _guard = session.apply.lock().await;
        let info = &session.info;

        match self.ctx.cache.refresh(&info.collection).await {
            Ok(_) => {
                let committed = self
                    .ctx
                    .cache
                    .snapshot(&info.collection)
                    .is_some_and(|s| s.owns_range(&info.range));
                if committed {
                    session.set_state(RecipientState::Done);
                    tracing::info!(
                        session_id = %id,
                        reason,
                        "Abort raced a committed move, keeping range"
                    );
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Refresh before discard failed");
            }
        }

        session.set_state(RecipientState::Aborted);
        self.ctx.cache.forget_pending(&info.collection, &info.range);
        self.ctx.metrics.record_recipient_abort();
        self.schedule_discard(&info.collection, info.range.clone());
        tracing::warn!(
            session_id = %id,
            collection = %info.collection,
            range = %info.range,
            reason,
            "Recipient session aborted"
        );
    }

    fn schedule_discard(&self, collection: &str, range: ChunkRange) {
        let delay = self.ctx.cleanup.config().range_deletion_delay;
        let _ = self
            .ctx
            .cleanup
            .schedule_range_deletion(collection, range, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::OrphanCleanupService;
    use crate::config::{CleanupConfig, MigrationConfig};
    use crate::metadata::{CollectionVersion, InMemoryMetadataStore, MetadataStore};
    use crate::migration::{CloneBatch, MigrationMetrics, ShardTransport};
    use crate::ownership::{RangeOwnershipCache, RangeStatus};
    use crate::storage::ShardStore;
    use crate::types::{Document, ShardId};
    use tokio::sync::Semaphore;

    /// Serves clone batches from a fixed document list behind a gate.
    #[derive(Debug)]
    struct FakeDonor {
        docs: Vec<Document>,
        served: Mutex<usize>,
        gate: Semaphore,
    }

    #[async_trait::async_trait]
    impl ShardTransport for FakeDonor {
        async fn begin_clone(&self, _to: ShardId, _session: MigrationSession) -> Result<()> {
            Ok(())
        }
        async fn clone_batch(&self, _to: ShardId, _s: SessionId, limit: usize) -> Result<CloneBatch> {
            self.gate.acquire().await.unwrap().forget();
            let mut served = self.served.lock();
            let end = (*served + limit).min(self.docs.len());
            let docs = self.docs[*served..end].to_vec();
            *served = end;
            Ok(CloneBatch {
                done: end == self.docs.len(),
                docs,
            })
        }
        async fn push_modifications(&self, _to: ShardId, _s: SessionId, _ops: Vec<SequencedOp>) -> Result<u64> {
            Ok(0)
        }
        async fn recipient_status(&self, _to: ShardId, _s: SessionId) -> Result<RecipientStatus> {
            Ok(RecipientStatus::inactive())
        }
        async fn start_commit(&self, _to: ShardId, _s: SessionId, _last_seq: u64) -> Result<()> {
            Ok(())
        }
        async fn commit(&self, _to: ShardId, _s: SessionId) -> Result<()> {
            Ok(())
        }
        async fn abort(&self, _to: ShardId, _s: SessionId) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        metadata: Arc<InMemoryMetadataStore>,
        donor: Arc<FakeDonor>,
        store: Arc<ShardStore>,
        cache: Arc<RangeOwnershipCache>,
        worker: Arc<RecipientWorker>,
        version: CollectionVersion,
    }

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(min, max).unwrap()
    }

    async fn fixture(config: MigrationConfig) -> Fixture {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let version = metadata
            .install(
                "db.users",
                vec![
                    (ChunkRange::new(ShardKey::Min, 0).unwrap(), 2),
                    (range(0, 20), 1),
                    (ChunkRange::new(20, ShardKey::Max).unwrap(), 2),
                ],
            )
            .unwrap();
        let donor = Arc::new(FakeDonor {
            docs: (0..20).map(|i| Document::new(i, "v1")).collect(),
            served: Mutex::new(0),
            gate: Semaphore::new(0),
        });
        let store = Arc::new(ShardStore::new(2));
        let cache = Arc::new(RangeOwnershipCache::new(2, metadata.clone()));
        let shutdown = CancellationToken::new();
        let cleanup = Arc::new(
            OrphanCleanupService::new(
                2,
                CleanupConfig::default().with_range_deletion_delay(Duration::ZERO),
                store.clone(),
                cache.clone(),
                shutdown.clone(),
            )
            .await
            .unwrap(),
        );
        let ctx = MigrationContext {
            shard: 2,
            config: config.with_clone_batch_size(8),
            store: store.clone(),
            cache: cache.clone(),
            metadata: metadata.clone(),
            transport: donor.clone(),
            cleanup,
            metrics: Arc::new(MigrationMetrics::new()),
            shutdown,
        };
        Fixture {
            metadata,
            donor,
            store,
            cache,
            worker: Arc::new(RecipientWorker::new(ctx)),
            version,
        }
    }

    fn session(f: &Fixture) -> MigrationSession {
        MigrationSession::new("db.users", range(0, 20), 1, 2, f.version)
    }

    async fn wait_for_state(worker: &RecipientWorker, id: SessionId, state: RecipientState) {
        for _ in 0..200 {
            if worker.status(id).state == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {:?}", state);
    }

    fn op(seq: u64, op: WriteOp) -> SequencedOp {
        SequencedOp { seq, op }
    }

    #[tokio::test]
    async fn test_pending_registered_before_first_batch() {
        let f = fixture(MigrationConfig::default()).await;
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();
        f.worker.begin_clone(s.clone()).await.unwrap();

        assert_eq!(f.cache.status("db.users", &ShardKey::Int(5)), RangeStatus::Pending);
        assert_eq!(f.store.count("db.users", None), 0);

        let status = f.worker.status(s.id);
        assert!(status.active);
        assert_eq!(status.state, Some(RecipientState::Cloning));
        assert_eq!(status.range, Some(range(0, 20)));
    }

    #[tokio::test]
    async fn test_modifications_buffered_while_cloning_then_folded() {
        let f = fixture(MigrationConfig::default()).await;
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();

        let received = f
            .worker
            .push_modifications(
                s.id,
                vec![
                    op(1, WriteOp::Insert(Document::new(19, "new"))),
                    op(2, WriteOp::Update(Document::new(19, "newer"))),
                    op(3, WriteOp::Delete(ShardKey::Int(6))),
                ],
            )
            .await
            .unwrap();
        assert_eq!(received, 3);
        let status = f.worker.status(s.id);
        assert_eq!((status.applied_seq, status.lag_estimate), (0, 3));

        // Redelivery is ignored.
        f.worker
            .push_modifications(s.id, vec![op(3, WriteOp::Delete(ShardKey::Int(7)))])
            .await
            .unwrap();

        f.donor.gate.add_permits(10);
        wait_for_state(&f.worker, s.id, RecipientState::Steady).await;

        assert_eq!(f.store.count("db.users", None), 19);
        assert_eq!(f.store.get("db.users", &ShardKey::Int(19)).unwrap().body, "newer");
        assert!(f.store.get("db.users", &ShardKey::Int(6)).is_none());
        assert!(f.store.get("db.users", &ShardKey::Int(7)).is_some());
        let status = f.worker.status(s.id);
        assert_eq!((status.applied_seq, status.lag_estimate, status.cloned_docs), (3, 0, 20));

        f.worker
            .push_modifications(s.id, vec![op(4, WriteOp::Delete(ShardKey::Int(8)))])
            .await
            .unwrap();
        assert!(f.store.get("db.users", &ShardKey::Int(8)).is_none());
        assert_eq!(f.worker.status(s.id).applied_seq, 4);
    }

    #[tokio::test]
    async fn test_commit_requires_metadata_confirmation() {
        let f = fixture(MigrationConfig::default()).await;
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();
        f.donor.gate.add_permits(10);
        wait_for_state(&f.worker, s.id, RecipientState::Steady).await;

        let err = f.worker.commit(s.id).await.unwrap_err();
        assert_eq!(err.code(), "RangeNotOwned");
        assert_eq!(f.cache.status("db.users", &ShardKey::Int(5)), RangeStatus::Pending);

        f.metadata
            .commit_chunk_move("db.users", &range(0, 20), 1, 2, f.version)
            .await
            .unwrap();
        f.worker.commit(s.id).await.unwrap();
        assert_eq!(f.cache.status("db.users", &ShardKey::Int(5)), RangeStatus::Owned);
        assert!(!f.worker.status(s.id).active);
        assert_eq!(f.store.count("db.users", None), 20);
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_discards_partial_clone() {
        let config = MigrationConfig::default()
            .with_status_poll_interval(Duration::from_millis(10))
            .with_heartbeat_timeout(Duration::from_millis(100));
        let f = fixture(config).await;
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();
        f.donor.gate.add_permits(1);

        for _ in 0..100 {
            if f.cache.pending_ranges("db.users").is_empty() && f.store.count("db.users", None) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.cache.pending_ranges("db.users").is_empty());
        assert_eq!(f.store.count("db.users", None), 0);
        assert!(!f.worker.status(s.id).active);
        assert!(matches!(
            f.worker.push_modifications(s.id, vec![]).await,
            Err(Error::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_commit_requires_applied_modifications() {
        let f = fixture(MigrationConfig::default()).await;
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();

        let err = f.worker.start_commit(s.id, 0).await.unwrap_err();
        assert_eq!(err.code(), "Aborted");

        f.donor.gate.add_permits(10);
        wait_for_state(&f.worker, s.id, RecipientState::Steady).await;
        f.worker
            .push_modifications(s.id, vec![op(1, WriteOp::Delete(ShardKey::Int(4)))])
            .await
            .unwrap();

        let err = f.worker.start_commit(s.id, 2).await.unwrap_err();
        assert_eq!(err.code(), "Aborted");
        assert_eq!(f.worker.status(s.id).state, Some(RecipientState::Steady));

        f.worker.start_commit(s.id, 1).await.unwrap();
        let status = f.worker.status(s.id);
        assert!(status.active);
        assert_eq!(status.state, Some(RecipientState::CommitPending));

        let err = f.worker.start_commit(uuid::Uuid::new_v4(), 0).await.unwrap_err();
        assert_eq!(err.code(), "Aborted");
    }

    #[tokio::test]
    async fn test_commit_pending_survives_donor_silence() {
        let config = MigrationConfig::default()
            .with_status_poll_interval(Duration::from_millis(10))
            .with_heartbeat_timeout(Duration::from_millis(100));
        let f = fixture(config).await;
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();
        f.donor.gate.add_permits(10);
        wait_for_state(&f.worker, s.id, RecipientState::Steady).await;
        f.worker.start_commit(s.id, 0).await.unwrap();

        // Three heartbeat timeouts without a word from the donor.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.cache.status("db.users", &ShardKey::Int(5)), RangeStatus::Pending);
        assert_eq!(f.store.count("db.users", None), 20);

        f.metadata
            .commit_chunk_move("db.users", &range(0, 20), 1, 2, f.version)
            .await
            .unwrap();
        f.worker.commit(s.id).await.unwrap();
        assert_eq!(f.cache.status("db.users", &ShardKey::Int(5)), RangeStatus::Owned);
        assert_eq!(f.store.count("db.users", None), 20);
    }

    #[tokio::test]
    async fn test_commit_pending_discarded_after_lock_lease() {
        let config = MigrationConfig::default()
            .with_status_poll_interval(Duration::from_millis(10))
            .with_heartbeat_timeout(Duration::from_millis(50))
            .with_lock_timing(Duration::from_millis(100), Duration::from_millis(100));
        let f = fixture(config).await;
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();
        f.donor.gate.add_permits(10);
        wait_for_state(&f.worker, s.id, RecipientState::Steady).await;
        f.worker.start_commit(s.id, 0).await.unwrap();

        for _ in 0..100 {
            if f.cache.pending_ranges("db.users").is_empty() && f.store.count("db.users", None) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.cache.pending_ranges("db.users").is_empty());
        assert_eq!(f.store.count("db.users", None), 0);
        assert_eq!(
            f.metadata.read_chunks("db.users").await.unwrap().owner_of(&ShardKey::Int(5)),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_abort_after_commit_keeps_range() {
        let f = fixture(MigrationConfig::default()).await;
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();
        f.donor.gate.add_permits(10);
        wait_for_state(&f.worker, s.id, RecipientState::Steady).await;

        f.metadata
            .commit_chunk_move("db.users", &range(0, 20), 1, 2, f.version)
            .await
            .unwrap();
        f.worker.abort(s.id).await.unwrap();

        assert_eq!(f.cache.status("db.users", &ShardKey::Int(5)), RangeStatus::Owned);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.store.count("db.users", None), 20);
    }

    #[tokio::test]
    async fn test_stale_documents_purged_before_clone() {
        let f = fixture(MigrationConfig::default()).await;
        f.store
            .upsert_batch("db.users", vec![Document::new(3, "stale"), Document::new(17, "stale")]);
        let s = session(&f);
        f.worker.begin_clone(s.clone()).await.unwrap();
        f.donor.gate.add_permits(10);
        wait_for_state(&f.worker, s.id, RecipientState::Steady).await;

        assert_eq!(f.store.count("db.users", None), 20);
        assert_eq!(f.store.get("db.users", &ShardKey::Int(3)).unwrap().body, "v1");
    }
}
