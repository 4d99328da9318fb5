//! Donor side of a migration.
//!
//! The coordinator owns at most one session per collection. While a session
//! is live it observes every user write on the shard: writes to the
//! migrating range are sequenced into a modification buffer that the driver
//! forwards to the recipient, and during the commit's critical section they
//! are held back until the outcome is known.

use super::session::{
    CloneBatch, MigrationSession, RecipientState, RecipientStatus, SequencedOp, SessionId,
    SessionState,
};
use super::MigrationContext;
use crate::error::{Error, Result};
use crate::lock::DistLockManager;
use crate::metadata::{ChunkRange, CollectionVersion};
use crate::ownership::OwnershipSnapshot;
use crate::storage::{Admission, WriteObserver};
use crate::types::{CollectionId, ShardId, ShardKey, WriteOp};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Outcome = Option<Result<CollectionVersion>>;

/// Writes captured for the recipient, plus the clone cursor.
#[derive(Debug, Default)]
struct ModBuffer {
    /// Sequence number of the last buffered write.
    last_seq: u64,
    /// Captured writes not yet forwarded, in sequence order.
    pending: VecDeque<SequencedOp>,
    /// Set while the critical section is active.
    critical: Option<watch::Sender<bool>>,
    /// Last key served to the recipient's clone.
    clone_cursor: Option<ShardKey>,
}

/// A range being moved out.
#[derive(Debug)]
struct DonorSession {
    /// Session id shared with the recipient.
    id: SessionId,
    /// Collection being migrated.
    collection: CollectionId,
    /// Range being moved.
    range: ChunkRange,
    /// Shard receiving the range.
    recipient: ShardId,
    /// Session record, including the donor-side state.
    info: Mutex<MigrationSession>,
    /// Modification stream and write gate.
    mods: Mutex<ModBuffer>,
    /// Cancelled on abort or shutdown.
    cancel: CancellationToken,
    /// Final result, published once.
    outcome: watch::Sender<Outcome>,
}

impl DonorSession {
    fn new(info: MigrationSession, cancel: CancellationToken) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id: info.id,
            collection: info.collection.clone(),
            range: info.range.clone(),
            recipient: info.recipient,
            info: Mutex::new(info),
            mods: Mutex::new(ModBuffer::default()),
            cancel,
            outcome,
        }
    }

    fn info(&self) -> MigrationSession {
        self.info.lock().clone()
    }

    fn transition(&self, next: SessionState) -> Result<()> {
        self.info.lock().transition(next)
    }

    fn take_pending(&self) -> (Vec<SequencedOp>, u64) {
        let mut mods = self.mods.lock();
        (mods.pending.drain(..).collect(), mods.last_seq)
    }

    fn enter_critical_section(&self) {
        let (tx, _) = watch::channel(false);
        self.mods.lock().critical = Some(tx);
    }

    fn exit_critical_section(&self) {
        if let Some(tx) = self.mods.lock().critical.take() {
            tx.send_replace(true);
        }
    }
}

/// Drives migrations out of this shard.
#[derive(Debug)]
pub struct DonorCoordinator {
    ctx: MigrationContext,
    locks: Arc<DistLockManager>,
    sessions: Mutex<HashMap<CollectionId, Arc<DonorSession>>>,
}

impl DonorCoordinator {
    pub fn new(ctx: MigrationContext, locks: Arc<DistLockManager>) -> Self {
        Self {
            ctx,
            locks,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.ctx.shard
    }

    /// Running session of `collection`, if any.
    pub fn active_session(&self, collection: &str) -> Option<MigrationSession> {
        self.sessions.lock().get(collection).map(|s| s.info())
    }

    fn find(&self, id: SessionId) -> Result<Arc<DonorSession>> {
        self.sessions
            .lock()
            .values()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(Error::SessionNotFound(id))
    }

    /// Start moving `range` to shard `to` and return once the session runs.
    #[tracing::instrument(skip(self), fields(shard = self.ctx.shard))]
    pub async fn start_migration(
        self: &Arc<Self>,
        collection: &str,
        range: ChunkRange,
        to: ShardId,
    ) -> Result<MigrationSession> {
        self.start(collection, range, to).await.map(|(info, _)| info)
    }

    /// Move `range` to shard `to` and wait for the outcome.
    pub async fn move_range(
        self: &Arc<Self>,
        collection: &str,
        range: ChunkRange,
        to: ShardId,
    ) -> Result<CollectionVersion> {
        let (_, mut outcome) = self.start(collection, range, to).await?;
        let result = match outcome.wait_for(|o| o.is_some()).await {
            Ok(done) => done.clone().unwrap_or(Err(Error::Cancelled)),
            Err(_) => Err(Error::Cancelled),
        };
        if let Err(e) = &result {
            tracing::info!(collection, code = e.code(), error = %e, "Move failed");
        }
        result
    }

    async fn start(
        self: &Arc<Self>,
        collection: &str,
        range: ChunkRange,
        to: ShardId,
    ) -> Result<(MigrationSession, watch::Receiver<Outcome>)> {
        if to == self.ctx.shard {
            return Err(Error::InvalidRange(format!(
                "cannot move {} to its current owner {}",
                range, to
            )));
        }

        let version = self.ctx.cache.refresh(collection).await?;
        let snapshot = self
            .ctx
            .cache
            .snapshot(collection)
            .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
        if !snapshot.owned_ranges().iter().any(|r| r.contains_range(&range)) {
            if snapshot.owns_range(&range) {
                return Err(Error::InvalidRange(format!("{} spans a chunk boundary", range)));
            }
            return Err(Error::RangeNotOwned {
                collection: collection.to_string(),
                range,
                shard: self.ctx.shard,
            });
        }
        let docs = self.ctx.store.count(collection, Some(&range)) as u64;
        if docs > self.ctx.config.max_chunk_docs {
            return Err(Error::ChunkTooBig {
                collection: collection.to_string(),
                range,
                docs,
                limit: self.ctx.config.max_chunk_docs,
            });
        }

        let info = MigrationSession::new(collection, range.clone(), self.ctx.shard, to, version);
        let session = Arc::new(DonorSession::new(info.clone(), self.ctx.shutdown.child_token()));
        let outcome = session.outcome.subscribe();
        {
            let mut sessions = self.sessions.lock();
            if let Some(existing) = sessions.get(collection) {
                return Err(Error::MigrationAlreadyInProgress {
                    collection: collection.to_string(),
                    range: existing.range.clone(),
                });
            }
            sessions.insert(collection.to_string(), session.clone());
        }

        self.ctx.metrics.record_started();
        tracing::info!(
            session_id = %info.id,
            collection,
            range = %range,
            recipient = to,
            version = %version,
            "Migration session created"
        );
        tokio::spawn(self.clone().run(session));
        Ok((info, outcome))
    }

    /// Abort the session `id`. The recipient is not waited for.
    pub fn cancel(&self, id: SessionId) -> Result<()> {
        let session = self.find(id)?;
        tracing::info!(session_id = %id, collection = %session.collection, "Migration cancel requested");
        session.cancel.cancel();
        Ok(())
    }

    /// Serve the next page of documents to the recipient.
    pub fn serve_clone_batch(&self, id: SessionId, limit: usize) -> Result<CloneBatch> {
        let session = self.find(id)?;
        if session.cancel.is_cancelled() {
            return Err(Error::Aborted(format!("session {} cancelled", id)));
        }

        let cursor = session.mods.lock().clone_cursor.clone();
        let docs = self
            .ctx
            .store
            .scan(&session.collection, &session.range, cursor.as_ref(), limit);
        let done = docs.len() < limit;
        if let Some(last) = docs.last() {
            session.mods.lock().clone_cursor = Some(last.key.clone());
        }
        self.ctx.metrics.record_cloned(docs.len());
        Ok(CloneBatch { docs, done })
    }

    async fn run(self: Arc<Self>, session: Arc<DonorSession>) {
        let heartbeat = self.spawn_heartbeat(&session);
        let result = self.drive(&session).await;
        heartbeat.cancel();

        match result {
            Ok(version) => self.finish_committed(&session, version).await,
            Err(err) => self.finish_aborted(&session, err).await,
        }
    }

    /// Keeps polling the recipient so its watchdog stays quiet while the
    /// driver is busy with the lock or the metadata store.
    fn spawn_heartbeat(self: &Arc<Self>, session: &Arc<DonorSession>) -> CancellationToken {
        let stop = session.cancel.child_token();
        let token = stop.clone();
        let transport = self.ctx.transport.clone();
        let (recipient, id) = (session.recipient, session.id);
        let mut ticker = tokio::time::interval(self.ctx.config.status_poll_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = async {
                        ticker.tick().await;
                        let _ = transport.recipient_status(recipient, id).await;
                    } => {}
                }
            }
        });
        stop
    }

    async fn drive(&self, session: &DonorSession) -> Result<CollectionVersion> {
        let prepared = tokio::select! {
            r = self.clone_and_catch_up(session) => r,
            _ = session.cancel.cancelled() => {
                Err(Error::Aborted(format!("session {} cancelled", session.id)))
            }
        };
        prepared?;
        session.transition(SessionState::Committing)?;
        self.commit(session).await
    }

    async fn clone_and_catch_up(&self, session: &DonorSession) -> Result<()> {
        self.ctx
            .transport
            .begin_clone(session.recipient, session.info())
            .await?;
        self.wait_for_clone(session).await?;
        session.transition(SessionState::Catchup)?;
        self.catch_up(session).await
    }

    async fn status(&self, session: &DonorSession) -> Result<RecipientStatus> {
        let status = self
            .ctx
            .transport
            .recipient_status(session.recipient, session.id)
            .await?;
        if !status.active {
            return Err(Error::Aborted(format!(
                "recipient {} no longer runs session {}",
                session.recipient, session.id
            )));
        }
        Ok(status)
    }

    /// Forward buffered writes. Returns the last sequence number handed to
    /// the recipient.
    async fn flush(&self, session: &DonorSession) -> Result<u64> {
        let (ops, last_seq) = session.take_pending();
        if ops.is_empty() {
            return Ok(last_seq);
        }
        let count = ops.len();
        self.ctx
            .transport
            .push_modifications(session.recipient, session.id, ops)
            .await?;
        self.ctx.metrics.record_forwarded(count);
        tracing::trace!(session_id = %session.id, count, last_seq, "Forwarded modifications");
        Ok(last_seq)
    }

    async fn wait_for_clone(&self, session: &DonorSession) -> Result<()> {
        let deadline = Instant::now() + self.ctx.config.clone_timeout;
        let mut ticker = tokio::time::interval(self.ctx.config.status_poll_interval);
        loop {
            ticker.tick().await;
            self.flush(session).await?;
            let status = self.status(session).await?;
            if status.state == Some(RecipientState::Steady) {
                tracing::info!(
                    session_id = %session.id,
                    cloned = status.cloned_docs,
                    "Recipient finished cloning"
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "recipient {} did not finish cloning",
                    session.recipient
                )));
            }
        }
    }

    async fn catch_up(&self, session: &DonorSession) -> Result<()> {
        let mut ticker = tokio::time::interval(self.ctx.config.status_poll_interval);
        for round in 1..=self.ctx.config.max_catchup_rounds {
            ticker.tick().await;
            let sent = self.flush(session).await?;
            self.ctx.metrics.record_catchup_round();
            let status = self.status(session).await?;
            let buffered = session.mods.lock().pending.len() as u64;
            let lag = sent.saturating_sub(status.applied_seq) + buffered;
            tracing::debug!(session_id = %session.id, round, lag, "Catch-up round");
            if lag <= self.ctx.config.max_catchup_lag {
                return Ok(());
            }
        }
        tracing::warn!(
            session_id = %session.id,
            rounds = self.ctx.config.max_catchup_rounds,
            "Catch-up rounds exhausted, committing with lag"
        );
        Ok(())
    }

    async fn commit(&self, session: &DonorSession) -> Result<CollectionVersion> {
        let entered = Instant::now();
        session.enter_critical_section();
        tracing::info!(session_id = %session.id, range = %session.range, "Entered critical section");

        let last_seq = self.flush(session).await?;
        let deadline = entered + self.ctx.config.critical_section_timeout;
        loop {
            let status = self.status(session).await?;
            if status.applied_seq >= last_seq && status.state == Some(RecipientState::Steady) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "recipient applied {} of {} modifications",
                    status.applied_seq, last_seq
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.status_poll_interval) => {}
                _ = session.cancel.cancelled() => {
                    return Err(Error::Aborted(format!("session {} cancelled", session.id)));
                }
            }
        }

        let commit_started = Instant::now();
        let handle = self
            .locks
            .acquire_with_retry(
                &session.collection,
                self.ctx.config.lock_ttl,
                "migrating chunk",
                self.ctx.config.lock_acquire_timeout,
            )
            .await?;
        // The recipient may have given up while we waited for the lock.
        let committed = match self
            .ctx
            .transport
            .start_commit(session.recipient, session.id, last_seq)
            .await
        {
            Ok(()) => self.commit_with_retry(session).await,
            Err(e) => {
                tracing::warn!(
                    session_id = %session.id,
                    recipient = session.recipient,
                    error = %e,
                    "Recipient refused to start commit"
                );
                Err(e)
            }
        };
        if let Err(e) = self.locks.release(handle).await {
            tracing::warn!(collection = %session.collection, error = %e, "Failed to release collection lock");
        }
        let version = committed?;

        if let Err(e) = self.ctx.cache.refresh(&session.collection).await {
            tracing::warn!(
                collection = %session.collection,
                error = %e,
                "Refresh after commit failed, invalidating ownership"
            );
            self.ctx.cache.invalidate(&session.collection);
        }
        self.ctx
            .metrics
            .record_committed(commit_started.elapsed(), entered.elapsed());
        Ok(version)
    }

    async fn commit_with_retry(&self, session: &DonorSession) -> Result<CollectionVersion> {
        let metadata = &self.ctx.metadata;
        let mut expected = session.info().expected_version;
        let max_attempts = self.ctx.config.max_commit_attempts;

        for attempt in 1..=max_attempts {
            let err = match metadata
                .commit_chunk_move(
                    &session.collection,
                    &session.range,
                    self.ctx.shard,
                    session.recipient,
                    expected,
                )
                .await
            {
                Ok(version) => {
                    tracing::info!(
                        session_id = %session.id,
                        collection = %session.collection,
                        range = %session.range,
                        version = %version,
                        "Committed chunk move"
                    );
                    return Ok(version);
                }
                Err(e) => e,
            };

            if matches!(err, Error::VersionMismatch { .. }) && attempt < max_attempts {
                let meta = metadata.read_chunks(&session.collection).await?;
                let mine = OwnershipSnapshot::from_metadata(self.ctx.shard, &meta, Vec::new());
                if !mine.owned_ranges().iter().any(|r| r.contains_range(&session.range)) {
                    return Err(Error::RangeNotOwned {
                        collection: session.collection.clone(),
                        range: session.range.clone(),
                        shard: self.ctx.shard,
                    });
                }
                tracing::info!(
                    session_id = %session.id,
                    attempt,
                    expected = %expected,
                    actual = %meta.version(),
                    "Collection version moved, retrying commit"
                );
                expected = meta.version();
                continue;
            }

            // The write may have landed even though the call failed.
            if let Ok(meta) = metadata.read_chunks(&session.collection).await {
                let theirs = OwnershipSnapshot::from_metadata(session.recipient, &meta, Vec::new());
                if theirs.owns_range(&session.range) {
                    tracing::warn!(
                        session_id = %session.id,
                        error = %err,
                        "Commit reported failure but the move is recorded"
                    );
                    return Ok(meta.version());
                }
            }
            return Err(err);
        }
        Err(Error::Internal("commit loop exhausted".into()))
    }

    /// Unregister `session` and let held-back writes retry.
    fn release(&self, session: &DonorSession) {
        {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(&session.collection)
                .is_some_and(|s| s.id == session.id)
            {
                sessions.remove(&session.collection);
            }
        }
        session.exit_critical_section();
    }

    async fn finish_committed(&self, session: &DonorSession, version: CollectionVersion) {
        self.release(session);
        if let Err(e) = session.transition(SessionState::Done) {
            tracing::warn!(session_id = %session.id, error = %e, "Unexpected session state");
        }
        tracing::info!(
            session_id = %session.id,
            collection = %session.collection,
            range = %session.range,
            version = %version,
            "Migration committed"
        );

        if let Err(e) = self
            .ctx
            .transport
            .commit(session.recipient, session.id)
            .await
        {
            tracing::warn!(
                session_id = %session.id,
                recipient = session.recipient,
                error = %e,
                "Recipient did not acknowledge commit"
            );
        }

        let deletion = self.ctx.cleanup.schedule_range_deletion(
            &session.collection,
            session.range.clone(),
            self.ctx.cleanup.config().range_deletion_delay,
        );
        if self.ctx.config.wait_for_delete {
            if let Err(e) = deletion.wait().await {
                tracing::warn!(session_id = %session.id, error = %e, "Range deletion after move failed");
            }
        }
        session.outcome.send_replace(Some(Ok(version)));
    }

    async fn finish_aborted(&self, session: &DonorSession, err: Error) {
        tracing::warn!(
            session_id = %session.id,
            collection = %session.collection,
            range = %session.range,
            error = %err,
            "Migration aborted"
        );
        self.release(session);
        let _ = session.transition(SessionState::Aborted);
        session.cancel.cancel();

        if self.ctx.config.notify_recipient_on_abort {
            if let Err(e) = self.ctx.transport.abort(session.recipient, session.id).await {
                tracing::debug!(session_id = %session.id, error = %e, "Abort notification not delivered");
            }
        }
        self.ctx.metrics.record_aborted(err.code());
        session.outcome.send_replace(Some(Err(err)));
    }
}

impl WriteObserver for DonorCoordinator {
    fn admit(&self, collection: &str, op: &WriteOp) -> Admission {
        let Some(session) = self.sessions.lock().get(collection).cloned() else {
            return Admission::Admit;
        };
        if !session.range.contains(op.key()) {
            return Admission::Admit;
        }
        let mut mods = session.mods.lock();
        if let Some(critical) = &mods.critical {
            return Admission::Wait(critical.subscribe());
        }
        mods.last_seq += 1;
        let seq = mods.last_seq;
        mods.pending.push_back(SequencedOp { seq, op: op.clone() });
        Admission::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::OrphanCleanupService;
    use crate::config::{CleanupConfig, LockConfig, MigrationConfig};
    use crate::lock::{InMemoryLockCatalog, SystemClock};
    use crate::metadata::{InMemoryMetadataStore, MetadataStore};
    use crate::migration::{MigrationMetrics, ShardTransport};
    use crate::ownership::RangeOwnershipCache;
    use crate::storage::{ShardStore, WriteOutcome};
    use crate::types::Document;

    /// Transport whose calls never complete.
    #[derive(Debug)]
    struct Stalled;

    #[async_trait::async_trait]
    impl ShardTransport for Stalled {
        async fn begin_clone(&self, _to: ShardId, _session: MigrationSession) -> Result<()> {
            std::future::pending().await
        }
        async fn clone_batch(&self, _to: ShardId, _s: SessionId, _limit: usize) -> Result<CloneBatch> {
            std::future::pending().await
        }
        async fn push_modifications(&self, _to: ShardId, _s: SessionId, _ops: Vec<SequencedOp>) -> Result<u64> {
            std::future::pending().await
        }
        async fn recipient_status(&self, _to: ShardId, _s: SessionId) -> Result<RecipientStatus> {
            std::future::pending().await
        }
        async fn start_commit(&self, _to: ShardId, _s: SessionId, _last_seq: u64) -> Result<()> {
            std::future::pending().await
        }
        async fn commit(&self, _to: ShardId, _s: SessionId) -> Result<()> {
            Ok(())
        }
        async fn abort(&self, _to: ShardId, _s: SessionId) -> Result<()> {
            Ok(())
        }
    }

    fn range(min: i64, max: i64) -> ChunkRange {
        ChunkRange::new(min, max).unwrap()
    }

    async fn donor() -> (Arc<DonorCoordinator>, Arc<ShardStore>) {
        donor_with(MigrationConfig::default()).await
    }

    async fn donor_with(config: MigrationConfig) -> (Arc<DonorCoordinator>, Arc<ShardStore>) {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata
            .install(
                "db.users",
                vec![
                    (ChunkRange::new(ShardKey::Min, 0).unwrap(), 2),
                    (range(0, 20), 1),
                    (range(20, 40), 1),
                    (ChunkRange::new(40, ShardKey::Max).unwrap(), 2),
                ],
            )
            .unwrap();
        let store = Arc::new(ShardStore::new(1));
        store.upsert_batch("db.users", (0..40).map(|i| Document::new(i, "v1")).collect());
        let cache = Arc::new(RangeOwnershipCache::new(1, metadata.clone()));
        let shutdown = CancellationToken::new();
        let cleanup = Arc::new(
            OrphanCleanupService::new(1, CleanupConfig::default(), store.clone(), cache.clone(), shutdown.clone())
                .await
                .unwrap(),
        );
        let clock = Arc::new(SystemClock);
        let locks = Arc::new(DistLockManager::new(
            "shard-1",
            clock.clone(),
            Arc::new(InMemoryLockCatalog::new(clock)),
            LockConfig::default(),
        ));
        let ctx = MigrationContext {
            shard: 1,
            config,
            store: store.clone(),
            cache,
            metadata,
            transport: Arc::new(Stalled),
            cleanup,
            metrics: Arc::new(MigrationMetrics::new()),
            shutdown,
        };
        let donor = Arc::new(DonorCoordinator::new(ctx, locks));
        let observer: Arc<dyn WriteObserver> = donor.clone();
        store.set_observer(Arc::downgrade(&observer));
        (donor, store)
    }

    #[tokio::test]
    async fn test_start_validates_ownership_and_overlap() {
        let (donor, _store) = donor().await;

        let err = donor.start_migration("db.users", range(-10, -5), 3).await.unwrap_err();
        assert_eq!(err.code(), "RangeNotOwned");

        let err = donor.start_migration("db.users", range(10, 30), 3).await.unwrap_err();
        assert_eq!(err.code(), "InvalidRange");

        let err = donor.start_migration("db.users", range(0, 20), 1).await.unwrap_err();
        assert_eq!(err.code(), "InvalidRange");

        let session = donor.start_migration("db.users", range(0, 20), 2).await.unwrap();
        assert_eq!(session.state, SessionState::Cloning);
        let err = donor.start_migration("db.users", range(20, 40), 2).await.unwrap_err();
        assert_eq!(err.code(), "MigrationAlreadyInProgress");
        assert_eq!(donor.active_session("db.users").unwrap().id, session.id);
    }

    #[tokio::test]
    async fn test_start_refuses_range_over_size_limit() {
        let (donor, _store) = donor_with(MigrationConfig::default().with_max_chunk_docs(19)).await;
        let err = donor.start_migration("db.users", range(0, 20), 2).await.unwrap_err();
        assert_eq!(err.code(), "ChunkTooBig");
        assert!(matches!(err, Error::ChunkTooBig { docs: 20, limit: 19, .. }));
        assert!(donor.active_session("db.users").is_none());

        // Exactly at the limit is fine.
        let (donor, _store) = donor_with(MigrationConfig::default().with_max_chunk_docs(20)).await;
        let session = donor.start_migration("db.users", range(0, 20), 2).await.unwrap();
        assert_eq!(session.state, SessionState::Cloning);
    }

    #[tokio::test]
    async fn test_writes_in_range_are_sequenced() {
        let (donor, store) = donor().await;
        let session = donor.start_migration("db.users", range(0, 20), 2).await.unwrap();

        for key in [5, 25, 7] {
            store
                .apply("db.users", WriteOp::Update(Document::new(key, "v2")), || Ok(()))
                .unwrap();
        }
        let live = donor.find(session.id).unwrap();
        let (ops, last) = live.take_pending();
        assert_eq!(last, 2);
        let keys: Vec<_> = ops.iter().map(|o| (o.seq, o.op.key().clone())).collect();
        assert_eq!(keys, vec![(1, ShardKey::Int(5)), (2, ShardKey::Int(7))]);
    }

    #[tokio::test]
    async fn test_critical_section_holds_writes_until_release() {
        let (donor, store) = donor().await;
        let session = donor.start_migration("db.users", range(0, 20), 2).await.unwrap();
        let live = donor.find(session.id).unwrap();
        live.enter_critical_section();

        let outcome = store
            .apply("db.users", WriteOp::Delete(ShardKey::Int(3)), || Ok(()))
            .unwrap();
        let WriteOutcome::Blocked(mut rx) = outcome else {
            panic!("write should be held back");
        };
        assert!(store.get("db.users", &ShardKey::Int(3)).is_some());
        // Outside the range writes proceed.
        assert!(matches!(
            store.apply("db.users", WriteOp::Delete(ShardKey::Int(30)), || Ok(())),
            Ok(WriteOutcome::Applied { existed: true })
        ));

        donor.release(&live);
        rx.wait_for(|released| *released).await.unwrap();
        assert!(donor.active_session("db.users").is_none());
    }

    #[tokio::test]
    async fn test_cancel_aborts_and_reports_code() {
        let (donor, _store) = donor().await;
        let (info, mut outcome) = donor.start("db.users", range(0, 20), 2).await.unwrap();
        donor.cancel(info.id).unwrap();

        let result = outcome.wait_for(|o| o.is_some()).await.unwrap().clone().unwrap();
        assert_eq!(result.unwrap_err().code(), "Aborted");
        assert!(donor.active_session("db.users").is_none());
        assert_eq!(donor.ctx.metrics.aborted_with("Aborted"), 1);
        assert!(matches!(donor.cancel(info.id), Err(Error::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_serve_clone_batch_pages_through_range() {
        let (donor, _store) = donor().await;
        let session = donor.start_migration("db.users", range(0, 20), 2).await.unwrap();

        let first = donor.serve_clone_batch(session.id, 15).unwrap();
        assert_eq!(first.docs.len(), 15);
        assert!(!first.done);
        let second = donor.serve_clone_batch(session.id, 15).unwrap();
        assert_eq!(second.docs.len(), 5);
        assert!(second.done);
        assert_eq!(second.docs[0].key, ShardKey::Int(15));
        assert_eq!(donor.ctx.metrics.snapshot().docs_cloned, 20);
    }
}
