//! Shard-to-shard messaging for migrations.
//!
//! The donor drives `begin_clone`, `push_modifications`, `recipient_status`,
//! `start_commit`, `commit` and `abort`; the recipient pulls documents with
//! `clone_batch`.
//! [`LocalTransport`] connects shards living in one process and carries the
//! failpoints the scenario tests use.

use super::session::{CloneBatch, MigrationSession, RecipientStatus, SequencedOp, SessionId};
use crate::error::{Error, Result};
use crate::types::ShardId;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};
use tokio::sync::Semaphore;

/// Client side of the shard-to-shard protocol.
#[async_trait::async_trait]
pub trait ShardTransport: Send + Sync + std::fmt::Debug {
    /// Ask `to` to start receiving `session`.
    async fn begin_clone(&self, to: ShardId, session: MigrationSession) -> Result<()>;

    /// Pull the next page of documents from donor `to`.
    async fn clone_batch(&self, to: ShardId, session: SessionId, limit: usize) -> Result<CloneBatch>;

    /// Forward modifications to recipient `to`. Returns the highest sequence
    /// number it has received.
    async fn push_modifications(
        &self,
        to: ShardId,
        session: SessionId,
        ops: Vec<SequencedOp>,
    ) -> Result<u64>;

    /// Query recipient progress. Doubles as the donor heartbeat.
    async fn recipient_status(&self, to: ShardId, session: SessionId) -> Result<RecipientStatus>;

    /// Announce the metadata write. The recipient accepts only if it has
    /// applied every modification up to `last_seq`.
    async fn start_commit(&self, to: ShardId, session: SessionId, last_seq: u64) -> Result<()>;

    /// Tell the recipient the metadata store committed the move.
    async fn commit(&self, to: ShardId, session: SessionId) -> Result<()>;

    /// Tell the recipient the donor aborted.
    async fn abort(&self, to: ShardId, session: SessionId) -> Result<()>;
}

/// Server side of the shard-to-shard protocol.
#[async_trait::async_trait]
pub trait MigrationHandler: Send + Sync {
    /// Recipient: start receiving.
    async fn handle_begin_clone(&self, session: MigrationSession) -> Result<()>;

    /// Donor: serve the next clone page.
    async fn handle_clone_batch(&self, session: SessionId, limit: usize) -> Result<CloneBatch>;

    /// Recipient: accept forwarded modifications.
    async fn handle_push_modifications(&self, session: SessionId, ops: Vec<SequencedOp>) -> Result<u64>;

    /// Recipient: report progress.
    async fn handle_recipient_status(&self, session: SessionId) -> Result<RecipientStatus>;

    /// Recipient: get ready for the metadata write.
    async fn handle_start_commit(&self, session: SessionId, last_seq: u64) -> Result<()>;

    /// Recipient: finish after the donor committed.
    async fn handle_commit(&self, session: SessionId) -> Result<()>;

    /// Recipient: discard the session.
    async fn handle_abort(&self, session: SessionId) -> Result<()>;
}

/// In-process transport.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<ShardId, Weak<dyn MigrationHandler>>,
    unreachable: DashSet<ShardId>,
    clone_gates: DashMap<ShardId, Arc<Semaphore>>,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("shards", &self.handlers.len())
            .field("unreachable", &self.unreachable.len())
            .finish()
    }
}

impl LocalTransport {
    /// Create an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `shard` to `handler`.
    pub fn register(&self, shard: ShardId, handler: &Arc<dyn MigrationHandler>) {
        self.handlers.insert(shard, Arc::downgrade(handler));
    }

    /// Make every message to `shard` fail, or restore it.
    pub fn set_unreachable(&self, shard: ShardId, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(shard);
        } else {
            self.unreachable.remove(&shard);
        }
    }

    /// Let only `permits` more clone batches through from donor `shard`;
    /// later requests wait until [`release_clone_gate`](Self::release_clone_gate).
    pub fn set_clone_gate(&self, shard: ShardId, permits: usize) {
        self.clone_gates.insert(shard, Arc::new(Semaphore::new(permits)));
    }

    /// Open the clone gate of `shard` for good.
    pub fn release_clone_gate(&self, shard: ShardId) {
        if let Some((_, gate)) = self.clone_gates.remove(&shard) {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    fn handler(&self, to: ShardId) -> Result<Arc<dyn MigrationHandler>> {
        if self.unreachable.contains(&to) {
            return Err(Error::RecipientUnavailable(to));
        }
        self.handlers
            .get(&to)
            .and_then(|h| h.upgrade())
            .ok_or(Error::RecipientUnavailable(to))
    }
}

#[async_trait::async_trait]
impl ShardTransport for LocalTransport {
    async fn begin_clone(&self, to: ShardId, session: MigrationSession) -> Result<()> {
        self.handler(to)?.handle_begin_clone(session).await
    }

    async fn clone_batch(&self, to: ShardId, session: SessionId, limit: usize) -> Result<CloneBatch> {
        let gate = self.clone_gates.get(&to).map(|g| g.clone());
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        self.handler(to)?.handle_clone_batch(session, limit).await
    }

    async fn push_modifications(
        &self,
        to: ShardId,
        session: SessionId,
        ops: Vec<SequencedOp>,
    ) -> Result<u64> {
        self.handler(to)?.handle_push_modifications(session, ops).await
    }

    async fn recipient_status(&self, to: ShardId, session: SessionId) -> Result<RecipientStatus> {
        self.handler(to)?.handle_recipient_status(session).await
    }

    async fn start_commit(&self, to: ShardId, session: SessionId, last_seq: u64) -> Result<()> {
        self.handler(to)?.handle_start_commit(session, last_seq).await
    }

    async fn commit(&self, to: ShardId, session: SessionId) -> Result<()> {
        self.handler(to)?.handle_commit(session).await
    }

    async fn abort(&self, to: ShardId, session: SessionId) -> Result<()> {
        self.handler(to)?.handle_abort(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ChunkRange, CollectionVersion};
    use crate::types::Document;
    use parking_lot::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct Echo {
        begun: Mutex<Vec<SessionId>>,
    }

    #[async_trait::async_trait]
    impl MigrationHandler for Echo {
        async fn handle_begin_clone(&self, session: MigrationSession) -> Result<()> {
            self.begun.lock().push(session.id);
            Ok(())
        }

        async fn handle_clone_batch(&self, _session: SessionId, limit: usize) -> Result<CloneBatch> {
            Ok(CloneBatch {
                docs: (0..limit as i64).map(|i| Document::new(i, "x")).collect(),
                done: false,
            })
        }

        async fn handle_push_modifications(&self, _session: SessionId, ops: Vec<SequencedOp>) -> Result<u64> {
            Ok(ops.last().map(|o| o.seq).unwrap_or(0))
        }

        async fn handle_recipient_status(&self, _session: SessionId) -> Result<RecipientStatus> {
            Ok(RecipientStatus::inactive())
        }

        async fn handle_start_commit(&self, _session: SessionId, _last_seq: u64) -> Result<()> {
            Ok(())
        }

        async fn handle_commit(&self, _session: SessionId) -> Result<()> {
            Ok(())
        }

        async fn handle_abort(&self, _session: SessionId) -> Result<()> {
            Ok(())
        }
    }

    fn session() -> MigrationSession {
        MigrationSession::new(
            "db.users",
            ChunkRange::new(0, 20).unwrap(),
            1,
            2,
            CollectionVersion::initial(Uuid::new_v4()),
        )
    }

    #[tokio::test]
    async fn test_routes_to_registered_handler() {
        let transport = LocalTransport::new();
        let echo = Arc::new(Echo::default());
        let handler: Arc<dyn MigrationHandler> = echo.clone();
        transport.register(2, &handler);

        let s = session();
        transport.begin_clone(2, s.clone()).await.unwrap();
        assert_eq!(echo.begun.lock().as_slice(), &[s.id]);

        let err = transport.begin_clone(3, s).await.unwrap_err();
        assert_eq!(err.code(), "RecipientUnavailable");
    }

    #[tokio::test]
    async fn test_unreachable_and_dropped_handlers() {
        let transport = LocalTransport::new();
        let handler: Arc<dyn MigrationHandler> = Arc::new(Echo::default());
        transport.register(2, &handler);

        transport.set_unreachable(2, true);
        assert!(transport.recipient_status(2, Uuid::new_v4()).await.is_err());
        transport.set_unreachable(2, false);
        assert!(transport.recipient_status(2, Uuid::new_v4()).await.is_ok());

        drop(handler);
        assert!(matches!(
            transport.commit(2, Uuid::new_v4()).await,
            Err(Error::RecipientUnavailable(2))
        ));
    }

    #[tokio::test]
    async fn test_clone_gate_blocks_after_permits() {
        let transport = Arc::new(LocalTransport::new());
        let handler: Arc<dyn MigrationHandler> = Arc::new(Echo::default());
        transport.register(1, &handler);
        transport.set_clone_gate(1, 1);

        let id = Uuid::new_v4();
        transport.clone_batch(1, id, 2).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(30), transport.clone_batch(1, id, 2)).await;
        assert!(blocked.is_err());

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.clone_batch(1, id, 2).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.release_clone_gate(1);
        assert_eq!(pending.await.unwrap().unwrap().docs.len(), 2);
    }
}
