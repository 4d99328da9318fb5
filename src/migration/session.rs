//! Migration session state shared by both sides of the protocol.

use crate::error::{Error, Result};
use crate::metadata::{ChunkRange, CollectionVersion};
use crate::types::{CollectionId, Document, ShardId, WriteOp};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Migration session identifier.
pub type SessionId = Uuid;

/// Donor-side session state.
///
/// ```text
/// Cloning ──► Catchup ──► Committing ──► Done
///    │           │            │
///    └───────────┴────────────┴────────► Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Recipient is pulling documents.
    Cloning,
    /// Donor is forwarding modifications until the recipient is close enough.
    Catchup,
    /// Writes are frozen and the metadata store is being updated.
    Committing,
    /// Ownership moved.
    Done,
    /// Gave up. Ownership unchanged.
    Aborted,
}

impl SessionState {
    /// Check if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Aborted)
    }

    /// Check if moving to `next` is allowed.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Cloning, Catchup) | (Catchup, Committing) | (Committing, Done)
        ) || (!self.is_terminal() && next == Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Cloning => "cloning",
            SessionState::Catchup => "catchup",
            SessionState::Committing => "committing",
            SessionState::Done => "done",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One range migration, as created by the donor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSession {
    /// Session id.
    pub id: SessionId,
    /// Collection being migrated.
    pub collection: CollectionId,
    /// Range being moved.
    pub range: ChunkRange,
    /// Current owner.
    pub donor: ShardId,
    /// Future owner.
    pub recipient: ShardId,
    /// Collection version the donor validated at start.
    pub expected_version: CollectionVersion,
    /// Donor-side state.
    pub state: SessionState,
}

impl MigrationSession {
    /// Create a session in the `Cloning` state.
    pub fn new(
        collection: impl Into<CollectionId>,
        range: ChunkRange,
        donor: ShardId,
        recipient: ShardId,
        expected_version: CollectionVersion,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            collection: collection.into(),
            range,
            donor,
            recipient,
            expected_version,
            state: SessionState::Cloning,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "invalid session transition {} -> {}",
                self.state, next
            )));
        }
        tracing::debug!(
            session_id = %self.id,
            from = %self.state,
            to = %next,
            "Session transition"
        );
        self.state = next;
        Ok(())
    }
}

/// Recipient-side state, tracked independently of the donor's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecipientState {
    /// Pulling clone batches; modifications are buffered.
    Cloning,
    /// Clone finished; modifications are applied as they arrive.
    Steady,
    /// Donor holds writes and is updating the metadata store. Donor silence
    /// no longer discards the range until the commit lock lease has run out.
    CommitPending,
    /// Commit confirmed by the metadata store.
    Done,
    /// Discarded.
    Aborted,
}

impl RecipientState {
    /// Check if the session still expects donor traffic.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RecipientState::Cloning | RecipientState::Steady | RecipientState::CommitPending
        )
    }
}

/// Answer to `recipientStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStatus {
    /// Whether the recipient still runs this session.
    pub active: bool,
    /// Recipient state, if the session is known.
    pub state: Option<RecipientState>,
    /// Range being received.
    pub range: Option<ChunkRange>,
    /// Modifications received but not yet applied.
    pub lag_estimate: u64,
    /// Highest modification sequence number applied.
    pub applied_seq: u64,
    /// Documents cloned so far.
    pub cloned_docs: u64,
}

impl RecipientStatus {
    /// Status for a session the recipient does not know.
    pub fn inactive() -> Self {
        Self {
            active: false,
            state: None,
            range: None,
            lag_estimate: 0,
            applied_seq: 0,
            cloned_docs: 0,
        }
    }
}

/// A forwarded write tagged with its position in the donor's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequencedOp {
    /// Position in the stream, starting at 1.
    pub seq: u64,
    /// The write.
    pub op: WriteOp,
}

/// One page of cloned documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneBatch {
    /// Documents in key order.
    pub docs: Vec<Document>,
    /// No more documents follow.
    pub done: bool,
}
