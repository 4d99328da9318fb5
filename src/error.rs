//! Error types for range migration.

use crate::metadata::{ChunkRange, CollectionVersion};
use crate::types::ShardId;
use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the migration subsystem.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The shard does not own the requested range (per the metadata store).
    #[error("range {range} of {collection} is not owned by shard {shard}")]
    RangeNotOwned {
        collection: String,
        range: ChunkRange,
        shard: ShardId,
    },

    /// The range holds more documents than a single move may carry.
    #[error("range {range} of {collection} holds {docs} documents, limit is {limit}")]
    ChunkTooBig {
        collection: String,
        range: ChunkRange,
        docs: u64,
        limit: u64,
    },

    /// Another session already covers an overlapping range.
    #[error("migration already in progress for {collection} range {range}")]
    MigrationAlreadyInProgress { collection: String, range: ChunkRange },

    /// Compare-and-swap on the collection version failed.
    #[error("version mismatch: expected {expected}, found {actual}")]
    VersionMismatch {
        expected: CollectionVersion,
        actual: CollectionVersion,
    },

    /// Clock skew against the current lock holder exceeds tolerance.
    #[error("clock skew of {skew_ms}ms exceeds tolerance of {tolerance_ms}ms")]
    ClockSkewTooHigh { skew_ms: i64, tolerance_ms: i64 },

    /// The recipient shard cannot be reached.
    #[error("recipient shard {0} unavailable")]
    RecipientUnavailable(ShardId),

    /// The migration was aborted.
    #[error("migration aborted: {0}")]
    Aborted(String),

    /// The caller's routing information is stale for this shard.
    #[error("stale shard version for {collection}: wanted {wanted:?}, received {received:?}")]
    StaleShardVersion {
        collection: String,
        wanted: Option<CollectionVersion>,
        received: Option<CollectionVersion>,
    },

    /// The lock is held by another process.
    #[error("lock {resource} busy, held by {holder}")]
    LockBusy { resource: String, holder: String },

    /// The lock could not be acquired before the deadline.
    #[error("timed out acquiring lock {resource}: {last_error}")]
    LockTimeout {
        resource: String,
        last_error: Box<Error>,
    },

    /// The lock handle no longer matches the catalog.
    #[error("lock {0} not held")]
    LockNotHeld(String),

    /// No session with this id.
    #[error("migration session not found: {0}")]
    SessionNotFound(Uuid),

    /// The collection is not sharded.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// Unknown shard.
    #[error("shard not found: {0}")]
    ShardNotFound(ShardId),

    /// Range bounds are malformed or do not line up with chunk boundaries.
    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Local persistence errors.
    #[error("storage error: {0}")]
    Storage(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error taxonomy used to decide how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Lock unavailable, version mismatch, overlapping session. Retried locally.
    Coordination,
    /// Peer unreachable or silent. Causes a unilateral abort.
    Availability,
    /// Caller is routing with stale ownership. Refresh and retry.
    Consistency,
    /// Operator or shutdown cancellation.
    Cancellation,
    /// Everything else.
    Internal,
}

impl Error {
    /// Stable error code surfaced to router callers.
    pub fn code(&self) -> &'static str {
        match self {
            Error::RangeNotOwned { .. } => "RangeNotOwned",
            Error::ChunkTooBig { .. } => "ChunkTooBig",
            Error::MigrationAlreadyInProgress { .. } => "MigrationAlreadyInProgress",
            Error::VersionMismatch { .. } => "VersionMismatch",
            Error::ClockSkewTooHigh { .. } => "ClockSkewTooHigh",
            Error::RecipientUnavailable(_) => "RecipientUnavailable",
            Error::Aborted(_) | Error::Cancelled => "Aborted",
            Error::StaleShardVersion { .. } => "StaleShardVersion",
            Error::LockBusy { .. } | Error::LockNotHeld(_) => "LockBusy",
            Error::LockTimeout { last_error, .. } => last_error.code(),
            Error::SessionNotFound(_) => "SessionNotFound",
            Error::CollectionNotFound(_) => "NamespaceNotFound",
            Error::ShardNotFound(_) => "ShardNotFound",
            Error::InvalidRange(_) => "InvalidRange",
            Error::Config(_) => "BadConfig",
            Error::Timeout(_) => "ExceededTimeLimit",
            Error::Storage(_) | Error::Internal(_) => "InternalError",
        }
    }

    /// Classify this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::MigrationAlreadyInProgress { .. }
            | Error::VersionMismatch { .. }
            | Error::ClockSkewTooHigh { .. }
            | Error::LockBusy { .. }
            | Error::LockTimeout { .. }
            | Error::LockNotHeld(_) => ErrorCategory::Coordination,
            Error::RecipientUnavailable(_) | Error::Timeout(_) | Error::ShardNotFound(_) => {
                ErrorCategory::Availability
            }
            Error::RangeNotOwned { .. } | Error::StaleShardVersion { .. } => {
                ErrorCategory::Consistency
            }
            Error::Aborted(_) | Error::Cancelled => ErrorCategory::Cancellation,
            _ => ErrorCategory::Internal,
        }
    }

    /// Check if retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockBusy { .. }
                | Error::ClockSkewTooHigh { .. }
                | Error::StaleShardVersion { .. }
                | Error::VersionMismatch { .. }
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Storage(format!("serialization: {}", e))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}
