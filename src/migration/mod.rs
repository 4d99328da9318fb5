//! Chunk migration protocol: donor coordinator and recipient worker.
//!
//! ```text
//!  Donor                                   Recipient
//!  ─────                                   ─────────
//!  start_migration
//!    │ begin_clone ──────────────────────► register pending range
//!    │                                     spawn clone task + watchdog
//!    │ ◄────────────────────── clone_batch (pull, until done)
//!    │ push_modifications ───────────────► buffer (cloning) / apply (steady)
//!    │ recipient_status ─────────────────► lag, applied seq   (heartbeat)
//!    │
//!    │ critical section: flush, wait for applied == sent
//!    │ lock
//!    │ start_commit ─────────────────────► check applied, hold range
//!    │ commitChunkMove (CAS)
//!    │ refresh cache, release writes
//!    │ commit ───────────────────────────► refresh, promote pending
//!    │ schedule range deletion
//! ```
//!
//! Either side may give up on its own. The donor never waits for the
//! recipient to acknowledge an abort; the recipient discards after a
//! heartbeat timeout, and orphan cleanup removes whatever is left.

mod donor;
mod metrics;
mod recipient;
mod session;
mod transport;

pub use donor::DonorCoordinator;
pub use metrics::{MigrationMetrics, MigrationMetricsSnapshot};
pub use recipient::RecipientWorker;
pub use session::{
    CloneBatch, MigrationSession, RecipientState, RecipientStatus, SequencedOp, SessionId,
    SessionState,
};
pub use transport::{LocalTransport, MigrationHandler, ShardTransport};

use crate::cleanup::OrphanCleanupService;
use crate::config::MigrationConfig;
use crate::metadata::MetadataStore;
use crate::ownership::RangeOwnershipCache;
use crate::storage::ShardStore;
use crate::types::ShardId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shard-local collaborators shared by the donor and recipient roles.
#[derive(Debug, Clone)]
pub struct MigrationContext {
    pub shard: ShardId,
    pub config: MigrationConfig,
    pub store: Arc<ShardStore>,
    pub cache: Arc<RangeOwnershipCache>,
    pub metadata: Arc<dyn MetadataStore>,
    pub transport: Arc<dyn ShardTransport>,
    pub cleanup: Arc<OrphanCleanupService>,
    pub metrics: Arc<MigrationMetrics>,
    /// Cancelled when the shard shuts down.
    pub shutdown: CancellationToken,
}
