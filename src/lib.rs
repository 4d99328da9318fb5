//! Live migration of key ranges between shards.
//!
//! A partitioned collection is split into contiguous chunks, each owned by
//! one shard. This crate moves a chunk (or part of one) from a donor shard to
//! a recipient while the collection keeps serving reads and writes:
//!
//! - **Metadata store**: versioned chunk layout per collection, updated by
//!   compare-and-swap
//! - **Range ownership cache**: each shard's immutable snapshot of what it
//!   owns and what it is receiving
//! - **Donor coordinator / recipient worker**: clone, catch-up, commit
//! - **Distributed lock**: lease-based, refuses holders with skewed clocks
//! - **Orphan cleanup**: batched, resumable removal of documents a shard no
//!   longer owns
//!
//! # Example
//!
//! ```rust,no_run
//! use rangeshift::lock::{InMemoryLockCatalog, SystemClock};
//! use rangeshift::metadata::{ChunkRange, InMemoryMetadataStore, MetadataStore};
//! use rangeshift::migration::{LocalTransport, MigrationHandler};
//! use rangeshift::{Router, RouterConfig, ShardConfig, ShardKey, ShardNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let metadata = Arc::new(InMemoryMetadataStore::new());
//!     metadata.create_collection("db.users", 1).await?;
//!     let version = metadata.read_chunks("db.users").await?.version();
//!     metadata.split_chunk("db.users", &ShardKey::Int(100), version).await?;
//!
//!     let clock = Arc::new(SystemClock);
//!     let catalog = Arc::new(InMemoryLockCatalog::new(clock.clone()));
//!     let transport = Arc::new(LocalTransport::new());
//!     let router = Router::new(RouterConfig::default(), metadata.clone());
//!
//!     let mut shards = Vec::new();
//!     for id in [1, 2] {
//!         let node = ShardNode::new(
//!             ShardConfig::new(id),
//!             metadata.clone(),
//!             catalog.clone(),
//!             clock.clone(),
//!             transport.clone(),
//!         )
//!         .await?;
//!         let handler: Arc<dyn MigrationHandler> = node.clone();
//!         transport.register(id, &handler);
//!         router.add_shard(node.clone());
//!         shards.push(node);
//!     }
//!
//!     // Move keys below 100 to shard 2 while the collection stays live.
//!     let range = ChunkRange::new(ShardKey::Min, 100)?;
//!     let version = router.move_range("db.users", range, 2).await?;
//!     println!("committed at {}", version);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              │            Router            │
//!              │ routing tables, stale retry  │
//!              └──────────────────────────────┘
//!                  │                      │
//!                  ▼                      ▼
//!        ┌──────────────────┐   ┌──────────────────┐
//!        │   Shard (donor)  │◄─►│ Shard (recipient)│   ShardTransport
//!        │ DonorCoordinator │   │ RecipientWorker  │
//!        │ OwnershipCache   │   │ OwnershipCache   │
//!        │ OrphanCleanup    │   │ OrphanCleanup    │
//!        └──────────────────┘   └──────────────────┘
//!                  │                      │
//!                  ▼                      ▼
//!        ┌──────────────────┐   ┌──────────────────┐
//!        │  MetadataStore   │   │   LockCatalog    │
//!        │ chunks + version │   │ leases + pings   │
//!        └──────────────────┘   └──────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Ownership**: the metadata store is authoritative; a range changes
//!   owner only through a compare-and-swap commit under the collection lock
//! - **Routing**: every request carries the router's shard version and is
//!   rejected with `StaleShardVersion` when the shard disagrees
//! - **Leftovers**: aborted or superseded copies are never served and are
//!   removed by orphan cleanup

pub mod cleanup;
pub mod config;
pub mod error;
pub mod lock;
pub mod metadata;
pub mod metrics;
pub mod migration;
pub mod ownership;
pub mod router;
pub mod shard;
pub mod storage;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::{CleanupConfig, LockConfig, MigrationConfig, RouterConfig, ShardConfig};
pub use error::{Error, ErrorCategory, Result};
pub use router::Router;
pub use shard::{ShardNode, ShardService};
pub use types::{CollectionId, Document, ShardId, ShardKey, WriteOp};

// Re-export protocol types
pub use cleanup::{CleanupStats, OrphanCleanupService, RangeDeletionTask};
pub use metadata::{Chunk, ChunkRange, CollectionMetadata, CollectionVersion, MetadataStore};
pub use migration::{MigrationSession, SessionId, SessionState};
pub use ownership::{RangeOwnershipCache, RangeOwnershipReport, RangeStatus};

// Re-export metrics types
pub use metrics::{Counter, Gauge, Histogram, HistogramSnapshot};
