//! In-process cluster fixture and scenario suites.
//!
//! ```text
//!   Router ──► ShardNode 1 ─┐                 ┌─ InMemoryMetadataStore
//!          ──► ShardNode 2 ─┼─ LocalTransport ┤
//!          ──► ShardNode n ─┘  (failpoints)   └─ InMemoryLockCatalog (SkewedClock)
//! ```
//!
//! Every shard gets its own [`SkewedClock`] so tests can push one shard's
//! wall clock away from the catalog's.

mod utils;

pub(crate) use utils::{fast_config, wait_for_result, wait_until};

use crate::config::{LockConfig, RouterConfig, ShardConfig};
use crate::lock::{Clock, DistLockManager, InMemoryLockCatalog, SkewedClock};
use crate::metadata::{ChunkRange, CollectionMetadata, InMemoryMetadataStore, MetadataStore};
use crate::migration::{LocalTransport, MigrationHandler};
use crate::router::Router;
use crate::shard::{ShardNode, ShardService};
use crate::types::{Document, ShardId, ShardKey};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

/// Shards, metadata, lock catalog, transport and a router in one process.
pub(crate) struct TestCluster {
    metadata: Arc<InMemoryMetadataStore>,
    catalog: Arc<InMemoryLockCatalog>,
    transport: Arc<LocalTransport>,
    clocks: BTreeMap<ShardId, Arc<SkewedClock>>,
    nodes: BTreeMap<ShardId, Arc<ShardNode>>,
    router: Arc<Router>,
}

impl TestCluster {
    pub const COLLECTION: &'static str = "db.items";

    /// Cluster with [`fast_config`] on every shard. The collection starts as
    /// one chunk owned by the first shard.
    pub async fn new(shards: &[ShardId]) -> Self {
        Self::with_config(shards, |config| config).await
    }

    /// Cluster whose shard configs are passed through `tweak` first.
    pub async fn with_config(shards: &[ShardId], tweak: impl Fn(ShardConfig) -> ShardConfig) -> Self {
        let metadata = Arc::new(InMemoryMetadataStore::new());
        metadata
            .create_collection(Self::COLLECTION, shards[0])
            .await
            .unwrap();

        let catalog_clock: Arc<dyn Clock> = Arc::new(SkewedClock::new(0));
        let catalog = Arc::new(InMemoryLockCatalog::new(catalog_clock));
        let transport = Arc::new(LocalTransport::new());
        let router = Arc::new(Router::new(
            RouterConfig::default().with_max_stale_retries(5),
            metadata.clone(),
        ));

        let mut clocks = BTreeMap::new();
        let mut nodes = BTreeMap::new();
        for &id in shards {
            let clock = Arc::new(SkewedClock::new(0));
            let node = ShardNode::new(
                tweak(fast_config(id)),
                metadata.clone(),
                catalog.clone(),
                clock.clone(),
                transport.clone(),
            )
            .await
            .unwrap();
            node.start().await.unwrap();

            let handler: Arc<dyn MigrationHandler> = node.clone();
            transport.register(id, &handler);
            router.add_shard(node.clone());
            clocks.insert(id, clock);
            nodes.insert(id, node);
        }

        Self {
            metadata,
            catalog,
            transport,
            clocks,
            nodes,
            router,
        }
    }

    /// Replace the chunk layout. The new layout gets a fresh epoch.
    pub async fn seed_layout(&self, layout: &[(ChunkRange, ShardId)]) {
        self.metadata
            .install(Self::COLLECTION, layout.to_vec())
            .unwrap();
        self.router.refresh(Self::COLLECTION).await.unwrap();
    }

    /// Store documents with keys in `keys` directly on `shard`.
    pub fn seed(&self, shard: ShardId, keys: Range<i64>) {
        let docs = keys.map(|k| Document::new(k, format!("doc-{}", k))).collect();
        self.node(shard).store().upsert_batch(Self::COLLECTION, docs);
    }

    pub fn node(&self, id: ShardId) -> Arc<ShardNode> {
        self.nodes[&id].clone()
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn metadata(&self) -> Arc<InMemoryMetadataStore> {
        self.metadata.clone()
    }

    pub fn transport(&self) -> &Arc<LocalTransport> {
        &self.transport
    }

    /// Lock client for a process outside the cluster, sharing its catalog.
    pub fn lock_client(&self, process: &str) -> DistLockManager {
        DistLockManager::new(
            process,
            Arc::new(SkewedClock::new(0)),
            self.catalog.clone(),
            LockConfig::default(),
        )
    }

    pub fn clock(&self, id: ShardId) -> &Arc<SkewedClock> {
        &self.clocks[&id]
    }

    /// Documents stored on `shard` in `range`, owned or not.
    pub fn count_in_range(&self, shard: ShardId, range: &ChunkRange) -> usize {
        self.nodes[&shard].store().count(Self::COLLECTION, Some(range))
    }

    pub async fn layout(&self) -> CollectionMetadata {
        self.metadata.read_chunks(Self::COLLECTION).await.unwrap()
    }

    /// Check that the shards' own ownership reports tile the key space
    /// exactly once and agree with the metadata store.
    pub async fn assert_ownership_consistent(&self) {
        let layout = self.layout().await;
        layout.validate().unwrap();

        let mut owned: Vec<(ChunkRange, ShardId)> = Vec::new();
        for (&id, node) in &self.nodes {
            let report = node.get_range_ownership(Self::COLLECTION).await.unwrap();
            assert_eq!(report.version, layout.version(), "shard {} is behind", id);
            owned.extend(report.owned_ranges.into_iter().map(|r| (r, id)));
        }
        owned.sort_by(|a, b| a.0.min.cmp(&b.0.min));

        let mut expected_min = ShardKey::Min;
        for (range, id) in &owned {
            assert_eq!(range.min, expected_min, "gap or overlap before {} on shard {}", range, id);
            assert_eq!(layout.owner_of(&range.min), Some(*id));
            expected_min = range.max.clone();
        }
        assert_eq!(expected_min, ShardKey::Max);
    }

    pub async fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown().await;
        }
    }
}
