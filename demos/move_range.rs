//! Example moving a key range between two shards under live writes.
//!
//! This example shows how to:
//! - Wire shards, a metadata store, a lock catalog and a router in one process
//! - Move a range while a writer keeps inserting into it
//! - Inspect range ownership on both sides
//! - Clean up orphaned documents and export metrics
//!
//! Run with:
//!   RUST_LOG=rangeshift=debug cargo run --example move_range

use rangeshift::lock::{InMemoryLockCatalog, SystemClock};
use rangeshift::metadata::{InMemoryMetadataStore, MetadataStore};
use rangeshift::migration::{LocalTransport, MigrationHandler};
use rangeshift::{
    ChunkRange, CleanupConfig, Document, MigrationConfig, Router, RouterConfig, ShardConfig,
    ShardKey, ShardNode,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const COLLECTION: &str = "demo.orders";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rangeshift=info")),
        )
        .init();

    println!("===========================================");
    println!("         Range Migration Example");
    println!("===========================================");
    println!();

    let metadata = Arc::new(InMemoryMetadataStore::new());
    metadata.create_collection(COLLECTION, 1).await?;
    let version = metadata.read_chunks(COLLECTION).await?.version();
    metadata
        .split_chunk(COLLECTION, &ShardKey::Int(1_000), version)
        .await?;

    let clock = Arc::new(SystemClock);
    let catalog = Arc::new(InMemoryLockCatalog::new(clock.clone()));
    let transport = Arc::new(LocalTransport::new());
    let router = Arc::new(Router::new(RouterConfig::default(), metadata.clone()));

    let mut shards = Vec::new();
    for id in [1, 2] {
        let config = ShardConfig::new(id)
            .with_migration_config(
                MigrationConfig::default()
                    .with_clone_batch_size(50)
                    .with_wait_for_delete(true),
            )
            .with_cleanup_config(
                CleanupConfig::default().with_range_deletion_delay(Duration::from_millis(100)),
            );
        let node = ShardNode::new(
            config,
            metadata.clone(),
            catalog.clone(),
            clock.clone(),
            transport.clone(),
        )
        .await?;
        node.start().await?;
        let handler: Arc<dyn MigrationHandler> = node.clone();
        transport.register(id, &handler);
        router.add_shard(node.clone());
        shards.push(node);
    }

    // Part 1: seed
    for key in 0..500i64 {
        router
            .insert(COLLECTION, Document::new(key, format!("order-{}", key)))
            .await?;
    }
    println!("Seeded 500 documents on shard 1");

    // Part 2: move [Min, 1000) to shard 2 while a writer keeps going
    let writer = tokio::spawn({
        let router = router.clone();
        async move {
            for key in 500..800i64 {
                router
                    .insert(COLLECTION, Document::new(key, format!("order-{}", key)))
                    .await?;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            Ok::<_, rangeshift::Error>(())
        }
    });

    let range = ChunkRange::new(ShardKey::Min, 1_000)?;
    let version = router.move_range(COLLECTION, range, 2).await?;
    writer.await??;
    println!("Move committed at version {}", version);
    println!();

    // Part 3: ownership on both shards
    for shard in &shards {
        let report = router.get_range_ownership(COLLECTION, shard.id()).await?;
        println!(
            "  shard {}: version {} owned {:?} pending {:?}",
            shard.id(),
            report.shard_version,
            report.owned_ranges.iter().map(|r| r.to_string()).collect::<Vec<_>>(),
            report.pending_ranges,
        );
    }
    println!("  routed count: {}", router.count(COLLECTION).await?);
    println!();

    // Part 4: cleanup and metrics
    for shard in &shards {
        let stats = router.cleanup_orphans(COLLECTION, shard.id(), None).await?;
        println!(
            "  shard {} cleanup: scanned {} deleted {}",
            shard.id(),
            stats.scanned,
            stats.deleted
        );
    }
    println!();
    println!("{}", shards[0].render_metrics());

    for shard in &shards {
        shard.shutdown().await;
    }
    Ok(())
}
