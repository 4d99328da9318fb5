//! Chunk placement metadata.
//!
//! The metadata store is the single source of truth for which shard owns
//! which key range. Shards and routers only ever hold cached projections.

mod chunk;
mod store;

pub use chunk::{Chunk, ChunkRange, CollectionMetadata, CollectionVersion};
pub use store::{InMemoryMetadataStore, MetadataStore};
