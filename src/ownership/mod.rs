//! Range ownership cache.
//!
//! Each shard keeps an immutable [`OwnershipSnapshot`] per collection,
//! projected from the metadata store and augmented with the ranges the shard
//! is currently receiving:
//!
//! ```text
//!   key space:  Min ----- 0 ----- 20 ----- 40 ----- Max
//!   owned:      |  Owned  |               |  Owned  |
//!   pending:              | Pending |
//!   orphans:                        |Unowned|
//! ```
//!
//! Refreshes swap in a new snapshot atomically; readers keep whichever
//! snapshot they already hold.

mod cache;
mod snapshot;

pub use cache::{RangeOwnershipCache, RangeOwnershipReport};
pub use snapshot::{OwnershipSnapshot, RangeStatus};
