//! Distributed lock serializing metadata mutations per collection.
//!
//! Locks are leases recorded in a shared [`LockCatalog`]. A crashed holder
//! never wedges a resource: once its lease expires in catalog time, the next
//! acquirer takes over.

mod catalog;
mod clock;
mod manager;

pub use catalog::{InMemoryLockCatalog, LockCatalog, LockDocument, LockState, PingRecord};
pub use clock::{Clock, SkewedClock, SystemClock};
pub use manager::{DistLockManager, LockHandle};
