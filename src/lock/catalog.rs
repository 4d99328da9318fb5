//! Lock catalog: the shared collection of lock documents and process pings.
//!
//! All lease arithmetic uses the catalog's own clock, so a holder with a
//! skewed clock can neither extend nor shorten a lease it does not own.

use super::clock::Clock;
use crate::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lock document state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    /// Free. `holder` names the last process that held it.
    Unlocked,
    /// Held until `expires_at_ms`.
    Locked,
}

/// One lock document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDocument {
    /// Locked resource, usually a collection name.
    pub resource: String,
    /// Current or last holder process.
    pub holder: String,
    /// Id of the current lease.
    pub lock_id: Uuid,
    /// Lock state.
    pub state: LockState,
    /// Lease expiry in catalog time.
    pub expires_at_ms: i64,
    /// Reason given by the holder.
    pub why: String,
}

impl LockDocument {
    /// Check if the lease is still live at catalog time `now_ms`.
    pub fn is_held_at(&self, now_ms: i64) -> bool {
        self.state == LockState::Locked && self.expires_at_ms > now_ms
    }
}

/// Last ping of a process: its local time and the catalog time at arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRecord {
    /// Process-local wall time when the ping was sent.
    pub local_ms: i64,
    /// Catalog wall time when the ping arrived.
    pub catalog_ms: i64,
}

impl PingRecord {
    /// Offset of the process clock against the catalog clock.
    pub fn offset_ms(&self) -> i64 {
        self.local_ms - self.catalog_ms
    }
}

/// Shared store of lock documents.
#[async_trait::async_trait]
pub trait LockCatalog: Send + Sync + std::fmt::Debug {
    /// Record a ping from `process` carrying its local time.
    async fn ping(&self, process: &str, local_ms: i64) -> Result<PingRecord>;

    /// Last ping of `process`.
    async fn last_ping(&self, process: &str) -> Result<Option<PingRecord>>;

    /// Current lock document of `resource`.
    async fn get_lock(&self, resource: &str) -> Result<Option<LockDocument>>;

    /// Take the lock if it is free or its lease expired.
    ///
    /// Returns `None` if another process holds a live lease.
    async fn try_grab(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        why: &str,
    ) -> Result<Option<LockDocument>>;

    /// Extend the lease identified by `lock_id`.
    async fn renew(&self, resource: &str, lock_id: Uuid, ttl: Duration) -> Result<Option<LockDocument>>;

    /// Free the lease identified by `lock_id`. Returns whether it was held.
    async fn unlock(&self, resource: &str, lock_id: Uuid) -> Result<bool>;
}

/// In-memory lock catalog.
#[derive(Debug)]
pub struct InMemoryLockCatalog {
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, LockDocument>>,
    pings: Mutex<HashMap<String, PingRecord>>,
}

impl InMemoryLockCatalog {
    /// Create a catalog running on `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            locks: Mutex::new(HashMap::new()),
            pings: Mutex::new(HashMap::new()),
        }
    }

    fn lease_end(&self, ttl: Duration) -> i64 {
        self.clock.now_ms() + ttl.as_millis() as i64
    }
}

#[async_trait::async_trait]
impl LockCatalog for InMemoryLockCatalog {
    async fn ping(&self, process: &str, local_ms: i64) -> Result<PingRecord> {
        let record = PingRecord {
            local_ms,
            catalog_ms: self.clock.now_ms(),
        };
        self.pings.lock().insert(process.to_string(), record);
        Ok(record)
    }

    async fn last_ping(&self, process: &str) -> Result<Option<PingRecord>> {
        Ok(self.pings.lock().get(process).copied())
    }

    async fn get_lock(&self, resource: &str) -> Result<Option<LockDocument>> {
        Ok(self.locks.lock().get(resource).cloned())
    }

    async fn try_grab(
        &self,
        resource: &str,
        holder: &str,
        ttl: Duration,
        why: &str,
    ) -> Result<Option<LockDocument>> {
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock();
        if let Some(existing) = locks.get(resource) {
            if existing.is_held_at(now) {
                return Ok(None);
            }
            if existing.state == LockState::Locked {
                tracing::warn!(
                    resource,
                    previous = %existing.holder,
                    holder,
                    "Taking over expired lock"
                );
            }
        }
        let doc = LockDocument {
            resource: resource.to_string(),
            holder: holder.to_string(),
            lock_id: Uuid::new_v4(),
            state: LockState::Locked,
            expires_at_ms: self.lease_end(ttl),
            why: why.to_string(),
        };
        locks.insert(resource.to_string(), doc.clone());
        Ok(Some(doc))
    }

    async fn renew(&self, resource: &str, lock_id: Uuid, ttl: Duration) -> Result<Option<LockDocument>> {
        let now = self.clock.now_ms();
        let mut locks = self.locks.lock();
        match locks.get_mut(resource) {
            Some(doc) if doc.lock_id == lock_id && doc.is_held_at(now) => {
                doc.expires_at_ms = self.lease_end(ttl);
                Ok(Some(doc.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn unlock(&self, resource: &str, lock_id: Uuid) -> Result<bool> {
        let mut locks = self.locks.lock();
        match locks.get_mut(resource) {
            Some(doc) if doc.lock_id == lock_id && doc.state == LockState::Locked => {
                doc.state = LockState::Unlocked;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::clock::SkewedClock;

    #[tokio::test]
    async fn test_grab_respects_live_lease() {
        let clock = Arc::new(SkewedClock::default());
        let catalog = InMemoryLockCatalog::new(clock.clone());

        let first = catalog
            .try_grab("db.users", "a", Duration::from_secs(10), "move")
            .await
            .unwrap()
            .unwrap();
        assert!(catalog
            .try_grab("db.users", "b", Duration::from_secs(10), "move")
            .await
            .unwrap()
            .is_none());

        // Lease expires in catalog time.
        clock.advance_ms(11_000);
        let second = catalog
            .try_grab("db.users", "b", Duration::from_secs(10), "move")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.lock_id, second.lock_id);
        assert!(!catalog.unlock("db.users", first.lock_id).await.unwrap());
        assert!(catalog.renew("db.users", first.lock_id, Duration::from_secs(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unlock_keeps_last_holder() {
        let catalog = InMemoryLockCatalog::new(Arc::new(SkewedClock::default()));
        let doc = catalog
            .try_grab("db.users", "a", Duration::from_secs(10), "move")
            .await
            .unwrap()
            .unwrap();
        assert!(catalog.unlock("db.users", doc.lock_id).await.unwrap());

        let after = catalog.get_lock("db.users").await.unwrap().unwrap();
        assert_eq!(after.state, LockState::Unlocked);
        assert_eq!(after.holder, "a");
    }

    #[tokio::test]
    async fn test_ping_offset() {
        let catalog = InMemoryLockCatalog::new(Arc::new(SkewedClock::default()));
        let local = SkewedClock::new(5_000).now_ms();
        let ping = catalog.ping("a", local).await.unwrap();
        assert!((4_900..=5_100).contains(&ping.offset_ms()));
        assert_eq!(catalog.last_ping("a").await.unwrap(), Some(ping));
    }
}
