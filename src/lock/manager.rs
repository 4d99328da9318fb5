//! Lease-based distributed lock client with clock skew checks.

use super::catalog::{LockCatalog, LockDocument};
use super::clock::Clock;
use crate::config::LockConfig;
use crate::error::{Error, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Proof of a held lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Locked resource.
    pub resource: String,
    /// Lease id.
    pub lock_id: Uuid,
    /// Holder process.
    pub holder: String,
    /// Lease expiry in catalog time.
    pub expires_at_ms: i64,
}

impl From<LockDocument> for LockHandle {
    fn from(doc: LockDocument) -> Self {
        Self {
            resource: doc.resource,
            lock_id: doc.lock_id,
            holder: doc.holder,
            expires_at_ms: doc.expires_at_ms,
        }
    }
}

/// Distributed lock client for one process.
///
/// Before taking a lock the client pings the catalog and compares its clock
/// offset with the offset recorded by the lock's current or last holder.
/// If the two disagree by more than `max_clock_skew`, acquisition is refused.
#[derive(Debug)]
pub struct DistLockManager {
    process: String,
    clock: Arc<dyn Clock>,
    catalog: Arc<dyn LockCatalog>,
    config: LockConfig,
}

impl DistLockManager {
    /// Create a client for `process`.
    pub fn new(
        process: impl Into<String>,
        clock: Arc<dyn Clock>,
        catalog: Arc<dyn LockCatalog>,
        config: LockConfig,
    ) -> Self {
        Self {
            process: process.into(),
            clock,
            catalog,
            config,
        }
    }

    /// Process name used as lock holder.
    pub fn process(&self) -> &str {
        &self.process
    }

    /// Lock configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Try once to take `resource`.
    #[tracing::instrument(skip(self), fields(process = %self.process))]
    pub async fn acquire(&self, resource: &str, ttl: Duration, why: &str) -> Result<LockHandle> {
        let mine = self.catalog.ping(&self.process, self.clock.now_ms()).await?;

        if let Some(existing) = self.catalog.get_lock(resource).await? {
            if existing.holder != self.process {
                self.check_skew(resource, &existing.holder, mine.offset_ms()).await?;
            }
        }

        match self.catalog.try_grab(resource, &self.process, ttl, why).await? {
            Some(doc) => {
                tracing::info!(resource, lock_id = %doc.lock_id, why, "Lock acquired");
                Ok(doc.into())
            }
            None => {
                let holder = self
                    .catalog
                    .get_lock(resource)
                    .await?
                    .map(|d| d.holder)
                    .unwrap_or_default();
                tracing::debug!(resource, holder = %holder, "Lock busy");
                Err(Error::LockBusy {
                    resource: resource.to_string(),
                    holder,
                })
            }
        }
    }

    async fn check_skew(&self, resource: &str, other: &str, my_offset_ms: i64) -> Result<()> {
        let Some(theirs) = self.catalog.last_ping(other).await? else {
            return Ok(());
        };
        let skew_ms = my_offset_ms - theirs.offset_ms();
        let tolerance_ms = self.config.max_clock_skew.as_millis() as i64;
        if skew_ms.abs() > tolerance_ms {
            tracing::warn!(
                resource,
                other,
                skew_ms,
                tolerance_ms,
                "Refusing lock, clock skew too high"
            );
            return Err(Error::ClockSkewTooHigh {
                skew_ms,
                tolerance_ms,
            });
        }
        Ok(())
    }

    /// Retry `acquire` on retryable failures until `timeout` elapses.
    ///
    /// Delays grow exponentially from `retry_initial_backoff` up to
    /// `retry_max_backoff`, with up to 50% random jitter.
    pub async fn acquire_with_retry(
        &self,
        resource: &str,
        ttl: Duration,
        why: &str,
        timeout: Duration,
    ) -> Result<LockHandle> {
        let deadline = Instant::now() + timeout;
        let mut backoff = self.config.retry_initial_backoff;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match self.acquire(resource, ttl, why).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };

            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let delay = backoff + Duration::from_millis(jitter);
            if Instant::now() + delay >= deadline {
                tracing::warn!(resource, attempts, error = %err, "Gave up acquiring lock");
                return Err(Error::LockTimeout {
                    resource: resource.to_string(),
                    last_error: Box::new(err),
                });
            }
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(self.config.retry_max_backoff);
        }
    }

    /// Extend a held lease.
    pub async fn renew(&self, handle: &LockHandle, ttl: Duration) -> Result<LockHandle> {
        self.catalog.ping(&self.process, self.clock.now_ms()).await?;
        match self.catalog.renew(&handle.resource, handle.lock_id, ttl).await? {
            Some(doc) => Ok(doc.into()),
            None => Err(Error::LockNotHeld(handle.resource.clone())),
        }
    }

    /// Release a held lease.
    pub async fn release(&self, handle: LockHandle) -> Result<()> {
        if self.catalog.unlock(&handle.resource, handle.lock_id).await? {
            tracing::info!(resource = %handle.resource, lock_id = %handle.lock_id, "Lock released");
            Ok(())
        } else {
            tracing::warn!(resource = %handle.resource, "Released a lock that was no longer held");
            Err(Error::LockNotHeld(handle.resource))
        }
    }
}
