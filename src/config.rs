//! Configuration types for shards, migrations, cleanup, locking and routing.

use crate::error::{Error, Result};
use crate::types::ShardId;
use std::path::PathBuf;
use std::time::Duration;

/// Divisor applied to the lock TTL to derive the tolerated clock skew.
pub const LOCK_SKEW_FACTOR: u32 = 30;

/// Configuration for the donor and recipient sides of a migration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Documents per clone batch.
    pub clone_batch_size: usize,

    /// How often the donor polls recipient status. Each poll doubles as the
    /// heartbeat the recipient watches.
    pub status_poll_interval: Duration,

    /// Recipient aborts unilaterally if the donor is silent this long.
    pub heartbeat_timeout: Duration,

    /// Catch-up ends once at most this many modifications are unapplied.
    pub max_catchup_lag: u64,

    /// Catch-up ends after this many flush rounds even if the lag bound was
    /// never met; the critical section drains the rest.
    pub max_catchup_rounds: u32,

    /// Donor aborts if the recipient has not finished cloning by then.
    pub clone_timeout: Duration,

    /// Lease of the collection lock taken for the commit.
    pub lock_ttl: Duration,

    /// How long the commit keeps retrying the collection lock.
    pub lock_acquire_timeout: Duration,

    /// Longest a write waits on a donor critical section.
    pub critical_section_timeout: Duration,

    /// Compare-and-swap attempts before the commit gives up.
    pub max_commit_attempts: u32,

    /// Make `move_range` wait for the donor's range deletion.
    pub wait_for_delete: bool,

    /// Tell the recipient when the donor aborts.
    pub notify_recipient_on_abort: bool,

    /// Largest range, in documents, the donor agrees to move.
    pub max_chunk_docs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            clone_batch_size: 128,
            status_poll_interval: Duration::from_millis(50),
            heartbeat_timeout: Duration::from_secs(5),
            max_catchup_lag: 8,
            max_catchup_rounds: 20,
            clone_timeout: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(30),
            lock_acquire_timeout: Duration::from_secs(5),
            critical_section_timeout: Duration::from_secs(10),
            max_commit_attempts: 3,
            wait_for_delete: false,
            notify_recipient_on_abort: true,
            max_chunk_docs: 250_000,
        }
    }
}

impl MigrationConfig {
    /// Set the clone batch size.
    pub fn with_clone_batch_size(mut self, size: usize) -> Self {
        self.clone_batch_size = size;
        self
    }

    /// Set the status poll interval.
    pub fn with_status_poll_interval(mut self, interval: Duration) -> Self {
        self.status_poll_interval = interval;
        self
    }

    /// Set the recipient heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the catch-up lag bound.
    pub fn with_max_catchup_lag(mut self, lag: u64) -> Self {
        self.max_catchup_lag = lag;
        self
    }

    /// Set the catch-up round bound.
    pub fn with_max_catchup_rounds(mut self, rounds: u32) -> Self {
        self.max_catchup_rounds = rounds;
        self
    }

    /// Set the clone timeout.
    pub fn with_clone_timeout(mut self, timeout: Duration) -> Self {
        self.clone_timeout = timeout;
        self
    }

    /// Set the commit lock lease and acquisition timeout.
    pub fn with_lock_timing(mut self, ttl: Duration, acquire_timeout: Duration) -> Self {
        self.lock_ttl = ttl;
        self.lock_acquire_timeout = acquire_timeout;
        self
    }

    /// Set the critical section timeout.
    pub fn with_critical_section_timeout(mut self, timeout: Duration) -> Self {
        self.critical_section_timeout = timeout;
        self
    }

    /// Wait for the donor's range deletion before `move_range` returns.
    pub fn with_wait_for_delete(mut self, wait: bool) -> Self {
        self.wait_for_delete = wait;
        self
    }

    /// Enable or disable the best-effort abort notification.
    pub fn with_notify_recipient_on_abort(mut self, notify: bool) -> Self {
        self.notify_recipient_on_abort = notify;
        self
    }

    /// Set the largest movable range.
    pub fn with_max_chunk_docs(mut self, docs: u64) -> Self {
        self.max_chunk_docs = docs;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.clone_batch_size == 0 {
            return Err(Error::Config("clone_batch_size must be positive".into()));
        }
        if self.status_poll_interval >= self.heartbeat_timeout {
            return Err(Error::Config(
                "status_poll_interval must be shorter than heartbeat_timeout".into(),
            ));
        }
        if self.max_catchup_rounds == 0 || self.max_commit_attempts == 0 {
            return Err(Error::Config(
                "max_catchup_rounds and max_commit_attempts must be positive".into(),
            ));
        }
        if self.lock_ttl.is_zero() {
            return Err(Error::Config("lock_ttl must be positive".into()));
        }
        if self.max_chunk_docs == 0 {
            return Err(Error::Config("max_chunk_docs must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration for the orphan cleanup service.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Documents examined per batch.
    pub batch_size: usize,

    /// Delay before a scheduled range deletion runs.
    pub range_deletion_delay: Duration,

    /// Interval of the background orphan sweep, if enabled.
    pub sweep_interval: Option<Duration>,

    /// Directory for cleanup cursors, if resumption is wanted.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            range_deletion_delay: Duration::from_secs(900),
            sweep_interval: None,
            checkpoint_dir: None,
        }
    }
}

impl CleanupConfig {
    /// Set the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the range deletion delay.
    pub fn with_range_deletion_delay(mut self, delay: Duration) -> Self {
        self.range_deletion_delay = delay;
        self
    }

    /// Enable the background sweep.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Persist cleanup cursors under `dir`.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("cleanup batch_size must be positive".into()));
        }
        if matches!(self.sweep_interval, Some(i) if i.is_zero()) {
            return Err(Error::Config("sweep_interval must be positive".into()));
        }
        Ok(())
    }
}

/// Configuration for the distributed lock client.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease used when the caller does not pass one.
    pub default_ttl: Duration,

    /// Largest tolerated clock skew against the lock's last holder.
    pub max_clock_skew: Duration,

    /// First retry delay of `acquire_with_retry`.
    pub retry_initial_backoff: Duration,

    /// Cap on the retry delay.
    pub retry_max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        let default_ttl = Duration::from_secs(30);
        Self {
            default_ttl,
            max_clock_skew: default_ttl / LOCK_SKEW_FACTOR,
            retry_initial_backoff: Duration::from_millis(10),
            retry_max_backoff: Duration::from_millis(500),
        }
    }
}

impl LockConfig {
    /// Set the default lease; the skew tolerance follows it.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self.max_clock_skew = ttl / LOCK_SKEW_FACTOR;
        self
    }

    /// Set the skew tolerance explicitly.
    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew = skew;
        self
    }

    /// Set retry backoff bounds.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_backoff = initial;
        self.retry_max_backoff = max;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.default_ttl.is_zero() {
            return Err(Error::Config("default_ttl must be positive".into()));
        }
        if self.retry_initial_backoff > self.retry_max_backoff {
            return Err(Error::Config(
                "retry_initial_backoff exceeds retry_max_backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Retries after a `StaleShardVersion` before giving up.
    pub max_stale_retries: u32,

    /// Pause between stale retries.
    pub retry_backoff: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_stale_retries: 3,
            retry_backoff: Duration::from_millis(5),
        }
    }
}

impl RouterConfig {
    /// Set the stale retry bound.
    pub fn with_max_stale_retries(mut self, retries: u32) -> Self {
        self.max_stale_retries = retries;
        self
    }
}

/// Configuration of one shard node.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Unique identifier of the shard.
    pub shard_id: ShardId,

    /// Migration settings.
    pub migration: MigrationConfig,

    /// Orphan cleanup settings.
    pub cleanup: CleanupConfig,

    /// Distributed lock settings.
    pub lock: LockConfig,
}

impl ShardConfig {
    /// Create a configuration with defaults for `shard_id`.
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            migration: MigrationConfig::default(),
            cleanup: CleanupConfig::default(),
            lock: LockConfig::default(),
        }
    }

    /// Set migration configuration.
    pub fn with_migration_config(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Set cleanup configuration.
    pub fn with_cleanup_config(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Set lock configuration.
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Validate all sections.
    pub fn validate(&self) -> Result<()> {
        self.migration.validate()?;
        self.cleanup.validate()?;
        self.lock.validate()
    }
}
