use crate::config::{CleanupConfig, LockConfig, MigrationConfig, ShardConfig};
use crate::types::ShardId;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Shard config with timings short enough for tests.
pub(crate) fn fast_config(shard: ShardId) -> ShardConfig {
    let migration = MigrationConfig::default()
        .with_clone_batch_size(5)
        .with_status_poll_interval(Duration::from_millis(10))
        .with_heartbeat_timeout(Duration::from_millis(500))
        .with_clone_timeout(Duration::from_secs(10))
        .with_lock_timing(Duration::from_secs(5), Duration::from_millis(300))
        .with_critical_section_timeout(Duration::from_secs(2));
    let cleanup = CleanupConfig::default()
        .with_batch_size(4)
        .with_range_deletion_delay(Duration::ZERO);
    let lock = LockConfig::default()
        .with_default_ttl(Duration::from_secs(5))
        .with_retry_backoff(Duration::from_millis(5), Duration::from_millis(50));

    ShardConfig::new(shard)
        .with_migration_config(migration)
        .with_cleanup_config(cleanup)
        .with_lock_config(lock)
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
pub(crate) async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Run `action` until `predicate` accepts its result or `timeout` passes.
pub(crate) async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        sleep(Duration::from_millis(10)).await;
    }
    None
}
