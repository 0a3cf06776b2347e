//! Background snapshot refresh and counter flush
//!
//! Two independent periodic tasks. Neither touches per-request state; they
//! talk to requests only through the pool's locked snapshot and pending map.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pool::Pool;

/// Spawn a task that reloads the account snapshot every `interval`.
///
/// Store errors keep the previous snapshot; the next cycle retries.
pub fn spawn_refresh_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the snapshot was just loaded
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&pool).await;
        }
    })
}

async fn refresh_cycle(pool: &Pool) {
    match pool.refresh().await {
        Ok(count) => debug!(accounts = count, "periodic account refresh"),
        Err(e) => warn!(error = %e, "periodic account refresh failed, keeping previous snapshot"),
    }
}

/// Spawn a task that flushes queued usage counters every `interval`.
///
/// Call `Pool::flush()` once more after aborting this task at shutdown.
pub fn spawn_flush_task(pool: Arc<Pool>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            pool.flush().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::test_account;
    use crate::store::FileStore;
    use std::collections::HashSet;

    async fn test_pool(dir: &tempfile::TempDir) -> (Arc<Pool>, Arc<FileStore>) {
        let store = Arc::new(
            FileStore::load(dir.path().join("accounts.json"))
                .await
                .unwrap(),
        );
        store.upsert(test_account(1, 1)).await.unwrap();
        let pool = Arc::new(Pool::new(store.clone(), Duration::from_secs(30)));
        (pool, store)
    }

    #[tokio::test]
    async fn refresh_cycle_picks_up_new_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, store) = test_pool(&dir).await;
        pool.refresh().await.unwrap();

        store.upsert(test_account(2, 1)).await.unwrap();
        refresh_cycle(&pool).await;

        assert_eq!(pool.snapshot().await.accounts.len(), 2);
    }

    #[tokio::test]
    async fn refresh_cycle_drops_disabled_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, store) = test_pool(&dir).await;
        pool.refresh().await.unwrap();

        let mut disabled = test_account(1, 1);
        disabled.enabled = false;
        store.upsert(disabled).await.unwrap();
        refresh_cycle(&pool).await;

        assert!(pool.snapshot().await.accounts.is_empty());
    }

    #[tokio::test]
    async fn flush_task_writes_pending_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (pool, store) = test_pool(&dir).await;
        pool.select_excluding(&HashSet::new()).await.unwrap();

        let handle = spawn_flush_task(pool.clone(), Duration::from_millis(20));
        // The tick fires after 20ms; the file write completes shortly after
        let mut flushed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if store.get(1).await.unwrap().request_count == 1 {
                flushed = true;
                break;
            }
        }
        handle.abort();

        assert!(flushed, "flush task should persist the queued request count");
        assert!(pool.pending().await.is_empty());
    }
}
