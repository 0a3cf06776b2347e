//! Snapshot-based weighted account selection
//!
//! The pool holds an `Arc<PoolSnapshot>` behind a `RwLock`. Readers clone the
//! `Arc` and release the lock immediately; a refresh builds a whole new
//! snapshot and swaps it in, so no reader ever sees a partial update.
//!
//! Usage counters never touch the store on the request path. Selections and
//! outcomes accumulate in a pending map that `flush()` drains in one write per
//! account.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::account::{Account, CounterDelta};
use crate::error::{Error, Result};
use crate::store::AccountStore;

/// Immutable view of the enabled accounts at one refresh.
#[derive(Debug)]
pub struct PoolSnapshot {
    pub accounts: Vec<Account>,
    pub refreshed_at: Instant,
}

/// Weighted-random pool over the store's enabled accounts.
pub struct Pool {
    store: Arc<dyn AccountStore>,
    snapshot: RwLock<Arc<PoolSnapshot>>,
    pending: Mutex<HashMap<i64, CounterDelta>>,
    refresh_interval: Duration,
}

impl Pool {
    /// Create a pool with an empty snapshot. The first selection (or an explicit
    /// `refresh()`) loads accounts from the store.
    pub fn new(store: Arc<dyn AccountStore>, refresh_interval: Duration) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(PoolSnapshot {
                accounts: Vec::new(),
                refreshed_at: Instant::now(),
            })),
            pending: Mutex::new(HashMap::new()),
            refresh_interval,
        }
    }

    /// Reload enabled accounts from the store and swap in a new snapshot.
    ///
    /// On store error the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<usize> {
        let accounts = self.store.enabled_accounts().await?;
        let count = accounts.len();
        let fresh = Arc::new(PoolSnapshot {
            accounts,
            refreshed_at: Instant::now(),
        });
        *self.snapshot.write().await = fresh;
        metrics::gauge!("pool_accounts_enabled").set(count as f64);
        debug!(accounts = count, "account snapshot refreshed");
        Ok(count)
    }

    /// The current snapshot, without any staleness check.
    pub async fn snapshot(&self) -> Arc<PoolSnapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Current snapshot, reloaded inline when empty or older than twice the
    /// refresh interval (the background task has stalled).
    async fn current(&self) -> Arc<PoolSnapshot> {
        let snapshot = self.snapshot().await;
        let stale = snapshot.refreshed_at.elapsed() > self.refresh_interval * 2;
        if !snapshot.accounts.is_empty() && !stale {
            return snapshot;
        }
        debug!(
            empty = snapshot.accounts.is_empty(),
            stale, "forcing account snapshot refresh"
        );
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "forced account refresh failed, using previous snapshot");
        }
        self.snapshot().await
    }

    /// Pick an enabled account not in `excluded`, with probability proportional
    /// to its weight. Queues a request count for the chosen account.
    pub async fn select_excluding(&self, excluded: &HashSet<i64>) -> Result<Account> {
        let snapshot = self.current().await;
        let candidates: Vec<&Account> = snapshot
            .accounts
            .iter()
            .filter(|a| !excluded.contains(&a.id))
            .collect();

        let chosen = match candidates.as_slice() {
            [] => {
                return Err(Error::NoAccounts(format!(
                    "{} enabled, {} excluded",
                    snapshot.accounts.len(),
                    excluded.len()
                )));
            }
            [only] => *only,
            many => {
                let weights: Vec<u64> = many.iter().map(|a| u64::from(a.weight)).collect();
                let total: u64 = weights.iter().sum();
                let draw = if total == 0 { 0 } else { random_draw(total) };
                many[weighted_index(&weights, draw)]
            }
        };

        self.record(chosen.id, |d| d.requests += 1).await;
        debug!(account_id = chosen.id, "account selected");
        Ok(chosen.clone())
    }

    /// Queue a success count. Never blocks on the store.
    pub async fn schedule_success(&self, id: i64) {
        self.record(id, |d| d.successes += 1).await;
    }

    /// Queue a failure count. Never blocks on the store.
    pub async fn schedule_failure(&self, id: i64) {
        self.record(id, |d| d.failures += 1).await;
    }

    async fn record(&self, id: i64, apply: impl FnOnce(&mut CounterDelta)) {
        let mut pending = self.pending.lock().await;
        apply(pending.entry(id).or_default());
    }

    /// Copy of the queued, not yet flushed deltas.
    pub async fn pending(&self) -> HashMap<i64, CounterDelta> {
        self.pending.lock().await.clone()
    }

    /// Write every queued delta to the store, one write per account.
    ///
    /// The pending map is swapped out under the lock and written after it is
    /// released. A failed write is merged back for the next cycle.
    /// Returns the number of accounts written.
    pub async fn flush(&self) -> usize {
        let drained = std::mem::take(&mut *self.pending.lock().await);
        let mut written = 0usize;

        for (id, delta) in drained {
            if delta.is_empty() {
                continue;
            }
            match self.store.add_counts(id, delta).await {
                Ok(()) => written += 1,
                Err(Error::NotFound(msg)) => {
                    // Account deleted since it was selected; its counts have nowhere to go
                    debug!(account_id = id, error = %msg, "dropping counts for missing account");
                }
                Err(e) => {
                    warn!(account_id = id, error = %e, "counter flush failed, requeueing");
                    self.pending.lock().await.entry(id).or_default().merge(delta);
                }
            }
        }

        if written > 0 {
            metrics::counter!("pool_counter_flushes_total").increment(written as u64);
            info!(accounts = written, "flushed usage counters");
        }
        written
    }

    /// Pool summary for the health endpoint.
    pub async fn health(&self) -> serde_json::Value {
        let snapshot = self.snapshot().await;
        let pending = self.pending.lock().await;

        let accounts: Vec<serde_json::Value> = snapshot
            .accounts
            .iter()
            .map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "name": a.name,
                    "weight": a.weight,
                    "pending": pending.get(&a.id).map(|d| serde_json::json!({
                        "requests": d.requests,
                        "successes": d.successes,
                        "failures": d.failures,
                    })),
                })
            })
            .collect();

        let status = if snapshot.accounts.is_empty() {
            "unhealthy"
        } else {
            "healthy"
        };

        serde_json::json!({
            "status": status,
            "accounts_enabled": snapshot.accounts.len(),
            "snapshot_age_secs": snapshot.refreshed_at.elapsed().as_secs(),
            "pending_accounts": pending.len(),
            "accounts": accounts,
        })
    }
}

/// Uniform draw in `[0, total)`. `total` must be non-zero.
fn random_draw(total: u64) -> u64 {
    rand::rng().random_range(0..total)
}

/// Index of the first account whose cumulative weight exceeds `draw`.
///
/// `draw` is expected in `[0, sum(weights))`. Zero total weight (or an empty
/// slice) selects index 0.
pub fn weighted_index(weights: &[u64], draw: u64) -> usize {
    let prefix: Vec<u64> = weights
        .iter()
        .scan(0u64, |acc, w| {
            *acc += w;
            Some(*acc)
        })
        .collect();
    match prefix.last() {
        Some(&total) if total > 0 => prefix
            .partition_point(|&cumulative| cumulative <= draw)
            .min(prefix.len() - 1),
        _ => 0,
    }
}
