//! Per-session bearer-token cache with fetch deduplication
//!
//! Two maps behind two tokio Mutexes: cached tokens, and in-flight fetches.
//! An in-flight fetch is a `Shared` future, so every concurrent caller for the
//! same key awaits the one underlying request. Locks are held only for map
//! operations; the fetch itself runs on a spawned task after they are released.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{MAX_CACHE_SIZE, SAFETY_MARGIN, TOKEN_TTL};
use crate::error::{Error, Result};

type PendingFetch = Shared<BoxFuture<'static, Result<String>>>;

/// Cache tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct CacheSettings {
    /// Lifetime assigned to a freshly minted token
    pub ttl: Duration,
    /// Minimum remaining lifetime for a cached token to be handed out
    pub safety_margin: Duration,
    /// Entry count bound
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: TOKEN_TTL,
            safety_margin: SAFETY_MARGIN,
            capacity: MAX_CACHE_SIZE,
        }
    }
}

/// Entry counts reported on the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

struct Inner {
    entries: Mutex<HashMap<String, CachedToken>>,
    inflight: Mutex<HashMap<String, PendingFetch>>,
    settings: CacheSettings,
}

impl Inner {
    fn is_fresh(&self, cached: &CachedToken, now: Instant) -> bool {
        now + self.settings.safety_margin < cached.expires_at
    }

    async fn lookup(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|cached| self.is_fresh(cached, Instant::now()))
            .map(|cached| cached.token.clone())
    }

    async fn store(&self, key: &str, token: String) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.settings.capacity && !entries.contains_key(key) {
            let victim = entries
                .iter()
                .min_by_key(|(_, cached)| cached.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                debug!(session_id = %victim, "token cache full, evicted nearest expiry");
            }
        }
        entries.insert(
            key.to_string(),
            CachedToken {
                token,
                expires_at: Instant::now() + self.settings.ttl,
            },
        );
    }
}

/// Process-wide token cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(CacheSettings::default())
    }
}

impl TokenCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                settings,
            }),
        }
    }

    /// Cached token for `key` if it is still outside the safety margin.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.inner.lookup(key).await
    }

    /// Return a fresh token for `key`, running `fetch` only if no fresh token is
    /// cached and no fetch for `key` is already in flight.
    ///
    /// `fetch` is not retried. Its error reaches every caller that joined it.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        if let Some(token) = self.inner.lookup(key).await {
            return Ok(token);
        }

        let pending = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.get(key) {
                Some(pending) => pending.clone(),
                None => {
                    // A fetch may have landed between the miss and taking the lock
                    if let Some(token) = self.inner.lookup(key).await {
                        return Ok(token);
                    }
                    let pending = self.start_fetch(key, fetch());
                    inflight.insert(key.to_string(), pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    /// Run `fetch` on its own task so it stores its token and clears the
    /// in-flight slot even when every waiter has gone away.
    fn start_fetch<Fut>(&self, key: &str, fetch: Fut) -> PendingFetch
    where
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let task = tokio::spawn({
            let inner = Arc::clone(&inner);
            let key = key.clone();
            async move {
                debug!(session_id = %key, "fetching session token");
                let outcome = fetch.await;
                match &outcome {
                    Ok(token) => inner.store(&key, token.clone()).await,
                    Err(e) => warn!(session_id = %key, error = %e, "session token fetch failed"),
                }
                inner.inflight.lock().await.remove(&key);
                outcome
            }
        });
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    inner.inflight.lock().await.remove(&key);
                    Err(Error::TokenExchange(format!("token fetch task failed: {e}")))
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Drop the entry for `key` so the next lookup fetches fresh.
    pub async fn invalidate(&self, key: &str) {
        if self.inner.entries.lock().await.remove(key).is_some() {
            debug!(session_id = key, "session token invalidated");
        }
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        self.inner.entries.lock().await.clear();
    }

    /// Remove entries past their expiry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, cached| cached.expires_at > now);
        before - entries.len()
    }

    pub async fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.inner.entries.lock().await;
        CacheStats {
            total: entries.len(),
            valid: entries
                .values()
                .filter(|cached| self.inner.is_fresh(cached, now))
                .count(),
        }
    }
}
