//! Background expiry sweep for the token cache

use std::time::Duration;

use tracing::debug;

use crate::cache::TokenCache;

/// Spawn a task that removes expired tokens every `interval`.
///
/// Returns a `JoinHandle`; abort it on shutdown.
pub fn spawn_sweep_task(cache: TokenCache, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick, the cache starts empty
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = cache.sweep().await;
            if removed > 0 {
                debug!(removed, "swept expired session tokens");
            }
        }
    })
}
