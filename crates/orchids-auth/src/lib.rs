//! Bearer-token management for orchids agent accounts
//!
//! Each account holds a long-lived identity-provider cookie. Upstream calls
//! need a short-lived JWT minted from it. This crate owns that exchange and a
//! process-wide cache in front of it.
//!
//! Token flow:
//! 1. Caller asks `TokenCache::get_or_fetch()` keyed by the account's session id
//! 2. A fresh cached token (more than the safety margin left) is returned as-is
//! 3. Otherwise one `token::fetch_session_token()` runs per key; concurrent
//!    callers for the same key await that single fetch
//! 4. Success is cached for the fixed TTL; failure reaches every waiter and
//!    nothing is cached
//! 5. An upstream 401/403 calls `TokenCache::invalidate()` so the next attempt fetches fresh
//! 6. `spawn_sweep_task()` drops expired entries in the background

pub mod cache;
pub mod constants;
pub mod error;
pub mod sweep;
pub mod token;

pub use cache::{CacheSettings, CacheStats, TokenCache};
pub use constants::*;
pub use error::{Error, Result};
pub use sweep::spawn_sweep_task;
pub use token::{TokenResponse, fetch_session_token, token_url};
