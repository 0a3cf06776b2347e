//! Identity-provider constants
//!
//! These identify the public web client the tokens are minted for. They are
//! not secrets; the per-account cookie is.

use std::time::Duration;

/// Base URL of the session token endpoint (`{base}/{session_id}/tokens`)
pub const TOKEN_ENDPOINT: &str = "https://clerk.orchids.app/v1/client/sessions";

/// API version query parameter expected by the identity provider
pub const CLERK_API_VERSION: &str = "2025-11-10";

/// Client library version query parameter expected by the identity provider
pub const CLERK_JS_VERSION: &str = "5.117.0";

/// How long a minted token is cached
pub const TOKEN_TTL: Duration = Duration::from_secs(50 * 60);

/// A cached token with less than this left is treated as a miss
pub const SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Entries beyond this evict the one closest to expiry
pub const MAX_CACHE_SIZE: usize = 1000;

/// Period of the background expiry sweep
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
