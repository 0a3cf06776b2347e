//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The static account's client cookie is loaded from ORCHIDS_CLIENT_COOKIE or
//! client_cookie_file, never stored in the TOML directly to avoid leaking
//! secrets.

use common::Secret;
use orchids_auth::CacheSettings;
use orchids_pool::{Account, DEFAULT_AGENT_MODE};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::DEFAULT_UPSTREAM_URL;
use crate::retry::RetryPolicy;

const COOKIE_ENV: &str = "ORCHIDS_CLIENT_COOKIE";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub token_cache: TokenCacheConfig,
    #[serde(default)]
    pub static_account: Option<StaticAccountConfig>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Whole-request upstream timeout, covering the event stream
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Route per-request debug hooks to tracing
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            token_endpoint: default_token_endpoint(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    pub accounts_file: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenCacheConfig {
    #[serde(default = "default_token_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_safety_margin")]
    pub safety_margin_secs: u64,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_token_ttl(),
            safety_margin_secs: default_safety_margin(),
            capacity: default_capacity(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl TokenCacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            ttl: Duration::from_secs(self.ttl_secs),
            safety_margin: Duration::from_secs(self.safety_margin_secs),
            capacity: self.capacity,
        }
    }
}

/// Fallback account used when no pool is configured or the pool is empty
#[derive(Debug, Deserialize)]
pub struct StaticAccountConfig {
    pub session_id: String,
    #[serde(skip)]
    pub client_cookie: Option<Secret<String>>,
    /// Path to a file containing the cookie (alternative to ORCHIDS_CLIENT_COOKIE)
    #[serde(default)]
    pub client_cookie_file: Option<PathBuf>,
    #[serde(default)]
    pub client_uat: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_agent_mode")]
    pub agent_mode: String,
}

impl StaticAccountConfig {
    /// The static account as a pool-shaped account with id 0.
    pub fn to_account(&self) -> Option<Account> {
        let cookie = self.client_cookie.as_ref()?;
        Some(Account {
            id: 0,
            name: "static".into(),
            session_id: self.session_id.clone(),
            client_cookie: cookie.expose().clone(),
            client_uat: self.client_uat.clone(),
            project_id: self.project_id.clone(),
            user_id: self.user_id.clone(),
            agent_mode: self.agent_mode.clone(),
            email: self.email.clone(),
            weight: 1,
            enabled: true,
            request_count: 0,
            success_count: 0,
            failure_count: 0,
            last_used_at: None,
        })
    }
}

fn default_timeout() -> u64 {
    120
}

fn default_max_connections() -> usize {
    1000
}

fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM_URL.to_string()
}

fn default_token_endpoint() -> String {
    orchids_auth::TOKEN_ENDPOINT.to_string()
}

fn default_refresh_interval() -> u64 {
    30
}

fn default_flush_interval() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    100
}

fn default_token_ttl() -> u64 {
    orchids_auth::TOKEN_TTL.as_secs()
}

fn default_safety_margin() -> u64 {
    orchids_auth::SAFETY_MARGIN.as_secs()
}

fn default_capacity() -> usize {
    orchids_auth::MAX_CACHE_SIZE
}

fn default_sweep_interval() -> u64 {
    orchids_auth::SWEEP_INTERVAL.as_secs()
}

fn default_agent_mode() -> String {
    DEFAULT_AGENT_MODE.to_string()
}

fn require_http(field: &str, url: &str) -> common::Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )))
    }
}

fn require_nonzero(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Client cookie resolution order:
    /// 1. ORCHIDS_CLIENT_COOKIE env var
    /// 2. client_cookie_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        require_http("upstream.url", &config.upstream.url)?;
        require_http("upstream.token_endpoint", &config.upstream.token_endpoint)?;
        require_nonzero("proxy.timeout_secs", config.proxy.timeout_secs)?;
        require_nonzero("proxy.max_connections", config.proxy.max_connections as u64)?;
        require_nonzero("retry.max_attempts", u64::from(config.retry.max_attempts))?;
        require_nonzero("token_cache.ttl_secs", config.token_cache.ttl_secs)?;
        require_nonzero("token_cache.capacity", config.token_cache.capacity as u64)?;
        require_nonzero(
            "token_cache.sweep_interval_secs",
            config.token_cache.sweep_interval_secs,
        )?;
        if config.token_cache.safety_margin_secs >= config.token_cache.ttl_secs {
            return Err(common::Error::Config(
                "token_cache.safety_margin_secs must be less than ttl_secs".into(),
            ));
        }
        if let Some(ref pool) = config.pool {
            require_nonzero("pool.refresh_interval_secs", pool.refresh_interval_secs)?;
            require_nonzero("pool.flush_interval_secs", pool.flush_interval_secs)?;
        }

        if let Some(ref mut account) = config.static_account {
            // Env var takes precedence over file
            if let Ok(cookie) = std::env::var(COOKIE_ENV) {
                account.client_cookie = Some(Secret::new(cookie));
            } else if let Some(ref cookie_file) = account.client_cookie_file {
                let cookie = std::fs::read_to_string(cookie_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read client_cookie_file {}: {e}",
                        cookie_file.display()
                    ))
                })?;
                let cookie = cookie.trim().to_owned();
                if !cookie.is_empty() {
                    account.client_cookie = Some(Secret::new(cookie));
                }
            }
            if account.client_cookie.is_none() {
                return Err(common::Error::Config(format!(
                    "static_account requires {COOKIE_ENV} or a non-empty client_cookie_file"
                )));
            }
        }

        if config.pool.is_none() && config.static_account.is_none() {
            return Err(common::Error::Config(
                "at least one of [pool] or [static_account] must be configured".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("orchids-proxy.toml")
    }
}
