//! Account model

use std::fmt;

use common::Secret;
use provider::Session;
use serde::{Deserialize, Serialize};

/// Agent mode used when an account does not name one
pub const DEFAULT_AGENT_MODE: &str = "claude-opus-4.5";

fn default_agent_mode() -> String {
    DEFAULT_AGENT_MODE.to_string()
}

fn default_weight() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

/// One pooled upstream account as persisted by the store.
///
/// Counters are cumulative and only ever change through batched
/// `AccountStore::add_counts` writes.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub session_id: String,
    /// Long-lived `__client` cookie
    pub client_cookie: String,
    #[serde(default)]
    pub client_uat: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_agent_mode")]
    pub agent_mode: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub request_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub failure_count: u64,
    /// Unix milliseconds of the last flushed activity
    #[serde(default)]
    pub last_used_at: Option<u64>,
}

impl Account {
    /// Routing identifiers for an upstream call through this account.
    pub fn session(&self) -> Session {
        Session {
            session_id: self.session_id.clone(),
            client_cookie: Secret::new(self.client_cookie.clone()),
            client_uat: self.client_uat.clone(),
            project_id: self.project_id.clone(),
            user_id: self.user_id.clone(),
            agent_mode: self.agent_mode.clone(),
            email: self.email.clone(),
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("session_id", &self.session_id)
            .field("client_cookie", &"[REDACTED]")
            .field("agent_mode", &self.agent_mode)
            .field("weight", &self.weight)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Pending usage counts for one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
}

impl CounterDelta {
    pub fn is_empty(&self) -> bool {
        self.requests == 0 && self.successes == 0 && self.failures == 0
    }

    pub fn merge(&mut self, other: CounterDelta) {
        self.requests += other.requests;
        self.successes += other.successes;
        self.failures += other.failures;
    }
}
