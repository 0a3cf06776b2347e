//! Per-account activity tracking
//!
//! The orchestrator reports each attempt outcome here. A success marks the
//! account active and clears its visible error state; a failure records the
//! error. The health endpoint renders the result.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

/// Externally visible state of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeeperStatus {
    /// Unix milliseconds of the last successful stream
    pub last_active_at: Option<u64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Default)]
pub struct AccountKeeper {
    statuses: RwLock<HashMap<i64, KeeperStatus>>,
}

impl AccountKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful stream: stamp activity, clear the error.
    pub async fn mark_active(&self, id: i64) {
        let mut statuses = self.statuses.write().await;
        let status = statuses.entry(id).or_default();
        if status.last_error.is_some() {
            info!(account_id = id, "account recovered");
        }
        status.last_active_at = Some(common::unix_millis());
        status.last_error = None;
        status.consecutive_failures = 0;
    }

    /// Record a failed attempt.
    pub async fn record_failure(&self, id: i64, error: &str) {
        let mut statuses = self.statuses.write().await;
        let status = statuses.entry(id).or_default();
        status.last_error = Some(error.to_string());
        status.consecutive_failures += 1;
    }

    pub async fn status(&self, id: i64) -> Option<KeeperStatus> {
        self.statuses.read().await.get(&id).cloned()
    }

    /// All tracked accounts keyed by id, for the health endpoint.
    pub async fn snapshot(&self) -> serde_json::Value {
        let statuses = self.statuses.read().await;
        let map: serde_json::Map<String, serde_json::Value> = statuses
            .iter()
            .map(|(id, status)| {
                (
                    id.to_string(),
                    serde_json::to_value(status).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failure_then_success_clears_error() {
        let keeper = AccountKeeper::new();
        keeper.record_failure(1, "upstream returned 502").await;
        keeper.record_failure(1, "upstream returned 502").await;

        let status = keeper.status(1).await.unwrap();
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.last_error.as_deref(), Some("upstream returned 502"));
        assert!(status.last_active_at.is_none());

        keeper.mark_active(1).await;
        let status = keeper.status(1).await.unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
        assert!(status.last_active_at.is_some());
    }

    #[tokio::test]
    async fn unknown_account_has_no_status() {
        let keeper = AccountKeeper::new();
        assert!(keeper.status(9).await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_keyed_by_id() {
        let keeper = AccountKeeper::new();
        keeper.mark_active(3).await;
        keeper.record_failure(4, "token fetch failed").await;

        let snapshot = keeper.snapshot().await;
        assert!(snapshot["3"]["last_active_at"].is_u64());
        assert_eq!(snapshot["4"]["last_error"], "token fetch failed");
        assert_eq!(snapshot["4"]["consecutive_failures"], 1);
    }
}
