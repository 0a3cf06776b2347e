//! Account storage
//!
//! `AccountStore` is the contract the pool needs from persistent storage:
//! read the enabled set, and apply batched counter deltas. `FileStore` keeps
//! accounts as a JSON array on disk. All writes use atomic temp-file + rename
//! to prevent corruption on crash, and a tokio Mutex serializes them.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::account::{Account, CounterDelta};
use crate::error::{Error, Result};

/// Persistent account storage as seen by the pool.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn AccountStore>`).
pub trait AccountStore: Send + Sync {
    /// All enabled accounts, ordered by id.
    fn enabled_accounts(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>>;

    /// Add `delta` to the account's cumulative counters in one write.
    fn add_counts(
        &self,
        id: i64,
        delta: CounterDelta,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// JSON-file account store.
///
/// Reads clone the in-memory state under a brief lock; the file is rewritten
/// on every mutation.
pub struct FileStore {
    path: PathBuf,
    state: Mutex<Vec<Account>>,
}

impl FileStore {
    /// Load accounts from `path`.
    ///
    /// A missing file is created as `[]` (cold start with zero accounts).
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading accounts file: {e}")))?;
            let mut accounts: Vec<Account> = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing accounts file: {e}")))?;
            accounts.sort_by_key(|a| a.id);
            info!(path = %path.display(), accounts = accounts.len(), "loaded accounts");
            accounts
        } else {
            info!(path = %path.display(), "accounts file not found, starting with empty store");
            let accounts = Vec::new();
            write_atomic(&path, &accounts).await?;
            accounts
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub async fn get(&self, id: i64) -> Option<Account> {
        let state = self.state.lock().await;
        state.iter().find(|a| a.id == id).cloned()
    }

    /// Every stored account, enabled or not.
    pub async fn list(&self) -> Vec<Account> {
        self.state.lock().await.clone()
    }

    /// Insert or replace an account by id and persist.
    pub async fn upsert(&self, account: Account) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = account.id;
        match state.iter_mut().find(|a| a.id == id) {
            Some(existing) => *existing = account,
            None => {
                state.push(account);
                state.sort_by_key(|a| a.id);
            }
        }
        debug!(account_id = id, "stored account");
        write_atomic(&self.path, &state).await
    }

    /// Remove an account and persist. Returns the removed account if it existed.
    pub async fn remove(&self, id: i64) -> Result<Option<Account>> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.iter().position(|a| a.id == id) else {
            return Ok(None);
        };
        let removed = state.remove(pos);
        debug!(account_id = id, "removed account");
        write_atomic(&self.path, &state).await?;
        Ok(Some(removed))
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl AccountStore for FileStore {
    fn enabled_accounts(&self) -> Pin<Box<dyn Future<Output = Result<Vec<Account>>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.iter().filter(|a| a.enabled).cloned().collect())
        })
    }

    fn add_counts(
        &self,
        id: i64,
        delta: CounterDelta,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let account = state
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or_else(|| Error::NotFound(format!("account {id} not in store")))?;
            account.request_count += delta.requests;
            account.success_count += delta.successes;
            account.failure_count += delta.failures;
            account.last_used_at = Some(common::unix_millis());
            write_atomic(&self.path, &state).await
        })
    }
}

/// Write accounts to a file atomically.
///
/// Writes a temporary file in the same directory, then renames it over the
/// target. The file holds session cookies, so it is created 0600.
async fn write_atomic(path: &Path, accounts: &[Account]) -> Result<()> {
    let json = serde_json::to_string_pretty(accounts)
        .map_err(|e| Error::Store(format!("serializing accounts: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("accounts path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".accounts.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp accounts file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting accounts file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp accounts file: {e}")))?;

    debug!(path = %path.display(), "persisted accounts");
    Ok(())
}
