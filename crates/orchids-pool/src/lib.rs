//! Account pool for orchids agent accounts
//!
//! Holds an immutable snapshot of enabled accounts, picks one per attempt by
//! weighted random selection, and aggregates usage counters off the request
//! path. The `AccountStore` is the single source of truth; the pool only ever
//! reads whole snapshots from it and writes batched counter deltas back.
//!
//! Account lifecycle:
//! 1. `Pool::refresh()` loads enabled accounts into a fresh snapshot (swap, never mutate)
//! 2. `Pool::select_excluding()` picks by weight, skipping accounts that failed this request
//! 3. Each selection queues a request count; the orchestrator queues success/failure
//! 4. `spawn_flush_task()` drains the queued deltas to the store on a timer and at shutdown
//! 5. `spawn_refresh_task()` reloads the snapshot; a stale or empty snapshot is
//!    reloaded inline by the next selection
//! 6. `AccountKeeper` tracks per-account activity and last error for the health endpoint

pub mod account;
pub mod error;
pub mod keeper;
pub mod pool;
pub mod refresh;
pub mod store;

pub use account::{Account, CounterDelta, DEFAULT_AGENT_MODE};
pub use error::{Error, Result};
pub use keeper::{AccountKeeper, KeeperStatus};
pub use pool::{Pool, PoolSnapshot, weighted_index};
pub use refresh::{spawn_flush_task, spawn_refresh_task};
pub use store::{AccountStore, FileStore};
