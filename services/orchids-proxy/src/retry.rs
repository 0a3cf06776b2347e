//! Per-request retry state machine
//!
//! Pure: records failures and returns the action to take. The orchestrator
//! performs the sleep and the re-selection.

use std::collections::HashSet;
use std::time::Duration;

/// Bounds for one request's upstream attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each further retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `n`, where `n` counts failures so far (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1 << shift)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait, then select another account and try again
    Backoff { delay: Duration },
    /// Attempt bound reached
    GiveUp,
}

#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    failures: u32,
    excluded: HashSet<i64>,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            excluded: HashSet::new(),
        }
    }

    /// Record a failed attempt on `account_id` and exclude it from further
    /// selection for this request.
    pub fn on_failure(&mut self, account_id: i64) -> RetryAction {
        self.excluded.insert(account_id);
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            RetryAction::GiveUp
        } else {
            RetryAction::Backoff {
                delay: self.policy.backoff(self.failures),
            }
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn excluded(&self) -> &HashSet<i64> {
        &self.excluded
    }
}
