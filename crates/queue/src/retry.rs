//! Volatile retry budgets and credential failure streaks.
//!
//! These counters live only in the process that owns dispatch for a job and
//! are rebuilt empty on restart.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Retry limits.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Extra attempts after a retriable failure.
    pub retry_budget: u32,
    /// Total attempts allowed under repeated network errors.
    pub network_retry_limit: u32,
    /// Consecutive session-invalid outcomes that retire a credential.
    pub failure_streak_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_budget: 1,
            network_retry_limit: 5,
            failure_streak_threshold: 3,
        }
    }
}

impl From<&courier_common::DispatchConfig> for RetryConfig {
    fn from(config: &courier_common::DispatchConfig) -> Self {
        Self {
            retry_budget: config.retry_budget,
            network_retry_limit: config.network_retry_limit,
            failure_streak_threshold: config.failure_streak_threshold,
        }
    }
}

/// What to do with a recipient after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put it back in the queue.
    Requeue,
    /// Budget spent; settle as failed.
    Exhausted,
}

type RecipientKey = (String, String);

#[derive(Default)]
struct Counters {
    attempts: HashMap<RecipientKey, u32>,
    network: HashMap<RecipientKey, u32>,
    streaks: HashMap<String, u32>,
}

/// Bookkeeping for retry budgets and failure streaks.
#[derive(Clone, Default)]
pub struct RetryBook {
    config: RetryConfig,
    counters: Arc<Mutex<Counters>>,
}

fn key(job_id: &str, recipient_id: &str) -> RecipientKey {
    (job_id.to_string(), recipient_id.to_string())
}

impl RetryBook {
    /// Create an empty book.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// Charge one retriable failure against a recipient's budget.
    pub async fn record_failure(&self, job_id: &str, recipient_id: &str) -> RetryDecision {
        let mut counters = self.counters.lock().await;
        let k = key(job_id, recipient_id);
        let attempts = counters.attempts.get(&k).copied().unwrap_or(0);

        if attempts < self.config.retry_budget {
            counters.attempts.insert(k, attempts + 1);
            RetryDecision::Requeue
        } else {
            counters.attempts.remove(&k);
            RetryDecision::Exhausted
        }
    }

    /// Count one network failure for a recipient.
    pub async fn record_network_failure(&self, job_id: &str, recipient_id: &str) -> RetryDecision {
        let mut counters = self.counters.lock().await;
        let k = key(job_id, recipient_id);
        let count = counters.network.get(&k).copied().unwrap_or(0) + 1;

        if count >= self.config.network_retry_limit {
            counters.network.remove(&k);
            RetryDecision::Exhausted
        } else {
            counters.network.insert(k, count);
            RetryDecision::Requeue
        }
    }

    /// Forget every counter of a settled recipient.
    pub async fn clear_recipient(&self, job_id: &str, recipient_id: &str) {
        let mut counters = self.counters.lock().await;
        let k = key(job_id, recipient_id);
        counters.attempts.remove(&k);
        counters.network.remove(&k);
    }

    /// Extend a credential's session-invalid streak. Returns `true` once the
    /// threshold is reached; the streak is cleared at that point.
    pub async fn bump_streak(&self, credential_id: &str) -> bool {
        let mut counters = self.counters.lock().await;
        let streak = counters.streaks.entry(credential_id.to_string()).or_insert(0);
        *streak += 1;

        if *streak >= self.config.failure_streak_threshold {
            counters.streaks.remove(credential_id);
            true
        } else {
            false
        }
    }

    /// Reset a credential's streak.
    pub async fn clear_streak(&self, credential_id: &str) {
        self.counters.lock().await.streaks.remove(credential_id);
    }

    /// Current streak of a credential.
    pub async fn streak(&self, credential_id: &str) -> u32 {
        self.counters
            .lock()
            .await
            .streaks
            .get(credential_id)
            .copied()
            .unwrap_or(0)
    }

    /// Drop every counter. Called when the owning scheduler shuts down.
    pub async fn clear(&self) {
        let mut counters = self.counters.lock().await;
        counters.attempts.clear();
        counters.network.clear();
        counters.streaks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_budget_of_one_allows_one_requeue() {
        let book = RetryBook::new(RetryConfig::default());

        assert_eq!(book.record_failure("job1", "r1").await, RetryDecision::Requeue);
        assert_eq!(book.record_failure("job1", "r1").await, RetryDecision::Exhausted);
        // Exhaustion resets the entry
        assert_eq!(book.record_failure("job1", "r1").await, RetryDecision::Requeue);
    }

    #[tokio::test]
    async fn test_zero_budget_settles_immediately() {
        let book = RetryBook::new(RetryConfig {
            retry_budget: 0,
            ..Default::default()
        });

        assert_eq!(book.record_failure("job1", "r1").await, RetryDecision::Exhausted);
    }

    #[tokio::test]
    async fn test_network_limit_counts_attempts() {
        let book = RetryBook::new(RetryConfig::default());

        for _ in 0..4 {
            assert_eq!(
                book.record_network_failure("job1", "r1").await,
                RetryDecision::Requeue
            );
        }
        assert_eq!(
            book.record_network_failure("job1", "r1").await,
            RetryDecision::Exhausted
        );
    }

    #[tokio::test]
    async fn test_streak_is_per_credential() {
        let book = RetryBook::new(RetryConfig::default());

        assert!(!book.bump_streak("cred1").await);
        assert!(!book.bump_streak("cred2").await);
        assert!(!book.bump_streak("cred1").await);
        assert!(book.bump_streak("cred1").await);

        assert_eq!(book.streak("cred1").await, 0);
        assert_eq!(book.streak("cred2").await, 1);

        book.clear_streak("cred2").await;
        assert_eq!(book.streak("cred2").await, 0);
    }

    #[tokio::test]
    async fn test_budgets_are_per_job() {
        let book = RetryBook::new(RetryConfig::default());

        book.record_failure("job1", "r1").await;
        assert_eq!(book.record_failure("job2", "r1").await, RetryDecision::Requeue);

        book.clear_recipient("job1", "r1").await;
        assert_eq!(book.record_failure("job1", "r1").await, RetryDecision::Requeue);
    }

    #[tokio::test]
    async fn test_clear_forgets_everything() {
        let book = RetryBook::new(RetryConfig::default());

        book.record_failure("job1", "r1").await;
        book.bump_streak("cred1").await;
        book.clear().await;

        assert_eq!(book.streak("cred1").await, 0);
        assert_eq!(book.record_failure("job1", "r1").await, RetryDecision::Requeue);
    }
}
