//! Credential pool access.
//!
//! Dispatch selects eligible credentials through the [`CredentialPool`] trait
//! and reports health transitions and successful sends back through it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use courier_common::{AppError, AppResult};
use courier_db::entities::CredentialStatus;
use courier_db::repositories::{CredentialRepository, PriorityFilter};
use tokio::sync::Mutex;
use tracing::debug;

/// One sender credential as stored in the relational pool.
pub use courier_db::entities::credential::Model as Credential;

/// Parameters of one selection query.
#[derive(Debug, Clone)]
pub struct CredentialQuery {
    /// Priority classes to draw from.
    pub priority: PriorityFilter,
    /// Sends allowed per credential per day.
    pub daily_cap: i32,
    /// Credentials already selected in this round.
    pub exclude: Vec<String>,
    /// Maximum number of credentials to return.
    pub limit: usize,
}

/// Source of sender credentials.
#[async_trait]
pub trait CredentialPool: Send + Sync {
    /// Eligible credentials of `pool` matching `query`, least used today first.
    ///
    /// Fails with [`AppError::NotFound`] if the pool does not exist.
    async fn select(&self, pool: &str, query: &CredentialQuery) -> AppResult<Vec<Credential>>;

    /// Set the health status of a credential.
    async fn set_status(&self, credential_id: &str, status: CredentialStatus) -> AppResult<()>;

    /// Count one successful send against a credential.
    async fn record_success(&self, credential_id: &str) -> AppResult<()>;
}

/// Credential pool backed by the relational store.
#[derive(Clone)]
pub struct DbCredentialPool {
    repo: CredentialRepository,
}

impl DbCredentialPool {
    /// Wrap a credential repository.
    #[must_use]
    pub const fn new(repo: CredentialRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl CredentialPool for DbCredentialPool {
    async fn select(&self, pool: &str, query: &CredentialQuery) -> AppResult<Vec<Credential>> {
        if !self.repo.pool_exists(pool).await? {
            return Err(AppError::NotFound(format!("credential pool {pool}")));
        }

        self.repo
            .find_eligible(
                pool,
                &query.priority,
                query.daily_cap,
                &query.exclude,
                query.limit as u64,
            )
            .await
    }

    async fn set_status(&self, credential_id: &str, status: CredentialStatus) -> AppResult<()> {
        self.repo.set_status(credential_id, status).await
    }

    async fn record_success(&self, credential_id: &str) -> AppResult<()> {
        self.repo.record_success(credential_id).await
    }
}

/// Credential pool held in memory, for tests and embedding.
#[derive(Clone, Default)]
pub struct MemoryCredentialPool {
    pools: Arc<Mutex<HashMap<String, Vec<Credential>>>>,
}

impl MemoryCredentialPool {
    /// Create a pool store with no pools.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty pool.
    pub async fn create_pool(&self, pool: &str) {
        self.pools
            .lock()
            .await
            .entry(pool.to_string())
            .or_default();
    }

    /// Add an eligible credential to `pool`, creating the pool if needed.
    pub async fn add(&self, pool: &str, id: &str, priority: i16, day_count: i32) {
        let now = Utc::now().into();
        let credential = Credential {
            id: id.to_string(),
            pool: pool.to_string(),
            priority,
            status: CredentialStatus::Eligible,
            used_count: 0,
            day_count,
            session: format!("session-{id}"),
            proxy: None,
            created_at: now,
            updated_at: now,
        };
        self.pools
            .lock()
            .await
            .entry(pool.to_string())
            .or_default()
            .push(credential);
    }

    /// Current record of a credential.
    pub async fn get(&self, credential_id: &str) -> Option<Credential> {
        self.pools
            .lock()
            .await
            .values()
            .flatten()
            .find(|c| c.id == credential_id)
            .cloned()
    }

    async fn update<F>(&self, credential_id: &str, f: F) -> AppResult<()>
    where
        F: FnOnce(&mut Credential) + Send,
    {
        let mut pools = self.pools.lock().await;
        let credential = pools
            .values_mut()
            .flatten()
            .find(|c| c.id == credential_id)
            .ok_or_else(|| AppError::NotFound(format!("credential {credential_id}")))?;
        f(credential);
        credential.updated_at = Utc::now().into();
        Ok(())
    }
}

fn matches_priority(filter: &PriorityFilter, priority: i16) -> bool {
    match filter {
        PriorityFilter::Exactly(p) => *p == priority,
        PriorityFilter::Excluding(ps) => !ps.contains(&priority),
    }
}

#[async_trait]
impl CredentialPool for MemoryCredentialPool {
    async fn select(&self, pool: &str, query: &CredentialQuery) -> AppResult<Vec<Credential>> {
        let pools = self.pools.lock().await;
        let credentials = pools
            .get(pool)
            .ok_or_else(|| AppError::NotFound(format!("credential pool {pool}")))?;

        let mut eligible: Vec<Credential> = credentials
            .iter()
            .filter(|c| c.status == CredentialStatus::Eligible)
            .filter(|c| c.day_count < query.daily_cap)
            .filter(|c| matches_priority(&query.priority, c.priority))
            .filter(|c| !query.exclude.contains(&c.id))
            .cloned()
            .collect();
        eligible.sort_by_key(|c| c.day_count);
        eligible.truncate(query.limit);
        Ok(eligible)
    }

    async fn set_status(&self, credential_id: &str, status: CredentialStatus) -> AppResult<()> {
        debug!(credential_id, ?status, "Setting credential status");
        self.update(credential_id, |c| c.status = status).await
    }

    async fn record_success(&self, credential_id: &str) -> AppResult<()> {
        self.update(credential_id, |c| {
            c.used_count += 1;
            c.day_count += 1;
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use courier_db::entities::{PRIORITY_HIGH, PRIORITY_STANDARD};

    fn query(priority: PriorityFilter, limit: usize) -> CredentialQuery {
        CredentialQuery {
            priority,
            daily_cap: 40,
            exclude: Vec::new(),
            limit,
        }
    }

    #[tokio::test]
    async fn test_select_filters_and_orders() {
        let pool = MemoryCredentialPool::new();
        pool.add("default", "a", PRIORITY_HIGH, 10).await;
        pool.add("default", "b", PRIORITY_HIGH, 2).await;
        pool.add("default", "c", PRIORITY_HIGH, 40).await;
        pool.add("default", "d", PRIORITY_STANDARD, 0).await;
        pool.set_status("a", CredentialStatus::Exited).await.unwrap();

        let picked = pool
            .select("default", &query(PriorityFilter::Exactly(PRIORITY_HIGH), 10))
            .await
            .unwrap();
        let ids: Vec<_> = picked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["b"]);

        let others = pool
            .select("default", &query(PriorityFilter::Excluding(vec![PRIORITY_HIGH]), 10))
            .await
            .unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id, "d");
    }

    #[tokio::test]
    async fn test_missing_pool_is_not_found() {
        let pool = MemoryCredentialPool::new();
        let err = pool
            .select("nope", &query(PriorityFilter::Exactly(0), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_record_success_counts() {
        let pool = MemoryCredentialPool::new();
        pool.add("default", "a", PRIORITY_HIGH, 0).await;
        pool.record_success("a").await.unwrap();

        let credential = pool.get("a").await.unwrap();
        assert_eq!(credential.used_count, 1);
        assert_eq!(credential.day_count, 1);
    }
}
