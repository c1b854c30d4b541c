//! Credential repository.

use std::sync::Arc;

use chrono::Utc;
use courier_common::{AppError, AppResult};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveEnum, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, Order,
    QueryFilter, QueryOrder, QuerySelect, Set,
};

use crate::entities::{Credential, CredentialPool, CredentialStatus, credential, credential_pool};

/// Which priority classes a selection may draw from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorityFilter {
    /// Exactly this priority class.
    Exactly(i16),
    /// Any priority class except the listed ones.
    Excluding(Vec<i16>),
}

/// Repository for credential operations.
#[derive(Clone)]
pub struct CredentialRepository {
    db: Arc<DatabaseConnection>,
}

impl CredentialRepository {
    /// Create a new credential repository.
    #[must_use]
    pub const fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    // ==================== Pool Operations ====================

    /// Whether a pool with this name has been provisioned.
    pub async fn pool_exists(&self, name: &str) -> AppResult<bool> {
        let pool = CredentialPool::find_by_id(name)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        Ok(pool.is_some())
    }

    /// Register a pool.
    pub async fn create_pool(&self, name: &str) -> AppResult<credential_pool::Model> {
        let model = credential_pool::ActiveModel {
            name: Set(name.to_string()),
            created_at: Set(Utc::now().into()),
        };
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    // ==================== Credential Operations ====================

    /// Find a credential by ID.
    pub async fn find_by_id(&self, id: &str) -> AppResult<Option<credential::Model>> {
        Credential::find_by_id(id)
            .one(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Create a credential.
    pub async fn create(&self, model: credential::ActiveModel) -> AppResult<credential::Model> {
        model
            .insert(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Find eligible credentials of a pool, least used today first.
    ///
    /// Only credentials with `status = eligible` and `day_count < daily_cap`
    /// qualify. IDs in `exclude` are skipped so callers can top up a
    /// selection without receiving the same credential twice.
    pub async fn find_eligible(
        &self,
        pool: &str,
        priority: &PriorityFilter,
        daily_cap: i32,
        exclude: &[String],
        limit: u64,
    ) -> AppResult<Vec<credential::Model>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut query = Credential::find()
            .filter(credential::Column::Pool.eq(pool))
            .filter(credential::Column::Status.eq(CredentialStatus::Eligible))
            .filter(credential::Column::DayCount.lt(daily_cap));

        query = match priority {
            PriorityFilter::Exactly(p) => query.filter(credential::Column::Priority.eq(*p)),
            PriorityFilter::Excluding(ps) => {
                query.filter(credential::Column::Priority.is_not_in(ps.clone()))
            }
        };

        if !exclude.is_empty() {
            query = query.filter(credential::Column::Id.is_not_in(exclude.to_vec()));
        }

        query
            .order_by(credential::Column::DayCount, Order::Asc)
            .limit(limit)
            .all(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))
    }

    /// Set the health status of a credential.
    pub async fn set_status(&self, id: &str, status: CredentialStatus) -> AppResult<()> {
        Credential::update_many()
            .col_expr(credential::Column::Status, Expr::value(status.to_value()))
            .col_expr(credential::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(credential::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }

    /// Count one successful send against the credential, atomically.
    pub async fn record_success(&self, id: &str) -> AppResult<()> {
        Credential::update_many()
            .col_expr(
                credential::Column::UsedCount,
                Expr::col(credential::Column::UsedCount).add(1),
            )
            .col_expr(
                credential::Column::DayCount,
                Expr::col(credential::Column::DayCount).add(1),
            )
            .col_expr(credential::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(credential::Column::Id.eq(id))
            .exec(self.db.as_ref())
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    fn create_test_credential(id: &str, priority: i16, day_count: i32) -> credential::Model {
        credential::Model {
            id: id.to_string(),
            pool: "default".to_string(),
            priority,
            status: CredentialStatus::Eligible,
            used_count: 100,
            day_count,
            session: format!("session-{id}"),
            proxy: None,
            created_at: Utc::now().into(),
            updated_at: Utc::now().into(),
        }
    }

    #[tokio::test]
    async fn test_find_eligible_returns_rows() {
        let a = create_test_credential("cred1", 0, 1);
        let b = create_test_credential("cred2", 0, 5);

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([[a.clone(), b.clone()]])
                .into_connection(),
        );

        let repo = CredentialRepository::new(db);
        let result = repo
            .find_eligible("default", &PriorityFilter::Exactly(0), 40, &[], 10)
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[0].id, "cred1");
        assert_eq!(result[1].remaining_quota(40), 35);
    }

    #[tokio::test]
    async fn test_find_eligible_zero_limit_skips_query() {
        // No query results appended: a query would fail
        let db = Arc::new(MockDatabase::new(DatabaseBackend::Postgres).into_connection());

        let repo = CredentialRepository::new(db);
        let result = repo
            .find_eligible(
                "default",
                &PriorityFilter::Excluding(vec![0, 1]),
                40,
                &["cred1".to_string()],
                0,
            )
            .await
            .unwrap();

        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_pool_exists() {
        let pool = credential_pool::Model {
            name: "default".to_string(),
            created_at: Utc::now().into(),
        };

        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_query_results([vec![pool], Vec::new()])
                .into_connection(),
        );

        let repo = CredentialRepository::new(db);
        assert!(repo.pool_exists("default").await.unwrap());
        assert!(!repo.pool_exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_status_and_record_success() {
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results([
                    MockExecResult {
                        last_insert_id: 0,
                        rows_affected: 1,
                    },
                    MockExecResult {
                        last_insert_id: 0,
                        rows_affected: 1,
                    },
                ])
                .into_connection(),
        );

        let repo = CredentialRepository::new(db);
        assert!(repo.set_status("cred1", CredentialStatus::Exited).await.is_ok());
        assert!(repo.record_success("cred1").await.is_ok());
    }

    #[test]
    fn test_remaining_quota_never_negative() {
        let cred = create_test_credential("cred1", 1, 45);
        assert_eq!(cred.remaining_quota(40), 0);
    }
}
