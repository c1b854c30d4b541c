//! Database integration tests.
//!
//! These tests require a running `PostgreSQL` instance.
//! Run with: `cargo test --test db_integration -- --ignored`
//!
//! Environment variables:
//!   `TEST_DB_HOST` (default: localhost)
//!   `TEST_DB_PORT` (default: 5433)
//!   `TEST_DB_USER` (default: `courier_test`)
//!   `TEST_DB_PASSWORD` (default: `courier_test`)
//!   `TEST_DB_NAME` (default: `courier_test`)

#![allow(clippy::unwrap_used)]

use courier_db::entities::CredentialStatus;
use courier_db::repositories::PriorityFilter;
use courier_db::test_utils::TestDatabase;

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_eligible_selection_orders_by_daily_use() {
    let db = TestDatabase::new().await.expect("Failed to connect");
    db.cleanup().await.unwrap();

    db.seed_credential("default", "busy", 0, 30).await.unwrap();
    db.seed_credential("default", "fresh", 0, 2).await.unwrap();
    db.seed_credential("default", "capped", 0, 40).await.unwrap();
    db.seed_credential("default", "standard", 1, 0).await.unwrap();

    let repo = db.credentials();
    let found = repo
        .find_eligible("default", &PriorityFilter::Exactly(0), 40, &[], 10)
        .await
        .unwrap();

    let ids: Vec<_> = found.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["fresh", "busy"]);
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_demoted_credential_is_not_selected() {
    let db = TestDatabase::new().await.expect("Failed to connect");
    db.cleanup().await.unwrap();

    db.seed_credential("default", "cred1", 1, 0).await.unwrap();
    let repo = db.credentials();
    repo.set_status("cred1", CredentialStatus::Throttled)
        .await
        .unwrap();

    let found = repo
        .find_eligible("default", &PriorityFilter::Exactly(1), 40, &[], 10)
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
#[ignore = "requires running PostgreSQL instance"]
async fn test_record_success_increments_counters() {
    let db = TestDatabase::new().await.expect("Failed to connect");
    db.cleanup().await.unwrap();

    db.seed_credential("default", "cred1", 0, 3).await.unwrap();
    let repo = db.credentials();
    repo.record_success("cred1").await.unwrap();
    repo.record_success("cred1").await.unwrap();

    let cred = repo.find_by_id("cred1").await.unwrap().unwrap();
    assert_eq!(cred.day_count, 5);
    assert_eq!(cred.used_count, 2);
}
