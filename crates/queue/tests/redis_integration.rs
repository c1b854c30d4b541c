//! Redis integration tests.
//!
//! These tests require a running Redis instance.
//! Run with: `cargo test --test redis_integration -- --ignored`
//!
//! Set `REDIS_URL` environment variable to point to your Redis instance.
//! Default: <redis://localhost:6379>

use std::time::Duration;

use courier_common::IdGenerator;
use courier_queue::{
    GatewayEvent, JobKey, JobMessage, JobStatus, JobStatusRecord, Notifier, QueueStore,
    RedisNotifier, RedisQueueStore, Settle, SettleOutcome,
};
use fred::clients::Client;
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::Config as RedisConfig;

fn get_redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

async fn connect() -> Client {
    let config = RedisConfig::from_url(&get_redis_url()).expect("Invalid Redis URL");
    let client = Client::new(config, None, None, None);
    client.init().await.expect("Failed to connect to Redis");
    client
}

/// Fresh prefix per test so runs never see each other's keys.
fn prefix() -> String {
    format!("courier_test_{}", IdGenerator::new().generate())
}

fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(ToString::to_string).collect()
}

/// Test enqueue deduplication and FIFO dequeue through the Lua scripts.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_enqueue_dequeue_fifo() {
    let store = RedisQueueStore::new(connect().await, prefix());
    let key = JobKey::new("owner1", "job1");

    let added = store
        .enqueue(&key, &ids(&["a", "b", "c", "a"]), "t1", None)
        .await
        .expect("enqueue failed");
    assert_eq!(added, 3);
    assert_eq!(store.pending_len(&key).await.expect("zcard failed"), 3);

    let batch = store.dequeue(&key, 2).await.expect("dequeue failed");
    let order: Vec<_> = batch.iter().map(|j| j.recipient_id.as_str()).collect();
    assert_eq!(order, ["a", "b"]);

    // Dequeued recipients left the pending set
    let again = store
        .enqueue(&key, &ids(&["a", "c"]), "t2", None)
        .await
        .expect("enqueue failed");
    assert_eq!(again, 1);

    // The re-added recipient is counted again
    let stats = store.get_stats("job1").await.expect("stats failed").expect("no stats");
    assert_eq!(stats.initial, 4);
    assert_eq!(stats.remaining, 4);
}

/// Test that counters follow submissions made after the first one.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_counters_cover_later_submissions() {
    let store = RedisQueueStore::new(connect().await, prefix());
    let key = JobKey::new("owner1", "job5");

    store
        .enqueue(&key, &[], "t0", None)
        .await
        .expect("enqueue failed");
    assert!(store.get_stats("job5").await.expect("stats failed").is_none());

    store
        .enqueue(&key, &ids(&["a", "b"]), "t1", None)
        .await
        .expect("enqueue failed");
    store.dequeue(&key, 2).await.expect("dequeue failed");
    store.settle("job5", Settle::Success).await.expect("settle failed");
    store.settle("job5", Settle::Success).await.expect("settle failed");

    store
        .enqueue(&key, &ids(&["c", "d", "e"]), "t2", None)
        .await
        .expect("enqueue failed");
    let stats = store.get_stats("job5").await.expect("stats failed").expect("no stats");
    assert_eq!((stats.initial, stats.remaining, stats.success), (5, 3, 2));
    assert!(stats.is_consistent());
}

/// Test that settle never drives remaining below zero.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_settle_is_atomic_and_bounded() {
    let store = RedisQueueStore::new(connect().await, prefix());
    let key = JobKey::new("owner1", "job2");
    store
        .enqueue(&key, &ids(&["a", "b"]), "t1", None)
        .await
        .expect("enqueue failed");

    let settles = (0..5).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            let settle = if i % 2 == 0 { Settle::Success } else { Settle::Fail };
            store.settle("job2", settle).await.expect("settle failed")
        })
    });

    let mut applied = 0;
    for handle in settles {
        if matches!(handle.await.expect("task failed"), SettleOutcome::Applied { .. }) {
            applied += 1;
        }
    }
    assert_eq!(applied, 2);

    let stats = store.get_stats("job2").await.expect("stats failed").expect("no stats");
    assert_eq!(stats.remaining, 0);
    assert!(stats.is_consistent());
}

/// Test the status and message hashes.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_status_and_message_round_trip() {
    let store = RedisQueueStore::new(connect().await, prefix());

    assert!(store.get_status("job3").await.expect("get failed").is_none());

    let record = JobStatusRecord::now(JobStatus::Stopped, "owner1", Some("manual stop"));
    store.set_status("job3", &record).await.expect("set failed");
    let read = store.get_status("job3").await.expect("get failed").expect("missing");
    assert_eq!(read.status, JobStatus::Stopped);
    assert_eq!(read.reason.as_deref(), Some("manual stop"));

    store
        .set_message(
            "job3",
            &JobMessage {
                text: "hello".to_string(),
                proxy_hint: None,
            },
        )
        .await
        .expect("set failed");
    let message = store.get_message("job3").await.expect("get failed").expect("missing");
    assert_eq!(message.text, "hello");
    assert!(message.proxy_hint.is_none());
}

/// Test presence detection and publishing.
#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_notifier_presence() {
    let client = connect().await;
    let prefix = prefix();
    let notifier = RedisNotifier::new(client.clone(), prefix.clone());

    assert!(!notifier.is_connected("owner1").await.expect("exists failed"));

    let presence = format!("{prefix}:presence:owner1");
    let _: () = client
        .set(presence.as_str(), "1", Some(fred::types::Expiration::EX(5)), None, false)
        .await
        .expect("set failed");
    assert!(notifier.is_connected("owner1").await.expect("exists failed"));

    let event = GatewayEvent::NeedMore {
        job_id: "job4".to_string(),
        need: 3,
    };
    notifier.publish("owner1", &event).await.expect("publish failed");

    let _: i64 = client.del(presence.as_str()).await.expect("del failed");
    tokio::time::sleep(Duration::from_millis(10)).await;
}
