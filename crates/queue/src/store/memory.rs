//! In-process queue store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use courier_common::{AppError, AppResult};
use tokio::sync::Mutex;

use super::QueueStore;
use crate::jobs::{
    JobKey, JobMessage, JobStats, JobStatus, JobStatusRecord, RecipientJob, Settle,
    SettleOutcome,
};

#[derive(Default)]
struct JobQueue {
    entries: VecDeque<RecipientJob>,
    pending: HashSet<String>,
}

#[derive(Default)]
struct State {
    queues: HashMap<JobKey, JobQueue>,
    stats: HashMap<String, JobStats>,
    statuses: HashMap<String, JobStatusRecord>,
    messages: HashMap<String, JobMessage>,
}

/// Queue store held entirely in memory.
///
/// Every operation runs under one lock, so the atomicity guarantees of the
/// Redis store hold trivially. Intended for tests and single-process use.
pub struct MemoryQueueStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueueStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AppError::Queue("queue store unavailable".to_string()))
        }
    }

    /// Snapshot of a job's queued recipients, oldest first.
    pub async fn queued(&self, key: &JobKey) -> Vec<RecipientJob> {
        self.state
            .lock()
            .await
            .queues
            .get(key)
            .map(|q| q.entries.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn push(state: &mut State, job: RecipientJob) -> bool {
    let queue = state.queues.entry(job.key()).or_default();
    if !queue.pending.insert(job.recipient_id.clone()) {
        return false;
    }
    queue.entries.push_back(job);
    true
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(
        &self,
        key: &JobKey,
        recipients: &[String],
        batch_tag: &str,
        declared_total: Option<u64>,
    ) -> AppResult<u64> {
        self.check()?;
        let mut state = self.state.lock().await;

        let mut added = 0u64;
        for recipient in recipients {
            let job = RecipientJob::new(
                key.owner_id.clone(),
                key.job_id.clone(),
                recipient.clone(),
                batch_tag.to_string(),
            );
            if push(&mut state, job) {
                added += 1;
            }
        }

        let queued = state.queues.get(key).map_or(0, |q| q.entries.len()) as i64;
        match state.stats.get_mut(&key.job_id) {
            Some(stats) => {
                let extra = match declared_total {
                    None => added as i64,
                    Some(_) => queued - stats.remaining,
                };
                stats.grow(extra);
            }
            None if declared_total.is_none() && added == 0 => {}
            None => {
                let initial = declared_total.map_or(added, |t| t.max(added)) as i64;
                state
                    .stats
                    .insert(key.job_id.clone(), JobStats::new(initial));
            }
        }

        Ok(added)
    }

    async fn requeue(&self, job: &RecipientJob) -> AppResult<()> {
        self.check()?;
        let mut state = self.state.lock().await;
        push(&mut state, job.clone());
        Ok(())
    }

    async fn dequeue(&self, key: &JobKey, max: usize) -> AppResult<Vec<RecipientJob>> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(queue) = state.queues.get_mut(key) else {
            return Ok(Vec::new());
        };

        let take = max.min(queue.entries.len());
        let batch: Vec<RecipientJob> = queue.entries.drain(..take).collect();
        for job in &batch {
            queue.pending.remove(&job.recipient_id);
        }
        Ok(batch)
    }

    async fn pending_len(&self, key: &JobKey) -> AppResult<u64> {
        self.check()?;
        let state = self.state.lock().await;
        Ok(state.queues.get(key).map_or(0, |q| q.entries.len() as u64))
    }

    async fn settle(&self, job_id: &str, settle: Settle) -> AppResult<SettleOutcome> {
        self.check()?;
        let mut state = self.state.lock().await;
        let Some(stats) = state.stats.get_mut(job_id) else {
            return Ok(SettleOutcome::NotApplied);
        };
        if stats.remaining <= 0 {
            return Ok(SettleOutcome::NotApplied);
        }

        stats.remaining -= 1;
        match settle {
            Settle::Success => stats.success += 1,
            Settle::Fail => stats.fail += 1,
        }
        Ok(SettleOutcome::Applied {
            remaining: stats.remaining,
        })
    }

    async fn get_stats(&self, job_id: &str) -> AppResult<Option<JobStats>> {
        self.check()?;
        Ok(self.state.lock().await.stats.get(job_id).copied())
    }

    async fn get_status(&self, job_id: &str) -> AppResult<Option<JobStatusRecord>> {
        self.check()?;
        Ok(self.state.lock().await.statuses.get(job_id).cloned())
    }

    async fn set_status(&self, job_id: &str, record: &JobStatusRecord) -> AppResult<()> {
        self.check()?;
        self.state
            .lock()
            .await
            .statuses
            .insert(job_id.to_string(), record.clone());
        Ok(())
    }

    async fn replace_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        record: &JobStatusRecord,
    ) -> AppResult<bool> {
        self.check()?;
        let mut state = self.state.lock().await;
        let current = state
            .statuses
            .get(job_id)
            .map_or(JobStatus::Idle, |r| r.status);
        if current != expected {
            return Ok(false);
        }
        state.statuses.insert(job_id.to_string(), record.clone());
        Ok(true)
    }

    async fn set_message(&self, job_id: &str, message: &JobMessage) -> AppResult<()> {
        self.check()?;
        self.state
            .lock()
            .await
            .messages
            .insert(job_id.to_string(), message.clone());
        Ok(())
    }

    async fn get_message(&self, job_id: &str) -> AppResult<Option<JobMessage>> {
        self.check()?;
        Ok(self.state.lock().await.messages.get(job_id).cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn recipients(ids: &[&str]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_enqueue_skips_pending_recipients() {
        let store = MemoryQueueStore::new();
        let key = JobKey::new("owner1", "job1");

        let added = store
            .enqueue(&key, &recipients(&["a", "b", "a"]), "t1", None)
            .await
            .unwrap();
        assert_eq!(added, 2);

        let again = store
            .enqueue(&key, &recipients(&["b", "c"]), "t2", None)
            .await
            .unwrap();
        assert_eq!(again, 1);

        // Undeclared submissions grow the counters by what they added
        let stats = store.get_stats("job1").await.unwrap().unwrap();
        assert_eq!((stats.initial, stats.remaining), (3, 3));
        assert_eq!(store.pending_len(&key).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_submission_creates_no_counters() {
        let store = MemoryQueueStore::new();
        let key = JobKey::new("owner1", "job1");

        assert_eq!(store.enqueue(&key, &[], "t1", None).await.unwrap(), 0);
        assert!(store.get_stats("job1").await.unwrap().is_none());

        store
            .enqueue(&key, &recipients(&["a", "b", "c"]), "t2", None)
            .await
            .unwrap();
        let stats = store.get_stats("job1").await.unwrap().unwrap();
        assert_eq!((stats.initial, stats.remaining), (3, 3));
    }

    #[tokio::test]
    async fn test_submission_after_settling_reopens_counters() {
        let store = MemoryQueueStore::new();
        let key = JobKey::new("owner1", "job1");
        store
            .enqueue(&key, &recipients(&["a", "b"]), "t1", None)
            .await
            .unwrap();
        store.dequeue(&key, 2).await.unwrap();
        store.settle("job1", Settle::Success).await.unwrap();
        store.settle("job1", Settle::Fail).await.unwrap();

        store
            .enqueue(&key, &recipients(&["c", "d", "e"]), "t2", None)
            .await
            .unwrap();
        let stats = store.get_stats("job1").await.unwrap().unwrap();
        assert_eq!(stats.initial, 5);
        assert_eq!(stats.remaining, 3);
        assert!(stats.is_consistent());
    }

    #[tokio::test]
    async fn test_declared_total_grows_only_past_remaining() {
        let store = MemoryQueueStore::new();
        let key = JobKey::new("owner1", "job1");
        store
            .enqueue(&key, &recipients(&["a"]), "t1", Some(3))
            .await
            .unwrap();

        // Still within the declared total
        store
            .enqueue(&key, &recipients(&["b", "c"]), "t2", Some(3))
            .await
            .unwrap();
        assert_eq!(store.get_stats("job1").await.unwrap().unwrap().initial, 3);

        // One more than declared: the counters follow the queue
        store
            .enqueue(&key, &recipients(&["d"]), "t3", Some(3))
            .await
            .unwrap();
        let stats = store.get_stats("job1").await.unwrap().unwrap();
        assert_eq!((stats.initial, stats.remaining), (4, 4));
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_clears_pending() {
        let store = MemoryQueueStore::new();
        let key = JobKey::new("owner1", "job1");
        store
            .enqueue(&key, &recipients(&["a", "b", "c"]), "t1", Some(10))
            .await
            .unwrap();

        let batch = store.dequeue(&key, 2).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|j| j.recipient_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);

        // "a" left the pending set, so it can be submitted again
        assert_eq!(
            store
                .enqueue(&key, &recipients(&["a"]), "t2", Some(10))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.get_stats("job1").await.unwrap().unwrap().initial, 10);
    }

    #[tokio::test]
    async fn test_settle_refuses_below_zero() {
        let store = MemoryQueueStore::new();
        let key = JobKey::new("owner1", "job1");
        store
            .enqueue(&key, &recipients(&["a"]), "t1", None)
            .await
            .unwrap();

        assert_eq!(
            store.settle("job1", Settle::Success).await.unwrap(),
            SettleOutcome::Applied { remaining: 0 }
        );
        assert_eq!(
            store.settle("job1", Settle::Fail).await.unwrap(),
            SettleOutcome::NotApplied
        );

        let stats = store.get_stats("job1").await.unwrap().unwrap();
        assert_eq!(stats.success, 1);
        assert_eq!(stats.fail, 0);
        assert!(stats.is_consistent());
    }

    #[tokio::test]
    async fn test_replace_status_requires_expected_status() {
        let store = MemoryQueueStore::new();
        let stopped = JobStatusRecord::now(JobStatus::Stopped, "owner1", Some("manual stop"));
        store.set_status("job1", &stopped).await.unwrap();

        let idle = JobStatusRecord::now(JobStatus::Idle, "owner1", None);
        assert!(!store
            .replace_status("job1", JobStatus::Running, &idle)
            .await
            .unwrap());
        assert_eq!(
            store.get_status("job1").await.unwrap().unwrap().status,
            JobStatus::Stopped
        );

        // No record yet counts as idle
        let running = JobStatusRecord::now(JobStatus::Running, "owner1", None);
        assert!(store
            .replace_status("job2", JobStatus::Idle, &running)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_propagates() {
        let store = MemoryQueueStore::new();
        store.set_available(false);

        let err = store.get_stats("job1").await.unwrap_err();
        assert!(err.is_store_error());
    }
}
