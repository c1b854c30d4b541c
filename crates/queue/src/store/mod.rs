//! Durable per-job work queue with atomic progress counters.
//!
//! A [`QueueStore`] keeps, for every (owner, job) stream:
//!
//! - an ordered queue of [`RecipientJob`]s, oldest first,
//! - a pending set guarding against duplicate submission of a recipient,
//! - the four [`JobStats`] counters, only ever mutated through [`QueueStore::settle`],
//! - a [`JobStatusRecord`] and the job's [`JobMessage`].

mod memory;
mod redis;

pub use memory::MemoryQueueStore;
pub use redis::RedisQueueStore;

use async_trait::async_trait;
use courier_common::AppResult;

use crate::jobs::{
    JobKey, JobMessage, JobStats, JobStatus, JobStatusRecord, RecipientJob, Settle,
    SettleOutcome,
};

/// Storage backend for job queues and their counters.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append recipients to a job's queue, oldest first.
    ///
    /// Recipients already in the job's pending set are skipped. Returns how
    /// many recipients were added.
    ///
    /// Counters are created by the first submission that adds recipients or
    /// declares a total, sized `declared_total` (at least the recipients
    /// added) or the number added. Later submissions grow `initial` and
    /// `remaining` together: by the number added when no total is declared,
    /// else by however much the queue now exceeds `remaining`. Queued work is
    /// therefore always covered by the counters.
    async fn enqueue(
        &self,
        key: &JobKey,
        recipients: &[String],
        batch_tag: &str,
        declared_total: Option<u64>,
    ) -> AppResult<u64>;

    /// Put one dequeued recipient back at the tail of its job's queue.
    async fn requeue(&self, job: &RecipientJob) -> AppResult<()>;

    /// Atomically remove and return up to `max` of the oldest entries.
    async fn dequeue(&self, key: &JobKey, max: usize) -> AppResult<Vec<RecipientJob>>;

    /// Number of entries waiting in a job's queue.
    async fn pending_len(&self, key: &JobKey) -> AppResult<u64>;

    /// Atomically move one unit from `remaining` into the given counter.
    async fn settle(&self, job_id: &str, settle: Settle) -> AppResult<SettleOutcome>;

    /// Current counters, if the job was ever submitted.
    async fn get_stats(&self, job_id: &str) -> AppResult<Option<JobStats>>;

    /// Current status record, if one was ever written.
    async fn get_status(&self, job_id: &str) -> AppResult<Option<JobStatusRecord>>;

    /// Overwrite the status record.
    async fn set_status(&self, job_id: &str, record: &JobStatusRecord) -> AppResult<()>;

    /// Write `record` only if the job's status is still `expected`, as one
    /// atomic step. A job without a status record counts as idle. Returns
    /// whether the record was written.
    async fn replace_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        record: &JobStatusRecord,
    ) -> AppResult<bool>;

    /// Store the message sent to every recipient of the job.
    async fn set_message(&self, job_id: &str, message: &JobMessage) -> AppResult<()>;

    /// Message of the job, if configured.
    async fn get_message(&self, job_id: &str) -> AppResult<Option<JobMessage>>;
}
