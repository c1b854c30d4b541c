//! Redis-backed queue store.
//!
//! Layout, all keys under the configured prefix:
//!
//! | key | type | content |
//! |---|---|---|
//! | `queue:{owner}:{job}` | sorted set | serialized [`RecipientJob`], scored by enqueue time |
//! | `pending:{owner}:{job}` | set | recipient IDs currently queued |
//! | `stats:{job}` | hash | `initial`, `remaining`, `success`, `fail` |
//! | `status:{job}` | hash | `status`, `owner_id`, `updated_at`, `reason` |
//! | `meta:{job}` | hash | `text`, `proxy_hint` |
//!
//! Enqueue, dequeue, settle and conditional status writes run as Lua scripts
//! so that each is applied atomically on the server, across every process
//! sharing the instance.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_common::{AppError, AppResult};
use fred::clients::Client as RedisClient;
use fred::interfaces::{HashesInterface, LuaInterface, SortedSetsInterface};
use tracing::debug;

use super::QueueStore;
use crate::jobs::{
    JobKey, JobMessage, JobStats, JobStatus, JobStatusRecord, RecipientJob, Settle,
    SettleOutcome,
};

/// KEYS: queue, pending, stats (empty on requeue). ARGV: base score,
/// declared total, then (recipient id, entry) pairs.
const ENQUEUE_SCRIPT: &str = r"
local base = tonumber(ARGV[1])
local added = 0
for i = 3, #ARGV, 2 do
  if redis.call('SADD', KEYS[2], ARGV[i]) == 1 then
    redis.call('ZADD', KEYS[1], base + added, ARGV[i + 1])
    added = added + 1
  end
end
if KEYS[3] == '' then return added end
local declared = ARGV[2]
if redis.call('EXISTS', KEYS[3]) == 0 then
  if declared == '' and added == 0 then return added end
  local total = added
  if declared ~= '' then total = math.max(tonumber(declared), added) end
  redis.call('HSET', KEYS[3], 'initial', total, 'remaining', total, 'success', 0, 'fail', 0)
  return added
end
local extra = added
if declared ~= '' then
  local remaining = tonumber(redis.call('HGET', KEYS[3], 'remaining') or '0')
  extra = redis.call('ZCARD', KEYS[1]) - remaining
end
if extra > 0 then
  redis.call('HINCRBY', KEYS[3], 'initial', extra)
  redis.call('HINCRBY', KEYS[3], 'remaining', extra)
end
return added
";

/// KEYS: queue, pending. ARGV: max entries.
const DEQUEUE_SCRIPT: &str = r"
local n = tonumber(ARGV[1])
if n <= 0 then return {} end
local items = redis.call('ZRANGE', KEYS[1], 0, n - 1)
for _, item in ipairs(items) do
  redis.call('ZREM', KEYS[1], item)
  local job = cjson.decode(item)
  redis.call('SREM', KEYS[2], job.recipient_id)
end
return items
";

/// KEYS: stats. ARGV: counter field. Returns -1 when nothing was left.
const SETTLE_SCRIPT: &str = r"
local remaining = tonumber(redis.call('HGET', KEYS[1], 'remaining') or '0')
if remaining <= 0 then return -1 end
remaining = redis.call('HINCRBY', KEYS[1], 'remaining', -1)
redis.call('HINCRBY', KEYS[1], ARGV[1], 1)
return remaining
";

/// KEYS: status. ARGV: expected status, then status, owner, updated_at,
/// reason. Returns 1 when written.
const REPLACE_STATUS_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'status') or 'idle'
if current ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'owner_id', ARGV[3], 'updated_at', ARGV[4], 'reason', ARGV[5])
return 1
";

/// Queue store on a shared Redis instance.
#[derive(Clone)]
pub struct RedisQueueStore {
    redis: RedisClient,
    prefix: String,
}

impl RedisQueueStore {
    /// Create a store using `prefix` for every key.
    #[must_use]
    pub fn new(redis: RedisClient, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn queue_key(&self, key: &JobKey) -> String {
        format!("{}:queue:{}:{}", self.prefix, key.owner_id, key.job_id)
    }

    fn pending_key(&self, key: &JobKey) -> String {
        format!("{}:pending:{}:{}", self.prefix, key.owner_id, key.job_id)
    }

    fn stats_key(&self, job_id: &str) -> String {
        format!("{}:stats:{job_id}", self.prefix)
    }

    fn status_key(&self, job_id: &str) -> String {
        format!("{}:status:{job_id}", self.prefix)
    }

    fn meta_key(&self, job_id: &str) -> String {
        format!("{}:meta:{job_id}", self.prefix)
    }

    async fn push(
        &self,
        key: &JobKey,
        entries: &[RecipientJob],
        init_counters: bool,
        declared_total: Option<u64>,
    ) -> AppResult<u64> {
        let mut args = Vec::with_capacity(entries.len() * 2 + 2);
        args.push(Utc::now().timestamp_micros().to_string());
        args.push(declared_total.map(|t| t.to_string()).unwrap_or_default());
        for entry in entries {
            args.push(entry.recipient_id.clone());
            args.push(serde_json::to_string(entry)?);
        }

        let stats_key = if init_counters {
            self.stats_key(&key.job_id)
        } else {
            String::new()
        };
        let keys = vec![self.queue_key(key), self.pending_key(key), stats_key];

        let added: i64 = self
            .redis
            .eval(ENQUEUE_SCRIPT, keys, args)
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        Ok(added.max(0) as u64)
    }
}

fn parse_counter(fields: &HashMap<String, String>, name: &str) -> AppResult<i64> {
    fields
        .get(name)
        .map_or(Ok(0), |v| v.parse())
        .map_err(|_| AppError::Queue(format!("corrupt counter field: {name}")))
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(
        &self,
        key: &JobKey,
        recipients: &[String],
        batch_tag: &str,
        declared_total: Option<u64>,
    ) -> AppResult<u64> {
        let entries: Vec<RecipientJob> = recipients
            .iter()
            .map(|r| {
                RecipientJob::new(
                    key.owner_id.clone(),
                    key.job_id.clone(),
                    r.clone(),
                    batch_tag.to_string(),
                )
            })
            .collect();

        let added = self.push(key, &entries, true, declared_total).await?;
        debug!(owner_id = %key.owner_id, job_id = %key.job_id, added, "Enqueued recipients");
        Ok(added)
    }

    async fn requeue(&self, job: &RecipientJob) -> AppResult<()> {
        self.push(&job.key(), std::slice::from_ref(job), false, None)
            .await?;
        Ok(())
    }

    async fn dequeue(&self, key: &JobKey, max: usize) -> AppResult<Vec<RecipientJob>> {
        let items: Vec<String> = self
            .redis
            .eval(
                DEQUEUE_SCRIPT,
                vec![self.queue_key(key), self.pending_key(key)],
                vec![max.to_string()],
            )
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;

        items
            .iter()
            .map(|item| serde_json::from_str(item).map_err(AppError::from))
            .collect()
    }

    async fn pending_len(&self, key: &JobKey) -> AppResult<u64> {
        let len: u64 = self
            .redis
            .zcard(self.queue_key(key))
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        Ok(len)
    }

    async fn settle(&self, job_id: &str, settle: Settle) -> AppResult<SettleOutcome> {
        let remaining: i64 = self
            .redis
            .eval(
                SETTLE_SCRIPT,
                vec![self.stats_key(job_id)],
                vec![settle.field().to_string()],
            )
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;

        if remaining < 0 {
            Ok(SettleOutcome::NotApplied)
        } else {
            Ok(SettleOutcome::Applied { remaining })
        }
    }

    async fn get_stats(&self, job_id: &str) -> AppResult<Option<JobStats>> {
        let fields: HashMap<String, String> = self
            .redis
            .hgetall(self.stats_key(job_id))
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(JobStats {
            initial: parse_counter(&fields, "initial")?,
            remaining: parse_counter(&fields, "remaining")?,
            success: parse_counter(&fields, "success")?,
            fail: parse_counter(&fields, "fail")?,
        }))
    }

    async fn get_status(&self, job_id: &str) -> AppResult<Option<JobStatusRecord>> {
        let fields: HashMap<String, String> = self
            .redis
            .hgetall(self.status_key(job_id))
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        let Some(status) = fields.get("status") else {
            return Ok(None);
        };

        let status: JobStatus = status.parse().map_err(AppError::Queue)?;
        let updated_at = fields
            .get("updated_at")
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map_or_else(Utc::now, |t| t.with_timezone(&Utc));

        Ok(Some(JobStatusRecord {
            status,
            owner_id: fields.get("owner_id").cloned().unwrap_or_default(),
            updated_at,
            reason: fields.get("reason").filter(|r| !r.is_empty()).cloned(),
        }))
    }

    async fn set_status(&self, job_id: &str, record: &JobStatusRecord) -> AppResult<()> {
        let values = vec![
            ("status", record.status.as_str().to_string()),
            ("owner_id", record.owner_id.clone()),
            ("updated_at", record.updated_at.to_rfc3339()),
            ("reason", record.reason.clone().unwrap_or_default()),
        ];
        let _: i64 = self
            .redis
            .hset(self.status_key(job_id), values)
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        Ok(())
    }

    async fn replace_status(
        &self,
        job_id: &str,
        expected: JobStatus,
        record: &JobStatusRecord,
    ) -> AppResult<bool> {
        let args = vec![
            expected.as_str().to_string(),
            record.status.as_str().to_string(),
            record.owner_id.clone(),
            record.updated_at.to_rfc3339(),
            record.reason.clone().unwrap_or_default(),
        ];
        let written: i64 = self
            .redis
            .eval(REPLACE_STATUS_SCRIPT, vec![self.status_key(job_id)], args)
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        Ok(written == 1)
    }

    async fn set_message(&self, job_id: &str, message: &JobMessage) -> AppResult<()> {
        let values = vec![
            ("text", message.text.clone()),
            ("proxy_hint", message.proxy_hint.clone().unwrap_or_default()),
        ];
        let _: i64 = self
            .redis
            .hset(self.meta_key(job_id), values)
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        Ok(())
    }

    async fn get_message(&self, job_id: &str) -> AppResult<Option<JobMessage>> {
        let mut fields: HashMap<String, String> = self
            .redis
            .hgetall(self.meta_key(job_id))
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        let Some(text) = fields.remove("text") else {
            return Ok(None);
        };

        Ok(Some(JobMessage {
            text,
            proxy_hint: fields.remove("proxy_hint").filter(|p| !p.is_empty()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let config = fred::types::config::Config::default();
        let store = RedisQueueStore::new(RedisClient::new(config, None, None, None), "courier");
        let key = JobKey::new("owner1", "job1");

        assert_eq!(store.queue_key(&key), "courier:queue:owner1:job1");
        assert_eq!(store.pending_key(&key), "courier:pending:owner1:job1");
        assert_eq!(store.stats_key("job1"), "courier:stats:job1");
        assert_eq!(store.status_key("job1"), "courier:status:job1");
        assert_eq!(store.meta_key("job1"), "courier:meta:job1");
    }

    #[test]
    fn test_parse_counter_rejects_garbage() {
        let mut fields = HashMap::new();
        fields.insert("remaining".to_string(), "12".to_string());
        fields.insert("fail".to_string(), "x".to_string());

        assert_eq!(parse_counter(&fields, "remaining").ok(), Some(12));
        assert_eq!(parse_counter(&fields, "success").ok(), Some(0));
        assert!(parse_counter(&fields, "fail").is_err());
    }
}
