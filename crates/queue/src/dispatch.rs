//! Dispatch cycle: credential allocation and worker fan-out.
//!
//! One cycle takes a batch of recipients of one job, selects eligible
//! credentials by priority class, and runs one concurrent worker per
//! credential. Workers share the batch and stop on their credential's daily
//! quota, on an outcome that retires the credential, or when the batch runs
//! dry. Whatever is left afterwards goes back to the queue.
//!
//! Fan-out width is the number of credentials with quota left, not a fixed
//! pool size: credential scarcity throttles concurrency.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use courier_common::{AppError, AppResult, DispatchConfig};
use courier_db::entities::{PRIORITY_HIGH, PRIORITY_STANDARD};
use courier_db::repositories::PriorityFilter;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::credentials::{Credential, CredentialQuery};
use crate::engine::Engine;
use crate::handler;
use crate::jobs::{JobKey, JobMessage, JobStatus, RecipientJob};
use crate::transport::SendResult;

/// What one dispatch cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Credentials that ran a worker.
    pub credentials: usize,
    /// Sends attempted.
    pub attempted: usize,
    /// Sends that succeeded.
    pub sent: usize,
    /// Recipients put back in the queue without a send attempt.
    pub requeued: usize,
}

/// Credential fetch sizes for ratio-based selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    /// Credentials requested from the high-priority class.
    pub high: usize,
    /// Credentials requested from the standard class.
    pub low: usize,
}

impl FetchPlan {
    /// Total credentials requested.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.high + self.low
    }
}

/// Ceiling that ignores float noise below `1e-9`.
fn ceil_tolerant(value: f64) -> usize {
    let rounded = value.round();
    let value = if (value - rounded).abs() < 1e-9 {
        rounded
    } else {
        value.ceil()
    };
    value.max(0.0) as usize
}

/// Credentials to request for `target` recipients.
#[must_use]
pub fn fetch_plan(target: usize, config: &DispatchConfig) -> FetchPlan {
    let wanted = target as f64 * config.priority_multiplier;
    let total = ceil_tolerant(wanted);
    let high = ceil_tolerant(wanted * config.high_ratio).min(total);
    let low = ceil_tolerant(wanted * config.low_ratio).min(total - high);
    FetchPlan { high, low }
}

/// Number of credentials one cycle asks for.
#[must_use]
pub fn credential_target(batch_len: usize, config: &DispatchConfig) -> usize {
    batch_len.clamp(1, config.max_account_batch_size.max(1))
}

async fn top_up(
    engine: &Engine,
    pool: &str,
    picked: &mut Vec<Credential>,
    priority: PriorityFilter,
    want: usize,
) -> AppResult<()> {
    if want == 0 {
        return Ok(());
    }

    let query = CredentialQuery {
        priority,
        daily_cap: engine.config.daily_cap,
        exclude: picked.iter().map(|c| c.id.clone()).collect(),
        limit: want,
    };
    let found = engine.credentials.select(pool, &query).await?;
    picked.extend(found);
    Ok(())
}

async fn select_from(
    engine: &Engine,
    pool: &str,
    target: usize,
    preferred: Option<i16>,
) -> AppResult<Vec<Credential>> {
    let mut picked = Vec::new();

    if let Some(p) = preferred {
        top_up(engine, pool, &mut picked, PriorityFilter::Exactly(p), target).await?;
        for class in [PRIORITY_HIGH, PRIORITY_STANDARD] {
            if class != p {
                let want = target.saturating_sub(picked.len());
                top_up(engine, pool, &mut picked, PriorityFilter::Exactly(class), want).await?;
            }
        }
        let mut others = vec![PRIORITY_HIGH, PRIORITY_STANDARD];
        if !others.contains(&p) {
            others.push(p);
        }
        let want = target.saturating_sub(picked.len());
        top_up(engine, pool, &mut picked, PriorityFilter::Excluding(others), want).await?;
        return Ok(picked);
    }

    let plan = fetch_plan(target, &engine.config);
    top_up(engine, pool, &mut picked, PriorityFilter::Exactly(PRIORITY_HIGH), plan.high).await?;
    let high_found = picked.len();
    top_up(engine, pool, &mut picked, PriorityFilter::Exactly(PRIORITY_STANDARD), plan.low).await?;

    // Cross-class shortfall fill, then any other priority value
    if picked.len() < plan.total() && high_found < plan.high {
        let want = plan.total() - picked.len();
        top_up(engine, pool, &mut picked, PriorityFilter::Exactly(PRIORITY_STANDARD), want)
            .await?;
    }
    if picked.len() < plan.total() {
        let want = plan.total() - picked.len();
        top_up(engine, pool, &mut picked, PriorityFilter::Exactly(PRIORITY_HIGH), want).await?;
    }
    let want = plan.total().saturating_sub(picked.len());
    top_up(
        engine,
        pool,
        &mut picked,
        PriorityFilter::Excluding(vec![PRIORITY_HIGH, PRIORITY_STANDARD]),
        want,
    )
    .await?;

    Ok(picked)
}

/// Select credentials for a cycle, falling back to the default pool once if
/// the owner's pool does not exist.
async fn select_credentials(
    engine: &Engine,
    owner_id: &str,
    target: usize,
    preferred: Option<i16>,
) -> AppResult<(String, Vec<Credential>)> {
    let pool = engine.config.pool_for(owner_id);
    match select_from(engine, pool, target, preferred).await {
        Err(AppError::NotFound(e)) if pool != engine.config.default_pool => {
            warn!(owner_id, pool, error = %e, "Credential pool missing, using default pool");
            let default_pool = engine.config.default_pool.as_str();
            let picked = select_from(engine, default_pool, target, preferred).await?;
            Ok((default_pool.to_string(), picked))
        }
        other => other.map(|picked| (pool.to_string(), picked)),
    }
}

async fn requeue_all(engine: &Engine, jobs: &[RecipientJob]) -> AppResult<()> {
    for job in jobs {
        engine.store.requeue(job).await?;
    }
    Ok(())
}

/// Requeue after a failure that already has an error to report.
async fn requeue_after_error(engine: &Engine, jobs: &[RecipientJob]) {
    if let Err(e) = requeue_all(engine, jobs).await {
        error!(count = jobs.len(), error = %e, "Failed to return recipients to the queue");
    }
}

#[derive(Default)]
struct WorkerReport {
    attempted: usize,
    sent: usize,
    requeued: usize,
}

struct Worker<'a> {
    engine: &'a Arc<Engine>,
    pool: &'a str,
    message: &'a JobMessage,
    queue: &'a Mutex<VecDeque<RecipientJob>>,
}

impl Worker<'_> {
    async fn run(&self, credential: Credential) -> AppResult<WorkerReport> {
        let engine = self.engine;
        let mut report = WorkerReport::default();
        let mut quota = credential.remaining_quota(engine.config.daily_cap);

        while quota > 0 {
            let Some(mut job) = self.queue.lock().await.pop_front() else {
                break;
            };

            // Another cycle may have claimed the recipient since dedup
            if !engine
                .registry
                .try_assign(&job.recipient_id, &credential.id, &job.job_id)
                .await
            {
                engine.store.requeue(&job).await?;
                report.requeued += 1;
                continue;
            }

            job.assigned_pool = Some(self.pool.to_string());
            job.assigned_priority = Some(credential.priority);
            report.attempted += 1;

            let result = match engine
                .transport
                .send(
                    &job.recipient_id,
                    &credential,
                    &self.message.text,
                    self.message.proxy_hint.as_deref(),
                )
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        recipient_id = %job.recipient_id,
                        credential_id = %credential.id,
                        error = %e,
                        "Transport failed"
                    );
                    SendResult::network_error(&e)
                }
            };

            let verdict = match handler::handle(engine, &job, &credential, &result).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    engine
                        .registry
                        .release(&job.recipient_id, &credential.id)
                        .await;
                    requeue_after_error(engine, std::slice::from_ref(&job)).await;
                    return Err(e);
                }
            };

            if verdict.sent {
                quota -= 1;
                report.sent += 1;
            }
            if verdict.stop_credential {
                debug!(credential_id = %credential.id, code = result.code, "Credential stopped");
                break;
            }
        }

        Ok(report)
    }
}

/// Run one dispatch cycle over `batch`.
///
/// Every recipient of the batch is either handed to the result handler or
/// put back in the queue. Store failures propagate after a best-effort
/// requeue of whatever was not yet handled.
pub(crate) async fn run_cycle(
    engine: &Arc<Engine>,
    key: &JobKey,
    batch: Vec<RecipientJob>,
    preferred: Option<i16>,
) -> AppResult<CycleReport> {
    let mut report = CycleReport::default();
    if batch.is_empty() {
        return Ok(report);
    }

    let message = match engine.store.get_message(&key.job_id).await {
        Ok(Some(message)) => message,
        Ok(None) => {
            requeue_after_error(engine, &batch).await;
            return Err(AppError::NotFound(format!("message for job {key}")));
        }
        Err(e) => {
            requeue_after_error(engine, &batch).await;
            return Err(e);
        }
    };

    let target = credential_target(batch.len(), &engine.config);
    let (pool, credentials) =
        match select_credentials(engine, &key.owner_id, target, preferred).await {
            Ok(selected) => selected,
            Err(e) => {
                requeue_after_error(engine, &batch).await;
                return Err(e);
            }
        };

    // Dedup by recipient; duplicates and recipients busy elsewhere go back
    let mut seen = HashSet::new();
    let mut work = VecDeque::with_capacity(batch.len());
    let mut deferred = Vec::new();
    for job in batch {
        let duplicate = !seen.insert(job.recipient_id.clone());
        if duplicate || engine.registry.is_assigned(&job.recipient_id).await {
            deferred.push(job);
        } else {
            work.push_back(job);
        }
    }
    requeue_all(engine, &deferred).await?;
    report.requeued += deferred.len();

    let daily_cap = engine.config.daily_cap;
    let usable: Vec<Credential> = credentials
        .into_iter()
        .filter(|c| c.remaining_quota(daily_cap) > 0)
        .collect();

    if usable.is_empty() {
        let pending: Vec<RecipientJob> = work.into_iter().collect();
        requeue_all(engine, &pending).await?;
        report.requeued += pending.len();
        warn!(owner_id = %key.owner_id, job_id = %key.job_id, pool, "No eligible credentials");
        engine
            .transition(key, JobStatus::Stopped, Some("no eligible credentials"))
            .await?;
        return Ok(report);
    }

    report.credentials = usable.len();
    debug!(
        owner_id = %key.owner_id,
        job_id = %key.job_id,
        pool,
        credentials = usable.len(),
        recipients = work.len(),
        "Starting dispatch cycle"
    );

    let queue = Mutex::new(work);
    let worker = Worker {
        engine,
        pool: &pool,
        message: &message,
        queue: &queue,
    };
    let results = join_all(usable.into_iter().map(|c| worker.run(c))).await;

    let leftover: Vec<RecipientJob> = queue.into_inner().into_iter().collect();
    let mut first_error = None;
    for result in results {
        match result {
            Ok(r) => {
                report.attempted += r.attempted;
                report.sent += r.sent;
                report.requeued += r.requeued;
            }
            Err(e) => {
                error!(job_id = %key.job_id, error = %e, "Dispatch worker failed");
                first_error.get_or_insert(e);
            }
        }
    }

    if let Some(e) = first_error {
        requeue_after_error(engine, &leftover).await;
        return Err(e);
    }
    requeue_all(engine, &leftover).await?;
    report.requeued += leftover.len();

    info!(
        owner_id = %key.owner_id,
        job_id = %key.job_id,
        credentials = report.credentials,
        attempted = report.attempted,
        sent = report.sent,
        requeued = report.requeued,
        "Dispatch cycle finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_plan_defaults() {
        let config = DispatchConfig::default();
        let target = credential_target(90, &config);

        assert_eq!(target, 60);
        assert_eq!(fetch_plan(target, &config), FetchPlan { high: 60, low: 30 });
    }

    #[test]
    fn test_fetch_plan_rounds_up() {
        let config = DispatchConfig::default();
        // 7 * 1.5 = 10.5 -> 11; high ceil(7.0) = 7, low ceil(3.5) = 4
        assert_eq!(fetch_plan(7, &config), FetchPlan { high: 7, low: 4 });
        // 1 * 1.5 = 1.5 -> 2; high ceil(1.0) = 1, low ceil(0.5) = 1
        assert_eq!(fetch_plan(1, &config), FetchPlan { high: 1, low: 1 });
    }

    #[test]
    fn test_fetch_plan_low_capped_by_total() {
        let config = DispatchConfig {
            priority_multiplier: 1.0,
            high_ratio: 0.5,
            low_ratio: 0.5,
            ..DispatchConfig::default()
        };
        // 3 * 0.5 = 1.5 -> 2 high; low ceil(1.5) = 2 capped at 3 - 2
        assert_eq!(fetch_plan(3, &config), FetchPlan { high: 2, low: 1 });
    }

    #[test]
    fn test_credential_target_clamps() {
        let config = DispatchConfig::default();
        assert_eq!(credential_target(0, &config), 1);
        assert_eq!(credential_target(10, &config), 10);
        assert_eq!(credential_target(500, &config), 60);
    }

    #[test]
    fn test_ceil_tolerant() {
        assert_eq!(ceil_tolerant(60.000_000_000_01), 60);
        assert_eq!(ceil_tolerant(59.999_999_999_99), 60);
        assert_eq!(ceil_tolerant(10.5), 11);
        assert_eq!(ceil_tolerant(-1.0), 0);
    }
}
