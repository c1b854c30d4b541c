//! Shared dispatch state.
//!
//! One [`Engine`] is built per scheduler. It owns the process-local
//! registries (assignments, retry budgets, backpressure throttle, poll loops)
//! and hands out the external collaborators to the dispatch cycle, the result
//! handler and the poll loops. Nothing here is global: two schedulers in one
//! process share no state.

use std::collections::HashMap;
use std::sync::Arc;

use courier_common::{AppResult, DispatchConfig};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::assignment::AssignmentRegistry;
use crate::credentials::CredentialPool;
use crate::jobs::{JobKey, JobStatus, JobStatusRecord};
use crate::poll::JobLoop;
use crate::pubsub::{GatewayEvent, Notifier};
use crate::rate_limit::BackpressureThrottle;
use crate::retry::{RetryBook, RetryConfig};
use crate::store::QueueStore;
use crate::transport::Transport;

pub(crate) struct Engine {
    pub(crate) store: Arc<dyn QueueStore>,
    pub(crate) credentials: Arc<dyn CredentialPool>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) config: DispatchConfig,
    pub(crate) registry: AssignmentRegistry,
    pub(crate) retries: RetryBook,
    pub(crate) throttle: BackpressureThrottle,
    pub(crate) loops: Mutex<HashMap<JobKey, JobLoop>>,
}

impl Engine {
    pub(crate) fn new(
        store: Arc<dyn QueueStore>,
        credentials: Arc<dyn CredentialPool>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            transport,
            notifier,
            retries: RetryBook::new(RetryConfig::from(&config)),
            throttle: BackpressureThrottle::new(config.backpressure_interval()),
            registry: AssignmentRegistry::new(),
            loops: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Push an event to the owner. Delivery failures are logged, never
    /// propagated: the gateway is best effort.
    pub(crate) async fn notify(&self, owner_id: &str, event: GatewayEvent) {
        if let Err(e) = self.notifier.publish(owner_id, &event).await {
            warn!(owner_id, error = %e, "Failed to publish gateway event");
        }
    }

    /// Status of a job, `idle` if none was ever recorded.
    pub(crate) async fn status_of(&self, key: &JobKey) -> AppResult<JobStatus> {
        Ok(self
            .store
            .get_status(&key.job_id)
            .await?
            .map_or(JobStatus::Idle, |r| r.status))
    }

    /// Record a status transition and tell the owner about it.
    pub(crate) async fn transition(
        &self,
        key: &JobKey,
        status: JobStatus,
        reason: Option<&str>,
    ) -> AppResult<()> {
        let record = JobStatusRecord::now(status, &key.owner_id, reason);
        self.store.set_status(&key.job_id, &record).await?;
        self.announce(key, status, reason).await;
        Ok(())
    }

    /// Like [`Engine::transition`], but only if the job is still in `from`.
    /// Returns whether the transition happened.
    pub(crate) async fn transition_from(
        &self,
        key: &JobKey,
        from: JobStatus,
        status: JobStatus,
        reason: Option<&str>,
    ) -> AppResult<bool> {
        let record = JobStatusRecord::now(status, &key.owner_id, reason);
        if !self
            .store
            .replace_status(&key.job_id, from, &record)
            .await?
        {
            return Ok(false);
        }
        self.announce(key, status, reason).await;
        Ok(true)
    }

    async fn announce(&self, key: &JobKey, status: JobStatus, reason: Option<&str>) {
        // A finished job may signal for more work right away once restarted
        if status.is_terminal() {
            self.throttle.reset(&key.job_id).await;
        }

        info!(
            owner_id = %key.owner_id,
            job_id = %key.job_id,
            status = %status,
            reason = reason.unwrap_or(""),
            "Job status changed"
        );

        let message = reason.map_or_else(|| default_message(status).to_string(), String::from);
        self.notify(&key.owner_id, GatewayEvent::status(&key.job_id, status, message))
            .await;
    }

    /// Publish the job's current counters.
    pub(crate) async fn publish_progress(&self, key: &JobKey) -> AppResult<()> {
        if let Some(stats) = self.store.get_stats(&key.job_id).await? {
            self.notify(&key.owner_id, GatewayEvent::progress(&key.job_id, &stats))
                .await;
        }
        Ok(())
    }
}

const fn default_message(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Idle => "job is idle",
        JobStatus::Running => "job is running",
        JobStatus::Stopped => "job was stopped",
        JobStatus::Completed => "all recipients settled",
        JobStatus::PendingSettlement => "job is awaiting settlement",
    }
}
