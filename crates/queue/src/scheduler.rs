//! Public scheduler facade.

use std::sync::Arc;
use std::time::Duration;

use courier_common::{AppError, AppResult, DispatchConfig, IdGenerator};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

use crate::assignment::AssignmentRegistry;
use crate::credentials::CredentialPool;
use crate::dispatch::{self, CycleReport};
use crate::engine::Engine;
use crate::jobs::{JobKey, JobMessage, JobStats, JobStatus, JobStatusRecord, RecipientJob};
use crate::pubsub::{GatewayCommand, GatewayEvent, Notifier};
use crate::store::QueueStore;
use crate::transport::Transport;

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    /// Tag stamped on every recipient of this submission.
    pub batch_tag: String,
    /// Recipients added; already-queued ones are skipped.
    pub accepted: u64,
}

/// DM-send scheduler.
///
/// Owns the assignment registry, retry counters, backpressure throttle and
/// poll loops of its jobs. Exactly one process must own dispatch for a given
/// job at a time; these registries are volatile and not shared between
/// processes.
pub struct Scheduler {
    engine: Arc<Engine>,
    ids: IdGenerator,
    maintenance: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler over the given collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn QueueStore>,
        credentials: Arc<dyn CredentialPool>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            engine: Arc::new(Engine::new(store, credentials, transport, notifier, config)),
            ids: IdGenerator::new(),
            maintenance: std::sync::Mutex::new(None),
        }
    }

    /// Set the message sent to every recipient of a job.
    pub async fn configure_job(&self, job_id: &str, message: JobMessage) -> AppResult<()> {
        if message.text.trim().is_empty() {
            return Err(AppError::BadRequest("message text must not be empty".to_string()));
        }
        self.engine.store.set_message(job_id, &message).await
    }

    /// Enqueue recipients for a job.
    ///
    /// Without `declared_total` every accepted recipient grows the job's
    /// counters. With it, the counters are sized once and only grow when the
    /// queue outruns them. A running job's loop is woken; a completed job
    /// goes back to `idle` so it can be started again.
    pub async fn submit(
        &self,
        owner_id: &str,
        job_id: &str,
        recipients: &[String],
        declared_total: Option<u64>,
    ) -> AppResult<Submission> {
        if owner_id.is_empty() || job_id.is_empty() {
            return Err(AppError::BadRequest("owner and job IDs are required".to_string()));
        }

        let key = JobKey::new(owner_id, job_id);
        let batch_tag = self.ids.generate();
        let accepted = self
            .engine
            .store
            .enqueue(&key, recipients, &batch_tag, declared_total)
            .await?;

        info!(owner_id, job_id, batch_tag, accepted, "Recipients submitted");

        if accepted > 0 {
            match self.engine.status_of(&key).await? {
                JobStatus::Running => self.engine.trigger_loop(&key, None).await,
                // New work reopens a finished job; it runs again on start
                JobStatus::Completed => {
                    self.engine
                        .transition_from(
                            &key,
                            JobStatus::Completed,
                            JobStatus::Idle,
                            Some("new recipients submitted"),
                        )
                        .await?;
                }
                _ => {}
            }
        }
        Ok(Submission {
            batch_tag,
            accepted,
        })
    }

    /// Start (or restart) a job.
    ///
    /// Fails with [`AppError::NotFound`] if the job was never submitted or
    /// has no message, and with [`AppError::Conflict`] if it is awaiting
    /// settlement. Starting a job with nothing left is a no-op.
    pub async fn start(&self, owner_id: &str, job_id: &str) -> AppResult<JobStatus> {
        let key = JobKey::new(owner_id, job_id);
        let stats = self
            .engine
            .store
            .get_stats(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {key}")))?;
        if self.engine.store.get_message(job_id).await?.is_none() {
            return Err(AppError::NotFound(format!("message for job {key}")));
        }

        let status = self.engine.status_of(&key).await?;
        if !status.can_start() {
            return Err(AppError::Conflict(format!("job {key} is {status}")));
        }
        if stats.remaining <= 0 {
            debug!(owner_id, job_id, "Nothing left to send");
            return Ok(status);
        }

        if status != JobStatus::Running {
            self.engine.transition(&key, JobStatus::Running, None).await?;
        }
        self.engine.resume_loop(&key).await;
        self.engine.trigger_loop(&key, None).await;
        Ok(JobStatus::Running)
    }

    /// Stop a job. In-flight sends finish; no new cycle starts.
    ///
    /// Fails with [`AppError::NotFound`] for a job that was never submitted.
    pub async fn stop(&self, owner_id: &str, job_id: &str) -> AppResult<()> {
        let key = JobKey::new(owner_id, job_id);
        if self.engine.store.get_stats(job_id).await?.is_none()
            && self.engine.store.get_status(job_id).await?.is_none()
        {
            return Err(AppError::NotFound(format!("job {key}")));
        }
        self.engine.stop_loop(&key).await;
        self.engine
            .transition(&key, JobStatus::Stopped, Some("manual stop"))
            .await
    }

    /// Hand a job over to external settlement.
    pub async fn request_settlement(&self, owner_id: &str, job_id: &str) -> AppResult<()> {
        let key = JobKey::new(owner_id, job_id);
        if self.engine.store.get_stats(job_id).await?.is_none() {
            return Err(AppError::NotFound(format!("job {key}")));
        }
        self.engine.stop_loop(&key).await;
        self.engine
            .transition(&key, JobStatus::PendingSettlement, None)
            .await
    }

    /// Status record of a job, created `idle` on first observation.
    pub async fn get_status(&self, owner_id: &str, job_id: &str) -> AppResult<JobStatusRecord> {
        if let Some(record) = self.engine.store.get_status(job_id).await? {
            return Ok(record);
        }
        let record = JobStatusRecord::now(JobStatus::Idle, owner_id, None);
        self.engine.store.set_status(job_id, &record).await?;
        Ok(record)
    }

    /// Counters of a job.
    pub async fn get_stats(&self, job_id: &str) -> AppResult<JobStats> {
        self.engine
            .store
            .get_stats(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    /// Apply a command received from the notification gateway.
    pub async fn handle_command(&self, command: GatewayCommand) -> AppResult<()> {
        debug!(?command, "Handling gateway command");
        match command {
            GatewayCommand::Start { owner_id, job_id } => {
                self.start(&owner_id, &job_id).await?;
            }
            GatewayCommand::Stop { owner_id, job_id } => {
                self.stop(&owner_id, &job_id).await?;
            }
            GatewayCommand::Status { owner_id, job_id } => {
                let record = self.get_status(&owner_id, &job_id).await?;
                let message = record.reason.unwrap_or_else(|| record.status.to_string());
                self.engine
                    .notify(
                        &owner_id,
                        GatewayEvent::status(&job_id, record.status, message),
                    )
                    .await;
                if let Some(stats) = self.engine.store.get_stats(&job_id).await? {
                    self.engine
                        .notify(&owner_id, GatewayEvent::progress(&job_id, &stats))
                        .await;
                }
            }
            GatewayCommand::Settle { owner_id, job_id } => {
                self.request_settlement(&owner_id, &job_id).await?;
            }
        }
        Ok(())
    }

    /// Run one dispatch cycle over an explicit batch, outside any poll loop.
    pub async fn run_cycle(
        &self,
        owner_id: &str,
        job_id: &str,
        batch: Vec<RecipientJob>,
        preferred_priority: Option<i16>,
    ) -> AppResult<CycleReport> {
        let key = JobKey::new(owner_id, job_id);
        dispatch::run_cycle(&self.engine, &key, batch, preferred_priority).await
    }

    /// Whether the job's poll loop is currently driving cycles.
    pub async fn is_processing(&self, owner_id: &str, job_id: &str) -> bool {
        self.engine
            .loop_processing(&JobKey::new(owner_id, job_id))
            .await
    }

    /// Number of job loops currently alive.
    pub async fn active_loops(&self) -> usize {
        self.engine.live_loops().await
    }

    /// The process-wide assignment registry.
    #[must_use]
    pub fn registry(&self) -> &AssignmentRegistry {
        &self.engine.registry
    }

    /// Periodically prune stale backpressure entries.
    pub fn start_maintenance(&self, every: Duration) {
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            loop {
                ticker.tick().await;
                engine.throttle.cleanup().await;
                let tracked = engine.throttle.tracked().await;
                let assigned = engine.registry.len().await;
                let loops = engine.live_loops().await;
                debug!(tracked, assigned, loops, "Scheduler maintenance");
            }
        });

        if let Ok(mut slot) = self.maintenance.lock() {
            if let Some(old) = slot.replace(handle) {
                old.abort();
            }
        }
    }

    /// Stop all loops and wait for in-flight cycles to finish.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.maintenance.lock().ok().and_then(|mut slot| slot.take()) {
            handle.abort();
        }
        self.engine.shutdown_loops().await;
        self.engine.registry.clear().await;
        self.engine.retries.clear().await;
        info!("Scheduler shut down");
    }
}
