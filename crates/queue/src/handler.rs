//! Result handler: turns one send outcome into state transitions.
//!
//! | outcome | credential | worker | recipient |
//! |---|---|---|---|
//! | sent | streak cleared, usage counted | continues | settled as success |
//! | session invalid | streak extended, exited at threshold | stops | bounded requeue |
//! | maintenance / exited / restricted / other | demoted | stops | bounded requeue |
//! | too fast | throttled | stops | requeued, never counted as a fail |
//! | network error | untouched | continues | requeued up to the network limit, then failed |
//!
//! The recipient's assignment is released before it is requeued or settled.
//! Failures after the recipient has been accounted for are logged rather
//! than returned, so the caller never requeues a settled recipient.

use std::sync::Arc;

use courier_common::AppResult;
use courier_db::entities::CredentialStatus;
use tracing::{debug, error, warn};

use crate::credentials::Credential;
use crate::engine::Engine;
use crate::jobs::{JobStatus, RecipientJob, Settle, SettleOutcome};
use crate::outcome::SendOutcome;
use crate::retry::RetryDecision;
use crate::transport::SendResult;

/// What the worker should do after an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    /// The send succeeded; it counts against the credential's quota.
    pub sent: bool,
    /// The credential must not be used again in this cycle.
    pub stop_credential: bool,
}

pub(crate) async fn handle(
    engine: &Arc<Engine>,
    job: &RecipientJob,
    credential: &Credential,
    result: &SendResult,
) -> AppResult<Verdict> {
    let outcome = result.outcome();
    debug!(
        job_id = %job.job_id,
        recipient_id = %job.recipient_id,
        credential_id = %credential.id,
        code = result.code,
        message = %result.message,
        "Send outcome"
    );

    if outcome != SendOutcome::SessionInvalid {
        engine.retries.clear_streak(&credential.id).await;
    }

    match outcome {
        SendOutcome::Sent => {
            release(engine, job, credential).await;
            settle(engine, job, Settle::Success).await?;
            if let Err(e) = engine.credentials.record_success(&credential.id).await {
                error!(credential_id = %credential.id, error = %e, "Failed to record credential usage");
            }
        }
        SendOutcome::SessionInvalid => {
            if engine.retries.bump_streak(&credential.id).await {
                demote(engine, credential, CredentialStatus::Exited).await?;
            }
            retry_or_fail(engine, job, credential).await?;
        }
        SendOutcome::TooFast => {
            demote(engine, credential, CredentialStatus::Throttled).await?;
            release(engine, job, credential).await;
            engine.store.requeue(job).await?;
        }
        SendOutcome::NetworkError => {
            release(engine, job, credential).await;
            match engine
                .retries
                .record_network_failure(&job.job_id, &job.recipient_id)
                .await
            {
                RetryDecision::Requeue => engine.store.requeue(job).await?,
                RetryDecision::Exhausted => {
                    warn!(
                        job_id = %job.job_id,
                        recipient_id = %job.recipient_id,
                        "Network retries exhausted"
                    );
                    settle(engine, job, Settle::Fail).await?;
                }
            }
        }
        SendOutcome::Maintenance
        | SendOutcome::SessionExited
        | SendOutcome::Restricted
        | SendOutcome::Other(_) => {
            if let Some(status) = outcome.demotion() {
                demote(engine, credential, status).await?;
            }
            retry_or_fail(engine, job, credential).await?;
        }
    }

    // Hand the loop its next round; a success suggests the same tier again
    let sent = outcome == SendOutcome::Sent;
    engine
        .wake_loop(&job.key(), sent.then_some(credential.priority))
        .await;

    Ok(Verdict {
        sent,
        stop_credential: outcome.stops_credential(),
    })
}

async fn release(engine: &Engine, job: &RecipientJob, credential: &Credential) {
    engine
        .registry
        .release(&job.recipient_id, &credential.id)
        .await;
}

async fn demote(engine: &Engine, credential: &Credential, status: CredentialStatus) -> AppResult<()> {
    warn!(credential_id = %credential.id, ?status, "Demoting credential");
    engine.credentials.set_status(&credential.id, status).await
}

/// Requeue within the retry budget, settle as failed once it is spent.
async fn retry_or_fail(
    engine: &Engine,
    job: &RecipientJob,
    credential: &Credential,
) -> AppResult<()> {
    release(engine, job, credential).await;
    match engine
        .retries
        .record_failure(&job.job_id, &job.recipient_id)
        .await
    {
        RetryDecision::Requeue => engine.store.requeue(job).await,
        RetryDecision::Exhausted => {
            warn!(
                job_id = %job.job_id,
                recipient_id = %job.recipient_id,
                "Retry budget exhausted"
            );
            settle(engine, job, Settle::Fail).await
        }
    }
}

async fn settle(engine: &Engine, job: &RecipientJob, settle: Settle) -> AppResult<()> {
    let key = job.key();
    match engine.store.settle(&job.job_id, settle).await? {
        SettleOutcome::Applied { remaining } => {
            engine
                .retries
                .clear_recipient(&job.job_id, &job.recipient_id)
                .await;
            if let Err(e) = engine.publish_progress(&key).await {
                error!(job_id = %job.job_id, error = %e, "Failed to read progress");
            }
            if remaining <= 0 {
                if let Err(e) = engine.transition(&key, JobStatus::Completed, None).await {
                    error!(job_id = %job.job_id, error = %e, "Failed to mark job completed");
                }
            }
        }
        SettleOutcome::NotApplied => {
            debug!(job_id = %job.job_id, recipient_id = %job.recipient_id, "Nothing left to settle");
        }
    }
    Ok(())
}
