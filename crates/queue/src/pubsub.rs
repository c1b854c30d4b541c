//! Notification gateway over Redis Pub/Sub.
//!
//! Outbound, the scheduler pushes [`GatewayEvent`]s to the owner's channel.
//! Inbound, [`CommandListener`] turns messages on the command channel into
//! scheduler calls. The client-facing gateway that relays both directions to
//! connected owners lives outside this crate; it marks an owner as online by
//! keeping the owner's presence key alive.

#![allow(missing_docs)]

use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{AppError, AppResult};
use fred::clients::{Client, SubscriberClient};
use fred::interfaces::{EventInterface, KeysInterface, PubsubInterface};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::jobs::{JobStats, JobStatus};
use crate::scheduler::Scheduler;

/// Channel and key names, relative to the configured prefix.
pub mod channels {
    /// Per-owner event channel (suffix with owner ID).
    pub const OWNER_PREFIX: &str = "owner:";
    /// Per-owner presence key (suffix with owner ID).
    pub const PRESENCE_PREFIX: &str = "presence:";
    /// Inbound command channel.
    pub const COMMANDS: &str = "commands";
}

/// Event pushed to a job's owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GatewayEvent {
    /// Job status changed.
    #[serde(rename_all = "camelCase")]
    Status {
        job_id: String,
        status: JobStatus,
        message: String,
        is_terminal: bool,
    },
    /// Job counters moved.
    #[serde(rename_all = "camelCase")]
    Progress {
        job_id: String,
        total: i64,
        success: i64,
        fail: i64,
        completed: i64,
        remaining: i64,
        percent_complete: f64,
    },
    /// The job can take more recipients.
    #[serde(rename_all = "camelCase")]
    NeedMore { job_id: String, need: i64 },
}

impl GatewayEvent {
    /// Progress event for a job's counters.
    #[must_use]
    pub fn progress(job_id: &str, stats: &JobStats) -> Self {
        Self::Progress {
            job_id: job_id.to_string(),
            total: stats.initial,
            success: stats.success,
            fail: stats.fail,
            completed: stats.completed(),
            remaining: stats.remaining,
            percent_complete: stats.percent_complete(),
        }
    }

    /// Status event for a transition.
    #[must_use]
    pub fn status(job_id: &str, status: JobStatus, message: impl Into<String>) -> Self {
        Self::Status {
            job_id: job_id.to_string(),
            status,
            message: message.into(),
            is_terminal: status.is_terminal(),
        }
    }
}

/// Command sent by a job's owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum GatewayCommand {
    Start { owner_id: String, job_id: String },
    Stop { owner_id: String, job_id: String },
    Status { owner_id: String, job_id: String },
    Settle { owner_id: String, job_id: String },
}

impl GatewayCommand {
    /// Owner and job the command targets.
    #[must_use]
    pub fn target(&self) -> (&str, &str) {
        match self {
            Self::Start { owner_id, job_id }
            | Self::Stop { owner_id, job_id }
            | Self::Status { owner_id, job_id }
            | Self::Settle { owner_id, job_id } => (owner_id, job_id),
        }
    }
}

/// Outbound side of the notification gateway.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Whether the owner currently has a live connection.
    async fn is_connected(&self, owner_id: &str) -> AppResult<bool>;

    /// Push an event to the owner.
    async fn publish(&self, owner_id: &str, event: &GatewayEvent) -> AppResult<()>;
}

/// Notifier that treats every owner as connected and drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn is_connected(&self, _owner_id: &str) -> AppResult<bool> {
        Ok(true)
    }

    async fn publish(&self, _owner_id: &str, _event: &GatewayEvent) -> AppResult<()> {
        Ok(())
    }
}

/// Notifier publishing to Redis.
#[derive(Clone)]
pub struct RedisNotifier {
    publisher: Client,
    prefix: String,
}

impl RedisNotifier {
    /// Create a notifier using `prefix` for channel and key names.
    #[must_use]
    pub fn new(publisher: Client, prefix: impl Into<String>) -> Self {
        Self {
            publisher,
            prefix: prefix.into(),
        }
    }

    fn owner_channel(&self, owner_id: &str) -> String {
        format!("{}:{}{owner_id}", self.prefix, channels::OWNER_PREFIX)
    }

    fn presence_key(&self, owner_id: &str) -> String {
        format!("{}:{}{owner_id}", self.prefix, channels::PRESENCE_PREFIX)
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn is_connected(&self, owner_id: &str) -> AppResult<bool> {
        let count: i64 = self
            .publisher
            .exists(self.presence_key(owner_id))
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        Ok(count > 0)
    }

    async fn publish(&self, owner_id: &str, event: &GatewayEvent) -> AppResult<()> {
        let channel = self.owner_channel(owner_id);
        let payload = serde_json::to_string(event)?;
        let _: () = self
            .publisher
            .publish(channel.as_str(), payload)
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        debug!(channel, ?event, "Published gateway event");
        Ok(())
    }
}

/// Forwards commands from the command channel into a scheduler.
pub struct CommandListener {
    subscriber: SubscriberClient,
    channel: String,
}

impl CommandListener {
    /// Create a listener on `{prefix}:commands`.
    #[must_use]
    pub fn new(subscriber: SubscriberClient, prefix: &str) -> Self {
        Self {
            subscriber,
            channel: format!("{prefix}:{}", channels::COMMANDS),
        }
    }

    /// Subscribe and spawn the forwarding loop.
    pub async fn start(&self, scheduler: Arc<Scheduler>) -> AppResult<JoinHandle<()>> {
        self.subscriber
            .subscribe(self.channel.as_str())
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;

        info!(channel = %self.channel, "Listening for gateway commands");

        let mut message_stream = self.subscriber.message_rx();
        Ok(tokio::spawn(async move {
            while let Ok(message) = message_stream.recv().await {
                let Some(payload) = message.value.as_string() else {
                    continue;
                };
                match serde_json::from_str::<GatewayCommand>(&payload) {
                    Ok(command) => {
                        let (owner_id, job_id) = command.target();
                        let (owner_id, job_id) = (owner_id.to_string(), job_id.to_string());
                        match scheduler.handle_command(command).await {
                            Ok(()) => {}
                            Err(e) if e.is_caller_error() => {
                                warn!(
                                    owner_id = %owner_id,
                                    job_id = %job_id,
                                    code = e.error_code(),
                                    error = %e,
                                    "Gateway command rejected"
                                );
                            }
                            Err(e) => {
                                error!(
                                    owner_id = %owner_id,
                                    job_id = %job_id,
                                    code = e.error_code(),
                                    error = %e,
                                    "Gateway command failed"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse gateway command: {}", e);
                    }
                }
            }
            info!("Gateway command stream ended");
        }))
    }
}
