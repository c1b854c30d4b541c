//! Job progress counters and run state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate progress of one job.
///
/// `remaining + success + fail == initial` holds at every observable instant;
/// only the atomic settle operation of the queue store moves a unit from
/// `remaining` into one of the outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    /// Declared size of the job; never changes after creation.
    pub initial: i64,
    /// Recipients not yet settled.
    pub remaining: i64,
    /// Recipients settled as sent.
    pub success: i64,
    /// Recipients settled as failed.
    pub fail: i64,
}

impl JobStats {
    /// Counters for a freshly created job.
    #[must_use]
    pub const fn new(initial: i64) -> Self {
        Self {
            initial,
            remaining: initial,
            success: 0,
            fail: 0,
        }
    }

    /// Take `extra` more recipients into the job.
    pub const fn grow(&mut self, extra: i64) {
        if extra > 0 {
            self.initial += extra;
            self.remaining += extra;
        }
    }

    /// Settled recipients, successful or not.
    #[must_use]
    pub const fn completed(&self) -> i64 {
        self.success + self.fail
    }

    /// Share of the job already settled, in percent.
    #[must_use]
    pub fn percent_complete(&self) -> f64 {
        if self.initial <= 0 {
            return 100.0;
        }
        (self.completed() as f64 / self.initial as f64 * 10_000.0).round() / 100.0
    }

    /// Whether the counters still add up.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.remaining + self.success + self.fail == self.initial
    }
}

/// Which outcome counter a settle moves a recipient into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// Count as sent.
    Success,
    /// Count as failed.
    Fail,
}

impl Settle {
    /// Name of the counter field this settle increments.
    #[must_use]
    pub const fn field(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

/// Result of an atomic settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleOutcome {
    /// Counters moved; `remaining` is the new remaining count.
    Applied {
        /// Remaining count after the settle.
        remaining: i64,
    },
    /// Nothing was left to settle; counters untouched.
    NotApplied,
}

/// Run state of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not running; may be started.
    #[default]
    Idle,
    /// The poll loop is dispatching.
    Running,
    /// Stopped manually or for lack of credentials.
    Stopped,
    /// Every recipient was settled.
    Completed,
    /// Handed over for external settlement; not restartable here.
    PendingSettlement,
}

impl JobStatus {
    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::PendingSettlement => "pending_settlement",
        }
    }

    /// Whether the status blocks dispatch until an explicit restart.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Completed | Self::PendingSettlement
        )
    }

    /// Whether a start command may move this status to running.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Stopped | Self::Completed | Self::Running
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "completed" => Ok(Self::Completed),
            "pending_settlement" => Ok(Self::PendingSettlement),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Persisted run-state record of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    /// Current status.
    pub status: JobStatus,
    /// Owner of the job.
    pub owner_id: String,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
    /// Why the job entered this status, if anything notable.
    pub reason: Option<String>,
}

impl JobStatusRecord {
    /// Build a record stamped with the current time.
    #[must_use]
    pub fn now(status: JobStatus, owner_id: &str, reason: Option<&str>) -> Self {
        Self {
            status,
            owner_id: owner_id.to_string(),
            updated_at: Utc::now(),
            reason: reason.map(String::from),
        }
    }
}

/// Message metadata of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Text sent to every recipient.
    pub text: String,
    /// Proxy the transport should prefer, when the credential has none.
    #[serde(default)]
    pub proxy_hint: Option<String>,
}
