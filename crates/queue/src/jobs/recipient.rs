//! Recipient send job.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one job stream: an (owner, job) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    /// Owner of the job.
    pub owner_id: String,
    /// Job identifier, unique across owners.
    pub job_id: String,
}

impl JobKey {
    /// Create a new job key.
    #[must_use]
    pub fn new(owner_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.job_id)
    }
}

/// One pending send to one recipient within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientJob {
    /// Owner of the job.
    pub owner_id: String,

    /// Job this send belongs to.
    pub job_id: String,

    /// Target of the direct message.
    pub recipient_id: String,

    /// Tag of the submission that introduced this recipient.
    pub batch_tag: String,

    /// Credential pool that last served this recipient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_pool: Option<String>,

    /// Priority class of the credential that last served this recipient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_priority: Option<i16>,
}

impl RecipientJob {
    /// Create a new, never-assigned recipient job.
    #[must_use]
    pub const fn new(
        owner_id: String,
        job_id: String,
        recipient_id: String,
        batch_tag: String,
    ) -> Self {
        Self {
            owner_id,
            job_id,
            recipient_id,
            batch_tag,
            assigned_pool: None,
            assigned_priority: None,
        }
    }

    /// Key of the job stream this recipient belongs to.
    #[must_use]
    pub fn key(&self) -> JobKey {
        JobKey::new(self.owner_id.clone(), self.job_id.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unassigned_fields_are_omitted() {
        let job = RecipientJob::new(
            "owner1".to_string(),
            "job1".to_string(),
            "r1".to_string(),
            "tag".to_string(),
        );

        let json = serde_json::to_string(&job).unwrap();
        assert!(!json.contains("assigned_pool"));
        assert!(json.contains("\"recipient_id\":\"r1\""));
    }

    #[test]
    fn test_job_key_display() {
        assert_eq!(JobKey::new("owner1", "job1").to_string(), "owner1/job1");
    }
}
