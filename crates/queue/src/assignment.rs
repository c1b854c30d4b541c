//! Process-wide recipient assignment registry.
//!
//! At most one credential may be assigned to a recipient at any instant,
//! across every job the process dispatches. Concurrent dispatch cycles for
//! the same job are allowed, so this registry is the only guard against two
//! simultaneous sends to one recipient and must be consulted before every
//! send.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Exclusive claim of one credential by one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Credential serving the recipient.
    pub credential_id: String,
    /// Job the send belongs to.
    pub job_id: String,
}

/// Registry of live assignments, keyed by recipient ID.
///
/// Cloning yields another handle to the same registry.
#[derive(Clone, Default)]
pub struct AssignmentRegistry {
    entries: Arc<Mutex<HashMap<String, Assignment>>>,
}

impl AssignmentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `recipient_id` for a credential. Returns `false` if the
    /// recipient is already assigned.
    pub async fn try_assign(&self, recipient_id: &str, credential_id: &str, job_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(recipient_id) {
            return false;
        }
        entries.insert(
            recipient_id.to_string(),
            Assignment {
                credential_id: credential_id.to_string(),
                job_id: job_id.to_string(),
            },
        );
        true
    }

    /// Whether the recipient currently holds an assignment.
    pub async fn is_assigned(&self, recipient_id: &str) -> bool {
        self.entries.lock().await.contains_key(recipient_id)
    }

    /// Current assignment of a recipient.
    pub async fn get(&self, recipient_id: &str) -> Option<Assignment> {
        self.entries.lock().await.get(recipient_id).cloned()
    }

    /// Release a recipient, but only if `credential_id` still holds it.
    pub async fn release(&self, recipient_id: &str, credential_id: &str) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(recipient_id) {
            Some(a) if a.credential_id == credential_id => {
                entries.remove(recipient_id);
                true
            }
            _ => false,
        }
    }

    /// Number of recipients of a job currently assigned.
    pub async fn count_for_job(&self, job_id: &str) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|a| a.job_id == job_id)
            .count()
    }

    /// Number of live assignments.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no assignment is live.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Drop every assignment. Called when the owning scheduler shuts down.
    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}
