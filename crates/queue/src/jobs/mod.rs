//! Job data model.

mod recipient;
mod status;

pub use recipient::{JobKey, RecipientJob};
pub use status::{JobMessage, JobStats, JobStatus, JobStatusRecord, Settle, SettleOutcome};
