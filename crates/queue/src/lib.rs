//! DM-send scheduler for courier.
//!
//! Distributes queued direct-message sends across a rotating pool of
//! rate-limited sender credentials:
//!
//! - **Store**: durable per-job FIFO queue with atomic progress counters
//! - **Credentials**: priority-weighted selection from the relational pool
//! - **Dispatch**: one concurrent worker per eligible credential
//! - **Handler**: outcome codes to credential health and retry/settle decisions
//! - **Poll loop**: one cooperative loop per job, with backpressure signals
//! - **Pub/Sub**: status, progress and backpressure events over Redis

pub mod assignment;
pub mod credentials;
pub mod dispatch;
mod engine;
pub mod handler;
pub mod jobs;
pub mod outcome;
mod poll;
pub mod pubsub;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use assignment::{Assignment, AssignmentRegistry};
pub use credentials::{Credential, CredentialPool, CredentialQuery, DbCredentialPool, MemoryCredentialPool};
pub use dispatch::{CycleReport, FetchPlan, fetch_plan};
pub use handler::Verdict;
pub use jobs::*;
pub use outcome::SendOutcome;
pub use pubsub::{CommandListener, GatewayCommand, GatewayEvent, NoOpNotifier, Notifier, RedisNotifier};
pub use rate_limit::BackpressureThrottle;
pub use retry::{RetryBook, RetryConfig, RetryDecision};
pub use scheduler::{Scheduler, Submission};
pub use store::{MemoryQueueStore, QueueStore, RedisQueueStore};
pub use transport::{HttpTransport, SendResult, Transport, TransportError};
