//! Repository layer for database operations.

mod credential;

pub use credential::{CredentialRepository, PriorityFilter};
