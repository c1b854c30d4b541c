//! Database entities.

#![allow(missing_docs)]

pub mod credential;
pub mod credential_pool;

pub use credential::{CredentialStatus, Entity as Credential, PRIORITY_HIGH, PRIORITY_STANDARD};
pub use credential_pool::Entity as CredentialPool;
