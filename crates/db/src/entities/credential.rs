//! Credential entity (one sender account usable for direct-message sends).

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Health state of a credential.
///
/// Only [`CredentialStatus::Eligible`] credentials are handed to dispatch.
/// The numeric values are shared with provisioning tooling and must not change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "i16", db_type = "SmallInteger")]
pub enum CredentialStatus {
    /// Usable for sending.
    #[sea_orm(num_value = 1)]
    Eligible,
    /// Session has exited or was judged invalid.
    #[sea_orm(num_value = 2)]
    Exited,
    /// Under maintenance or community restriction.
    #[sea_orm(num_value = 3)]
    Maintenance,
    /// Restricted from sending by the remote service.
    #[sea_orm(num_value = 4)]
    Restricted,
    /// Sending too fast; cools down externally.
    #[sea_orm(num_value = 5)]
    Throttled,
    /// Failed for an unclassified reason.
    #[sea_orm(num_value = 6)]
    Failed,
}

/// Preferred tier for credential selection.
pub const PRIORITY_HIGH: i16 = 0;
/// Standard tier for credential selection.
pub const PRIORITY_STANDARD: i16 = 1;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "credential")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// Name of the pool this credential belongs to.
    #[sea_orm(indexed)]
    pub pool: String,

    /// Priority class: 0 = preferred tier, 1 = standard.
    pub priority: i16,

    pub status: CredentialStatus,

    /// Lifetime successful sends.
    pub used_count: i64,

    /// Successful sends today; reset externally once per day.
    pub day_count: i32,

    /// Session material presented to the transport.
    #[sea_orm(column_type = "Text")]
    pub session: String,

    /// Optional proxy the transport should route through.
    #[sea_orm(nullable)]
    pub proxy: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::credential_pool::Entity",
        from = "Column::Pool",
        to = "super::credential_pool::Column::Name",
        on_delete = "Cascade"
    )]
    CredentialPool,
}

impl Related<super::credential_pool::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CredentialPool.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Sends this credential may still perform today under `daily_cap`.
    #[must_use]
    pub fn remaining_quota(&self, daily_cap: i32) -> u32 {
        u32::try_from(daily_cap.saturating_sub(self.day_count)).unwrap_or(0)
    }
}
