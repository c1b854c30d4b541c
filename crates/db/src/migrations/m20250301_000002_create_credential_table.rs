//! Create `credential` table migration.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Credential::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Credential::Id)
                            .string_len(64)
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Credential::Pool).string_len(64).not_null())
                    .col(
                        ColumnDef::new(Credential::Priority)
                            .small_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Credential::Status)
                            .small_integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Credential::UsedCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Credential::DayCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Credential::Session).text().not_null())
                    .col(ColumnDef::new(Credential::Proxy).string_len(512))
                    .col(
                        ColumnDef::new(Credential::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Credential::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_credential_pool")
                            .from(Credential::Table, Credential::Pool)
                            .to(CredentialPool::Table, CredentialPool::Name)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Selection scans eligible credentials of one pool by daily usage
        manager
            .create_index(
                Index::create()
                    .name("idx_credential_selection")
                    .table(Credential::Table)
                    .col(Credential::Pool)
                    .col(Credential::Status)
                    .col(Credential::Priority)
                    .col(Credential::DayCount)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Credential::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Credential {
    Table,
    Id,
    Pool,
    Priority,
    Status,
    UsedCount,
    DayCount,
    Session,
    Proxy,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum CredentialPool {
    Table,
    Name,
}
