use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(PickingSessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PickingSessions::Id)
                            .uuid()
                            .primary_key()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PickingSessions::Status)
                            .string()
                            .not_null()
                            .default("in_progress"),
                    )
                    .col(
                        ColumnDef::new(PickingSessions::Version)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(ColumnDef::new(PickingSessions::Lines).json_binary().not_null())
                    .col(ColumnDef::new(PickingSessions::Notes).json_binary().not_null())
                    .col(
                        ColumnDef::new(PickingSessions::ExternalDocumentId)
                            .string()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(PickingSessions::LastActivityAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PickingSessions::RetryCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(PickingSessions::LastError).text().null())
                    .col(ColumnDef::new(PickingSessions::CreatedBy).string().not_null())
                    .col(
                        ColumnDef::new(PickingSessions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(PickingSessions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // zombie sweeps filter on status + last activity
        manager
            .create_index(
                Index::create()
                    .name("idx_picking_sessions_status_activity")
                    .table(PickingSessions::Table)
                    .col(PickingSessions::Status)
                    .col(PickingSessions::LastActivityAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(PickingSessions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum PickingSessions {
    Table,
    Id,
    Status,
    Version,
    Lines,
    Notes,
    ExternalDocumentId,
    LastActivityAt,
    RetryCount,
    LastError,
    CreatedBy,
    CreatedAt,
    UpdatedAt,
}
