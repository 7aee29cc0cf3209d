use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Emissions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Emissions::Id)
                            .uuid()
                            .primary_key()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Emissions::ContextId).string().not_null())
                    .col(ColumnDef::new(Emissions::EmissionType).string().not_null())
                    .col(
                        ColumnDef::new(Emissions::IdempotencyKey)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Emissions::AttemptNumber)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Emissions::Status)
                            .string()
                            .not_null()
                            .default("pending"),
                    )
                    .col(
                        ColumnDef::new(Emissions::RequestPayload)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Emissions::ResponsePayload)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Emissions::ExternalDocumentId)
                            .string()
                            .null(),
                    )
                    .col(ColumnDef::new(Emissions::ErrorMessage).text().null())
                    .col(ColumnDef::new(Emissions::ErrorDetails).json_binary().null())
                    .col(
                        ColumnDef::new(Emissions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Emissions::CompletedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_emissions_context_type")
                    .table(Emissions::Table)
                    .col(Emissions::ContextId)
                    .col(Emissions::EmissionType)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Emissions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Emissions {
    Table,
    Id,
    ContextId,
    EmissionType,
    IdempotencyKey,
    AttemptNumber,
    Status,
    RequestPayload,
    ResponsePayload,
    ExternalDocumentId,
    ErrorMessage,
    ErrorDetails,
    CreatedAt,
    CompletedAt,
}
