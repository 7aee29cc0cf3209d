use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Bins::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Bins::BinCode)
                            .string()
                            .primary_key()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Bins::IsFrozen)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Bins::FreezeReason).string().null())
                    .col(ColumnDef::new(Bins::FrozenBy).string().null())
                    .col(
                        ColumnDef::new(Bins::FrozenAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(Bins::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // on_hand is persisted and kept equal to available + committed by every ledger write
        manager
            .create_table(
                Table::create()
                    .table(StockEntries::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(StockEntries::Sku).string().not_null())
                    .col(ColumnDef::new(StockEntries::BinCode).string().not_null())
                    .col(
                        ColumnDef::new(StockEntries::Available)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(StockEntries::Committed)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(StockEntries::OnHand)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(StockEntries::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .primary_key(
                        Index::create()
                            .col(StockEntries::Sku)
                            .col(StockEntries::BinCode),
                    )
                    .check(Expr::col(StockEntries::Available).gte(0))
                    .check(Expr::col(StockEntries::Committed).gte(0))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_stock_entries_bin_code")
                    .table(StockEntries::Table)
                    .col(StockEntries::BinCode)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StockEntries::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Bins::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Bins {
    Table,
    BinCode,
    IsFrozen,
    FreezeReason,
    FrozenBy,
    FrozenAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum StockEntries {
    Table,
    Sku,
    BinCode,
    Available,
    Committed,
    OnHand,
    UpdatedAt,
}
