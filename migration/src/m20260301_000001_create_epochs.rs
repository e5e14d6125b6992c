use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // One row per settled 200-block window
        manager
            .create_table(
                Table::create()
                    .table(Epochs::Table)
                    .if_not_exists()
                    .col(pk_auto(Epochs::Id))
                    .col(big_integer(Epochs::EpochIndex).not_null().unique_key())
                    .col(big_integer(Epochs::ThisBlockNumber).not_null())
                    .col(big_integer(Epochs::LastBlockNumber).not_null())
                    .col(text(Epochs::TotalFees).not_null())
                    .col(timestamp_with_time_zone(Epochs::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp_with_time_zone(Epochs::UpdatedAt).default(Expr::current_timestamp()))
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Epochs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Epochs {
    Table,
    Id,
    EpochIndex,
    ThisBlockNumber,
    LastBlockNumber,
    TotalFees,
    CreatedAt,
    UpdatedAt,
}
