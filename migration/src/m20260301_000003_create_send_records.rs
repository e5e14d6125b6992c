//! Migration to create the send_records table, one row per broadcast attempt

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(SendRecords::Table)
                    .if_not_exists()
                    .col(pk_auto(SendRecords::Id))
                    .col(text(SendRecords::RawTx).not_null().unique_key())
                    .col(string_len(SendRecords::TxHash, 66).not_null())
                    .col(big_integer(SendRecords::Nonce).not_null())
                    .col(text(SendRecords::GasPrice).not_null())
                    .col(big_integer(SendRecords::ThisEpoch).not_null())
                    .col(big_integer(SendRecords::LastEpoch).not_null())
                    .col(text(SendRecords::Validators).not_null())
                    .col(text(SendRecords::RewardIds).not_null())
                    .col(string_len(SendRecords::Stat, 16).not_null())
                    .col(timestamp_with_time_zone(SendRecords::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp_with_time_zone(SendRecords::UpdatedAt).default(Expr::current_timestamp()))
                    .to_owned(),
            )
            .await?;

        // Reconciliation scans for records still in `created`
        manager
            .create_index(
                Index::create()
                    .name("idx_send_records_stat")
                    .table(SendRecords::Table)
                    .col(SendRecords::Stat)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SendRecords::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum SendRecords {
    Table,
    Id,
    RawTx,
    TxHash,
    Nonce,
    GasPrice,
    ThisEpoch,
    LastEpoch,
    Validators,
    RewardIds,
    Stat,
    CreatedAt,
    UpdatedAt,
}
