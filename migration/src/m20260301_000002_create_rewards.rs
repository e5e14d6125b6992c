use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Rewards::Table)
                    .if_not_exists()
                    .col(pk_auto(Rewards::Id))
                    .col(string_len(Rewards::ValidatorAddr, 42).not_null())
                    .col(big_integer(Rewards::EpochIndex).not_null())
                    .col(text(Rewards::Rewards).not_null())
                    .col(boolean(Rewards::Distributed).not_null().default(false))
                    .col(timestamp_with_time_zone(Rewards::CreatedAt).default(Expr::current_timestamp()))
                    .col(timestamp_with_time_zone(Rewards::UpdatedAt).default(Expr::current_timestamp()))
                    .to_owned(),
            )
            .await?;

        // At most one reward row per (epoch, validator)
        manager
            .create_index(
                Index::create()
                    .name("idx_rewards_epoch_validator")
                    .table(Rewards::Table)
                    .col(Rewards::EpochIndex)
                    .col(Rewards::ValidatorAddr)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Undistributed-sum lookups filter on validator + flag
        manager
            .create_index(
                Index::create()
                    .name("idx_rewards_validator_distributed")
                    .table(Rewards::Table)
                    .col(Rewards::ValidatorAddr)
                    .col(Rewards::Distributed)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Rewards::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Rewards {
    Table,
    Id,
    ValidatorAddr,
    EpochIndex,
    Rewards,
    Distributed,
    CreatedAt,
    UpdatedAt,
}
