//! `SeaORM` Entity for send_records table

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(table_name = "send_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(column_type = "Text", unique)]
    pub raw_tx: String,
    pub tx_hash: String,
    pub nonce: i64,
    #[sea_orm(column_type = "Text")]
    pub gas_price: String,
    pub this_epoch: i64,
    pub last_epoch: i64,
    /// JSON array of the validator addresses paid by this transaction
    #[sea_orm(column_type = "Text")]
    pub validators: String,
    /// JSON array of the `rewards.id` rows this transaction pays
    #[sea_orm(column_type = "Text")]
    pub reward_ids: String,
    /// One of `created`, `success`, `failed`
    pub stat: String,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
