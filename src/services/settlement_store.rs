//! Settlement Store
//!
//! Sole writer of `epochs`, `rewards` and `send_records`. Multi-row mutations
//! run in one database transaction; unique indexes turn duplicate creation into
//! `SettlementError::Conflict`.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

use crate::entities::{epochs, prelude::{Epochs, Rewards, SendRecords}, rewards, send_records};
use crate::error::{Result, SettlementError};
use crate::services::distribution::ValidatorReward;
use crate::services::epoch_scraper::EpochFees;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Created,
    Success,
    Failed,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Created => "created",
            SendStatus::Success => "success",
            SendStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(SendStatus::Created),
            "success" => Ok(SendStatus::Success),
            "failed" => Ok(SendStatus::Failed),
            other => Err(SettlementError::Database(format!("unknown send status '{}'", other))),
        }
    }
}

/// A broadcast attempt about to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSendRecord {
    pub raw_tx: String,
    pub tx_hash: String,
    pub nonce: u64,
    pub gas_price: U256,
    pub this_epoch: u64,
    pub last_epoch: u64,
    pub validators: Vec<Address>,
    /// Reward rows the transaction pays; only these are marked distributed on success
    pub reward_ids: Vec<i32>,
}

/// Undistributed rewards of a window folded per validator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payouts {
    pub sums: BTreeMap<Address, U256>,
    /// Rows behind `sums`, ascending
    pub reward_ids: Vec<i32>,
}

pub fn format_address(address: &Address) -> String {
    format!("{:#x}", address)
}

fn now() -> chrono::DateTime<chrono::FixedOffset> {
    Utc::now().fixed_offset()
}

fn parse_amount(value: &str) -> Result<U256> {
    U256::from_str(value)
        .map_err(|e| SettlementError::Database(format!("invalid stored amount '{}': {}", value, e)))
}

fn parse_address(value: &str) -> Result<Address> {
    Address::from_str(value)
        .map_err(|e| SettlementError::Database(format!("invalid stored address '{}': {}", value, e)))
}

/// Reward rows a send record pays, as stored in its JSON column
pub fn record_reward_ids(record: &send_records::Model) -> Result<Vec<i32>> {
    serde_json::from_str(&record.reward_ids).map_err(|e| {
        SettlementError::Database(format!("send record {} has invalid reward ids: {}", record.id, e))
    })
}

#[derive(Clone)]
pub struct SettlementStore {
    db: DatabaseConnection,
}

impl SettlementStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    // ---- epochs ----

    pub async fn latest_epoch(&self) -> Result<Option<epochs::Model>> {
        Ok(Epochs::find()
            .order_by_desc(epochs::Column::EpochIndex)
            .one(&self.db)
            .await?)
    }

    pub async fn earliest_epoch(&self) -> Result<Option<epochs::Model>> {
        Ok(Epochs::find()
            .order_by_asc(epochs::Column::EpochIndex)
            .one(&self.db)
            .await?)
    }

    /// Indices in `[first, last]` that already have an epoch row
    pub async fn recorded_epoch_indices(&self, first: u64, last: u64) -> Result<BTreeSet<u64>> {
        let indices: Vec<i64> = Epochs::find()
            .select_only()
            .column(epochs::Column::EpochIndex)
            .filter(epochs::Column::EpochIndex.between(first as i64, last as i64))
            .into_tuple()
            .all(&self.db)
            .await?;
        Ok(indices.into_iter().map(|i| i as u64).collect())
    }

    pub async fn epoch(&self, epoch_index: u64) -> Result<Option<epochs::Model>> {
        Ok(Epochs::find()
            .filter(epochs::Column::EpochIndex.eq(epoch_index as i64))
            .one(&self.db)
            .await?)
    }

    pub async fn epochs_in_range(&self, this_epoch: u64, last_epoch: u64) -> Result<Vec<epochs::Model>> {
        Ok(Epochs::find()
            .filter(epochs::Column::EpochIndex.between(this_epoch as i64, last_epoch as i64))
            .order_by_asc(epochs::Column::EpochIndex)
            .all(&self.db)
            .await?)
    }

    pub async fn create_epoch(&self, fees: &EpochFees) -> Result<epochs::Model> {
        insert_epoch(&self.db, fees).await
    }

    /// Persist an epoch and its reward rows atomically, epoch row first
    pub async fn record_epoch(&self, fees: &EpochFees, rewards: &[ValidatorReward]) -> Result<epochs::Model> {
        let txn = self.db.begin().await?;

        let epoch = insert_epoch(&txn, fees).await?;
        insert_rewards(&txn, fees.window.epoch_index, rewards).await?;

        txn.commit().await?;

        info!(
            epoch_index = fees.window.epoch_index,
            total_fees = %fees.total_fees,
            reward_rows = rewards.len(),
            "Recorded epoch"
        );
        Ok(epoch)
    }

    // ---- rewards ----

    /// Batch insert of one epoch's rewards; all rows or none
    pub async fn create_rewards(&self, epoch_index: u64, rewards: &[ValidatorReward]) -> Result<usize> {
        let txn = self.db.begin().await?;

        let exists = Epochs::find()
            .filter(epochs::Column::EpochIndex.eq(epoch_index as i64))
            .count(&txn)
            .await?;
        if exists == 0 {
            return Err(SettlementError::Database(format!(
                "cannot record rewards for unknown epoch {}",
                epoch_index
            )));
        }

        let inserted = insert_rewards(&txn, epoch_index, rewards).await?;
        txn.commit().await?;
        Ok(inserted)
    }

    pub async fn rewards_in_range(&self, this_epoch: u64, last_epoch: u64) -> Result<Vec<rewards::Model>> {
        Ok(Rewards::find()
            .filter(rewards::Column::EpochIndex.between(this_epoch as i64, last_epoch as i64))
            .order_by_asc(rewards::Column::EpochIndex)
            .order_by_asc(rewards::Column::ValidatorAddr)
            .all(&self.db)
            .await?)
    }

    /// Undistributed reward sum per validator over `[this_epoch, last_epoch]`, zero sums dropped
    pub async fn undistributed_sums(
        &self,
        this_epoch: u64,
        last_epoch: u64,
        validators: Option<&[Address]>,
    ) -> Result<BTreeMap<Address, U256>> {
        Ok(self.undistributed_payouts(this_epoch, last_epoch, validators).await?.sums)
    }

    /// Sums of `undistributed_sums` together with the ids of the rows they add up
    pub async fn undistributed_payouts(
        &self,
        this_epoch: u64,
        last_epoch: u64,
        validators: Option<&[Address]>,
    ) -> Result<Payouts> {
        let mut query = Rewards::find()
            .filter(rewards::Column::EpochIndex.between(this_epoch as i64, last_epoch as i64))
            .filter(rewards::Column::Distributed.eq(false))
            .order_by_asc(rewards::Column::Id);
        if let Some(validators) = validators {
            query = query.filter(
                rewards::Column::ValidatorAddr.is_in(validators.iter().map(format_address)),
            );
        }

        let mut sums: BTreeMap<Address, U256> = BTreeMap::new();
        let mut rows = Vec::new();
        for row in query.all(&self.db).await? {
            let validator = parse_address(&row.validator_addr)?;
            *sums.entry(validator).or_insert(U256::ZERO) += parse_amount(&row.rewards)?;
            rows.push((row.id, validator));
        }
        sums.retain(|_, amount| !amount.is_zero());

        let reward_ids = rows
            .into_iter()
            .filter(|(_, validator)| sums.contains_key(validator))
            .map(|(id, _)| id)
            .collect();
        Ok(Payouts { sums, reward_ids })
    }

    pub async fn total_fees_in_range(&self, this_epoch: u64, last_epoch: u64) -> Result<U256> {
        let mut total = U256::ZERO;
        for epoch in self.epochs_in_range(this_epoch, last_epoch).await? {
            total += parse_amount(&epoch.total_fees)?;
        }
        Ok(total)
    }

    // ---- send records ----

    pub async fn create_send_record(&self, record: &NewSendRecord) -> Result<send_records::Model> {
        let validators: Vec<String> = record.validators.iter().map(format_address).collect();
        let validators = serde_json::to_string(&validators)
            .map_err(|e| SettlementError::Database(format!("encode validators: {}", e)))?;
        let reward_ids = serde_json::to_string(&record.reward_ids)
            .map_err(|e| SettlementError::Database(format!("encode reward ids: {}", e)))?;
        let timestamp = now();

        let model = send_records::ActiveModel {
            raw_tx: Set(record.raw_tx.clone()),
            tx_hash: Set(record.tx_hash.clone()),
            nonce: Set(record.nonce as i64),
            gas_price: Set(record.gas_price.to_string()),
            this_epoch: Set(record.this_epoch as i64),
            last_epoch: Set(record.last_epoch as i64),
            validators: Set(validators),
            reward_ids: Set(reward_ids),
            stat: Set(SendStatus::Created.as_str().to_string()),
            created_at: Set(timestamp),
            updated_at: Set(timestamp),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;

        info!(
            id = model.id,
            tx_hash = %model.tx_hash,
            nonce = model.nonce,
            this_epoch = model.this_epoch,
            last_epoch = model.last_epoch,
            "Persisted send record"
        );
        Ok(model)
    }

    pub async fn send_record(&self, id: i32) -> Result<Option<send_records::Model>> {
        Ok(SendRecords::find_by_id(id).one(&self.db).await?)
    }

    pub async fn has_created_send_record(&self) -> Result<bool> {
        let count = SendRecords::find()
            .filter(send_records::Column::Stat.eq(SendStatus::Created.as_str()))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    /// `created` records inserted before `cutoff`, oldest first
    pub async fn created_send_records(&self, cutoff: DateTime<Utc>) -> Result<Vec<send_records::Model>> {
        Ok(SendRecords::find()
            .filter(send_records::Column::Stat.eq(SendStatus::Created.as_str()))
            .filter(send_records::Column::CreatedAt.lt(cutoff.fixed_offset()))
            .order_by_asc(send_records::Column::Id)
            .all(&self.db)
            .await?)
    }

    /// `created` -> `failed`; false when the record had already left `created`
    pub async fn mark_send_failed(&self, id: i32) -> Result<bool> {
        let result = SendRecords::update_many()
            .col_expr(send_records::Column::Stat, Expr::value(SendStatus::Failed.as_str()))
            .col_expr(send_records::Column::UpdatedAt, Expr::value(now()))
            .filter(send_records::Column::Id.eq(id))
            .filter(send_records::Column::Stat.eq(SendStatus::Created.as_str()))
            .exec(&self.db)
            .await?;

        debug!(id = id, affected = result.rows_affected, "Marked send record failed");
        Ok(result.rows_affected > 0)
    }

    /// `created` -> `success` and mark the reward rows the record pays distributed, in one
    /// transaction. Rows recorded after the record was built are left alone.
    /// Returns false (and touches nothing) when the record had already left `created`.
    pub async fn settle_send_success(&self, id: i32) -> Result<bool> {
        let txn = self.db.begin().await?;

        let record = match SendRecords::find_by_id(id).one(&txn).await? {
            Some(record) => record,
            None => return Err(SettlementError::Database(format!("send record {} not found", id))),
        };

        let updated = SendRecords::update_many()
            .col_expr(send_records::Column::Stat, Expr::value(SendStatus::Success.as_str()))
            .col_expr(send_records::Column::UpdatedAt, Expr::value(now()))
            .filter(send_records::Column::Id.eq(id))
            .filter(send_records::Column::Stat.eq(SendStatus::Created.as_str()))
            .exec(&txn)
            .await?;
        if updated.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(false);
        }

        let reward_ids = record_reward_ids(&record)?;
        let marked = if reward_ids.is_empty() {
            0
        } else {
            Rewards::update_many()
                .col_expr(rewards::Column::Distributed, Expr::value(true))
                .col_expr(rewards::Column::UpdatedAt, Expr::value(now()))
                .filter(rewards::Column::Id.is_in(reward_ids))
                .filter(rewards::Column::Distributed.eq(false))
                .exec(&txn)
                .await?
                .rows_affected
        };

        txn.commit().await?;

        info!(
            id = id,
            tx_hash = %record.tx_hash,
            this_epoch = record.this_epoch,
            last_epoch = record.last_epoch,
            rewards_marked = marked,
            "Settlement confirmed"
        );
        Ok(true)
    }
}

async fn insert_epoch<C: ConnectionTrait>(conn: &C, fees: &EpochFees) -> Result<epochs::Model> {
    let timestamp = now();
    let model = epochs::ActiveModel {
        epoch_index: Set(fees.window.epoch_index as i64),
        this_block_number: Set(fees.window.first_block as i64),
        last_block_number: Set(fees.window.last_block as i64),
        total_fees: Set(fees.total_fees.to_string()),
        created_at: Set(timestamp),
        updated_at: Set(timestamp),
        ..Default::default()
    };

    model.insert(conn).await.map_err(|e| match SettlementError::from(e) {
        SettlementError::Conflict(_) => {
            SettlementError::Conflict(format!("epoch {} already recorded", fees.window.epoch_index))
        }
        other => other,
    })
}

async fn insert_rewards<C: ConnectionTrait>(
    conn: &C,
    epoch_index: u64,
    rewards: &[ValidatorReward],
) -> Result<usize> {
    if rewards.is_empty() {
        return Ok(0);
    }

    let timestamp = now();
    let models: Vec<rewards::ActiveModel> = rewards
        .iter()
        .map(|r| rewards::ActiveModel {
            validator_addr: Set(format_address(&r.validator_addr)),
            epoch_index: Set(epoch_index as i64),
            rewards: Set(r.rewards.to_string()),
            distributed: Set(false),
            created_at: Set(timestamp),
            updated_at: Set(timestamp),
            ..Default::default()
        })
        .collect();

    Rewards::insert_many(models)
        .exec(conn)
        .await
        .map_err(|e| match SettlementError::from(e) {
            SettlementError::Conflict(_) => {
                SettlementError::Conflict(format!("rewards for epoch {} already recorded", epoch_index))
            }
            other => other,
        })?;

    Ok(rewards.len())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::epoch_scraper::EpochWindow;
    use migration::MigratorTrait;

    pub(crate) async fn test_store() -> SettlementStore {
        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        migration::Migrator::up(&db, None).await.unwrap();
        SettlementStore::new(db)
    }

    fn fees(epoch_index: u64, total: u64) -> EpochFees {
        EpochFees {
            window: EpochWindow::for_index(epoch_index, 200),
            total_fees: U256::from(total),
            skipped_blocks: Vec::new(),
        }
    }

    fn reward(epoch_index: u64, byte: u8, amount: u64) -> ValidatorReward {
        ValidatorReward {
            validator_addr: Address::repeat_byte(byte),
            epoch_index,
            rewards: U256::from(amount),
        }
    }

    #[test]
    fn test_send_status_round_trip() {
        for status in [SendStatus::Created, SendStatus::Success, SendStatus::Failed] {
            assert_eq!(status.as_str().parse::<SendStatus>().unwrap(), status);
        }
        assert!("pending".parse::<SendStatus>().is_err());
    }

    #[tokio::test]
    async fn test_record_epoch_writes_epoch_and_rewards() {
        let store = test_store().await;
        store
            .record_epoch(&fees(100, 1_000), &[reward(100, 1, 600), reward(100, 2, 300)])
            .await
            .unwrap();

        let epoch = store.epoch(100).await.unwrap().unwrap();
        assert_eq!(epoch.this_block_number, 20_000);
        assert_eq!(epoch.last_block_number, 20_199);
        assert_eq!(epoch.total_fees, "1000");
        assert_eq!(store.latest_epoch().await.unwrap().unwrap().epoch_index, 100);
        assert_eq!(store.rewards_in_range(100, 100).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recorded_epoch_indices() {
        let store = test_store().await;
        assert!(store.earliest_epoch().await.unwrap().is_none());
        for epoch_index in [3, 5, 9] {
            store.record_epoch(&fees(epoch_index, 1), &[]).await.unwrap();
        }

        assert_eq!(store.earliest_epoch().await.unwrap().unwrap().epoch_index, 3);
        let indices: Vec<u64> = store.recorded_epoch_indices(4, 9).await.unwrap().into_iter().collect();
        assert_eq!(indices, vec![5, 9]);
    }

    #[tokio::test]
    async fn test_duplicate_epoch_conflicts_without_partial_rows() {
        let store = test_store().await;
        store.record_epoch(&fees(7, 10), &[reward(7, 1, 5)]).await.unwrap();

        let err = store
            .record_epoch(&fees(7, 99), &[reward(7, 2, 50), reward(7, 3, 40)])
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let rows = store.rewards_in_range(7, 7).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(store.epoch(7).await.unwrap().unwrap().total_fees, "10");
    }

    #[tokio::test]
    async fn test_reward_batch_is_all_or_nothing() {
        let store = test_store().await;
        store.create_epoch(&fees(3, 10)).await.unwrap();
        store.create_rewards(3, &[reward(3, 1, 5)]).await.unwrap();

        // The second row collides with the existing one, so the first must not land either
        let err = store
            .create_rewards(3, &[reward(3, 2, 5), reward(3, 1, 9)])
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.rewards_in_range(3, 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rewards_require_their_epoch() {
        let store = test_store().await;
        assert!(matches!(
            store.create_rewards(4, &[reward(4, 1, 5)]).await,
            Err(SettlementError::Database(_))
        ));
    }

    #[tokio::test]
    async fn test_undistributed_sums_over_window() {
        let store = test_store().await;
        store.record_epoch(&fees(1, 10), &[reward(1, 1, 5), reward(1, 2, 3)]).await.unwrap();
        store.record_epoch(&fees(2, 10), &[reward(2, 1, 7)]).await.unwrap();
        store.record_epoch(&fees(3, 10), &[reward(3, 1, 100)]).await.unwrap();

        let sums = store.undistributed_sums(1, 2, None).await.unwrap();
        assert_eq!(sums[&Address::repeat_byte(1)], U256::from(12));
        assert_eq!(sums[&Address::repeat_byte(2)], U256::from(3));

        let only = [Address::repeat_byte(2)];
        let sums = store.undistributed_sums(1, 3, Some(&only)).await.unwrap();
        assert_eq!(sums.len(), 1);

        assert_eq!(store.total_fees_in_range(1, 3).await.unwrap(), U256::from(30));
    }

    fn send_record(raw_tx: &str, this_epoch: u64, last_epoch: u64, payouts: &Payouts) -> NewSendRecord {
        NewSendRecord {
            raw_tx: raw_tx.to_string(),
            tx_hash: format!("{:#x}", alloy::primitives::B256::repeat_byte(9)),
            nonce: 1,
            gas_price: U256::from(10),
            this_epoch,
            last_epoch,
            validators: payouts.sums.keys().copied().collect(),
            reward_ids: payouts.reward_ids.clone(),
        }
    }

    #[tokio::test]
    async fn test_payouts_track_the_rows_they_sum() {
        let store = test_store().await;
        store.record_epoch(&fees(1, 10), &[reward(1, 1, 5), reward(1, 2, 3)]).await.unwrap();
        store.record_epoch(&fees(2, 10), &[reward(2, 1, 7)]).await.unwrap();

        let only = [Address::repeat_byte(1)];
        let payouts = store.undistributed_payouts(1, 2, Some(&only)).await.unwrap();
        assert_eq!(payouts.sums[&Address::repeat_byte(1)], U256::from(12));

        let rows = store.rewards_in_range(1, 2).await.unwrap();
        let mut expected: Vec<i32> = rows
            .iter()
            .filter(|r| r.validator_addr == format_address(&Address::repeat_byte(1)))
            .map(|r| r.id)
            .collect();
        expected.sort();
        assert_eq!(payouts.reward_ids, expected);
    }

    #[tokio::test]
    async fn test_settle_is_guarded_by_created_state() {
        let store = test_store().await;
        store.record_epoch(&fees(1, 10), &[reward(1, 1, 5), reward(1, 2, 3)]).await.unwrap();

        let only = [Address::repeat_byte(1)];
        let payouts = store.undistributed_payouts(1, 1, Some(&only)).await.unwrap();
        let record = store
            .create_send_record(&send_record("0xaa", 1, 1, &payouts))
            .await
            .unwrap();
        assert!(store.has_created_send_record().await.unwrap());
        assert_eq!(record_reward_ids(&record).unwrap(), payouts.reward_ids);

        assert!(store.settle_send_success(record.id).await.unwrap());
        assert!(!store.settle_send_success(record.id).await.unwrap());
        assert!(!store.mark_send_failed(record.id).await.unwrap());

        let sums = store.undistributed_sums(1, 1, None).await.unwrap();
        assert_eq!(sums.len(), 1);
        assert!(sums.contains_key(&Address::repeat_byte(2)));
        assert!(!store.has_created_send_record().await.unwrap());
    }

    #[tokio::test]
    async fn test_settle_leaves_rows_recorded_after_the_send() {
        let store = test_store().await;
        store.record_epoch(&fees(100, 10), &[reward(100, 1, 5)]).await.unwrap();

        let payouts = store.undistributed_payouts(98, 100, None).await.unwrap();
        let record = store
            .create_send_record(&send_record("0xab", 98, 100, &payouts))
            .await
            .unwrap();

        // A gap epoch inside the window lands while the transaction is in flight
        store.record_epoch(&fees(98, 10), &[reward(98, 1, 700)]).await.unwrap();

        assert!(store.settle_send_success(record.id).await.unwrap());
        let sums = store.undistributed_sums(98, 100, None).await.unwrap();
        assert_eq!(sums.len(), 1);
        assert_eq!(sums[&Address::repeat_byte(1)], U256::from(700));
    }

    #[tokio::test]
    async fn test_duplicate_raw_tx_conflicts() {
        let store = test_store().await;
        let record = send_record("0xbeef", 1, 1, &Payouts::default());
        store.create_send_record(&record).await.unwrap();
        assert!(store.create_send_record(&record).await.unwrap_err().is_conflict());
    }
}
