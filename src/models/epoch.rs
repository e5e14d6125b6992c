use serde::{Deserialize, Serialize};

use crate::entities::epochs;
use crate::models::reward::RewardAmount;
use crate::services::distribution::{Candidate, Distribution};
use crate::services::staking_registry::PoolEntry;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochResponse {
    pub epoch_index: i64,
    pub this_block_number: i64,
    pub last_block_number: i64,
    /// Decimal wei
    pub total_fees: String,
    pub created_at: String,
}

impl From<epochs::Model> for EpochResponse {
    fn from(model: epochs::Model) -> Self {
        Self {
            epoch_index: model.epoch_index,
            this_block_number: model.this_block_number,
            last_block_number: model.last_block_number,
            total_fees: model.total_fees,
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentEpochResponse {
    pub epoch_index: u64,
    pub first_block: u64,
    pub last_block: u64,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillRequest {
    pub epoch_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillResponse {
    pub epoch_index: u64,
    /// `recorded` or `already_recorded`
    pub status: String,
    pub total_fees: Option<String>,
    pub reward_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolEntryResponse {
    pub pool_index: u64,
    pub fee_address: String,
    /// Raw 18-decimal fixed point
    pub staked: String,
    pub status: String,
    pub active: bool,
}

impl From<&PoolEntry> for PoolEntryResponse {
    fn from(entry: &PoolEntry) -> Self {
        Self {
            pool_index: entry.pool_index,
            fee_address: format!("{:#x}", entry.fee_address),
            staked: entry.staked.to_string(),
            status: entry.status.to_string(),
            active: entry.is_active(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolResponse {
    pub epoch_index: u64,
    pub snapshot_block: u64,
    pub pools: Vec<PoolEntryResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateResponse {
    pub validator_addr: String,
    pub pool_index: u64,
    /// Whole coins
    pub stake: String,
}

impl From<&Candidate> for CandidateResponse {
    fn from(candidate: &Candidate) -> Self {
        Self {
            validator_addr: format!("{:#x}", candidate.validator_addr),
            pool_index: candidate.pool_index,
            stake: candidate.stake.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionResponse {
    pub epoch_index: u64,
    pub total_fees: String,
    pub total_rewards: String,
    pub active: Vec<CandidateResponse>,
    pub standby: Vec<CandidateResponse>,
    pub rewards: Vec<RewardAmount>,
}

impl From<&Distribution> for DistributionResponse {
    fn from(distribution: &Distribution) -> Self {
        Self {
            epoch_index: distribution.epoch_index,
            total_fees: distribution.total_fees.to_string(),
            total_rewards: distribution.total_rewards().to_string(),
            active: distribution.active.iter().map(CandidateResponse::from).collect(),
            standby: distribution.standby.iter().map(CandidateResponse::from).collect(),
            rewards: distribution
                .rewards
                .iter()
                .map(|r| RewardAmount {
                    validator_addr: format!("{:#x}", r.validator_addr),
                    rewards: r.rewards.to_string(),
                })
                .collect(),
        }
    }
}
