use serde::{Deserialize, Serialize};

use crate::entities::rewards;

/// Inclusive epoch range, `?this_epoch=..&last_epoch=..`
#[derive(Debug, Clone, Deserialize)]
pub struct RewardRangeQuery {
    pub this_epoch: u64,
    pub last_epoch: u64,
}

/// Widest range a single request may cover
pub const MAX_RANGE_EPOCHS: u64 = 1_000;

impl RewardRangeQuery {
    pub fn validate(&self) -> Result<(), String> {
        if self.this_epoch > self.last_epoch {
            return Err(format!(
                "this_epoch ({}) must not be after last_epoch ({})",
                self.this_epoch, self.last_epoch
            ));
        }
        if self.last_epoch - self.this_epoch >= MAX_RANGE_EPOCHS {
            return Err(format!("range may cover at most {} epochs", MAX_RANGE_EPOCHS));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardResponse {
    pub validator_addr: String,
    pub epoch_index: i64,
    pub rewards: String,
    pub distributed: bool,
}

impl From<rewards::Model> for RewardResponse {
    fn from(model: rewards::Model) -> Self {
        Self {
            validator_addr: model.validator_addr,
            epoch_index: model.epoch_index,
            rewards: model.rewards,
            distributed: model.distributed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardsResponse {
    pub this_epoch: u64,
    pub last_epoch: u64,
    pub total_fees: String,
    pub rewards: Vec<RewardResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RewardAmount {
    pub validator_addr: String,
    pub rewards: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRewardsResponse {
    pub this_epoch: u64,
    pub last_epoch: u64,
    pub total: String,
    pub validators: Vec<RewardAmount>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_validation() {
        assert!(RewardRangeQuery { this_epoch: 3, last_epoch: 5 }.validate().is_ok());
        assert!(RewardRangeQuery { this_epoch: 5, last_epoch: 5 }.validate().is_ok());
        assert!(RewardRangeQuery { this_epoch: 6, last_epoch: 5 }.validate().is_err());
        assert!(RewardRangeQuery { this_epoch: 0, last_epoch: 1_000 }.validate().is_err());
    }
}
