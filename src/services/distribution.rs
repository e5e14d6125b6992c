//! Tiered reward distribution
//!
//! Splits an epoch's fees between an active set (even per-head share plus a
//! stake-weighted share) and a standby set (stake-weighted share only). All
//! arithmetic is integer arithmetic on `U256`; every division truncates and the
//! remainder is left undistributed.

use alloy::primitives::{Address, U256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SettlementError};
use crate::services::staking_registry::PoolEntry;

/// `numerator / denominator` of the epoch's total fees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: u64,
    pub denominator: u64,
}

impl Fraction {
    pub const fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub fn of(&self, amount: U256) -> U256 {
        amount * U256::from(self.numerator) / U256::from(self.denominator)
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

impl FromStr for Fraction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (num, den) = s
            .split_once('/')
            .ok_or_else(|| "expected numerator/denominator".to_string())?;
        let numerator = num.trim().parse::<u64>().map_err(|e| e.to_string())?;
        let denominator = den.trim().parse::<u64>().map_err(|e| e.to_string())?;
        if denominator == 0 {
            return Err("denominator must not be zero".to_string());
        }
        Ok(Self::new(numerator, denominator))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionParams {
    pub active_set_size: usize,
    /// Fixed denominator for the per-head pool, independent of the actual active count
    pub per_head_slots: u64,
    /// Only this many top stakers take part in a split
    pub pool_cap: usize,
    pub min_eligible: usize,
    pub per_head_fraction: Fraction,
    pub active_stake_fraction: Fraction,
    pub standby_stake_fraction: Fraction,
    /// Fixed-point decimals of the registry's staked amount
    pub coin_decimals: u32,
}

impl Default for DistributionParams {
    fn default() -> Self {
        Self {
            active_set_size: 11,
            per_head_slots: 21,
            pool_cap: 22,
            min_eligible: 11,
            per_head_fraction: Fraction::new(1, 2),
            active_stake_fraction: Fraction::new(2, 5),
            standby_stake_fraction: Fraction::new(1, 10),
            coin_decimals: 18,
        }
    }
}

impl DistributionParams {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(SettlementError::Configuration(msg));

        if self.active_set_size == 0 {
            return invalid("active set size must be at least 1".to_string());
        }
        if self.active_set_size > self.pool_cap {
            return invalid(format!(
                "active set size {} exceeds pool cap {}",
                self.active_set_size, self.pool_cap
            ));
        }
        if self.min_eligible < self.active_set_size {
            return invalid(format!(
                "minimum eligible {} is below active set size {}",
                self.min_eligible, self.active_set_size
            ));
        }
        if self.per_head_slots == 0 {
            return invalid("per-head slots must be at least 1".to_string());
        }
        for fraction in [
            self.per_head_fraction,
            self.active_stake_fraction,
            self.standby_stake_fraction,
        ] {
            if fraction.denominator == 0 {
                return invalid(format!("fraction {} has a zero denominator", fraction));
            }
        }
        Ok(())
    }

    fn coin_unit(&self) -> U256 {
        U256::from(10u64).pow(U256::from(self.coin_decimals))
    }
}

/// One eligible validator after stake conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub validator_addr: Address,
    pub pool_index: u64,
    /// Whole coins staked
    pub stake: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorReward {
    pub validator_addr: Address,
    pub epoch_index: u64,
    pub rewards: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub epoch_index: u64,
    pub total_fees: U256,
    pub active: Vec<Candidate>,
    pub standby: Vec<Candidate>,
    pub rewards: Vec<ValidatorReward>,
}

impl Distribution {
    pub fn total_rewards(&self) -> U256 {
        self.rewards.iter().map(|r| r.rewards).fold(U256::ZERO, |a, b| a + b)
    }
}

/// Rank eligible pool entries by stake (desc), lower pool index first on ties
pub fn rank_candidates(pool: &[PoolEntry], params: &DistributionParams) -> Vec<Candidate> {
    let unit = params.coin_unit();

    // One entry per fee address; a later pool slot replaces an earlier one
    let mut by_address: BTreeMap<Address, Candidate> = BTreeMap::new();
    for entry in pool.iter().filter(|e| e.is_active()) {
        by_address.insert(
            entry.fee_address,
            Candidate {
                validator_addr: entry.fee_address,
                pool_index: entry.pool_index,
                stake: entry.staked / unit,
            },
        );
    }

    let mut ranked: Vec<Candidate> = by_address.into_values().collect();
    ranked.sort_by(|a, b| b.stake.cmp(&a.stake).then(a.pool_index.cmp(&b.pool_index)));
    ranked
}

pub fn compute_distribution(
    epoch_index: u64,
    total_fees: U256,
    pool: &[PoolEntry],
    params: &DistributionParams,
) -> Result<Distribution> {
    let mut ranked = rank_candidates(pool, params);
    if ranked.len() < params.min_eligible {
        return Err(SettlementError::NotEnoughValidators {
            eligible: ranked.len(),
            required: params.min_eligible,
        });
    }

    ranked.truncate(params.pool_cap);
    let standby = ranked.split_off(params.active_set_size.min(ranked.len()));
    let active = ranked;

    let per_head = params.per_head_fraction.of(total_fees) / U256::from(params.per_head_slots);

    let active_stake = sum_stake(&active);
    let active_per_coin = if active_stake.is_zero() {
        U256::ZERO
    } else {
        params.active_stake_fraction.of(total_fees) / active_stake
    };

    let standby_stake = sum_stake(&standby);
    let standby_per_coin = if standby_stake.is_zero() {
        U256::ZERO
    } else {
        params.standby_stake_fraction.of(total_fees) / standby_stake
    };

    let active_rewards = active
        .iter()
        .map(|c| (c.validator_addr, per_head + active_per_coin * c.stake));
    let standby_rewards = standby
        .iter()
        .map(|c| (c.validator_addr, standby_per_coin * c.stake));

    let rewards = active_rewards
        .chain(standby_rewards)
        .filter(|(_, amount)| !amount.is_zero())
        .map(|(validator_addr, rewards)| ValidatorReward {
            validator_addr,
            epoch_index,
            rewards,
        })
        .collect();

    Ok(Distribution {
        epoch_index,
        total_fees,
        active,
        standby,
        rewards,
    })
}

fn sum_stake(candidates: &[Candidate]) -> U256 {
    candidates.iter().map(|c| c.stake).fold(U256::ZERO, |a, b| a + b)
}

#[cfg(test)]
mod tests {
    use super::*;

    const COIN: u64 = 1_000_000_000_000_000_000;

    fn entry(pool_index: u64, coins: u64) -> PoolEntry {
        PoolEntry {
            pool_index,
            fee_address: Address::with_last_byte(pool_index as u8 + 1),
            staked: U256::from(coins) * U256::from(COIN),
            status: U256::from(1),
        }
    }

    fn reward_of(dist: &Distribution, pool_index: u64) -> Option<U256> {
        let addr = Address::with_last_byte(pool_index as u8 + 1);
        dist.rewards
            .iter()
            .find(|r| r.validator_addr == addr)
            .map(|r| r.rewards)
    }

    #[test]
    fn test_eleven_active_five_standby_scenario() {
        let pool: Vec<PoolEntry> = (0..16).map(|i| entry(i, 1)).collect();
        let dist = compute_distribution(100, U256::from(1_000_000u64), &pool, &DistributionParams::default())
            .unwrap();

        assert_eq!(dist.active.len(), 11);
        assert_eq!(dist.standby.len(), 5);
        let expected_active = U256::from(500_000u64 / 21 + 400_000u64 / 11);
        for i in 0..11 {
            assert_eq!(reward_of(&dist, i), Some(expected_active));
        }
        for i in 11..16 {
            assert_eq!(reward_of(&dist, i), Some(U256::from(20_000u64)));
        }
        assert!(dist.rewards.iter().all(|r| r.epoch_index == 100));
    }

    #[test]
    fn test_rewards_never_exceed_total_fees() {
        let stakes = [913u64, 7, 44, 1_250, 3, 3, 86, 501, 77, 12, 640, 999, 15, 2, 300, 41, 8, 1, 5, 60, 700, 33, 21, 90];
        let pool: Vec<PoolEntry> = stakes.iter().enumerate().map(|(i, s)| entry(i as u64, *s)).collect();

        for total in [0u64, 1, 999, 1_000_003, 987_654_321_987] {
            let dist = compute_distribution(3, U256::from(total), &pool, &DistributionParams::default()).unwrap();
            assert!(dist.total_rewards() <= U256::from(total));
        }
    }

    #[test]
    fn test_tie_at_boundary_prefers_lower_pool_index() {
        // Ten clear leaders, then two entries tied for the last active slot
        let mut pool: Vec<PoolEntry> = (0..10).map(|i| entry(i, 100)).collect();
        pool.push(entry(15, 50));
        pool.push(entry(12, 50));
        pool.push(entry(13, 10));

        let dist = compute_distribution(1, U256::from(1_000_000u64), &pool, &DistributionParams::default())
            .unwrap();

        let last_active = dist.active.last().unwrap();
        assert_eq!(last_active.pool_index, 12);
        assert_eq!(dist.standby[0].pool_index, 15);
    }

    #[test]
    fn test_partition_is_deterministic_regardless_of_input_order() {
        let mut pool: Vec<PoolEntry> = (0..14).map(|i| entry(i, 10 + (i % 3))).collect();
        let first = compute_distribution(9, U256::from(77_777u64), &pool, &DistributionParams::default()).unwrap();

        pool.reverse();
        let second = compute_distribution(9, U256::from(77_777u64), &pool, &DistributionParams::default()).unwrap();

        assert_eq!(first.active, second.active);
        assert_eq!(first.standby, second.standby);
        assert_eq!(first.rewards, second.rewards);
    }

    #[test]
    fn test_not_enough_validators() {
        let mut pool: Vec<PoolEntry> = (0..10).map(|i| entry(i, 5)).collect();
        // Inactive entries do not count
        let mut inactive = entry(10, 5);
        inactive.status = U256::ZERO;
        pool.push(inactive);

        let err = compute_distribution(1, U256::from(1000u64), &pool, &DistributionParams::default()).unwrap_err();
        assert!(matches!(
            err,
            SettlementError::NotEnoughValidators { eligible: 10, required: 11 }
        ));
    }

    #[test]
    fn test_zero_standby_stake_gives_zero_standby_rewards() {
        let mut pool: Vec<PoolEntry> = (0..11).map(|i| entry(i, 10)).collect();
        pool.push(entry(11, 0));
        pool.push(entry(12, 0));

        let dist = compute_distribution(2, U256::from(1_000_000u64), &pool, &DistributionParams::default())
            .unwrap();
        assert_eq!(dist.standby.len(), 2);
        // Zero rewards are omitted from the output
        assert_eq!(dist.rewards.len(), 11);
        assert_eq!(reward_of(&dist, 11), None);
    }

    #[test]
    fn test_pool_capped_at_top_stakers() {
        let pool: Vec<PoolEntry> = (0..30).map(|i| entry(i, 100 - i)).collect();
        let dist = compute_distribution(4, U256::from(1_000_000u64), &pool, &DistributionParams::default())
            .unwrap();

        assert_eq!(dist.active.len() + dist.standby.len(), 22);
        assert!(dist.standby.iter().all(|c| c.pool_index < 22));
        assert_eq!(reward_of(&dist, 25), None);
    }

    #[test]
    fn test_fractional_stake_truncates_to_whole_coins() {
        let mut pool: Vec<PoolEntry> = (0..11).map(|i| entry(i, 1)).collect();
        let mut half = entry(20, 0);
        half.staked = U256::from(COIN / 2);
        pool.push(half);

        let ranked = rank_candidates(&pool, &DistributionParams::default());
        assert_eq!(ranked.last().unwrap().stake, U256::ZERO);
    }

    #[test]
    fn test_duplicate_fee_address_keeps_later_slot() {
        let mut pool: Vec<PoolEntry> = (0..11).map(|i| entry(i, 10)).collect();
        let mut dup = entry(30, 99);
        dup.fee_address = pool[0].fee_address;
        pool.push(dup);

        let ranked = rank_candidates(&pool, &DistributionParams::default());
        assert_eq!(ranked.len(), 11);
        assert_eq!(ranked[0].pool_index, 30);
        assert_eq!(ranked[0].stake, U256::from(99));
    }

    #[test]
    fn test_fraction_parsing_and_validation() {
        assert_eq!("2/5".parse::<Fraction>().unwrap(), Fraction::new(2, 5));
        assert!("2/0".parse::<Fraction>().is_err());
        assert!("0.4".parse::<Fraction>().is_err());

        let params = DistributionParams {
            min_eligible: 5,
            ..DistributionParams::default()
        };
        assert!(params.validate().is_err());
        assert!(DistributionParams::default().validate().is_ok());
    }
}
