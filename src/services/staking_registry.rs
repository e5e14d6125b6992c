//! Staking registry reader
//!
//! Reads the validator pool from the registry contract as of an epoch's last
//! block. Replies of `getPoolWithStatus` are decoded by fixed word offsets of
//! the deployed contract's return layout.

use alloy::{
    primitives::{Address, Bytes, U256},
    sol,
    sol_types::SolCall,
};
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, SettlementError};
use crate::services::chain_client::{BlockTag, ChainClient};

const WORD: usize = 32;

/// Word holding the fee recipient address
const FEE_ADDRESS_WORD: usize = 0;
/// Word holding the staked amount (18-decimal fixed point)
const STAKED_COINS_WORD: usize = 6;
/// Word holding the pool status flag
const STATUS_WORD: usize = 11;
/// Upper bound on a believable `getPoolLength` reply
const MAX_POOL_LENGTH: u64 = 10_000;

sol! {
    interface IStakingRegistry {
        function getPoolLength() external view returns (uint256);
        function getPoolWithStatus(uint256 id) external view;
    }
}

/// One registry slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntry {
    pub pool_index: u64,
    pub fee_address: Address,
    /// Raw fixed-point stake as stored on chain
    pub staked: U256,
    pub status: U256,
}

impl PoolEntry {
    pub fn is_active(&self) -> bool {
        !self.status.is_zero()
    }

    /// Decode a `getPoolWithStatus` reply
    pub fn decode(pool_index: u64, reply: &[u8]) -> Result<Self> {
        let needed = (STATUS_WORD + 1) * WORD;
        if reply.len() < needed {
            return Err(SettlementError::ChainCall(format!(
                "pool {} reply is {} bytes, expected at least {}",
                pool_index,
                reply.len(),
                needed
            )));
        }

        let fee_word = word(reply, FEE_ADDRESS_WORD);
        Ok(Self {
            pool_index,
            fee_address: Address::from_slice(&fee_word[12..]),
            staked: U256::from_be_slice(word(reply, STAKED_COINS_WORD)),
            status: U256::from_be_slice(word(reply, STATUS_WORD)),
        })
    }
}

fn word(data: &[u8], index: usize) -> &[u8] {
    &data[index * WORD..(index + 1) * WORD]
}

pub fn pool_length_calldata() -> Bytes {
    Bytes::from(IStakingRegistry::getPoolLengthCall {}.abi_encode())
}

pub fn pool_calldata(pool_index: u64) -> Bytes {
    Bytes::from(
        IStakingRegistry::getPoolWithStatusCall {
            id: U256::from(pool_index),
        }
        .abi_encode(),
    )
}

/// Reads (and caches) pool snapshots; a snapshot at a past block never changes
#[derive(Clone)]
pub struct StakingRegistry {
    client: Arc<dyn ChainClient>,
    address: Address,
    epoch_length: u64,
    cache: Arc<Cache<u64, Arc<Vec<PoolEntry>>>>,
}

impl StakingRegistry {
    pub fn new(client: Arc<dyn ChainClient>, address: Address, epoch_length: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(64)
            .time_to_live(Duration::from_secs(6 * 3600))
            .build();

        Self {
            client,
            address,
            epoch_length,
            cache: Arc::new(cache),
        }
    }

    /// Last block of an epoch, where its stake snapshot is taken
    pub fn snapshot_block(&self, epoch_index: u64) -> u64 {
        (epoch_index + 1) * self.epoch_length - 1
    }

    pub async fn pool_at_epoch(&self, epoch_index: u64) -> Result<Arc<Vec<PoolEntry>>> {
        let block = self.snapshot_block(epoch_index);
        if let Some(cached) = self.cache.get(&block).await {
            debug!(epoch_index = epoch_index, block = block, "Pool snapshot cache hit");
            return Ok(cached);
        }

        let pool = Arc::new(self.pool_at_block(block).await?);
        self.cache.insert(block, pool.clone()).await;

        info!(
            epoch_index = epoch_index,
            block = block,
            pool_length = pool.len(),
            active = pool.iter().filter(|p| p.is_active()).count(),
            "Read staking registry pool"
        );
        Ok(pool)
    }

    pub async fn pool_length(&self, block: u64) -> Result<u64> {
        let reply = self
            .client
            .call(self.address, pool_length_calldata(), BlockTag::Number(block))
            .await?;
        if reply.len() < WORD {
            return Err(SettlementError::ChainCall(format!(
                "getPoolLength reply is {} bytes",
                reply.len()
            )));
        }

        let length = U256::from_be_slice(word(&reply, 0));
        u64::try_from(length)
            .map_err(|_| SettlementError::ChainCall(format!("pool length {} out of range", length)))
    }

    pub async fn pool_at_block(&self, block: u64) -> Result<Vec<PoolEntry>> {
        let length = self.pool_length(block).await?;
        if length == 0 {
            return Err(SettlementError::ChainCall(format!(
                "staking registry reports an empty pool at block {}",
                block
            )));
        }

        if length > MAX_POOL_LENGTH {
            return Err(SettlementError::ChainCall(format!(
                "staking registry reports {} pools at block {}, more than {}",
                length, block, MAX_POOL_LENGTH
            )));
        }

        let mut entries = Vec::with_capacity(length as usize);
        for pool_index in 0..length {
            let reply = self
                .client
                .call(self.address, pool_calldata(pool_index), BlockTag::Number(block))
                .await?;
            entries.push(PoolEntry::decode(pool_index, &reply)?);
        }
        Ok(entries)
    }
}
