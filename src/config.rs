//! Service configuration
//!
//! Everything is read once at startup (after `dotenvy` has loaded `.env`) into
//! plain structs that are handed to the constructors of the chain client,
//! scraper, signer and settlement coordinator.

use alloy::primitives::{Address, U256};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SettlementError};
use crate::services::distribution::{DistributionParams, Fraction};
use crate::services::epoch_scraper::EpochTiming;
use crate::services::request_signer::{Credentials, RequestSigner};

/// Registry contract the validator pool is read from
pub const DEFAULT_REGISTRY_ADDRESS: &str = "0x7Ce9A4f22FB3B3e2d91cC895bb082d7BD6F08525";

/// Contract receiving `notifyRewardAmount`
pub const DEFAULT_REWARD_CONTRACT: &str = "0x5CaeF96c490b5c357847214395Ca384dC3d3b85e";

/// Account the gateway signs for
pub const DEFAULT_SYSTEM_ACCOUNT: &str = "0xe2cdcf16d70084ac2a9ce3323c5ad3fa44cddbda";

pub const DEFAULT_SIGNER_HOST: &str = "signer.blockchain.amazonaws.com";
pub const DEFAULT_SIGNER_REGION: &str = "blockchain";
pub const DEFAULT_SIGNER_SERVICE: &str = "signer";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8005";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: String,
    pub chain: ChainConfig,
    pub gateway: GatewayConfig,
    pub exchange: ExchangeConfig,
    pub distribution: DistributionParams,
    pub schedule: ScheduleConfig,
    pub settlement: SettlementConfig,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub archive_node_url: String,
    /// Extra nodes the raw transaction is also broadcast to
    pub backup_node_urls: Vec<String>,
    pub registry_address: Address,
    pub timing: EpochTiming,
    pub request_timeout: Duration,
}

/// Gateway `/sign` endpoint plus the fixed transaction skeleton fields it expects
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    pub signer: RequestSigner,
    pub chain: String,
    pub asset: String,
    pub fee_asset: String,
    pub platform: String,
    pub decimal: u32,
    pub request_timeout: Duration,
}

/// Validator/co-signing exchange endpoint
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub url: String,
    pub signer: RequestSigner,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub epoch_sync_interval: Duration,
    pub settlement_interval: Duration,
    pub reconcile_interval: Duration,
    /// First epoch to persist when the store is empty
    pub start_epoch: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SettlementConfig {
    pub system_account: Address,
    pub reward_contract: Address,
    /// Number of epochs covered by one settlement
    pub window_epochs: u64,
    pub gas_limit: u64,
    pub gas_price: U256,
    pub gas_bump_percent: u64,
    pub max_resends: u32,
    pub confirmation_wait: Duration,
    pub reconcile_min_age: Duration,
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        let signer_host = env.string_or("SIGNER_HOST", DEFAULT_SIGNER_HOST);
        let signer_region = env.string_or("SIGNER_REGION", DEFAULT_SIGNER_REGION);
        let signer_service = env.string_or("SIGNER_SERVICE", DEFAULT_SIGNER_SERVICE);

        let chain = ChainConfig {
            archive_node_url: env.required("ARCHIVE_NODE_URL")?,
            backup_node_urls: env.list("BACKUP_NODE_URLS"),
            registry_address: env.parse_or("STAKING_REGISTRY_ADDRESS", DEFAULT_REGISTRY_ADDRESS)?,
            timing: EpochTiming {
                epoch_length: env.parse_or("EPOCH_LENGTH", "200")?,
                reorg_margin: env.parse_or("REORG_MARGIN", "10")?,
                reorg_wait: env.secs_or("REORG_WAIT_SECS", 30)?,
            },
            request_timeout: env.secs_or("RPC_TIMEOUT_SECS", 30)?,
        };
        if chain.timing.epoch_length == 0 || chain.timing.reorg_margin >= chain.timing.epoch_length {
            return Err(SettlementError::Configuration(format!(
                "REORG_MARGIN ({}) must be below a non-zero EPOCH_LENGTH ({})",
                chain.timing.reorg_margin, chain.timing.epoch_length
            )));
        }

        let gateway = GatewayConfig {
            url: env.required("GATEWAY_URL")?,
            signer: RequestSigner::new(
                Credentials::new(
                    env.required("GATEWAY_ACCESS_KEY")?,
                    env.required("GATEWAY_SECRET_KEY")?,
                ),
                signer_region.clone(),
                signer_service.clone(),
                Some(signer_host.clone()),
            ),
            chain: env.string_or("GATEWAY_CHAIN", "ht2"),
            asset: env.string_or("GATEWAY_ASSET", "ht"),
            fee_asset: env.string_or("GATEWAY_FEE_ASSET", "ht"),
            platform: env.string_or("GATEWAY_PLATFORM", "starlabsne3"),
            decimal: env.parse_or("GATEWAY_DECIMAL", "18")?,
            request_timeout: env.secs_or("GATEWAY_TIMEOUT_SECS", 120)?,
        };

        let exchange = ExchangeConfig {
            url: env.required("EXCHANGE_URL")?,
            signer: RequestSigner::new(
                Credentials::new(
                    env.required("EXCHANGE_ACCESS_KEY")?,
                    env.required("EXCHANGE_SECRET_KEY")?,
                ),
                signer_region,
                signer_service,
                Some(signer_host),
            ),
            request_timeout: env.secs_or("EXCHANGE_TIMEOUT_SECS", 120)?,
        };

        let defaults = DistributionParams::default();
        let distribution = DistributionParams {
            active_set_size: env.parse_or("ACTIVE_SET_SIZE", &defaults.active_set_size.to_string())?,
            per_head_slots: env.parse_or("PER_HEAD_SLOTS", &defaults.per_head_slots.to_string())?,
            pool_cap: env.parse_or("POOL_CAP", &defaults.pool_cap.to_string())?,
            min_eligible: env.parse_or("MIN_ELIGIBLE", &defaults.min_eligible.to_string())?,
            per_head_fraction: env.fraction_or("PER_HEAD_FRACTION", defaults.per_head_fraction)?,
            active_stake_fraction: env
                .fraction_or("ACTIVE_STAKE_FRACTION", defaults.active_stake_fraction)?,
            standby_stake_fraction: env
                .fraction_or("STANDBY_STAKE_FRACTION", defaults.standby_stake_fraction)?,
            coin_decimals: env.parse_or("COIN_DECIMALS", &defaults.coin_decimals.to_string())?,
        };
        distribution.validate()?;

        let schedule = ScheduleConfig {
            epoch_sync_interval: env.secs_or("EPOCH_SYNC_INTERVAL_SECS", 300)?,
            settlement_interval: env.secs_or("SETTLEMENT_INTERVAL_SECS", 600)?,
            reconcile_interval: env.secs_or("RECONCILE_INTERVAL_SECS", 300)?,
            start_epoch: env.optional("START_EPOCH")?,
        };

        let settlement = SettlementConfig {
            system_account: env.parse_or("SYSTEM_ACCOUNT", DEFAULT_SYSTEM_ACCOUNT)?,
            reward_contract: env.parse_or("REWARD_CONTRACT_ADDRESS", DEFAULT_REWARD_CONTRACT)?,
            window_epochs: env.parse_or("SETTLEMENT_WINDOW_EPOCHS", "3")?,
            gas_limit: env.parse_or("GAS_LIMIT", "200000")?,
            gas_price: env.parse_or("GAS_PRICE_WEI", "40000000000")?,
            gas_bump_percent: env.parse_or("GAS_BUMP_PERCENT", "10")?,
            max_resends: env.parse_or("MAX_RESENDS", "3")?,
            confirmation_wait: env.secs_or("CONFIRMATION_WAIT_SECS", 30)?,
            reconcile_min_age: env.secs_or("RECONCILE_MIN_AGE_SECS", 120)?,
        };
        if settlement.window_epochs == 0 {
            return Err(SettlementError::Configuration(
                "SETTLEMENT_WINDOW_EPOCHS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            listen_addr: env.string_or("LISTEN_ADDR", DEFAULT_LISTEN_ADDR),
            chain,
            gateway,
            exchange,
            distribution,
            schedule,
            settlement,
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| SettlementError::Configuration(format!("{} must be set", key)))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse_or<T>(&self, key: &str, default: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let raw = self.get(key).unwrap_or_else(|| default.to_string());
        raw.parse::<T>().map_err(|e| {
            SettlementError::Configuration(format!("{} has invalid value '{}': {}", key, raw, e))
        })
    }

    fn optional<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| {
                SettlementError::Configuration(format!("{} has invalid value '{}': {}", key, raw, e))
            }),
        }
    }

    fn secs_or(&self, key: &str, default: u64) -> Result<Duration> {
        self.parse_or::<u64>(key, &default.to_string())
            .map(Duration::from_secs)
    }

    /// Fractions are written as `numerator/denominator`, e.g. `2/5`
    fn fraction_or(&self, key: &str, default: Fraction) -> Result<Fraction> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.parse::<Fraction>().map_err(|e| {
                SettlementError::Configuration(format!("{} has invalid value '{}': {}", key, raw, e))
            }),
        }
    }
}
