//! Backfill Epochs
//!
//! Scrapes and persists an explicit range of epochs, oldest first, then exits.
//! Epochs already in the store are left untouched.
//!
//! Usage:
//!   cargo run --bin backfill_epochs -- <first_epoch> [last_epoch]
//!
//! `last_epoch` defaults to `first_epoch`. Reads the same environment as the
//! service (DATABASE_URL, ARCHIVE_NODE_URL, ...).

use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rewards_collector::{
    config::AppConfig,
    error::SettlementError,
    services::{
        chain_client::{ChainClient, RpcChainClient},
        epoch_recorder::{EpochRecorder, RecordOutcome},
        epoch_scraper::EpochScraper,
        settlement_store::SettlementStore,
        staking_registry::StakingRegistry,
    },
};

fn parse_range(args: &[String]) -> Result<(u64, u64), SettlementError> {
    let parse = |value: &String| {
        value
            .parse::<u64>()
            .map_err(|e| SettlementError::Configuration(format!("invalid epoch '{}': {}", value, e)))
    };

    let first = match args.first() {
        Some(value) => parse(value)?,
        None => {
            return Err(SettlementError::Configuration(
                "usage: backfill_epochs <first_epoch> [last_epoch]".to_string(),
            ))
        }
    };
    let last = match args.get(1) {
        Some(value) => parse(value)?,
        None => first,
    };
    if last < first {
        return Err(SettlementError::Configuration(format!(
            "last epoch {} is before first epoch {}",
            last, first
        )));
    }
    Ok((first, last))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rewards_collector=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (first, last) = parse_range(&args)?;
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.database_url).await?;
    migration::Migrator::up(&db, None).await?;

    let client: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(
        &config.chain.archive_node_url,
        config.chain.request_timeout,
    )?);
    let store = SettlementStore::new(db);
    let registry = StakingRegistry::new(
        client.clone(),
        config.chain.registry_address,
        config.chain.timing.epoch_length,
    );
    let scraper = Arc::new(EpochScraper::new(client, config.chain.timing));

    // Never persist an epoch the chain has not finished yet
    let token = CancellationToken::new();
    let current = scraper.current_epoch(&token).await?;
    if last > current.epoch_index {
        return Err(SettlementError::EpochNotComplete {
            epoch_index: last,
            current_epoch: current.epoch_index,
        }
        .into());
    }

    let recorder = EpochRecorder::new(scraper, registry, store, config.distribution);

    info!(first_epoch = first, last_epoch = last, "Backfilling epochs");
    let mut recorded = 0;
    for epoch_index in first..=last {
        match recorder.record(epoch_index, &token).await {
            Ok(RecordOutcome::Recorded(distribution)) => {
                recorded += 1;
                info!(
                    epoch_index = epoch_index,
                    total_fees = %distribution.total_fees,
                    rewards = distribution.rewards.len(),
                    "Recorded epoch"
                );
            }
            Ok(RecordOutcome::AlreadyRecorded) => {
                info!(epoch_index = epoch_index, "Already recorded, skipping");
            }
            Err(e) => {
                error!(epoch_index = epoch_index, error = %e, "Backfill stopped");
                return Err(e.into());
            }
        }
    }

    info!(recorded = recorded, "Backfill complete");
    Ok(())
}
