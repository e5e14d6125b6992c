//! Epoch Recorder
//!
//! Scrapes an epoch's fees, reads the validator pool at its last block,
//! computes the split and persists the `Epoch` row with its `Reward` rows.
//! `sync` walks every epoch missing between the oldest stored one and the
//! chain tip, so gaps left by manual backfills are filled too.

use alloy::primitives::U256;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{Result, SettlementError};
use crate::services::distribution::{compute_distribution, Distribution, DistributionParams};
use crate::services::epoch_scraper::EpochScraper;
use crate::services::settlement_store::SettlementStore;
use crate::services::staking_registry::StakingRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded(Distribution),
    /// Another cycle (or an earlier run) persisted it first
    AlreadyRecorded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub recorded: usize,
    pub already_recorded: usize,
    /// Highest epoch the chain allows right now
    pub current_epoch: u64,
}

pub struct EpochRecorder {
    scraper: Arc<EpochScraper>,
    registry: StakingRegistry,
    store: SettlementStore,
    params: DistributionParams,
}

impl EpochRecorder {
    pub fn new(
        scraper: Arc<EpochScraper>,
        registry: StakingRegistry,
        store: SettlementStore,
        params: DistributionParams,
    ) -> Self {
        Self {
            scraper,
            registry,
            store,
            params,
        }
    }

    pub fn scraper(&self) -> &EpochScraper {
        &self.scraper
    }

    pub async fn record(&self, epoch_index: u64, token: &CancellationToken) -> Result<RecordOutcome> {
        if token.is_cancelled() {
            return Err(SettlementError::Cancelled);
        }
        if self.store.epoch(epoch_index).await?.is_some() {
            return Ok(RecordOutcome::AlreadyRecorded);
        }

        let fees = self.scraper.scrape_epoch(epoch_index).await?;
        let pool = self.registry.pool_at_epoch(epoch_index).await?;
        let distribution = compute_distribution(epoch_index, fees.total_fees, &pool, &self.params)?;

        if token.is_cancelled() {
            return Err(SettlementError::Cancelled);
        }
        match self.store.record_epoch(&fees, &distribution.rewards).await {
            Ok(_) => Ok(RecordOutcome::Recorded(distribution)),
            Err(e) if e.is_conflict() => {
                info!(epoch_index = epoch_index, "Epoch already recorded by another cycle");
                Ok(RecordOutcome::AlreadyRecorded)
            }
            Err(e) => Err(e),
        }
    }

    /// Record one epoch on request, refusing epochs the chain has not finished yet
    pub async fn backfill(&self, epoch_index: u64, token: &CancellationToken) -> Result<RecordOutcome> {
        let current = self.scraper.current_epoch(token).await?;
        if epoch_index > current.epoch_index {
            return Err(SettlementError::EpochNotComplete {
                epoch_index,
                current_epoch: current.epoch_index,
            });
        }
        self.record(epoch_index, token).await
    }

    /// Persist every missing epoch from the oldest stored one up to the current epoch,
    /// in ascending order. An empty store starts at `start_epoch`, or at the current
    /// epoch alone.
    pub async fn sync(&self, start_epoch: Option<u64>, token: &CancellationToken) -> Result<SyncReport> {
        let current = self.scraper.current_epoch(token).await?;

        if token.is_cancelled() {
            return Err(SettlementError::Cancelled);
        }
        let first = match self.store.earliest_epoch().await? {
            Some(earliest) => earliest.epoch_index as u64,
            None => start_epoch.unwrap_or(current.epoch_index),
        };

        let mut report = SyncReport {
            current_epoch: current.epoch_index,
            ..SyncReport::default()
        };
        if first > current.epoch_index {
            return Ok(report);
        }

        let recorded = self
            .store
            .recorded_epoch_indices(first, current.epoch_index)
            .await?;
        let missing: Vec<u64> = (first..=current.epoch_index)
            .filter(|epoch_index| !recorded.contains(epoch_index))
            .collect();
        if missing.is_empty() {
            return Ok(report);
        }

        info!(
            first_missing = missing[0],
            missing = missing.len(),
            current_epoch = current.epoch_index,
            "Backfilling epochs"
        );
        for epoch_index in missing {
            match self.record(epoch_index, token).await {
                Ok(RecordOutcome::Recorded(distribution)) => {
                    report.recorded += 1;
                    info!(
                        epoch_index = epoch_index,
                        total_fees = %distribution.total_fees,
                        active = distribution.active.len(),
                        standby = distribution.standby.len(),
                        rewards = %distribution.total_rewards(),
                        "Recorded epoch rewards"
                    );
                }
                Ok(RecordOutcome::AlreadyRecorded) => report.already_recorded += 1,
                Err(e) => {
                    // Later epochs wait so they are never persisted out of order
                    error!(epoch_index = epoch_index, error = %e, "Epoch processing failed, stopping backfill");
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Compute an epoch's split without writing anything, from stored fees when available
    pub async fn tally(&self, epoch_index: u64) -> Result<Distribution> {
        let total_fees = match self.store.epoch(epoch_index).await? {
            Some(epoch) => U256::from_str(&epoch.total_fees).map_err(|e| {
                SettlementError::Database(format!("epoch {} has invalid total fees: {}", epoch_index, e))
            })?,
            None => {
                warn!(epoch_index = epoch_index, "Epoch not persisted, scraping fees for tally");
                self.scraper.scrape_epoch(epoch_index).await?.total_fees
            }
        };

        let pool = self.registry.pool_at_epoch(epoch_index).await?;
        compute_distribution(epoch_index, total_fees, &pool, &self.params)
    }
}
