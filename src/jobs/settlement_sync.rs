//! Settlement Sync Job
//!
//! Runs a settlement attempt on one interval and the reconciliation pass on
//! another. Both run from the same loop, so they never interleave.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ScheduleConfig;
use crate::error::SettlementError;
use crate::services::settlement::{AttemptOutcome, SettlementCoordinator};

pub fn start_settlement_job(
    coordinator: Arc<SettlementCoordinator>,
    schedule: ScheduleConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            settlement_interval_secs = schedule.settlement_interval.as_secs(),
            reconcile_interval_secs = schedule.reconcile_interval.as_secs(),
            "Settlement job started"
        );

        let mut settle_interval = interval(schedule.settlement_interval);
        let mut reconcile_interval = interval(schedule.reconcile_interval);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping settlement job");
                    shutdown.cancel();
                    break;
                }
                _ = shutdown.cancelled() => {
                    info!("Settlement job cancelled");
                    break;
                }
                _ = reconcile_interval.tick() => {
                    match coordinator.reconcile(&shutdown).await {
                        Ok(_) => {}
                        Err(SettlementError::Cancelled) => break,
                        Err(e) => error!(error = %e, "Reconciliation failed"),
                    }
                }
                _ = settle_interval.tick() => {
                    match coordinator.run_attempt(&shutdown).await {
                        Ok(AttemptOutcome::Confirmed { record_id, tx_hash, resends }) => {
                            info!(record_id = record_id, tx_hash = %tx_hash, resends = resends, "Settlement confirmed on chain");
                        }
                        Ok(outcome) => info!(outcome = ?outcome, "Settlement attempt finished"),
                        Err(SettlementError::Cancelled) => break,
                        Err(e) => {
                            // Any `created` record left behind is picked up by reconciliation
                            error!(error = %e, "Settlement attempt failed");
                        }
                    }
                }
            }
        }

        info!("Settlement job stopped");
    })
}
