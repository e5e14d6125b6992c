//! Epoch Sync Job
//!
//! Periodically persists every completed epoch the store is missing.
//! Stops on SIGINT or when the shutdown token is cancelled.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ScheduleConfig;
use crate::error::SettlementError;
use crate::services::epoch_recorder::EpochRecorder;

/// Held for the duration of one cycle; shared with the manual backfill endpoint
pub type CycleGuard = Arc<Mutex<()>>;

pub fn start_epoch_sync_job(
    recorder: Arc<EpochRecorder>,
    guard: CycleGuard,
    schedule: ScheduleConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = schedule.epoch_sync_interval.as_secs(),
            start_epoch = ?schedule.start_epoch,
            "Epoch sync job started"
        );

        let mut interval = interval(schedule.epoch_sync_interval);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping epoch sync job");
                    shutdown.cancel();
                    break;
                }
                _ = shutdown.cancelled() => {
                    info!("Epoch sync job cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let Ok(_cycle) = guard.try_lock() else {
                        warn!("Previous epoch sync cycle still running, skipping");
                        continue;
                    };

                    match recorder.sync(schedule.start_epoch, &shutdown).await {
                        Ok(report) => {
                            info!(
                                recorded = report.recorded,
                                already_recorded = report.already_recorded,
                                current_epoch = report.current_epoch,
                                "Epoch sync completed"
                            );
                        }
                        Err(SettlementError::Cancelled) => break,
                        Err(e) => {
                            // Next tick retries from the first missing epoch
                            error!(error = %e, "Epoch sync failed");
                        }
                    }
                }
            }
        }

        info!("Epoch sync job stopped");
    })
}
