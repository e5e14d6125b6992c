//! Epoch handlers
//!
//! GET /api/epochs/current, GET /api/epochs/{epoch_index} and the manual
//! POST /api/epochs/backfill.

use axum::{
    extract::{Path, State},
    Json,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::handlers::error::{api_error, not_found, ApiError};
use crate::models::epoch::{BackfillRequest, BackfillResponse, CurrentEpochResponse, EpochResponse};
use crate::services::epoch_recorder::RecordOutcome;
use crate::AppState;

/// GET /api/epochs/current
///
/// Newest completed epoch according to the archive node. May pause for the
/// reorg wait when the tip sits right after a boundary.
pub async fn get_current_epoch(
    State(state): State<AppState>,
) -> Result<Json<CurrentEpochResponse>, ApiError> {
    let window = state
        .recorder
        .scraper()
        .current_epoch(&CancellationToken::new())
        .await
        .map_err(api_error)?;
    let persisted = state
        .store
        .epoch(window.epoch_index)
        .await
        .map_err(api_error)?
        .is_some();

    Ok(Json(CurrentEpochResponse {
        epoch_index: window.epoch_index,
        first_block: window.first_block,
        last_block: window.last_block,
        persisted,
    }))
}

/// GET /api/epochs/{epoch_index}
pub async fn get_epoch(
    State(state): State<AppState>,
    Path(epoch_index): Path<u64>,
) -> Result<Json<EpochResponse>, ApiError> {
    match state.store.epoch(epoch_index).await.map_err(api_error)? {
        Some(epoch) => Ok(Json(EpochResponse::from(epoch))),
        None => Err(not_found(format!("epoch {} not recorded", epoch_index))),
    }
}

/// POST /api/epochs/backfill
///
/// Scrape and persist one completed epoch. Waits for a running sync cycle to
/// finish first; gaps left below it are filled by the next sync.
pub async fn backfill_epoch(
    State(state): State<AppState>,
    Json(request): Json<BackfillRequest>,
) -> Result<Json<BackfillResponse>, ApiError> {
    info!(epoch_index = request.epoch_index, "Manual epoch backfill requested");
    let _cycle = state.epoch_guard.lock().await;

    let outcome = state
        .recorder
        .backfill(request.epoch_index, &CancellationToken::new())
        .await
        .map_err(api_error)?;

    let response = match outcome {
        RecordOutcome::Recorded(distribution) => BackfillResponse {
            epoch_index: request.epoch_index,
            status: "recorded".to_string(),
            total_fees: Some(distribution.total_fees.to_string()),
            reward_count: distribution.rewards.len(),
        },
        RecordOutcome::AlreadyRecorded => BackfillResponse {
            epoch_index: request.epoch_index,
            status: "already_recorded".to_string(),
            total_fees: None,
            reward_count: 0,
        },
    };
    Ok(Json(response))
}
