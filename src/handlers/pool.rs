//! Registry pool and live distribution tally

use axum::{
    extract::{Path, State},
    Json,
};

use crate::handlers::error::{api_error, ApiError};
use crate::models::epoch::{DistributionResponse, PoolEntryResponse, PoolResponse};
use crate::AppState;

/// GET /api/pools/{epoch_index}
pub async fn get_pool(
    State(state): State<AppState>,
    Path(epoch_index): Path<u64>,
) -> Result<Json<PoolResponse>, ApiError> {
    let pool = state
        .registry
        .pool_at_epoch(epoch_index)
        .await
        .map_err(api_error)?;

    Ok(Json(PoolResponse {
        epoch_index,
        snapshot_block: state.registry.snapshot_block(epoch_index),
        pools: pool.iter().map(PoolEntryResponse::from).collect(),
    }))
}

/// GET /api/distribution/{epoch_index}
///
/// Recomputes the split without writing anything.
pub async fn get_distribution(
    State(state): State<AppState>,
    Path(epoch_index): Path<u64>,
) -> Result<Json<DistributionResponse>, ApiError> {
    let distribution = state.recorder.tally(epoch_index).await.map_err(api_error)?;
    Ok(Json(DistributionResponse::from(&distribution)))
}
