//! Reward handlers
//!
//! GET /api/rewards and GET /api/rewards/pending over an inclusive epoch range.

use alloy::primitives::U256;
use axum::{
    extract::{Query, State},
    Json,
};

use crate::handlers::error::{api_error, bad_request, ApiError};
use crate::models::reward::{
    PendingRewardsResponse, RewardAmount, RewardRangeQuery, RewardResponse, RewardsResponse,
};
use crate::AppState;

/// GET /api/rewards?this_epoch=&last_epoch=
pub async fn get_rewards(
    State(state): State<AppState>,
    Query(range): Query<RewardRangeQuery>,
) -> Result<Json<RewardsResponse>, ApiError> {
    range.validate().map_err(bad_request)?;

    let rows = state
        .store
        .rewards_in_range(range.this_epoch, range.last_epoch)
        .await
        .map_err(api_error)?;
    let total_fees = state
        .store
        .total_fees_in_range(range.this_epoch, range.last_epoch)
        .await
        .map_err(api_error)?;

    Ok(Json(RewardsResponse {
        this_epoch: range.this_epoch,
        last_epoch: range.last_epoch,
        total_fees: total_fees.to_string(),
        rewards: rows.into_iter().map(RewardResponse::from).collect(),
    }))
}

/// GET /api/rewards/pending?this_epoch=&last_epoch=
///
/// Undistributed sum per validator; validators with nothing owed are left out.
pub async fn get_pending_rewards(
    State(state): State<AppState>,
    Query(range): Query<RewardRangeQuery>,
) -> Result<Json<PendingRewardsResponse>, ApiError> {
    range.validate().map_err(bad_request)?;

    let sums = state
        .store
        .undistributed_sums(range.this_epoch, range.last_epoch, None)
        .await
        .map_err(api_error)?;
    let total = sums.values().fold(U256::ZERO, |a, b| a + *b);

    Ok(Json(PendingRewardsResponse {
        this_epoch: range.this_epoch,
        last_epoch: range.last_epoch,
        total: total.to_string(),
        validators: sums
            .into_iter()
            .map(|(addr, amount)| RewardAmount {
                validator_addr: format!("{:#x}", addr),
                rewards: amount.to_string(),
            })
            .collect(),
    }))
}
