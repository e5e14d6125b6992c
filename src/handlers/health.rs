use axum::{extract::State, Json};

use crate::handlers::error::{api_error, ApiError};
use crate::models::error::HealthResponse;
use crate::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let latest = state.store.latest_epoch().await.map_err(api_error)?;

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        latest_epoch: latest.map(|e| e.epoch_index),
    }))
}
