//! Mapping of `SettlementError` onto HTTP responses

use axum::{http::StatusCode, Json};
use tracing::error;

use crate::error::SettlementError;
use crate::models::error::ErrorResponse;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn status_for(err: &SettlementError) -> StatusCode {
    match err {
        SettlementError::ChainCall(_)
        | SettlementError::NotEnoughValidators { .. }
        | SettlementError::EpochNotComplete { .. } => StatusCode::BAD_REQUEST,
        SettlementError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(err: SettlementError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, "Request failed");
    }
    (status, Json(ErrorResponse { error: err.to_string() }))
}

pub fn bad_request(message: String) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message }))
}

pub fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message }))
}
