// src/lib.rs

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use jobs::epoch_sync::CycleGuard;
use services::{
    epoch_recorder::EpochRecorder, settlement_store::SettlementStore,
    staking_registry::StakingRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub store: SettlementStore,
    pub registry: StakingRegistry,
    pub recorder: Arc<EpochRecorder>,
    /// Shared with the epoch sync job so manual backfills never interleave with it
    pub epoch_guard: CycleGuard,
}

pub mod config;
pub mod error;

pub mod entities {
    pub mod prelude;
    pub mod epochs;
    pub mod rewards;
    pub mod send_records;
}

pub mod services {
    pub mod chain_client;
    pub mod staking_registry;
    pub mod epoch_scraper;
    pub mod distribution;
    pub mod epoch_recorder;
    pub mod request_signer;
    pub mod gateway;
    pub mod settlement_store;
    pub mod settlement;
    #[cfg(test)]
    pub mod mock_chain;
}

pub mod jobs {
    pub mod epoch_sync;
    pub mod settlement_sync;
}

pub mod models {
    pub mod epoch;
    pub mod error;
    pub mod reward;
}

pub mod handlers {
    pub mod epoch;
    pub mod error;
    pub mod health;
    pub mod pool;
    pub mod reward;
}

/// Read surface plus the manual backfill trigger
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api/epochs/current", get(handlers::epoch::get_current_epoch))
        .route("/api/epochs/backfill", post(handlers::epoch::backfill_epoch))
        .route("/api/epochs/{epoch_index}", get(handlers::epoch::get_epoch))
        .route("/api/rewards", get(handlers::reward::get_rewards))
        .route("/api/rewards/pending", get(handlers::reward::get_pending_rewards))
        .route("/api/pools/{epoch_index}", get(handlers::pool::get_pool))
        .route("/api/distribution/{epoch_index}", get(handlers::pool::get_distribution))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
