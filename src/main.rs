use sea_orm::Database;
use sea_orm_migration::MigratorTrait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rewards_collector::{
    build_router,
    config::AppConfig,
    jobs::{
        epoch_sync::{start_epoch_sync_job, CycleGuard},
        settlement_sync::start_settlement_job,
    },
    services::{
        chain_client::{ChainClient, RpcChainClient},
        epoch_recorder::EpochRecorder,
        epoch_scraper::EpochScraper,
        gateway::{CoSignerClient, GatewayClient, GatewaySigner},
        settlement::SettlementCoordinator,
        settlement_store::SettlementStore,
        staking_registry::StakingRegistry,
    },
    AppState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,rewards_collector=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Loads .env before reading the environment
    let config = AppConfig::from_env()?;

    tracing::info!("Connecting to database...");
    let db = Database::connect(&config.database_url).await?;

    tracing::info!("Running migrations...");
    migration::Migrator::up(&db, None).await?;

    let client: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(
        &config.chain.archive_node_url,
        config.chain.request_timeout,
    )?);
    let mut backups: Vec<Arc<dyn ChainClient>> = Vec::new();
    for url in &config.chain.backup_node_urls {
        backups.push(Arc::new(RpcChainClient::new(url, config.chain.request_timeout)?));
    }

    let store = SettlementStore::new(db);
    let registry = StakingRegistry::new(
        client.clone(),
        config.chain.registry_address,
        config.chain.timing.epoch_length,
    );
    let scraper = Arc::new(EpochScraper::new(client.clone(), config.chain.timing));
    let recorder = Arc::new(EpochRecorder::new(
        scraper,
        registry.clone(),
        store.clone(),
        config.distribution.clone(),
    ));
    let signer = Arc::new(GatewaySigner::new(
        GatewayClient::new(config.gateway.clone())?,
        CoSignerClient::new(config.exchange.clone())?,
    ));
    let coordinator = Arc::new(SettlementCoordinator::new(
        client,
        backups,
        signer,
        registry.clone(),
        store.clone(),
        config.settlement.clone(),
    ));

    let shutdown = CancellationToken::new();
    let epoch_guard: CycleGuard = Arc::new(Mutex::new(()));

    tracing::info!(
        archive_node = %config.chain.archive_node_url,
        backups = config.chain.backup_node_urls.len(),
        epoch_length = config.chain.timing.epoch_length,
        "Starting background jobs"
    );
    let epoch_job = start_epoch_sync_job(
        recorder.clone(),
        epoch_guard.clone(),
        config.schedule.clone(),
        shutdown.clone(),
    );
    let settlement_job = start_settlement_job(
        coordinator,
        config.schedule.clone(),
        shutdown.clone(),
    );

    let state = AppState {
        store,
        registry,
        recorder,
        epoch_guard,
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_shutdown.cancelled() => {}
            }
            server_shutdown.cancel();
        })
        .await?;

    let (epoch_result, settlement_result) = tokio::join!(epoch_job, settlement_job);
    if let Err(e) = epoch_result.and(settlement_result) {
        tracing::warn!(error = %e, "Background job ended abnormally");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
