// =============================================================================
// Copy-Trading Reconciliation Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety (persisted runtime
// state is honored across restarts, but a brand-new deployment always
// starts there). Operators must explicitly switch to Live trading mode
// through the persisted runtime state.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod engine;
mod executor;
mod health;
mod independent_trader;
mod indicators;
mod metadata_cache;
mod orchestrator;
mod planner;
mod prediction;
mod store;
mod types;
mod venue;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{EngineConfig, RuntimeState};
use crate::engine::Engine;
use crate::prediction::scoring::WeightedIndicatorModel;
use crate::store::SqliteStore;
use crate::types::{AccountMode, TradingMode};
use crate::venue::RestVenueClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Copy-Trading Reconciliation Engine — Starting Up  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = EngineConfig::load_from_env()?;
    let mut runtime_state = RuntimeState::load_or_default(&config.runtime_state_path);

    info!(
        trading_mode = %runtime_state.trading_mode,
        account_mode = %runtime_state.account_mode,
        "runtime state loaded"
    );

    if runtime_state.trading_mode == TradingMode::Live && runtime_state.account_mode != AccountMode::Live {
        warn!("persisted trading_mode was Live with a non-Live account, forcing Paused for safety");
        runtime_state.trading_mode = TradingMode::Paused;
    }

    // ── 2. Build the venue client, store, and engine ─────────────────────
    let venue = RestVenueClient::new(&config.venue_base_url, &config.venue_api_key, &config.venue_api_secret);
    let scheduler_venue = Arc::new(venue.clone());
    let store = SqliteStore::open(&config.store_path)?;
    let last_validated_at = runtime_state.last_validated_at;
    let runtime_state_path = config.runtime_state_path.clone();
    let health_bind_addr = config.health_bind_addr.clone();

    let engine = Arc::new(Engine::new(config, venue, store, last_validated_at));

    info!(
        target_account = %engine.config.target_account,
        operator_account = %engine.config.operator_account,
        copy_mode = ?engine.config.copy_mode,
        enable_copy_trading = engine.config.enable_copy_trading,
        enable_independent_trading = engine.config.enable_independent_trading,
        "engine assembled"
    );

    // ── 3. Health endpoint ────────────────────────────────────────────────
    let health_engine = engine.clone();
    tokio::spawn(async move {
        if let Err(err) = health::serve(health_engine, &health_bind_addr).await {
            error!(error = %err, "health endpoint terminated unexpectedly");
        }
    });

    // ── 4. Scan scheduler ─────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_engine = engine.clone();
    let model_factory: Arc<orchestrator::ModelFactory> =
        Arc::new(|| Box::new(WeightedIndicatorModel::default()));

    let scheduler_handle = tokio::spawn(async move {
        orchestrator::spawn_scheduler(scheduler_engine, scheduler_venue, model_factory, shutdown_rx).await;
    });

    info!("scan scheduler running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ──────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    let _ = shutdown_tx.send(true);
    if let Err(err) = scheduler_handle.await {
        error!(error = %err, "scheduler task panicked during shutdown");
    }

    if let Some(t) = engine.last_validated_at() {
        runtime_state.last_validated_at = Some(t);
    }
    if let Err(err) = runtime_state.save(&runtime_state_path) {
        error!(error = %err, "failed to save runtime state on shutdown");
    }

    info!("copy-trading reconciliation engine shut down complete.");
    Ok(())
}
