// =============================================================================
// Scan Orchestrator — single-flight, timeout-guarded periodic reconciliation
// =============================================================================
//
// One call to `run_scan` is one pass of §4.1: expire cool-downs, probe the
// store, fetch all account/market state concurrently, score predictions, run
// the independent trader, plan+execute every symbol in bounded batches, then
// finalize predictions and (hourly) validate past ones. `spawn_scheduler`
// wraps this in the fixed-cadence, single-flight loop the process runs under.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::engine::{Engine, LastScanOutcome};
use crate::executor::Executor;
use crate::independent_trader::IndependentTrader;
use crate::planner::{sync_position, SyncContext};
use crate::prediction::scoring::{MarketState, ScoringModel};
use crate::prediction::PredictionRecorder;
use crate::types::Position;
use crate::venue::VenueClient;

/// Builds a fresh boxed scoring model for one scan. Plain functions and
/// closures with no captured state both satisfy this automatically.
pub type ModelFactory = dyn Fn() -> Box<dyn ScoringModel> + Send + Sync;

/// Drive the fixed-cadence, single-flight scan loop until the shutdown
/// signal resolves. Also fires one scan immediately on start, per §4.1.
pub async fn spawn_scheduler<V: VenueClient>(
    engine: Arc<Engine>,
    venue: Arc<V>,
    model_factory: Arc<ModelFactory>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let cadence = StdDuration::from_secs(engine.config.copy_poll_interval_minutes * 60);
    let mut ticker = tokio::time::interval(cadence);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // Fire once immediately on process start.
    run_scan_guarded(&engine, venue.as_ref(), model_factory.as_ref()).await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_scan_guarded(&engine, venue.as_ref(), model_factory.as_ref()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("scheduler received shutdown signal, stopping scan loop");
                    break;
                }
            }
        }
    }
}

/// Apply the single-flight guard around one `run_scan` call, downgrading any
/// top-level error to a log (error kind 9 — never crash the scheduler).
async fn run_scan_guarded<V: VenueClient>(engine: &Engine, venue: &V, model_factory: &ModelFactory) {
    let scan_timeout = chrono::Duration::seconds(engine.config.scan_timeout_seconds as i64);
    if !engine.try_start_scan(scan_timeout) {
        warn!("scan already in flight, skipping this tick");
        return;
    }

    let started = std::time::Instant::now();
    let result = run_scan(engine, venue, model_factory).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let succeeded = match &result {
        Ok(symbols_scanned) => {
            // One unconditional completion log per scan, never gated on
            // whether any action was taken.
            info!(duration_ms, symbols_scanned, "scan completed");
            engine.record_scan_outcome(LastScanOutcome {
                finished_at: chrono::Utc::now(),
                duration_ms,
                symbols_scanned: *symbols_scanned,
                succeeded: true,
            });
            true
        }
        Err(err) => {
            error!(duration_ms, error = %err, "scan aborted");
            engine.record_scan_outcome(LastScanOutcome {
                finished_at: chrono::Utc::now(),
                duration_ms,
                symbols_scanned: 0,
                succeeded: false,
            });
            engine.record_error("scan", err.to_string());
            false
        }
    };
    let _ = succeeded;

    // Unconditionally cleared on exit, normal or error.
    engine.finish_scan();
}

/// One full scan pass. Returns the number of symbols in the universe on
/// success, or an error if the store/venue state fetch failed outright.
async fn run_scan<V: VenueClient>(engine: &Engine, venue: &V, model_factory: &ModelFactory) -> anyhow::Result<usize> {
    // 1. Expire cool-downs.
    let cooldown = chrono::Duration::seconds(engine.config.failed_order_cooldown_seconds as i64);
    engine.expire_cooldowns(cooldown);

    // 2. Store health probe, with one disconnect+reconnect-equivalent retry.
    probe_store_with_retry(engine).await?;

    // 3. Metadata fetch (only if cache empty).
    if engine.metadata.is_empty() {
        let meta = timeout(StdDuration::from_secs(20), venue.meta())
            .await
            .map_err(|_| anyhow::anyhow!("metadata fetch timed out"))??;
        engine.metadata.populate(meta);
    }

    // 4. Parallel state fetch.
    let (target_snapshot, target_positions_vec, operator_snapshot, operator_positions_vec, mids) = fetch_all_state(engine, venue).await?;

    let target_positions: HashMap<String, Position> = target_positions_vec
        .into_iter()
        .filter(|p| p.signed_size != 0.0)
        .map(|p| (p.symbol.clone(), p))
        .collect();
    let operator_positions: HashMap<String, Position> = operator_positions_vec
        .into_iter()
        .filter(|p| p.signed_size != 0.0)
        .map(|p| (p.symbol.clone(), p))
        .collect();

    // 5. Scale factor.
    let scale_factor = if engine.config.copy_mode == crate::config::CopyMode::Exact {
        1.0
    } else if target_snapshot.equity > 0.0 {
        (operator_snapshot.equity / target_snapshot.equity) * engine.config.copy_scale_multiplier
    } else {
        0.0
    };

    // 6. Symbol universe.
    let mut universe: HashSet<String> = HashSet::new();
    universe.extend(target_positions.keys().cloned());
    universe.extend(operator_positions.keys().cloned());
    if engine.config.enable_independent_trading {
        universe.extend(engine.config.independent_whitelist.iter().cloned());
    }

    // 7. Prediction recorder.
    let recorder = PredictionRecorder::new(engine, model_factory());
    let states = assemble_market_states(engine, &universe);
    recorder.log_predictions(&states);

    // 8. Independent trader: entries, then management.
    if engine.config.enable_independent_trading {
        if let Err(err) = IndependentTrader::process_signals(engine, venue, &operator_positions, &target_positions, &mids).await {
            warn!(error = %err, "independent trader entry pass failed");
        }
        if let Err(err) = IndependentTrader::manage_positions(engine, venue, &target_positions, &mids).await {
            warn!(error = %err, "independent trader management pass failed");
        }
    }

    // 9. Per-symbol planning+execution, batched to at most B concurrent.
    let executor = Executor::new(venue, engine.config.order_slippage_pct);
    let mut traded_symbols: HashSet<String> = HashSet::new();
    let symbols: Vec<String> = universe.iter().cloned().collect();
    let batch_size = engine.config.symbol_batch_size.max(1);
    let per_symbol_timeout = StdDuration::from_secs(30);

    for chunk in symbols.chunks(batch_size) {
        let mut handles = Vec::with_capacity(chunk.len());
        for symbol in chunk {
            let ctx = SyncContext {
                symbol,
                scale_factor,
                target_positions: &target_positions,
                operator_positions: &operator_positions,
                mids: &mids,
            };
            // Per-symbol work is run serially within the batch for borrow
            // simplicity; the timeout still bounds each one individually, and
            // a slow/hung symbol does not block symbols in later batches
            // beyond its own per-symbol deadline.
            let fut = sync_position(engine, &executor, &recorder, ctx, &mut traded_symbols);
            handles.push(timeout(per_symbol_timeout, fut).await);
        }
        for (symbol, outcome) in chunk.iter().zip(handles) {
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!(symbol = %symbol, error = %err, "per-symbol planning failed");
                    engine.record_error(symbol, err.to_string());
                }
                Err(_) => {
                    warn!(symbol = %symbol, "per-symbol planning timed out");
                    engine.record_error(symbol, "per-symbol timeout");
                }
            }
        }
    }

    // 10. Finalize predictions.
    recorder.finalize_scan_predictions(&traded_symbols);

    // 11. Periodic validation, gated on elapsed time rather than a modulus.
    let validation_interval = chrono::Duration::minutes(engine.config.prediction_validation_interval_minutes);
    if engine.should_validate(validation_interval) {
        if let Err(err) = recorder.validate_past_predictions(100) {
            warn!(error = %err, "prediction validation pass failed");
        }
    }

    Ok(universe.len())
}

async fn probe_store_with_retry(engine: &Engine) -> anyhow::Result<()> {
    match engine.store.health_probe() {
        Ok(()) => Ok(()),
        Err(first_err) => {
            warn!(error = %first_err, "store health probe failed, retrying once");
            // A single reconnect attempt; this store implementation holds a
            // persistent connection, so the retry is the same probe again
            // after a brief backoff rather than a literal socket reconnect.
            tokio::time::sleep(StdDuration::from_millis(200)).await;
            engine
                .store
                .health_probe()
                .map_err(|e| anyhow::anyhow!("store unavailable after reconnect attempt: {e}"))
        }
    }
}

type StateFetch = (
    crate::types::PortfolioSnapshot,
    Vec<Position>,
    crate::types::PortfolioSnapshot,
    Vec<Position>,
    HashMap<String, f64>,
);

async fn fetch_all_state<V: VenueClient>(engine: &Engine, venue: &V) -> anyhow::Result<StateFetch> {
    let target_fut = timeout(StdDuration::from_secs(10), venue.clearinghouse_state(&engine.config.target_account));
    let operator_fut = timeout(StdDuration::from_secs(10), venue.clearinghouse_state(&engine.config.operator_account));
    let mids_fut = timeout(StdDuration::from_secs(10), venue.all_mids());

    let (target_res, operator_res, mids_res) = tokio::join!(target_fut, operator_fut, mids_fut);

    let (target_snapshot, target_positions) = target_res
        .map_err(|_| anyhow::anyhow!("target state fetch timed out"))?
        .map_err(|e| anyhow::anyhow!("target state fetch failed: {e}"))?;
    let (operator_snapshot, operator_positions) = operator_res
        .map_err(|_| anyhow::anyhow!("operator state fetch timed out"))?
        .map_err(|e| anyhow::anyhow!("operator state fetch failed: {e}"))?;
    let mids = mids_res
        .map_err(|_| anyhow::anyhow!("mid-price fetch timed out"))?
        .map_err(|e| anyhow::anyhow!("mid-price fetch failed: {e}"))?;

    Ok((target_snapshot, target_positions, operator_snapshot, operator_positions, mids))
}

/// Build one `MarketState` per symbol in the universe from store-backed
/// candles and funding. BTC's own candles are fetched once and shared as
/// relative-strength context for every other symbol; BTC itself gets an
/// empty context (nothing to compare against itself). Every universe symbol
/// gets an entry, even with empty candles, so `log_predictions` can still
/// record one prediction row per symbol (§8 property 8).
fn assemble_market_states(engine: &Engine, universe: &HashSet<String>) -> Vec<MarketState> {
    const BTC_SYMBOL: &str = "BTC";
    let btc_reference = engine.store.recent_candles(BTC_SYMBOL, "1h", 60).unwrap_or_default();

    universe
        .iter()
        .map(|symbol| {
            let candles = engine.store.recent_candles(symbol, "1h", 60).unwrap_or_default();
            let funding_rate = engine.store.latest_funding(symbol).ok().flatten();
            let btc_candles = if symbol == BTC_SYMBOL { Vec::new() } else { btc_reference.clone() };
            MarketState {
                symbol: symbol.clone(),
                candles,
                funding_rate,
                btc_candles,
            }
        })
        .collect()
}
