// =============================================================================
// Engine — the single process-wide object threaded through every component
// =============================================================================
//
// Replaces the module-scoped singletons (metadata cache, failed-order map,
// current-scan prediction map, single-flight flag) with fields of one
// object owned by the orchestrator and passed by reference to the planner,
// executor, recorder, and independent trader. This removes the cyclic
// dependency where the independent trader would otherwise need to import
// the planner's metadata-cache module directly.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::metadata_cache::MetadataCache;
use crate::store::SqliteStore;
use crate::types::{ErrorRecord, ScoredPrediction};
use crate::venue::RestVenueClient;

const MAX_ERROR_RECORDS: usize = 50;

/// Outcome of the most recently completed scan, surfaced on the health
/// endpoint.
#[derive(Debug, Clone)]
pub struct LastScanOutcome {
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub symbols_scanned: usize,
    pub succeeded: bool,
}

pub struct Engine {
    pub config: EngineConfig,
    pub venue: RestVenueClient,
    pub store: Arc<SqliteStore>,
    pub metadata: MetadataCache,

    /// Single-flight guard, cleared unconditionally on scan exit.
    scan_running: RwLock<bool>,
    scan_started_at: RwLock<Option<DateTime<Utc>>>,

    /// Per-symbol failed-order cool-down, single-writer (executor path).
    failed_orders: RwLock<HashMap<String, DateTime<Utc>>>,

    /// Current-scan predictions, single-writer during the recorder phase.
    current_scan_predictions: RwLock<HashMap<String, ScoredPrediction>>,

    /// Replaces the modulus-based validation gate.
    last_validated_at: RwLock<Option<DateTime<Utc>>>,

    /// Bounded ring of recent anomalies for the health endpoint.
    recent_errors: RwLock<VecDeque<ErrorRecord>>,

    pub started_at: DateTime<Utc>,
    last_scan_outcome: RwLock<Option<LastScanOutcome>>,
}

impl Engine {
    pub fn new(config: EngineConfig, venue: RestVenueClient, store: SqliteStore, last_validated_at: Option<DateTime<Utc>>) -> Self {
        Self {
            config,
            venue,
            store: Arc::new(store),
            metadata: MetadataCache::new(),
            scan_running: RwLock::new(false),
            scan_started_at: RwLock::new(None),
            failed_orders: RwLock::new(HashMap::new()),
            current_scan_predictions: RwLock::new(HashMap::new()),
            last_validated_at: RwLock::new(last_validated_at),
            recent_errors: RwLock::new(VecDeque::with_capacity(MAX_ERROR_RECORDS)),
            started_at: Utc::now(),
            last_scan_outcome: RwLock::new(None),
        }
    }

    // --- Single-flight ---------------------------------------------------

    /// Attempt to enter a scan. Returns `true` if this call acquired the
    /// flag (caller must call `finish_scan` when done); `false` if another
    /// scan is already in flight and not yet timed out.
    pub fn try_start_scan(&self, timeout: chrono::Duration) -> bool {
        let mut running = self.scan_running.write();
        if *running {
            let started = *self.scan_started_at.read();
            let hung = started
                .map(|t| Utc::now() - t > timeout)
                .unwrap_or(true);
            if !hung {
                return false;
            }
            // Previous scan considered hung; force-reset and proceed.
        }
        *running = true;
        *self.scan_started_at.write() = Some(Utc::now());
        true
    }

    /// Unconditionally clear the single-flight flag on scan exit (normal or
    /// error path).
    pub fn finish_scan(&self) {
        *self.scan_running.write() = false;
    }

    // --- Failed-order cool-down -------------------------------------------

    pub fn mark_order_failed(&self, symbol: &str) {
        self.failed_orders.write().insert(symbol.to_string(), Utc::now());
    }

    pub fn clear_cooldown(&self, symbol: &str) {
        self.failed_orders.write().remove(symbol);
    }

    pub fn is_cooling_down(&self, symbol: &str, cooldown: chrono::Duration) -> bool {
        self.failed_orders
            .read()
            .get(symbol)
            .map(|failed_at| Utc::now() - *failed_at < cooldown)
            .unwrap_or(false)
    }

    /// Drop cool-down entries that have expired. Step 1 of the per-scan
    /// structure.
    pub fn expire_cooldowns(&self, cooldown: chrono::Duration) {
        let now = Utc::now();
        self.failed_orders.write().retain(|_, at| now - *at < cooldown);
    }

    // --- Current-scan predictions -------------------------------------------

    pub fn clear_scan_predictions(&self) {
        self.current_scan_predictions.write().clear();
    }

    pub fn record_prediction(&self, prediction: ScoredPrediction) {
        self.current_scan_predictions
            .write()
            .insert(prediction.symbol.clone(), prediction);
    }

    pub fn scan_prediction(&self, symbol: &str) -> Option<ScoredPrediction> {
        self.current_scan_predictions.read().get(symbol).cloned()
    }

    pub fn scan_prediction_symbols(&self) -> Vec<String> {
        self.current_scan_predictions.read().keys().cloned().collect()
    }

    // --- Validation gate ---------------------------------------------------

    pub fn should_validate(&self, interval: chrono::Duration) -> bool {
        match *self.last_validated_at.read() {
            None => true,
            Some(t) => Utc::now() - t >= interval,
        }
    }

    pub fn mark_validated(&self) {
        *self.last_validated_at.write() = Some(Utc::now());
    }

    pub fn last_validated_at(&self) -> Option<DateTime<Utc>> {
        *self.last_validated_at.read()
    }

    // --- Error ring ---------------------------------------------------------

    pub fn record_error(&self, context: impl Into<String>, message: impl Into<String>) {
        let mut ring = self.recent_errors.write();
        if ring.len() >= MAX_ERROR_RECORDS {
            ring.pop_front();
        }
        ring.push_back(ErrorRecord {
            at: Utc::now(),
            context: context.into(),
            message: message.into(),
        });
    }

    pub fn recent_error_count(&self) -> usize {
        self.recent_errors.read().len()
    }

    // --- Scan outcome --------------------------------------------------------

    pub fn record_scan_outcome(&self, outcome: LastScanOutcome) {
        *self.last_scan_outcome.write() = Some(outcome);
    }

    pub fn last_scan_outcome(&self) -> Option<LastScanOutcome> {
        self.last_scan_outcome.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> Engine {
        let config = EngineConfig {
            enable_copy_trading: true,
            copy_mode: crate::config::CopyMode::Scaled,
            copy_poll_interval_minutes: 5,
            copy_scale_multiplier: 1.3,
            position_adjust_threshold: 0.10,
            min_position_size_usd: 5.0,
            enable_independent_trading: false,
            independent_max_allocation_pct: 0.10,
            independent_max_positions: 3,
            independent_leverage: 5.0,
            independent_use_time_exit: true,
            independent_hold_hours: 4.0,
            independent_tp_pct: 0.20,
            independent_sl_pct: 0.12,
            independent_min_score: 90.0,
            independent_whitelist: vec![],
            target_account: "target".to_string(),
            operator_account: "operator".to_string(),
            scan_timeout_seconds: 240,
            symbol_batch_size: 5,
            exchange_min_notional_usd: 10.0,
            order_slippage_pct: 0.02,
            failed_order_cooldown_seconds: 300,
            prediction_validation_hours: 4,
            prediction_validation_interval_minutes: 60,
            prediction_high_confidence_threshold: 0.70,
            model_version: "test-v1".to_string(),
            venue_base_url: "https://example.invalid".to_string(),
            venue_api_key: "key".to_string(),
            venue_api_secret: "secret".to_string(),
            store_path: std::path::PathBuf::from(":memory:"),
            health_bind_addr: "127.0.0.1:0".to_string(),
            runtime_state_path: std::path::PathBuf::from("/tmp/runtime_state_test.json"),
        };
        let venue = RestVenueClient::new("https://example.invalid", "key", "secret");
        let store = SqliteStore::open_in_memory().unwrap();
        Engine::new(config, venue, store, None)
    }

    #[test]
    fn single_flight_blocks_concurrent_scans() {
        let engine = test_engine();
        assert!(engine.try_start_scan(chrono::Duration::minutes(4)));
        assert!(!engine.try_start_scan(chrono::Duration::minutes(4)));
        engine.finish_scan();
        assert!(engine.try_start_scan(chrono::Duration::minutes(4)));
    }

    #[test]
    fn hung_scan_is_force_reset() {
        let engine = test_engine();
        assert!(engine.try_start_scan(chrono::Duration::minutes(4)));
        // Simulate a hung scan by using a zero timeout on the next check.
        assert!(engine.try_start_scan(chrono::Duration::seconds(-1)));
    }

    #[test]
    fn cooldown_monotonicity() {
        let engine = test_engine();
        engine.mark_order_failed("BTC");
        assert!(engine.is_cooling_down("BTC", chrono::Duration::minutes(5)));
        engine.clear_cooldown("BTC");
        assert!(!engine.is_cooling_down("BTC", chrono::Duration::minutes(5)));
    }

    #[test]
    fn should_validate_defaults_true_until_marked() {
        let engine = test_engine();
        assert!(engine.should_validate(chrono::Duration::hours(1)));
        engine.mark_validated();
        assert!(!engine.should_validate(chrono::Duration::hours(1)));
    }

    #[test]
    fn error_ring_is_bounded() {
        let engine = test_engine();
        for i in 0..(MAX_ERROR_RECORDS + 10) {
            engine.record_error("test", format!("error {i}"));
        }
        assert_eq!(engine.recent_error_count(), MAX_ERROR_RECORDS);
    }
}
