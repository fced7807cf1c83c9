// =============================================================================
// Prediction Recorder — logs, finalizes, and later validates scored predictions
// =============================================================================
//
// Independent of whether a prediction results in a copy action: every symbol
// scored in a scan gets a row, and every row gets a copy-action update before
// the scan ends, even when that update is "none". This is what keeps the
// predictions table a complete record rather than a sample biased toward
// symbols that happened to trade.
// =============================================================================

pub mod scoring;

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::types::{CopyAction, Direction, ScoredPrediction, Side};
use scoring::{MarketState, ScoringModel};

pub struct PredictionRecorder<'a> {
    engine: &'a Engine,
    model: Box<dyn ScoringModel>,
}

impl<'a> PredictionRecorder<'a> {
    pub fn new(engine: &'a Engine, model: Box<dyn ScoringModel>) -> Self {
        Self { engine, model }
    }

    /// Score every symbol's market state and persist a prediction row for
    /// every symbol in `states`. A symbol the model can't score (too little
    /// history, no usable entry price) still gets a `Flat`/zero-score
    /// placeholder row with an `insufficient_data` reason, so that the
    /// predictions table stays one row per universe symbol per scan rather
    /// than a sample biased toward symbols with enough history (§8 property
    /// 8). Returns the number of predictions recorded.
    pub fn log_predictions(&self, states: &[MarketState]) -> usize {
        let mut count = 0;
        for state in states {
            let scored = self.model.score(state);
            let entry_price = state.candles.last().map(|c| c.close).unwrap_or(0.0);

            let (score, direction, reasons) = match scored {
                Some(output) if entry_price > 0.0 => (output.score, output.direction, output.reasons),
                _ => (0.0, Direction::Flat, vec!["insufficient_data".to_string()]),
            };

            let prediction = ScoredPrediction {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: chrono::Utc::now(),
                symbol: state.symbol.clone(),
                score,
                direction,
                reasons,
                entry_price,
                features: serde_json::json!({ "funding_rate": state.funding_rate }),
                model_version: self.engine.config.model_version.clone(),
                copy_action: None,
                copy_side: None,
                copy_size: None,
                actual_label: None,
                exit_price: None,
                paper_pnl: None,
                paper_pnl_pct: None,
                correct: None,
                validated_at: None,
            };

            if let Err(err) = self.engine.store.insert_prediction(&prediction) {
                warn!(symbol = %state.symbol, error = %err, "failed to persist prediction");
                continue;
            }
            self.engine.record_prediction(prediction);
            count += 1;
        }
        info!(count, "predictions logged for scan");
        count
    }

    /// Stamp the current scan's in-memory prediction for `symbol` with the
    /// copy action that was actually taken.
    pub fn log_copy_action(&self, symbol: &str, action: CopyAction, side: Option<Side>, size: Option<f64>) {
        let Some(prediction) = self.engine.scan_prediction(symbol) else {
            return;
        };
        let actual_label = if action == CopyAction::None { 0 } else { 1 };
        if let Err(err) = self
            .engine
            .store
            .update_prediction_copy_action(&prediction.id, action, side, size, actual_label)
        {
            warn!(symbol, error = %err, "failed to log copy action onto prediction");
        }
    }

    /// Ensure every symbol predicted this scan has a finalized copy-action
    /// record, defaulting untraded symbols to `CopyAction::None` /
    /// `actual_label = 0`. Always call this once at the end of a scan,
    /// regardless of how many symbols actually traded.
    pub fn finalize_scan_predictions(&self, traded_symbols: &HashSet<String>) {
        for symbol in self.engine.scan_prediction_symbols() {
            if traded_symbols.contains(&symbol) {
                continue;
            }
            self.log_copy_action(&symbol, CopyAction::None, None, None);
        }
        self.engine.clear_scan_predictions();
    }

    /// Validate predictions old enough to have a known outcome, using the
    /// latest stored hourly close for each symbol as the exit price (§4.5:
    /// "fetch the latest hourly close for `symbol` as `exitPrice`"). Returns
    /// the number validated.
    pub fn validate_past_predictions(&self, batch_limit: usize) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(self.engine.config.prediction_validation_hours);
        let pending = self.engine.store.predictions_needing_validation(cutoff, batch_limit)?;

        let mut validated = 0;
        for prediction in pending {
            let Some(exit_price) = self
                .engine
                .store
                .latest_candle(&prediction.symbol, "1h")?
                .map(|c| c.close)
            else {
                continue;
            };
            if prediction.entry_price <= 0.0 {
                continue;
            }

            let raw_pct = (exit_price - prediction.entry_price) / prediction.entry_price;
            let paper_pnl_pct = raw_pct * prediction.direction.as_i8() as f64 * 100.0;
            let paper_pnl = paper_pnl_pct / 100.0 * prediction.entry_price;

            let correct = prediction_correct(
                &prediction,
                raw_pct,
                paper_pnl_pct,
                self.engine.config.prediction_high_confidence_threshold,
            );

            self.engine.store.update_prediction_validation(
                &prediction.id,
                exit_price,
                paper_pnl,
                paper_pnl_pct,
                correct,
                chrono::Utc::now(),
            )?;
            validated += 1;
        }

        self.engine.mark_validated();
        info!(validated, "predictions validated");
        Ok(validated)
    }
}

/// A validated prediction is "correct" in either of two ways: a confident
/// call whose direction played out, or a low-confidence call the system
/// declined to act on whose direction would have lost money had it acted.
fn prediction_correct(
    prediction: &ScoredPrediction,
    raw_pct: f64,
    paper_pnl_pct: f64,
    high_confidence_threshold: f64,
) -> bool {
    let direction_correct = match prediction.direction {
        Direction::Flat => raw_pct.abs() < 0.001,
        _ => paper_pnl_pct > 0.0,
    };
    let high_confidence = prediction.confidence() >= high_confidence_threshold;
    let no_action = prediction.actual_label == Some(0);
    let would_have_lost = paper_pnl_pct < 0.0;
    (high_confidence && direction_correct) || (!high_confidence && no_action && would_have_lost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CopyMode, EngineConfig};
    use crate::store::SqliteStore;
    use crate::types::Candle;
    use crate::venue::RestVenueClient;

    fn test_engine() -> Engine {
        let config = EngineConfig {
            enable_copy_trading: true,
            copy_mode: CopyMode::Scaled,
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
            runtime_state_path: std::path::PathBuf::from("/tmp/runtime_state_test_pred.json"),
        };
        let venue = RestVenueClient::new("https://example.invalid", "key", "secret");
        let store = SqliteStore::open_in_memory().unwrap();
        Engine::new(config, venue, store, None)
    }

    fn rising_candles(n: usize, start: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = start + i as f64 * 2.0;
                Candle {
                    open_time: i as i64 * 60_000,
                    close_time: i as i64 * 60_000 + 59_999,
                    open: close - 1.0,
                    high: close + 1.0,
                    low: close - 2.0,
                    close,
                    volume: 100.0,
                }
            })
            .collect()
    }

    #[test]
    fn log_predictions_persists_and_caches() {
        let engine = test_engine();
        let recorder = PredictionRecorder::new(&engine, Box::new(scoring::WeightedIndicatorModel::default()));

        let states = vec![MarketState {
            symbol: "BTC".to_string(),
            candles: rising_candles(60, 100.0),
            funding_rate: None,
            btc_candles: vec![],
        }];
        let count = recorder.log_predictions(&states);
        assert_eq!(count, 1);
        assert!(engine.scan_prediction("BTC").is_some());
    }

    #[test]
    fn log_predictions_records_placeholder_for_symbol_with_no_history() {
        let engine = test_engine();
        let recorder = PredictionRecorder::new(&engine, Box::new(scoring::WeightedIndicatorModel::default()));

        let states = vec![MarketState {
            symbol: "NEWCOIN".to_string(),
            candles: vec![],
            funding_rate: None,
            btc_candles: vec![],
        }];
        let count = recorder.log_predictions(&states);
        assert_eq!(count, 1);

        let prediction = engine.scan_prediction("NEWCOIN").unwrap();
        assert_eq!(prediction.direction, Direction::Flat);
        assert_eq!(prediction.score, 0.0);
        assert_eq!(prediction.reasons, vec!["insufficient_data".to_string()]);
    }

    #[test]
    fn finalize_defaults_untraded_symbols_to_none() {
        let engine = test_engine();
        let recorder = PredictionRecorder::new(&engine, Box::new(scoring::WeightedIndicatorModel::default()));
        let states = vec![MarketState {
            symbol: "ETH".to_string(),
            candles: rising_candles(60, 100.0),
            funding_rate: None,
            btc_candles: vec![],
        }];
        recorder.log_predictions(&states);

        let traded = HashSet::new();
        recorder.finalize_scan_predictions(&traded);
        assert!(engine.scan_prediction_symbols().is_empty());
    }

    #[test]
    fn validate_past_predictions_marks_validated_timestamp() {
        let engine = test_engine();
        let recorder = PredictionRecorder::new(&engine, Box::new(scoring::WeightedIndicatorModel::default()));
        assert!(engine.last_validated_at().is_none());

        recorder.validate_past_predictions(50).unwrap();
        assert!(engine.last_validated_at().is_some());
    }

    #[test]
    fn validate_past_predictions_uses_latest_stored_hourly_close() {
        let engine = test_engine();
        let recorder = PredictionRecorder::new(&engine, Box::new(scoring::WeightedIndicatorModel::default()));

        let old_ts = chrono::Utc::now() - chrono::Duration::hours(5);
        let prediction = ScoredPrediction {
            id: "val1".to_string(),
            timestamp: old_ts,
            symbol: "BTC".to_string(),
            score: 90.0,
            direction: Direction::Up,
            reasons: vec!["rsi_oversold".to_string()],
            entry_price: 100.0,
            features: serde_json::json!({}),
            model_version: "test-v1".to_string(),
            copy_action: Some(CopyAction::Open),
            copy_side: Some(Side::Long),
            copy_size: Some(0.1),
            actual_label: Some(1),
            exit_price: None,
            paper_pnl: None,
            paper_pnl_pct: None,
            correct: None,
            validated_at: None,
        };
        engine.store.insert_prediction(&prediction).unwrap();
        engine
            .store
            .insert_candle(
                "BTC",
                "1h",
                &Candle {
                    open_time: 0,
                    close_time: 3_599_999,
                    open: 99.0,
                    high: 111.0,
                    low: 98.0,
                    close: 110.0,
                    volume: 10.0,
                },
            )
            .unwrap();

        let validated = recorder.validate_past_predictions(50).unwrap();
        assert_eq!(validated, 1);

        let cutoff = chrono::Utc::now() - chrono::Duration::hours(4);
        assert!(engine.store.predictions_needing_validation(cutoff, 50).unwrap().is_empty());
    }

    fn sample_prediction(direction: Direction, actual_label: Option<u8>, score: f64) -> ScoredPrediction {
        ScoredPrediction {
            id: "p".to_string(),
            timestamp: chrono::Utc::now(),
            symbol: "BTC".to_string(),
            score,
            direction,
            reasons: vec![],
            entry_price: 100.0,
            features: serde_json::json!({}),
            model_version: "test".to_string(),
            copy_action: None,
            copy_side: None,
            copy_size: None,
            actual_label,
            exit_price: None,
            paper_pnl: None,
            paper_pnl_pct: None,
            correct: None,
            validated_at: None,
        }
    }

    #[test]
    fn confident_correct_direction_is_correct() {
        let pred = sample_prediction(Direction::Up, Some(1), 95.0);
        assert!(prediction_correct(&pred, 0.05, 5.0, 0.70));
    }

    #[test]
    fn confident_wrong_direction_is_incorrect() {
        let pred = sample_prediction(Direction::Up, Some(1), 95.0);
        assert!(!prediction_correct(&pred, -0.05, -5.0, 0.70));
    }

    #[test]
    fn low_confidence_no_action_would_have_lost_is_correct() {
        let pred = sample_prediction(Direction::Up, Some(0), 40.0);
        assert!(prediction_correct(&pred, -0.03, -3.0, 0.70));
    }

    #[test]
    fn low_confidence_no_action_would_have_won_is_incorrect() {
        let pred = sample_prediction(Direction::Up, Some(0), 40.0);
        assert!(!prediction_correct(&pred, 0.03, 3.0, 0.70));
    }

    #[test]
    fn low_confidence_that_acted_is_incorrect() {
        let pred = sample_prediction(Direction::Up, Some(1), 40.0);
        assert!(!prediction_correct(&pred, -0.03, -3.0, 0.70));
    }
}
