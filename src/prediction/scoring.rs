// =============================================================================
// Scoring — the pluggable prediction model
// =============================================================================
//
// `MarketState` is the frozen snapshot a scoring model sees; `ScoringModel`
// is the single seam an alternative model plugs into without touching the
// recorder's bookkeeping. `WeightedIndicatorModel` is the bundled default,
// combining RSI mean-reversion, EMA trend alignment, MACD momentum,
// Bollinger-band position, ATR-normalized volatility, funding-rate skew, and
// BTC-relative-strength context into a single 0-100 score the same way the
// original strategy evaluator combined its signal weights.
// =============================================================================

use crate::indicators::{atr, bollinger, ema, macd, roc, rsi};
use crate::types::{Candle, Direction};

/// Everything a scoring model is allowed to look at for one symbol: recent
/// candles, the latest funding rate, and a BTC candle series for relative
/// strength context (empty when the symbol itself is BTC, or when BTC
/// history isn't warm yet).
#[derive(Debug, Clone)]
pub struct MarketState {
    pub symbol: String,
    pub candles: Vec<Candle>,
    pub funding_rate: Option<f64>,
    pub btc_candles: Vec<Candle>,
}

#[derive(Debug, Clone)]
pub struct ScoreOutput {
    pub score: f64,
    pub direction: Direction,
    pub reasons: Vec<String>,
}

/// The scoring plug-point. Any model implementing this trait can be swapped
/// in without touching `PredictionRecorder`.
pub trait ScoringModel: Send + Sync {
    fn score(&self, state: &MarketState) -> Option<ScoreOutput>;
}

/// Default bundled model: a weighted blend of momentum and volatility
/// indicators, mirroring the signal-weighting idiom used elsewhere in this
/// corpus's strategy evaluator.
pub struct WeightedIndicatorModel {
    pub rsi_period: usize,
    pub roc_period: usize,
    pub bollinger_period: usize,
}

impl Default for WeightedIndicatorModel {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            roc_period: 10,
            bollinger_period: 20,
        }
    }
}

impl ScoringModel for WeightedIndicatorModel {
    fn score(&self, state: &MarketState) -> Option<ScoreOutput> {
        let closes: Vec<f64> = state.candles.iter().map(|c| c.close).collect();
        if closes.len() < self.bollinger_period.max(self.rsi_period + 1) {
            return None;
        }

        let mut reasons = Vec::new();
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;

        if let Some(rsi_val) = rsi::calculate_rsi(&closes, self.rsi_period).last().copied() {
            let rsi_signal = if rsi_val < 30.0 {
                reasons.push("rsi_oversold".to_string());
                1.0
            } else if rsi_val > 70.0 {
                reasons.push("rsi_overbought".to_string());
                -1.0
            } else {
                (50.0 - rsi_val) / 50.0
            };
            weighted_sum += rsi_signal * 0.35;
            weight_total += 0.35;
        }

        if let Some(m) = macd::standard_macd(&closes) {
            let macd_signal = if m.histogram > 0.0 {
                reasons.push("macd_bullish_cross".to_string());
                1.0
            } else if m.histogram < 0.0 {
                reasons.push("macd_bearish_cross".to_string());
                -1.0
            } else {
                0.0
            };
            weighted_sum += macd_signal * 0.30;
            weight_total += 0.30;
        }

        if let Some(roc_val) = roc::current_roc(&closes, self.roc_period) {
            let roc_signal = (roc_val / 10.0).clamp(-1.0, 1.0);
            if roc_val.abs() > 3.0 {
                reasons.push("momentum_confirmed".to_string());
            }
            weighted_sum += roc_signal * 0.20;
            weight_total += 0.20;
        }

        if let Some(bb) = bollinger::calculate_bollinger(&closes, self.bollinger_period, 2.0) {
            if bb.width < 2.0 {
                reasons.push("bollinger_squeeze".to_string());
            }
            // Narrow bands contribute no directional signal, only a reason tag.
            weight_total += 0.15;
        }

        // Break-even EMA crossover as a tie-breaker confirmation.
        let ema_fast = ema::calculate_ema(&closes, 9);
        let ema_slow = ema::calculate_ema(&closes, 21);
        if let (Some(f), Some(s)) = (ema_fast.last(), ema_slow.last()) {
            if f > s {
                reasons.push("ema_trend_up".to_string());
            } else if f < s {
                reasons.push("ema_trend_down".to_string());
            }
        }

        // ATR-normalized volatility: high volatility damps confidence in the
        // momentum signals above rather than contributing its own direction.
        if let Some(atr_pct) = atr::calculate_atr_pct(&state.candles, 14) {
            if atr_pct > 8.0 {
                reasons.push("high_volatility".to_string());
                weighted_sum *= 0.7;
            } else if atr_pct < 2.0 {
                reasons.push("low_volatility".to_string());
            }
        }

        // Funding-rate skew: crowded longs (positive funding) fade a long
        // signal, crowded shorts (negative funding) fade a short signal.
        if let Some(funding) = state.funding_rate {
            let funding_signal = (-funding * 5_000.0).clamp(-1.0, 1.0);
            if funding.abs() > 0.0003 {
                reasons.push(if funding > 0.0 { "funding_crowded_long" } else { "funding_crowded_short" }.to_string());
            }
            weighted_sum += funding_signal * 0.10;
            weight_total += 0.10;
        }

        // BTC-relative-strength: an altcoin outpacing BTC on the same
        // look-back window gets a small boost; lagging BTC gets a fade.
        let btc_closes: Vec<f64> = state.btc_candles.iter().map(|c| c.close).collect();
        if let (Some(alt_roc), Some(btc_roc)) = (
            roc::current_roc(&closes, self.roc_period),
            roc::current_roc(&btc_closes, self.roc_period),
        ) {
            let relative = alt_roc - btc_roc;
            if relative.abs() > 1.0 {
                reasons.push(if relative > 0.0 { "outperforming_btc" } else { "underperforming_btc" }.to_string());
            }
            weighted_sum += (relative / 10.0).clamp(-1.0, 1.0) * 0.10;
            weight_total += 0.10;
        }

        if weight_total <= 0.0 {
            return None;
        }

        let normalized = (weighted_sum / weight_total).clamp(-1.0, 1.0);
        let score = ((normalized + 1.0) / 2.0) * 100.0;
        let direction = if normalized > 0.15 {
            Direction::Up
        } else if normalized < -0.15 {
            Direction::Down
        } else {
            Direction::Flat
        };

        Some(ScoreOutput { score, direction, reasons })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn insufficient_history_returns_none() {
        let model = WeightedIndicatorModel::default();
        let state = MarketState {
            symbol: "BTC".to_string(),
            candles: rising_candles(5, 100.0),
            funding_rate: None,
            btc_candles: vec![],
        };
        assert!(model.score(&state).is_none());
    }

    #[test]
    fn strong_uptrend_scores_above_midpoint_with_up_direction() {
        let model = WeightedIndicatorModel::default();
        let state = MarketState {
            symbol: "BTC".to_string(),
            candles: rising_candles(60, 100.0),
            funding_rate: None,
            btc_candles: vec![],
        };
        let out = model.score(&state).expect("enough history");
        assert_eq!(out.direction, Direction::Up);
        assert!(out.score > 50.0);
        assert!(!out.reasons.is_empty());
    }

    #[test]
    fn positive_funding_tags_crowded_long() {
        let model = WeightedIndicatorModel::default();
        let state = MarketState {
            symbol: "BTC".to_string(),
            candles: rising_candles(60, 100.0),
            funding_rate: Some(0.001),
            btc_candles: vec![],
        };
        let out = model.score(&state).expect("enough history");
        assert!(out.reasons.contains(&"funding_crowded_long".to_string()));
    }

    fn rising_candles_step(n: usize, start: f64, step: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = start + i as f64 * step;
                Candle {
                    open_time: i as i64 * 60_000,
                    close_time: i as i64 * 60_000 + 59_999,
                    open: close - 0.1,
                    high: close + 0.1,
                    low: close - 0.2,
                    close,
                    volume: 100.0,
                }
            })
            .collect()
    }

    #[test]
    fn outperforming_btc_is_tagged() {
        let model = WeightedIndicatorModel::default();
        let state = MarketState {
            symbol: "ALT".to_string(),
            candles: rising_candles(60, 100.0),
            funding_rate: None,
            btc_candles: rising_candles_step(60, 100.0, 0.1),
        };
        let out = model.score(&state).expect("enough history");
        assert!(out.reasons.contains(&"outperforming_btc".to_string()));
    }
}
