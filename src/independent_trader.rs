// =============================================================================
// Independent Trader — shadow-mode entries on high-confidence predictions
// =============================================================================
//
// Shares the operator's book with the copy planner but owns its own entry and
// exit decisions. A position starts `Open`; once the target takes the same
// side in the same symbol, the planner's classification step flips it to
// `Confirmed` and sizing ownership passes to the copy planner. Until then this
// module is the only thing that can close it.
// =============================================================================

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::types::{Direction, ExitReason, IndependentPosition, IndependentStatus, Position, ScoredPrediction, Side};
use crate::venue::VenueClient;

/// Result of consulting the independent book for one symbol — the seam the
/// copy planner consults before deciding whether it owns a close/adjust.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndependentStatusQuery {
    pub exists: bool,
    pub confirmed: bool,
}

/// Whether `symbol` has an active (`open`/`confirmed`) independent position,
/// and if so whether the target has already confirmed it. A pure lookup over
/// an already-fetched position list, so the planner and the trader agree on
/// the same snapshot within a scan.
pub fn has_independent_position(positions: &[IndependentPosition], symbol: &str) -> IndependentStatusQuery {
    match positions.iter().find(|p| p.symbol == symbol && p.is_active()) {
        None => IndependentStatusQuery::default(),
        Some(p) => IndependentStatusQuery {
            exists: true,
            confirmed: matches!(p.status, IndependentStatus::Confirmed),
        },
    }
}

pub struct IndependentTrader;

impl IndependentTrader {
    /// §4.4.1 — open new positions from this scan's predictions. Invoked once
    /// per scan, after the recorder and before the copy planner's per-symbol
    /// pass.
    pub async fn process_signals<V: VenueClient>(
        engine: &Engine,
        venue: &V,
        operator_positions: &HashMap<String, Position>,
        target_positions: &HashMap<String, Position>,
        mids: &HashMap<String, f64>,
    ) -> Result<usize> {
        if !engine.config.enable_independent_trading {
            return Ok(0);
        }

        let active = engine.store.active_independent_positions()?;
        if active.len() as u32 >= engine.config.independent_max_positions {
            return Ok(0);
        }

        let (operator_snapshot, _) = venue.clearinghouse_state(&engine.config.operator_account).await?;
        let equity = operator_snapshot.equity;
        let withdrawable = operator_snapshot.withdrawable;

        let allocation_cap = engine.config.independent_max_allocation_pct * equity;
        let used_margin: f64 = active.iter().map(|p| p.margin_usd()).sum();
        let mut remaining_allocation = (allocation_cap - used_margin).max(0.0);

        let whitelist: HashSet<&str> = engine.config.independent_whitelist.iter().map(String::as_str).collect();

        let mut candidates: Vec<ScoredPrediction> = engine
            .scan_prediction_symbols()
            .into_iter()
            .filter_map(|symbol| engine.scan_prediction(&symbol))
            .filter(|p| p.score >= engine.config.independent_min_score)
            .filter(|p| p.direction == Direction::Up)
            .filter(|p| whitelist.contains(p.symbol.as_str()))
            .filter(|p| !operator_positions.contains_key(&p.symbol))
            .filter(|p| !active.iter().any(|ip| ip.symbol == p.symbol))
            .filter(|p| !target_positions.contains_key(&p.symbol))
            .collect();

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let mut opened = 0;
        let mut slots_remaining = engine.config.independent_max_positions - active.len() as u32;
        let max_allocation_cap = engine.config.independent_max_allocation_pct * equity;

        for prediction in candidates {
            if slots_remaining == 0 || remaining_allocation < 10.0 {
                break;
            }

            let Some(&mid) = mids.get(&prediction.symbol) else {
                continue;
            };
            if !(mid.is_finite() && mid > 0.0) {
                continue;
            }

            let margin_budget = (remaining_allocation / slots_remaining as f64)
                .min(max_allocation_cap / engine.config.independent_max_positions as f64);
            if margin_budget < 10.0 {
                continue;
            }
            if margin_budget > withdrawable * 0.95 {
                warn!(symbol = %prediction.symbol, margin_budget, withdrawable, "independent entry skipped, insufficient withdrawable margin");
                continue;
            }

            let leverage = match engine.metadata.get(&prediction.symbol) {
                Some(meta) => (engine.config.independent_leverage as u32).min(meta.max_leverage).max(1) as f64,
                None => {
                    warn!(symbol = %prediction.symbol, "missing instrument metadata, skipping independent entry");
                    continue;
                }
            };

            let notional = margin_budget * leverage;
            let size = notional / mid;

            let (tp_price, sl_price) = if engine.config.independent_use_time_exit {
                (0.0, 0.0)
            } else {
                (
                    prediction.entry_price * (1.0 + engine.config.independent_tp_pct),
                    prediction.entry_price * (1.0 - engine.config.independent_sl_pct),
                )
            };
            let timeout_at = chrono::Utc::now() + chrono::Duration::milliseconds(
                (engine.config.independent_hold_hours * 3_600_000.0) as i64,
            );

            let meta = engine.metadata.get(&prediction.symbol).expect("checked above");
            let limit_price = crate::executor::round_price(
                crate::executor::slippage_price(mid, true, engine.config.order_slippage_pct),
                mid,
            );
            let rounded_size = crate::executor::round_size(size, meta.size_decimals);

            if let Err(err) = venue
                .submit_market_order(meta.asset_index, true, limit_price, rounded_size, false)
                .await
            {
                warn!(symbol = %prediction.symbol, error = %err, "independent entry order failed");
                continue;
            }

            let position = IndependentPosition {
                id: uuid::Uuid::new_v4().to_string(),
                symbol: prediction.symbol.clone(),
                entry_price: prediction.entry_price,
                size: rounded_size,
                notional_usd: rounded_size * mid,
                leverage,
                tp_price,
                sl_price,
                timeout_at,
                status: IndependentStatus::Open,
                confirmed_by_target: false,
                prediction_score: prediction.score,
                prediction_reasons: prediction.reasons.clone(),
                exit_price: None,
                exit_reason: None,
                realized_pnl: None,
                realized_pnl_pct: None,
                created_at: chrono::Utc::now(),
                closed_at: None,
            };

            engine.store.insert_independent_position(&position)?;
            info!(symbol = %prediction.symbol, score = prediction.score, size = rounded_size, margin_budget, "independent position opened");

            remaining_allocation -= margin_budget;
            slots_remaining -= 1;
            opened += 1;
        }

        Ok(opened)
    }

    /// §4.4.2 — manage every `{open, confirmed}` independent position: target
    /// confirmation/conflict, TP/SL (when not time-based), and timeout.
    pub async fn manage_positions<V: VenueClient>(
        engine: &Engine,
        venue: &V,
        target_positions: &HashMap<String, Position>,
        mids: &HashMap<String, f64>,
    ) -> Result<usize> {
        if !engine.config.enable_independent_trading {
            return Ok(0);
        }

        let active = engine.store.active_independent_positions()?;
        let mut managed = 0;

        for position in active {
            let Some(&mid) = mids.get(&position.symbol) else {
                continue;
            };

            let target = target_positions.get(&position.symbol);
            let target_side = target.and_then(|p| p.side());

            if let Some(side) = target_side {
                if side == Side::Long {
                    if !matches!(position.status, IndependentStatus::Confirmed) {
                        let mut confirmed = position.clone();
                        confirmed.status = IndependentStatus::Confirmed;
                        confirmed.confirmed_by_target = true;
                        engine.store.update_independent_position(&confirmed)?;
                        info!(symbol = %position.symbol, "independent position confirmed by target");
                        managed += 1;
                    }
                    continue;
                } else {
                    Self::close(engine, venue, &position, mid, ExitReason::TargetOpposite).await?;
                    managed += 1;
                    continue;
                }
            }

            if !engine.config.independent_use_time_exit {
                if mid >= position.tp_price && position.tp_price > 0.0 {
                    Self::close(engine, venue, &position, mid, ExitReason::TakeProfit).await?;
                    managed += 1;
                    continue;
                }
                if mid <= position.sl_price && position.sl_price > 0.0 {
                    Self::close(engine, venue, &position, mid, ExitReason::StopLoss).await?;
                    managed += 1;
                    continue;
                }
            }

            if chrono::Utc::now() >= position.timeout_at {
                Self::close(engine, venue, &position, mid, ExitReason::Timeout).await?;
                managed += 1;
            }
        }

        Ok(managed)
    }

    async fn close<V: VenueClient>(
        engine: &Engine,
        venue: &V,
        position: &IndependentPosition,
        exit_price: f64,
        reason: ExitReason,
    ) -> Result<()> {
        let meta = match engine.metadata.get(&position.symbol) {
            Some(m) => m,
            None => {
                warn!(symbol = %position.symbol, "missing instrument metadata, cannot close independent position");
                return Ok(());
            }
        };

        let limit_price = crate::executor::round_price(
            crate::executor::slippage_price(exit_price, false, engine.config.order_slippage_pct),
            exit_price,
        );

        if let Err(err) = venue
            .submit_market_order(meta.asset_index, false, limit_price, position.size, true)
            .await
        {
            engine.record_error(&position.symbol, err.to_string());
            warn!(symbol = %position.symbol, error = %err, "independent close order failed");
            return Ok(());
        }

        let realized_pnl = (exit_price - position.entry_price) * position.size;
        let realized_pnl_pct = if position.entry_price > 0.0 {
            realized_pnl / (position.entry_price * position.size) * 100.0
        } else {
            0.0
        };

        let mut closed = position.clone();
        closed.status = IndependentStatus::Closed;
        closed.exit_price = Some(exit_price);
        closed.exit_reason = Some(reason);
        closed.realized_pnl = Some(realized_pnl);
        closed.realized_pnl_pct = Some(realized_pnl_pct);
        closed.closed_at = Some(chrono::Utc::now());
        engine.store.update_independent_position(&closed)?;

        info!(symbol = %position.symbol, reason = %reason, realized_pnl, "independent position closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(symbol: &str, status: IndependentStatus) -> IndependentPosition {
        IndependentPosition {
            id: "ip1".to_string(),
            symbol: symbol.to_string(),
            entry_price: 100.0,
            size: 1.0,
            notional_usd: 500.0,
            leverage: 5.0,
            tp_price: 120.0,
            sl_price: 88.0,
            timeout_at: chrono::Utc::now() + chrono::Duration::hours(4),
            status,
            confirmed_by_target: false,
            prediction_score: 92.0,
            prediction_reasons: vec!["ema_trend_up".to_string()],
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            realized_pnl_pct: None,
            created_at: chrono::Utc::now(),
            closed_at: None,
        }
    }

    #[test]
    fn no_position_reports_absent() {
        let positions = vec![];
        let q = has_independent_position(&positions, "BTC");
        assert!(!q.exists);
        assert!(!q.confirmed);
    }

    #[test]
    fn open_position_is_unconfirmed() {
        let positions = vec![sample_position("BTC", IndependentStatus::Open)];
        let q = has_independent_position(&positions, "BTC");
        assert!(q.exists);
        assert!(!q.confirmed);
    }

    #[test]
    fn confirmed_position_reports_confirmed() {
        let positions = vec![sample_position("BTC", IndependentStatus::Confirmed)];
        let q = has_independent_position(&positions, "BTC");
        assert!(q.exists);
        assert!(q.confirmed);
    }

    #[test]
    fn closed_position_is_inactive() {
        let positions = vec![sample_position("BTC", IndependentStatus::Closed)];
        let q = has_independent_position(&positions, "BTC");
        assert!(!q.exists);
    }

    #[test]
    fn different_symbol_is_absent() {
        let positions = vec![sample_position("BTC", IndependentStatus::Open)];
        let q = has_independent_position(&positions, "ETH");
        assert!(!q.exists);
    }
}
