// =============================================================================
// Copy Planner — classifies and dispatches the per-symbol position delta
// =============================================================================

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::executor::Executor;
use crate::independent_trader::has_independent_position;
use crate::prediction::PredictionRecorder;
use crate::types::{CopyAction, Position, Side, TelemetryRecord};
use crate::venue::VenueClient;

/// Inputs to the pure classification step — everything the action is a
/// deterministic function of.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput {
    pub target_side: Option<Side>,
    pub operator_side: Option<Side>,
    pub scaled_target_size: f64,
    pub operator_size: f64,
    pub adjust_threshold: f64,
    pub independent_exists: bool,
    pub independent_confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyOutput {
    pub action: CopyAction,
    pub confirm_independent: bool,
}

/// The action-classification table (§4.2). A pure function of its inputs —
/// same inputs always produce the same output.
pub fn classify_action(input: ClassifyInput) -> ClassifyOutput {
    match (input.target_side, input.operator_side) {
        (None, None) => ClassifyOutput { action: CopyAction::None, confirm_independent: false },

        (None, Some(_)) => {
            if input.independent_exists && !input.independent_confirmed {
                // Independent trader owns the exit; the planner does not close.
                ClassifyOutput { action: CopyAction::None, confirm_independent: false }
            } else {
                ClassifyOutput { action: CopyAction::Close, confirm_independent: false }
            }
        }

        (Some(_), None) => ClassifyOutput { action: CopyAction::Open, confirm_independent: false },

        (Some(t), Some(o)) if t != o => {
            ClassifyOutput { action: CopyAction::Flip, confirm_independent: false }
        }

        (Some(_), Some(_)) => {
            let confirm = input.independent_exists && !input.independent_confirmed;
            let action = if input.scaled_target_size > 0.0
                && (input.operator_size - input.scaled_target_size).abs()
                    > input.scaled_target_size * input.adjust_threshold
            {
                CopyAction::Adjust
            } else {
                CopyAction::None
            };
            ClassifyOutput { action, confirm_independent: confirm }
        }
    }
}

/// Everything `sync_position` needs for one symbol in one scan.
pub struct SyncContext<'a> {
    pub symbol: &'a str,
    pub scale_factor: f64,
    pub target_positions: &'a HashMap<String, Position>,
    pub operator_positions: &'a HashMap<String, Position>,
    pub mids: &'a HashMap<String, f64>,
}

/// Run the full gated classify-and-dispatch pipeline for one symbol. On
/// success, inserts the symbol into `traded_symbols` and logs the copy
/// action through the prediction recorder. Returns the action taken (or
/// `None` on any gate failure / skip), never propagating a per-symbol error
/// past the caller's batch boundary — callers downgrade `Err` to a warning.
pub async fn sync_position<V: VenueClient>(
    engine: &Engine,
    executor: &Executor<'_, V>,
    recorder: &PredictionRecorder,
    ctx: SyncContext<'_>,
    traded_symbols: &mut std::collections::HashSet<String>,
) -> Result<CopyAction> {
    let symbol = ctx.symbol;

    let meta = match engine.metadata.get(symbol) {
        Some(m) => m,
        None => {
            warn!(symbol, "missing instrument metadata, skipping");
            return Ok(CopyAction::None);
        }
    };

    let mid = match ctx.mids.get(symbol).copied() {
        Some(m) if m.is_finite() && m > 0.0 => m,
        _ => {
            warn!(symbol, "missing or invalid mid price, skipping");
            return Ok(CopyAction::None);
        }
    };

    let target = ctx.target_positions.get(symbol);
    let operator = ctx.operator_positions.get(symbol);

    let target_side = target.and_then(|p| p.side());
    let operator_side = operator.and_then(|p| p.side());
    let target_size = target.map(|p| p.abs_size()).unwrap_or(0.0);
    let operator_size = operator.map(|p| p.abs_size()).unwrap_or(0.0);
    let target_leverage = target.map(|p| p.leverage).filter(|l| *l > 0.0).unwrap_or(1.0);
    let scaled_target_size = target_size * ctx.scale_factor;

    let independent_positions = engine.store.active_independent_positions().unwrap_or_default();
    let independent_status = has_independent_position(&independent_positions, symbol);
    let independent = independent_positions.iter().find(|p| p.symbol == symbol && p.is_active());

    let classified = classify_action(ClassifyInput {
        target_side,
        operator_side,
        scaled_target_size,
        operator_size,
        adjust_threshold: engine.config.position_adjust_threshold,
        independent_exists: independent_status.exists,
        independent_confirmed: independent_status.confirmed,
    });

    if classified.confirm_independent {
        if let Some(pos) = independent {
            let mut confirmed = pos.clone();
            confirmed.status = crate::types::IndependentStatus::Confirmed;
            confirmed.confirmed_by_target = true;
            if let Err(err) = engine.store.update_independent_position(&confirmed) {
                warn!(symbol, error = %err, "failed to mark independent position confirmed");
            }
        }
    }

    if classified.action == CopyAction::None {
        return Ok(CopyAction::None);
    }

    let actual_leverage = (target_leverage as u32).min(meta.max_leverage).max(1);
    let notional = scaled_target_size * mid;
    let margin = notional / actual_leverage as f64;

    if classified.action != CopyAction::Close {
        if margin < engine.config.min_position_size_usd {
            warn!(symbol, margin, "margin below floor, skipping");
            return Ok(CopyAction::None);
        }
        if notional < engine.config.exchange_min_notional_usd {
            warn!(symbol, notional, "notional below floor, skipping");
            return Ok(CopyAction::None);
        }
    }

    let cooldown = chrono::Duration::seconds(engine.config.failed_order_cooldown_seconds as i64);
    if matches!(classified.action, CopyAction::Open | CopyAction::Flip) && engine.is_cooling_down(symbol, cooldown) {
        warn!(symbol, "order cool-down active, skipping open/flip");
        return Ok(CopyAction::None);
    }

    let result = dispatch(engine, executor, &ctx, symbol, classified.action, operator, mid, actual_leverage, scaled_target_size).await;

    match result {
        Ok(()) => {
            traded_symbols.insert(symbol.to_string());
            engine.clear_cooldown(symbol);
            let _ = engine.store.insert_telemetry(&TelemetryRecord {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: chrono::Utc::now(),
                symbol: symbol.to_string(),
                action: classified.action,
                side: target_side,
                size: scaled_target_size,
                notional_usd: notional,
            });
            recorder.log_copy_action(symbol, classified.action, target_side, Some(scaled_target_size));
            info!(symbol, action = %classified.action, "copy action executed");
            Ok(classified.action)
        }
        Err(err) => {
            if matches!(classified.action, CopyAction::Open | CopyAction::Flip) {
                engine.mark_order_failed(symbol);
            }
            engine.record_error(symbol, err.to_string());
            warn!(symbol, action = %classified.action, error = %err, "copy action failed");
            Ok(CopyAction::None)
        }
    }
}

async fn dispatch<V: VenueClient>(
    engine: &Engine,
    executor: &Executor<'_, V>,
    ctx: &SyncContext<'_>,
    symbol: &str,
    action: CopyAction,
    operator: Option<&Position>,
    mid: f64,
    actual_leverage: u32,
    scaled_target_size: f64,
) -> Result<()> {
    let meta = engine.metadata.get(symbol).expect("checked by caller");

    match action {
        CopyAction::Close => {
            let signed_size = operator.map(|p| p.signed_size).unwrap_or(0.0);
            executor.close(&meta, signed_size, mid, 1.0).await?;
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        CopyAction::Open => {
            let withdrawable = positions_withdrawable(engine).await?;
            require_affordable(withdrawable, scaled_target_size * mid, actual_leverage)?;

            let target_side = ctx
                .target_positions
                .get(symbol)
                .and_then(|p| p.side())
                .unwrap_or(Side::Long);

            executor.ensure_leverage(&meta, None, actual_leverage).await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            executor.open(&meta, target_side, scaled_target_size, mid, withdrawable, actual_leverage).await?;
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        CopyAction::Flip => {
            let signed_size = operator.map(|p| p.signed_size).unwrap_or(0.0);
            executor.close(&meta, signed_size, mid, 1.0).await?;
            tokio::time::sleep(Duration::from_secs(2)).await;

            let withdrawable = positions_withdrawable(engine).await?;
            require_affordable(withdrawable, scaled_target_size * mid, actual_leverage)?;

            let target_side = ctx
                .target_positions
                .get(symbol)
                .and_then(|p| p.side())
                .unwrap_or(Side::Long);

            executor.ensure_leverage(&meta, None, actual_leverage).await?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            executor.open(&meta, target_side, scaled_target_size, mid, withdrawable, actual_leverage).await?;
            tokio::time::sleep(Duration::from_secs(3)).await;
        }

        CopyAction::Adjust => {
            let operator_size = operator.map(|p| p.abs_size()).unwrap_or(0.0);
            let signed_size = operator.map(|p| p.signed_size).unwrap_or(0.0);
            let size_delta = scaled_target_size - operator_size;

            if (size_delta.abs() * mid) < engine.config.exchange_min_notional_usd {
                return Ok(());
            }

            if size_delta > 0.0 {
                let side = if signed_size >= 0.0 { Side::Long } else { Side::Short };
                executor.open(&meta, side, size_delta, mid, positions_withdrawable(engine).await?, actual_leverage).await?;
            } else {
                let fraction = (-size_delta) / operator_size.max(f64::EPSILON);
                executor.close(&meta, signed_size, mid, fraction.min(1.0)).await?;
            }
        }

        CopyAction::None => {}
    }

    Ok(())
}

async fn positions_withdrawable(engine: &Engine) -> Result<f64> {
    let (snapshot, _) = engine.venue.clearinghouse_state(&engine.config.operator_account).await?;
    Ok(snapshot.withdrawable)
}

fn require_affordable(withdrawable: f64, notional: f64, leverage: u32) -> Result<()> {
    let margin = notional / leverage.max(1) as f64;
    if margin * 1.2 > withdrawable {
        anyhow::bail!("insufficient withdrawable margin: need {}, have {}", margin * 1.2, withdrawable);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(target: Option<Side>, operator: Option<Side>, scaled: f64, ours: f64, thresh: f64) -> ClassifyInput {
        ClassifyInput {
            target_side: target,
            operator_side: operator,
            scaled_target_size: scaled,
            operator_size: ours,
            adjust_threshold: thresh,
            independent_exists: false,
            independent_confirmed: false,
        }
    }

    #[test]
    fn zero_target_zero_operator_is_none() {
        let out = classify_action(input(None, None, 0.0, 0.0, 0.10));
        assert_eq!(out.action, CopyAction::None);
    }

    #[test]
    fn target_none_operator_holds_closes() {
        let out = classify_action(input(None, Some(Side::Long), 0.0, 1.0, 0.10));
        assert_eq!(out.action, CopyAction::Close);
    }

    #[test]
    fn target_none_operator_holds_unconfirmed_independent_skips() {
        let mut inp = input(None, Some(Side::Long), 0.0, 1.0, 0.10);
        inp.independent_exists = true;
        inp.independent_confirmed = false;
        let out = classify_action(inp);
        assert_eq!(out.action, CopyAction::None);
    }

    #[test]
    fn target_holds_operator_none_opens() {
        let out = classify_action(input(Some(Side::Long), None, 1.0, 0.0, 0.10));
        assert_eq!(out.action, CopyAction::Open);
    }

    #[test]
    fn opposite_sides_flip() {
        let out = classify_action(input(Some(Side::Short), Some(Side::Long), 4.0 * 0.125, 0.625, 0.10));
        assert_eq!(out.action, CopyAction::Flip);
    }

    #[test]
    fn same_side_over_threshold_adjusts() {
        // scaled=0.12, ours=0.10: delta 0.02 / 0.10 = 20% > 10%.
        let out = classify_action(input(Some(Side::Long), Some(Side::Long), 0.12, 0.10, 0.10));
        assert_eq!(out.action, CopyAction::Adjust);
    }

    #[test]
    fn threshold_exact_boundary_is_none() {
        // scaled=0.11, ours=0.10: delta exactly 10% of scaled.
        let out = classify_action(input(Some(Side::Long), Some(Side::Long), 0.11, 0.10, 0.10 / 1.1 * 1.0));
        // Construct an exact-boundary case directly instead of via rounding.
        let scaled = 1.0;
        let ours = 0.9;
        let threshold = 0.10; // |1.0 - 0.9| = 0.1 == 1.0 * 0.10
        let out2 = classify_action(input(Some(Side::Long), Some(Side::Long), scaled, ours, threshold));
        assert_eq!(out2.action, CopyAction::None);
        let _ = out; // silence unused in the loose first construction
    }

    #[test]
    fn unconfirmed_independent_gets_confirmed_on_same_side_collision() {
        let mut inp = input(Some(Side::Long), Some(Side::Long), 1.0, 1.0, 0.10);
        inp.independent_exists = true;
        inp.independent_confirmed = false;
        let out = classify_action(inp);
        assert!(out.confirm_independent);
    }

    #[test]
    fn affordability_gate_rejects_when_margin_too_high() {
        assert!(require_affordable(100.0, 10_000.0, 10).is_err());
    }

    #[test]
    fn affordability_gate_allows_within_bounds() {
        assert!(require_affordable(1000.0, 5000.0, 10).is_ok());
    }
}
