// =============================================================================
// Executor — translates planner intents into venue calls
// =============================================================================
//
// Idempotent per-intent relative to observed state, slippage-protected
// market-order pricing, an affordability cap that silently shrinks rather
// than fails, and leverage changes issued only when needed. Generalizes the
// demo/live execution split this codebase has always used into a single
// path since there is no separate paper-trading venue here — `AccountMode`
// governs which venue credentials are loaded, not a code fork.
// =============================================================================

use anyhow::Result;
use tracing::{info, warn};

use crate::types::{InstrumentMeta, Side};
use crate::venue::VenueClient;

/// Price quoted with slippage protection: buy at `mid * (1 + slippage)`,
/// sell at `mid * (1 - slippage)`.
pub fn slippage_price(mid: f64, buy: bool, slippage_pct: f64) -> f64 {
    if buy {
        mid * (1.0 + slippage_pct)
    } else {
        mid * (1.0 - slippage_pct)
    }
}

/// Fewer decimals for higher-priced instruments — a coarse precision rule
/// derived from the numeric magnitude of the mid.
pub fn price_precision_decimals(mid: f64) -> u32 {
    if mid >= 10_000.0 {
        0
    } else if mid >= 1_000.0 {
        1
    } else if mid >= 100.0 {
        2
    } else if mid >= 10.0 {
        3
    } else if mid >= 1.0 {
        4
    } else {
        5
    }
}

pub fn round_price(price: f64, mid: f64) -> f64 {
    let decimals = price_precision_decimals(mid);
    let factor = 10f64.powi(decimals as i32);
    (price * factor).round() / factor
}

pub fn round_size(size: f64, size_decimals: u32) -> f64 {
    let factor = 10f64.powi(size_decimals as i32);
    (size * factor).round() / factor
}

/// `withdrawable * leverage * 0.95` — never fail the scan for affordability,
/// shrink the order instead.
pub fn affordability_cap(withdrawable: f64, leverage: f64) -> f64 {
    withdrawable * leverage * 0.95
}

/// Shrink `requested_notional` to the affordability cap if it exceeds it,
/// returning the (possibly reduced) notional and whether a shrink occurred.
pub fn apply_affordability_cap(requested_notional: f64, withdrawable: f64, leverage: f64) -> (f64, bool) {
    let cap = affordability_cap(withdrawable, leverage);
    if requested_notional > cap {
        (cap, true)
    } else {
        (requested_notional, false)
    }
}

pub struct Executor<'a, V: VenueClient> {
    venue: &'a V,
    slippage_pct: f64,
}

impl<'a, V: VenueClient> Executor<'a, V> {
    pub fn new(venue: &'a V, slippage_pct: f64) -> Self {
        Self { venue, slippage_pct }
    }

    /// Leverage is only changed on open or when the observed leverage
    /// differs from the target; always cross-margin.
    pub async fn ensure_leverage(
        &self,
        meta: &InstrumentMeta,
        observed_leverage: Option<f64>,
        target_leverage: u32,
    ) -> Result<()> {
        if let Some(observed) = observed_leverage {
            if (observed - target_leverage as f64).abs() < f64::EPSILON {
                return Ok(());
            }
        }
        self.venue
            .update_leverage(meta.asset_index, true, target_leverage)
            .await?;
        info!(symbol = %meta.symbol, leverage = target_leverage, "leverage updated");
        Ok(())
    }

    /// Open a new position (or add to an existing one when `reduce_only`
    /// is false), after applying the affordability cap.
    pub async fn open(
        &self,
        meta: &InstrumentMeta,
        side: Side,
        requested_size: f64,
        mid: f64,
        withdrawable: f64,
        actual_leverage: u32,
    ) -> Result<f64> {
        let requested_notional = requested_size * mid;
        let (capped_notional, shrunk) =
            apply_affordability_cap(requested_notional, withdrawable, actual_leverage as f64);

        let final_size = if shrunk {
            warn!(
                symbol = %meta.symbol,
                requested_notional,
                capped_notional,
                "order notional exceeds affordability cap, shrinking"
            );
            capped_notional / mid
        } else {
            requested_size
        };

        let size = round_size(final_size, meta.size_decimals);
        let buy = matches!(side, Side::Long);
        let limit_price = round_price(slippage_price(mid, buy, self.slippage_pct), mid);

        self.venue
            .submit_market_order(meta.asset_index, buy, limit_price, size, false)
            .await?;

        info!(symbol = %meta.symbol, side = %side, size, limit_price, "position opened");
        Ok(size)
    }

    /// Close `fraction` (0.0..=1.0) of the current position. `signed_size`
    /// is the operator's current signed size (positive = long).
    pub async fn close(&self, meta: &InstrumentMeta, signed_size: f64, mid: f64, fraction: f64) -> Result<f64> {
        let close_size = round_size(signed_size.abs() * fraction, meta.size_decimals);
        if close_size <= 0.0 {
            return Ok(0.0);
        }
        // Closing a long is a sell; closing a short is a buy.
        let buy = signed_size < 0.0;
        let limit_price = round_price(slippage_price(mid, buy, self.slippage_pct), mid);

        self.venue
            .submit_market_order(meta.asset_index, buy, limit_price, close_size, true)
            .await?;

        info!(symbol = %meta.symbol, close_size, fraction, "position closed");
        Ok(close_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slippage_buy_is_above_mid() {
        assert!((slippage_price(100.0, true, 0.02) - 102.0).abs() < 1e-9);
    }

    #[test]
    fn slippage_sell_is_below_mid() {
        assert!((slippage_price(100.0, false, 0.02) - 98.0).abs() < 1e-9);
    }

    #[test]
    fn precision_decreases_with_price() {
        assert_eq!(price_precision_decimals(60_000.0), 0);
        assert_eq!(price_precision_decimals(3_000.0), 1);
        assert_eq!(price_precision_decimals(150.0), 2);
        assert_eq!(price_precision_decimals(15.0), 3);
        assert_eq!(price_precision_decimals(1.5), 4);
        assert_eq!(price_precision_decimals(0.05), 5);
    }

    #[test]
    fn affordability_cap_formula() {
        assert!((affordability_cap(1000.0, 10.0) - 9500.0).abs() < 1e-9);
    }

    #[test]
    fn affordability_shrinks_when_over_cap() {
        let (notional, shrunk) = apply_affordability_cap(20_000.0, 1000.0, 10.0);
        assert!(shrunk);
        assert!((notional - 9500.0).abs() < 1e-9);
    }

    #[test]
    fn affordability_unchanged_when_under_cap() {
        let (notional, shrunk) = apply_affordability_cap(500.0, 1000.0, 10.0);
        assert!(!shrunk);
        assert!((notional - 500.0).abs() < 1e-9);
    }

    #[test]
    fn round_size_respects_decimals() {
        assert!((round_size(0.016254, 3) - 0.016).abs() < 1e-9);
        assert!((round_size(0.016254, 5) - 0.01625).abs() < 1e-9);
    }
}
