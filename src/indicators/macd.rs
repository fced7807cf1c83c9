// =============================================================================
// Moving Average Convergence/Divergence (MACD)
// =============================================================================
//
// MACD line = EMA(fast) - EMA(slow); signal line = EMA(MACD line, signal
// period); histogram = MACD line - signal line. Built from the existing
// EMA primitive rather than a separate recursive implementation.
// =============================================================================

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdResult {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD(fast, slow, signal) values from `closes`.
///
/// Returns `None` when there isn't enough history for the slow EMA plus the
/// signal smoothing window.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdResult> {
    if fast == 0 || slow == 0 || signal == 0 || slow <= fast {
        return None;
    }
    if closes.len() < slow + signal {
        return None;
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    if ema_fast.is_empty() || ema_slow.is_empty() {
        return None;
    }

    // ema_fast is longer than ema_slow by (slow - fast) leading elements;
    // align both series to the same trailing window before subtracting.
    let offset = ema_fast.len() - ema_slow.len();
    let macd_line: Vec<f64> = ema_fast[offset..]
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    if macd_line.len() < signal {
        return None;
    }

    let signal_line = calculate_ema(&macd_line, signal);
    let macd = *macd_line.last()?;
    let sig = *signal_line.last()?;
    if !macd.is_finite() || !sig.is_finite() {
        return None;
    }

    Some(MacdResult {
        macd,
        signal: sig,
        histogram: macd - sig,
    })
}

/// Standard 12/26/9 MACD, as used by the default scoring model.
pub fn standard_macd(closes: &[f64]) -> Option<MacdResult> {
    calculate_macd(closes, 12, 26, 9)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        assert!(standard_macd(&closes).is_none());
    }

    #[test]
    fn steadily_rising_series_has_positive_macd() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let result = standard_macd(&closes).expect("should compute");
        assert!(result.macd > 0.0);
        assert!(result.macd.is_finite());
        assert!(result.signal.is_finite());
    }

    #[test]
    fn flat_series_has_zero_macd() {
        let closes = vec![50.0; 100];
        let result = standard_macd(&closes).expect("should compute");
        assert!(result.macd.abs() < 1e-9);
        assert!(result.histogram.abs() < 1e-9);
    }

    #[test]
    fn invalid_periods_return_none() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
    }
}
