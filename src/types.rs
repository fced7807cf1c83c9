// =============================================================================
// Shared types for the copy-trading reconciliation engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are pointed at a paper or real venue account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Which side a position is on. Always derived from `entry_price` vs
/// `liquidation_price` — never stored independently of that derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

/// Immutable per-symbol instrument facts, populated once by the metadata cache.
/// A symbol missing here is a hard skip for that scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub symbol: String,
    pub asset_index: u32,
    pub size_decimals: u32,
    pub max_leverage: u32,
    #[serde(default)]
    pub only_isolated: bool,
}

/// Per-account snapshot fetched fresh every scan; never cached across scans.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub equity: f64,
    pub withdrawable: f64,
}

/// An open position on the venue. `signed_size` positive => long, negative =>
/// short, zero => no position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub signed_size: f64,
    pub leverage: f64,
    pub entry_price: f64,
    pub liquidation_price: f64,
}

impl Position {
    /// `None` when `signed_size == 0.0` — "no position" in the data model.
    pub fn side(&self) -> Option<Side> {
        if self.signed_size == 0.0 {
            return None;
        }
        if self.entry_price > self.liquidation_price {
            Some(Side::Long)
        } else {
            Some(Side::Short)
        }
    }

    pub fn abs_size(&self) -> f64 {
        self.signed_size.abs()
    }
}

/// The planner-internal delta between a target account's position and the
/// operator's scaled equivalent for the same symbol.
#[derive(Debug, Clone)]
pub struct PositionDelta {
    pub symbol: String,
    pub target_side: Option<Side>,
    pub target_size: f64,
    pub operator_side: Option<Side>,
    pub operator_size: f64,
    pub scaled_target_size: f64,
}

/// Planner action classification for a single symbol in a single scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyAction {
    Open,
    Close,
    Flip,
    Adjust,
    None,
}

impl std::fmt::Display for CopyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Flip => "flip",
            Self::Adjust => "adjust",
            Self::None => "none",
        };
        write!(f, "{s}")
    }
}

/// Direction carried by a scored prediction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Up,
    Down,
    Flat,
}

impl Direction {
    pub fn as_i8(self) -> i8 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
            Self::Flat => 0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "+1"),
            Self::Down => write!(f, "-1"),
            Self::Flat => write!(f, "0"),
        }
    }
}

/// Status of an independent-trader position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndependentStatus {
    Open,
    Confirmed,
    Closed,
}

impl std::fmt::Display for IndependentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Why an independent position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Timeout,
    TargetConfirmed,
    TargetOpposite,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TakeProfit => "tp",
            Self::StopLoss => "sl",
            Self::Timeout => "timeout",
            Self::TargetConfirmed => "target_confirmed",
            Self::TargetOpposite => "target_opposite",
        };
        write!(f, "{s}")
    }
}

/// A position opened and managed by the independent trader, sharing the
/// operator's book with the copy planner. At most one per symbol may be in
/// {Open, Confirmed} at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndependentPosition {
    pub id: String,
    pub symbol: String,
    pub entry_price: f64,
    pub size: f64,
    pub notional_usd: f64,
    pub leverage: f64,
    pub tp_price: f64,
    pub sl_price: f64,
    pub timeout_at: chrono::DateTime<chrono::Utc>,
    pub status: IndependentStatus,
    pub confirmed_by_target: bool,
    pub prediction_score: f64,
    pub prediction_reasons: Vec<String>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    #[serde(default)]
    pub realized_pnl_pct: Option<f64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub closed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl IndependentPosition {
    pub fn is_active(&self) -> bool {
        matches!(self.status, IndependentStatus::Open | IndependentStatus::Confirmed)
    }

    /// Margin locked by this position: `notional / leverage`.
    pub fn margin_usd(&self) -> f64 {
        if self.leverage <= 0.0 {
            0.0
        } else {
            self.notional_usd / self.leverage
        }
    }
}

/// A scored prediction for one symbol in one scan. Mutated twice after
/// creation: once with the resulting copy action (`log_copy_action`), once
/// much later with the validation outcome (`validate_past_predictions`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPrediction {
    pub id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub symbol: String,
    pub score: f64,
    pub direction: Direction,
    pub reasons: Vec<String>,
    pub entry_price: f64,
    pub features: serde_json::Value,
    pub model_version: String,

    #[serde(default)]
    pub copy_action: Option<CopyAction>,
    #[serde(default)]
    pub copy_side: Option<Side>,
    #[serde(default)]
    pub copy_size: Option<f64>,
    #[serde(default)]
    pub actual_label: Option<u8>,

    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub paper_pnl: Option<f64>,
    #[serde(default)]
    pub paper_pnl_pct: Option<f64>,
    #[serde(default)]
    pub correct: Option<bool>,
    #[serde(default)]
    pub validated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ScoredPrediction {
    pub fn confidence(&self) -> f64 {
        self.score / 100.0
    }
}

/// A single OHLCV bar, consumed by the indicator library and the prediction
/// recorder's market-state assembly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Bounded ring of recent anomalies, surfaced on the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub at: chrono::DateTime<chrono::Utc>,
    pub context: String,
    pub message: String,
}

/// One executed copy action, recorded for audit/observability independent
/// of the prediction it may or may not be tied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub symbol: String,
    pub action: CopyAction,
    pub side: Option<Side>,
    pub size: f64,
    pub notional_usd: f64,
}
