// =============================================================================
// Engine configuration — environment-loaded, with atomic runtime-state persistence
// =============================================================================
//
// `EngineConfig` is read once at startup from plain environment variables; an
// empty environment still produces a runnable, conservatively-paused
// configuration (every field carries a default). `RuntimeState` is the small
// mutable subset that changes during the process lifetime and is persisted to
// disk so a restart resumes instead of re-arming cold.
//
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{AccountMode, TradingMode};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_string_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Copy mode: exact 1:1 replication, or scaled by equity ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyMode {
    Exact,
    Scaled,
}

impl std::str::FromStr for CopyMode {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exact" => Ok(Self::Exact),
            _ => Ok(Self::Scaled),
        }
    }
}

/// Independent-trader exit strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitMode {
    TimeBased,
    TpSl,
}

/// Static, process-lifetime configuration loaded once from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // --- Copy planner ---
    pub enable_copy_trading: bool,
    pub copy_mode: CopyMode,
    pub copy_poll_interval_minutes: u64,
    pub copy_scale_multiplier: f64,
    pub position_adjust_threshold: f64,
    /// Margin floor gate (§4.2) applied to every non-close action.
    pub min_position_size_usd: f64,

    // --- Independent trader ---
    pub enable_independent_trading: bool,
    pub independent_max_allocation_pct: f64,
    pub independent_max_positions: u32,
    pub independent_leverage: f64,
    pub independent_use_time_exit: bool,
    pub independent_hold_hours: f64,
    pub independent_tp_pct: f64,
    pub independent_sl_pct: f64,
    pub independent_min_score: f64,
    pub independent_whitelist: Vec<String>,

    // --- Accounts ---
    pub target_account: String,
    pub operator_account: String,

    // --- Orchestrator / executor gates ---
    pub scan_timeout_seconds: u64,
    pub symbol_batch_size: usize,
    pub exchange_min_notional_usd: f64,
    pub order_slippage_pct: f64,
    pub failed_order_cooldown_seconds: u64,

    // --- Prediction recorder ---
    pub prediction_validation_hours: i64,
    pub prediction_validation_interval_minutes: i64,
    pub prediction_high_confidence_threshold: f64,
    pub model_version: String,

    // --- Venue / store / http ---
    pub venue_base_url: String,
    pub venue_api_key: String,
    pub venue_api_secret: String,
    pub store_path: PathBuf,
    pub health_bind_addr: String,
    pub runtime_state_path: PathBuf,
}

impl EngineConfig {
    /// Load from the process environment. Never fails on missing optional
    /// keys — only `TARGET_ACCOUNT`/`OPERATOR_ACCOUNT`/`VENUE_BASE_URL`/
    /// `VENUE_API_KEY`/`VENUE_API_SECRET` are required, and their absence is a
    /// fatal configuration error at startup (error kind 1 in the error model).
    pub fn load_from_env() -> Result<Self> {
        let target_account = std::env::var("TARGET_ACCOUNT")
            .context("TARGET_ACCOUNT is required")?;
        let operator_account = std::env::var("OPERATOR_ACCOUNT")
            .context("OPERATOR_ACCOUNT is required")?;
        let venue_base_url = std::env::var("VENUE_BASE_URL")
            .context("VENUE_BASE_URL is required")?;
        let venue_api_key = std::env::var("VENUE_API_KEY")
            .context("VENUE_API_KEY is required")?;
        let venue_api_secret = std::env::var("VENUE_API_SECRET")
            .context("VENUE_API_SECRET is required")?;

        let exit_mode_time: bool = env_or("INDEPENDENT_USE_TIME_EXIT", true);

        let cfg = Self {
            enable_copy_trading: env_or("ENABLE_COPY_TRADING", true),
            copy_mode: env_string_or("COPY_MODE", "scaled").parse().unwrap_or(CopyMode::Scaled),
            copy_poll_interval_minutes: env_or("COPY_POLL_INTERVAL_MINUTES", 5u64),
            copy_scale_multiplier: env_or("COPY_SCALE_MULTIPLIER", 1.3),
            position_adjust_threshold: env_or("POSITION_ADJUST_THRESHOLD", 0.10),
            min_position_size_usd: env_or("MIN_POSITION_SIZE_USD", 5.0),

            enable_independent_trading: env_or("ENABLE_INDEPENDENT_TRADING", false),
            independent_max_allocation_pct: env_or("INDEPENDENT_MAX_ALLOCATION_PCT", 0.10),
            independent_max_positions: env_or("INDEPENDENT_MAX_POSITIONS", 3u32),
            independent_leverage: env_or("INDEPENDENT_LEVERAGE", 5.0),
            independent_use_time_exit: exit_mode_time,
            independent_hold_hours: env_or("INDEPENDENT_HOLD_HOURS", 4.0),
            independent_tp_pct: env_or("INDEPENDENT_TP_PCT", 0.20),
            independent_sl_pct: env_or("INDEPENDENT_SL_PCT", 0.12),
            independent_min_score: env_or("INDEPENDENT_MIN_SCORE", 90.0),
            independent_whitelist: env_list("INDEPENDENT_WHITELIST"),

            target_account,
            operator_account,

            scan_timeout_seconds: env_or("SCAN_TIMEOUT_SECONDS", 240u64),
            symbol_batch_size: env_or("SYMBOL_BATCH_SIZE", 5usize),
            exchange_min_notional_usd: env_or("EXCHANGE_MIN_NOTIONAL_USD", 10.0),
            order_slippage_pct: env_or("ORDER_SLIPPAGE_PCT", 0.02),
            failed_order_cooldown_seconds: env_or("FAILED_ORDER_COOLDOWN_SECONDS", 300u64),

            prediction_validation_hours: env_or("PREDICTION_VALIDATION_HOURS", 4i64),
            prediction_validation_interval_minutes: env_or(
                "PREDICTION_VALIDATION_INTERVAL_MINUTES",
                60i64,
            ),
            prediction_high_confidence_threshold: env_or(
                "PREDICTION_HIGH_CONFIDENCE_THRESHOLD",
                0.70,
            ),
            model_version: env_string_or("MODEL_VERSION", "weighted-v1"),

            venue_base_url,
            venue_api_key,
            venue_api_secret,
            store_path: PathBuf::from(env_string_or("STORE_PATH", "./data/engine.db")),
            health_bind_addr: env_string_or("HEALTH_BIND_ADDR", "0.0.0.0:8080"),
            runtime_state_path: PathBuf::from(env_string_or(
                "RUNTIME_STATE_PATH",
                "./data/runtime_state.json",
            )),
        };

        info!(
            target_account = %cfg.target_account,
            operator_account = %cfg.operator_account,
            copy_mode = ?cfg.copy_mode,
            enable_copy_trading = cfg.enable_copy_trading,
            enable_independent_trading = cfg.enable_independent_trading,
            "engine configuration loaded"
        );

        Ok(cfg)
    }

    pub fn exit_mode(&self) -> ExitMode {
        if self.independent_use_time_exit {
            ExitMode::TimeBased
        } else {
            ExitMode::TpSl
        }
    }
}

/// The mutable subset of operational state, persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default)]
    pub account_mode: AccountMode,
    #[serde(default)]
    pub last_validated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            account_mode: AccountMode::Demo,
            last_validated_at: None,
        }
    }
}

impl RuntimeState {
    /// Load from `path`, falling back to a conservative default (paused,
    /// demo) if the file is absent or unreadable.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => {
                    info!(path = %path.display(), "runtime state loaded");
                    state
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to parse runtime state, using defaults");
                    Self::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no runtime state file found, starting from defaults");
                Self::default()
            }
        }
    }

    /// Persist via the atomic tmp-write-then-rename pattern.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime state to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp runtime state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp runtime state to {}", path.display()))?;

        info!(path = %path.display(), "runtime state saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_runtime_state_is_paused_demo() {
        let state = RuntimeState::default();
        assert_eq!(state.trading_mode, TradingMode::Paused);
        assert_eq!(state.account_mode, AccountMode::Demo);
        assert!(state.last_validated_at.is_none());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let state: RuntimeState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.trading_mode, TradingMode::Paused);
        assert_eq!(state.account_mode, AccountMode::Demo);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = std::env::temp_dir().join(format!("copytrade-engine-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("runtime_state.json");

        let mut state = RuntimeState::default();
        state.trading_mode = TradingMode::Live;
        state.save(&path).unwrap();

        let loaded = RuntimeState::load_or_default(&path);
        assert_eq!(loaded.trading_mode, TradingMode::Live);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let state = RuntimeState::load_or_default("/nonexistent/path/runtime_state.json");
        assert_eq!(state.trading_mode, TradingMode::Paused);
    }

    #[test]
    fn exit_mode_reflects_time_flag() {
        // CopyMode parse fallback behaviour, covered here since it's a small
        // free function exercised by EngineConfig::load_from_env.
        let mode: CopyMode = "exact".parse().unwrap();
        assert_eq!(mode, CopyMode::Exact);
        let mode2: CopyMode = "scaled".parse().unwrap();
        assert_eq!(mode2, CopyMode::Scaled);
    }
}
