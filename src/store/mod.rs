// =============================================================================
// Store — durable append-only telemetry plus read-only market data
// =============================================================================
//
// A relational, key-addressable store exposing exactly four operation
// shapes: point-read-latest, range-read-older-than-T-limit-K, insert, and
// partial-update-by-id. Implemented here with `rusqlite` behind a single
// WAL-mode connection guarded by a mutex, mirroring the connection-handling
// idiom used elsewhere in this corpus for signal-storage workloads.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::types::{Candle, CopyAction, ExitReason, IndependentPosition, IndependentStatus, ScoredPrediction, Side, TelemetryRecord};


pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to set WAL journal mode")?;

        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS candles (
                symbol TEXT NOT NULL,
                interval TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                close_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume REAL NOT NULL,
                PRIMARY KEY (symbol, interval, open_time)
            );

            CREATE TABLE IF NOT EXISTS indicators (
                symbol TEXT PRIMARY KEY,
                at INTEGER NOT NULL,
                rsi REAL NOT NULL,
                macd REAL NOT NULL,
                macd_signal REAL NOT NULL,
                bb_width REAL NOT NULL,
                atr_pct REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS funding (
                symbol TEXT PRIMARY KEY,
                at INTEGER NOT NULL,
                rate REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS telemetry (
                id TEXT PRIMARY KEY,
                at INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                action TEXT NOT NULL,
                side TEXT,
                size REAL NOT NULL,
                notional_usd REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS predictions (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                score REAL NOT NULL,
                direction TEXT NOT NULL,
                reasons TEXT NOT NULL,
                entry_price REAL NOT NULL,
                features TEXT NOT NULL,
                model_version TEXT NOT NULL,
                copy_action TEXT,
                copy_side TEXT,
                copy_size REAL,
                actual_label INTEGER,
                exit_price REAL,
                paper_pnl REAL,
                paper_pnl_pct REAL,
                correct INTEGER,
                validated_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_predictions_timestamp ON predictions (timestamp);

            CREATE TABLE IF NOT EXISTS independent_positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                entry_price REAL NOT NULL,
                size REAL NOT NULL,
                notional_usd REAL NOT NULL,
                leverage REAL NOT NULL,
                tp_price REAL NOT NULL,
                sl_price REAL NOT NULL,
                timeout_at INTEGER NOT NULL,
                status TEXT NOT NULL,
                confirmed_by_target INTEGER NOT NULL,
                prediction_score REAL NOT NULL,
                prediction_reasons TEXT NOT NULL,
                exit_price REAL,
                exit_reason TEXT,
                realized_pnl REAL,
                realized_pnl_pct REAL,
                created_at INTEGER NOT NULL,
                closed_at INTEGER
            );
            "#,
        )
        .context("failed to initialize store schema")?;
        Ok(())
    }

    /// Cheap point-read used as the scan's store health probe.
    pub fn health_probe(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .context("store health probe failed")?;
        Ok(())
    }

    // --- Read-only market data (point-read-latest) --------------------------

    pub fn latest_candle(&self, symbol: &str, interval: &str) -> Result<Option<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT open_time, close_time, open, high, low, close, volume
             FROM candles WHERE symbol = ?1 AND interval = ?2
             ORDER BY open_time DESC LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![symbol, interval], |r| {
                Ok(Candle {
                    open_time: r.get(0)?,
                    close_time: r.get(1)?,
                    open: r.get(2)?,
                    high: r.get(3)?,
                    low: r.get(4)?,
                    close: r.get(5)?,
                    volume: r.get(6)?,
                })
            })
            .optional()
            .context("failed to read latest candle")?;
        Ok(row)
    }

    pub fn recent_candles(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT open_time, close_time, open, high, low, close, volume
             FROM candles WHERE symbol = ?1 AND interval = ?2
             ORDER BY open_time DESC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![symbol, interval, limit as i64], |r| {
                Ok(Candle {
                    open_time: r.get(0)?,
                    close_time: r.get(1)?,
                    open: r.get(2)?,
                    high: r.get(3)?,
                    low: r.get(4)?,
                    close: r.get(5)?,
                    volume: r.get(6)?,
                })
            })
            .context("failed to query recent candles")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect recent candles")?;
        Ok(rows.into_iter().rev().collect())
    }

    /// Candles are otherwise populated by an out-of-scope backfill process
    /// (§1); this writer exists only so tests can seed fixture data.
    #[cfg(test)]
    pub(crate) fn insert_candle(&self, symbol: &str, interval: &str, candle: &Candle) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO candles
             (symbol, interval, open_time, close_time, open, high, low, close, volume)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                symbol,
                interval,
                candle.open_time,
                candle.close_time,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume,
            ],
        )
        .context("failed to insert test candle")?;
        Ok(())
    }

    pub fn latest_funding(&self, symbol: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT rate FROM funding WHERE symbol = ?1")?;
        let row = stmt
            .query_row(params![symbol], |r| r.get::<_, f64>(0))
            .optional()
            .context("failed to read latest funding")?;
        Ok(row)
    }

    // --- Telemetry (insert) ---------------------------------------------------

    pub fn insert_telemetry(&self, record: &TelemetryRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO telemetry (id, at, symbol, action, side, size, notional_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id,
                record.timestamp.timestamp_millis(),
                record.symbol,
                record.action.to_string(),
                record.side.map(|s| s.to_string()),
                record.size,
                record.notional_usd,
            ],
        )
        .context("failed to insert telemetry record")?;
        Ok(())
    }

    // --- Predictions (insert / partial update / range read) ------------------

    pub fn insert_prediction(&self, prediction: &ScoredPrediction) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO predictions
             (id, timestamp, symbol, score, direction, reasons, entry_price, features, model_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                prediction.id,
                prediction.timestamp.timestamp_millis(),
                prediction.symbol,
                prediction.score,
                prediction.direction.to_string(),
                serde_json::to_string(&prediction.reasons).unwrap_or_default(),
                prediction.entry_price,
                prediction.features.to_string(),
                prediction.model_version,
            ],
        )
        .context("failed to insert prediction")?;
        Ok(())
    }

    pub fn update_prediction_copy_action(
        &self,
        id: &str,
        action: CopyAction,
        side: Option<Side>,
        size: Option<f64>,
        actual_label: u8,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE predictions SET copy_action = ?2, copy_side = ?3, copy_size = ?4, actual_label = ?5
             WHERE id = ?1",
            params![
                id,
                action.to_string(),
                side.map(|s| s.to_string()),
                size,
                actual_label as i64,
            ],
        )
        .context("failed to update prediction copy action")?;
        Ok(())
    }

    /// Records older than `older_than`, whose `validated_at` is still unset,
    /// oldest first, at most `limit`.
    pub fn predictions_needing_validation(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScoredPrediction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, symbol, score, direction, reasons, entry_price, features, model_version,
                    copy_action, copy_side, copy_size, actual_label
             FROM predictions
             WHERE timestamp < ?1 AND validated_at IS NULL
             ORDER BY timestamp ASC
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![older_than.timestamp_millis(), limit as i64], |r| {
                let ts_ms: i64 = r.get(1)?;
                let reasons_json: String = r.get(5)?;
                let features_json: String = r.get(7)?;
                let direction_str: String = r.get(4)?;
                let copy_action_str: Option<String> = r.get(9)?;
                let copy_side_str: Option<String> = r.get(10)?;
                let actual_label: Option<i64> = r.get(12)?;
                Ok(ScoredPrediction {
                    id: r.get(0)?,
                    timestamp: DateTime::from_timestamp_millis(ts_ms).unwrap_or_else(Utc::now),
                    symbol: r.get(2)?,
                    score: r.get(3)?,
                    direction: parse_direction(&direction_str),
                    reasons: serde_json::from_str(&reasons_json).unwrap_or_default(),
                    entry_price: r.get(6)?,
                    features: serde_json::from_str(&features_json).unwrap_or(serde_json::Value::Null),
                    model_version: r.get(8)?,
                    copy_action: copy_action_str.as_deref().map(parse_copy_action),
                    copy_side: copy_side_str.as_deref().map(parse_side),
                    copy_size: r.get(11)?,
                    actual_label: actual_label.map(|v| v as u8),
                    exit_price: None,
                    paper_pnl: None,
                    paper_pnl_pct: None,
                    correct: None,
                    validated_at: None,
                })
            })
            .context("failed to query predictions needing validation")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect predictions needing validation")?;

        debug!(count = rows.len(), "predictions needing validation fetched");
        Ok(rows)
    }

    pub fn update_prediction_validation(
        &self,
        id: &str,
        exit_price: f64,
        paper_pnl: f64,
        paper_pnl_pct: f64,
        correct: bool,
        validated_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE predictions SET exit_price = ?2, paper_pnl = ?3, paper_pnl_pct = ?4, correct = ?5, validated_at = ?6
             WHERE id = ?1",
            params![
                id,
                exit_price,
                paper_pnl,
                paper_pnl_pct,
                correct as i64,
                validated_at.timestamp_millis(),
            ],
        )
        .context("failed to update prediction validation")?;
        Ok(())
    }

    // --- Independent positions (insert / partial update / point read) --------

    pub fn insert_independent_position(&self, pos: &IndependentPosition) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO independent_positions
             (id, symbol, entry_price, size, notional_usd, leverage, tp_price, sl_price, timeout_at,
              status, confirmed_by_target, prediction_score, prediction_reasons, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                pos.id,
                pos.symbol,
                pos.entry_price,
                pos.size,
                pos.notional_usd,
                pos.leverage,
                pos.tp_price,
                pos.sl_price,
                pos.timeout_at.timestamp_millis(),
                pos.status.to_string(),
                pos.confirmed_by_target as i64,
                pos.prediction_score,
                serde_json::to_string(&pos.prediction_reasons).unwrap_or_default(),
                pos.created_at.timestamp_millis(),
            ],
        )
        .context("failed to insert independent position")?;
        Ok(())
    }

    pub fn update_independent_position(&self, pos: &IndependentPosition) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE independent_positions SET
                status = ?2, confirmed_by_target = ?3,
                exit_price = ?4, exit_reason = ?5, realized_pnl = ?6, realized_pnl_pct = ?7,
                closed_at = ?8
             WHERE id = ?1",
            params![
                pos.id,
                pos.status.to_string(),
                pos.confirmed_by_target as i64,
                pos.exit_price,
                pos.exit_reason.map(|e| e.to_string()),
                pos.realized_pnl,
                pos.realized_pnl_pct,
                pos.closed_at.map(|t| t.timestamp_millis()),
            ],
        )
        .context("failed to update independent position")?;
        Ok(())
    }

    /// All positions currently in `{open, confirmed}` — used to enforce the
    /// single-position-per-symbol and allocation-cap invariants.
    pub fn active_independent_positions(&self) -> Result<Vec<IndependentPosition>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, entry_price, size, notional_usd, leverage, tp_price, sl_price,
                    timeout_at, status, confirmed_by_target, prediction_score, prediction_reasons,
                    created_at
             FROM independent_positions WHERE status IN ('open', 'confirmed')",
        )?;

        let rows = stmt
            .query_map([], |r| {
                let status_str: String = r.get(9)?;
                let reasons_json: String = r.get(12)?;
                let timeout_ms: i64 = r.get(8)?;
                let created_ms: i64 = r.get(13)?;
                Ok(IndependentPosition {
                    id: r.get(0)?,
                    symbol: r.get(1)?,
                    entry_price: r.get(2)?,
                    size: r.get(3)?,
                    notional_usd: r.get(4)?,
                    leverage: r.get(5)?,
                    tp_price: r.get(6)?,
                    sl_price: r.get(7)?,
                    timeout_at: DateTime::from_timestamp_millis(timeout_ms).unwrap_or_else(Utc::now),
                    status: parse_independent_status(&status_str),
                    confirmed_by_target: r.get::<_, i64>(10)? != 0,
                    prediction_score: r.get(11)?,
                    prediction_reasons: serde_json::from_str(&reasons_json).unwrap_or_default(),
                    exit_price: None,
                    exit_reason: None,
                    realized_pnl: None,
                    realized_pnl_pct: None,
                    created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
                    closed_at: None,
                })
            })
            .context("failed to query active independent positions")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to collect active independent positions")?;

        Ok(rows)
    }
}

fn parse_direction(s: &str) -> crate::types::Direction {
    match s {
        "+1" => crate::types::Direction::Up,
        "-1" => crate::types::Direction::Down,
        _ => crate::types::Direction::Flat,
    }
}

fn parse_copy_action(s: &str) -> CopyAction {
    match s {
        "open" => CopyAction::Open,
        "close" => CopyAction::Close,
        "flip" => CopyAction::Flip,
        "adjust" => CopyAction::Adjust,
        _ => CopyAction::None,
    }
}

fn parse_side(s: &str) -> Side {
    match s {
        "short" => Side::Short,
        _ => Side::Long,
    }
}

fn parse_independent_status(s: &str) -> IndependentStatus {
    match s {
        "confirmed" => IndependentStatus::Confirmed,
        "closed" => IndependentStatus::Closed,
        _ => IndependentStatus::Open,
    }
}

#[allow(dead_code)]
fn parse_exit_reason(s: &str) -> Option<ExitReason> {
    match s {
        "tp" => Some(ExitReason::TakeProfit),
        "sl" => Some(ExitReason::StopLoss),
        "timeout" => Some(ExitReason::Timeout),
        "target_confirmed" => Some(ExitReason::TargetConfirmed),
        "target_opposite" => Some(ExitReason::TargetOpposite),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn sample_prediction(id: &str, ts: DateTime<Utc>) -> ScoredPrediction {
        ScoredPrediction {
            id: id.to_string(),
            timestamp: ts,
            symbol: "BTC".to_string(),
            score: 80.0,
            direction: Direction::Up,
            reasons: vec!["rsi_oversold".to_string()],
            entry_price: 60_000.0,
            features: serde_json::json!({ "rsi": 28.0 }),
            model_version: "weighted-v1".to_string(),
            copy_action: None,
            copy_side: None,
            copy_size: None,
            actual_label: None,
            exit_price: None,
            paper_pnl: None,
            paper_pnl_pct: None,
            correct: None,
            validated_at: None,
        }
    }

    #[test]
    fn insert_and_read_back_prediction_needing_validation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old_ts = Utc::now() - chrono::Duration::hours(5);
        store.insert_prediction(&sample_prediction("p1", old_ts)).unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(4);
        let pending = store.predictions_needing_validation(cutoff, 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "p1");
    }

    #[test]
    fn recent_prediction_not_yet_due_for_validation() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_prediction(&sample_prediction("p2", Utc::now())).unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(4);
        let pending = store.predictions_needing_validation(cutoff, 100).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn update_copy_action_persists_and_is_visible_to_validation_read() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old_ts = Utc::now() - chrono::Duration::hours(5);
        store.insert_prediction(&sample_prediction("p3", old_ts)).unwrap();
        store
            .update_prediction_copy_action("p3", CopyAction::Open, Some(Side::Long), Some(0.5), 1)
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(4);
        let pending = store.predictions_needing_validation(cutoff, 100).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].copy_action, Some(CopyAction::Open));
        assert_eq!(pending[0].copy_side, Some(Side::Long));
        assert_eq!(pending[0].actual_label, Some(1));
    }

    #[test]
    fn independent_position_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let pos = IndependentPosition {
            id: "ip1".to_string(),
            symbol: "ETH".to_string(),
            entry_price: 3000.0,
            size: 1.0,
            notional_usd: 3000.0,
            leverage: 5.0,
            tp_price: 3600.0,
            sl_price: 2640.0,
            timeout_at: Utc::now() + chrono::Duration::hours(4),
            status: IndependentStatus::Open,
            confirmed_by_target: false,
            prediction_score: 92.0,
            prediction_reasons: vec!["ema_trend".to_string()],
            exit_price: None,
            exit_reason: None,
            realized_pnl: None,
            realized_pnl_pct: None,
            created_at: Utc::now(),
            closed_at: None,
        };
        store.insert_independent_position(&pos).unwrap();

        let active = store.active_independent_positions().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].symbol, "ETH");

        let mut closed = active[0].clone();
        closed.status = IndependentStatus::Closed;
        closed.exit_price = Some(3100.0);
        closed.exit_reason = Some(ExitReason::TakeProfit);
        closed.realized_pnl = Some(100.0);
        closed.realized_pnl_pct = Some(3.33);
        closed.closed_at = Some(Utc::now());
        store.update_independent_position(&closed).unwrap();

        let active_after = store.active_independent_positions().unwrap();
        assert!(active_after.is_empty());
    }

    #[test]
    fn health_probe_succeeds_on_open_connection() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.health_probe().is_ok());
    }
}
