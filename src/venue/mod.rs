// =============================================================================
// Venue client — abstract surface consumed by the planner, executor, and
// independent trader
// =============================================================================

pub mod client;

use std::collections::HashMap;

use anyhow::Result;

use crate::types::{InstrumentMeta, PortfolioSnapshot, Position};

pub use client::RestVenueClient;

/// Abstract perpetuals venue surface. Implementable against any venue that
/// offers market-order trading with cross-margin leverage on perpetuals.
pub trait VenueClient: Send + Sync {
    /// Instrument universe: symbol, asset index, size decimals, max leverage.
    async fn meta(&self) -> Result<Vec<InstrumentMeta>>;

    /// Current mid-price for every tradable symbol.
    async fn all_mids(&self) -> Result<HashMap<String, f64>>;

    /// Account equity/withdrawable plus every open position for `account`.
    async fn clearinghouse_state(&self, account: &str) -> Result<(PortfolioSnapshot, Vec<Position>)>;

    /// Change leverage for `asset_index`. Always cross-margin per this
    /// crate's usage.
    async fn update_leverage(&self, asset_index: u32, cross: bool, leverage: u32) -> Result<()>;

    /// Submit a market order, modelled as an aggressive limit at
    /// `limit_price` (the caller has already applied slippage protection).
    async fn submit_market_order(
        &self,
        asset_index: u32,
        buy: bool,
        limit_price: f64,
        size: f64,
        reduce_only: bool,
    ) -> Result<()>;
}
