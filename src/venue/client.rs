// =============================================================================
// REST venue client — HMAC-SHA256 signed requests against a perpetuals venue
// =============================================================================
//
// Generalizes the HMAC-signed request-construction idiom (signed query
// string, recv-window, hex-encoded signature header) to the five operations
// this crate's core consumes: meta, allMids, clearinghouseState,
// updateLeverage, submitMarketOrder.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::types::{InstrumentMeta, PortfolioSnapshot, Position};
use crate::venue::VenueClient;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// A request-signing REST adapter for a perpetuals venue.
#[derive(Clone)]
pub struct RestVenueClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl RestVenueClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();
        let base_url = base_url.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-VENUE-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = %base_url, "RestVenueClient initialised");

        Self {
            api_key,
            secret,
            base_url,
            client,
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the signed query string for a request: appends timestamp,
    /// recvWindow, and an HMAC signature over the whole thing.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn signed_body(&self, account: &str, payload: &serde_json::Value) -> (String, serde_json::Value) {
        let ts = Self::timestamp_ms();
        let mut body = payload.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert("account".to_string(), serde_json::json!(account));
            obj.insert("timestamp".to_string(), serde_json::json!(ts));
        }
        let canonical = body.to_string();
        let sig = self.sign(&canonical);
        (sig, body)
    }
}

impl VenueClient for RestVenueClient {
    #[instrument(skip(self), name = "venue::meta")]
    async fn meta(&self) -> Result<Vec<InstrumentMeta>> {
        let url = format!("{}/info/meta", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(std::time::Duration::from_secs(20))
            .json(&serde_json::json!({ "type": "meta" }))
            .send()
            .await
            .context("POST /info/meta request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse meta response")?;
        if !status.is_success() {
            anyhow::bail!("venue meta returned {}: {}", status, body);
        }

        let raw = body["universe"]
            .as_array()
            .context("meta response missing 'universe' array")?;

        let mut out = Vec::with_capacity(raw.len());
        for (idx, entry) in raw.iter().enumerate() {
            let symbol = entry["name"].as_str().unwrap_or_default().to_string();
            if symbol.is_empty() {
                continue;
            }
            out.push(InstrumentMeta {
                symbol,
                asset_index: idx as u32,
                size_decimals: entry["szDecimals"].as_u64().unwrap_or(3) as u32,
                max_leverage: entry["maxLeverage"].as_u64().unwrap_or(1) as u32,
                only_isolated: entry["onlyIsolated"].as_bool().unwrap_or(false),
            });
        }

        debug!(count = out.len(), "instrument metadata fetched");
        Ok(out)
    }

    #[instrument(skip(self), name = "venue::all_mids")]
    async fn all_mids(&self) -> Result<HashMap<String, f64>> {
        let url = format!("{}/info/allMids", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(std::time::Duration::from_secs(10))
            .json(&serde_json::json!({ "type": "allMids" }))
            .send()
            .await
            .context("POST /info/allMids request failed")?;

        let status = resp.status();
        let body: HashMap<String, String> =
            resp.json().await.context("failed to parse allMids response")?;
        if !status.is_success() {
            anyhow::bail!("venue allMids returned {}", status);
        }

        let mut out = HashMap::with_capacity(body.len());
        for (symbol, price_str) in body {
            if let Ok(price) = price_str.parse::<f64>() {
                out.insert(symbol, price);
            }
        }
        Ok(out)
    }

    #[instrument(skip(self), name = "venue::clearinghouse_state")]
    async fn clearinghouse_state(&self, account: &str) -> Result<(PortfolioSnapshot, Vec<Position>)> {
        let qs = self.signed_query(&format!("account={account}"));
        let url = format!("{}/info/clearinghouseState?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .context("GET clearinghouseState request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse clearinghouseState response")?;
        if !status.is_success() {
            anyhow::bail!("venue clearinghouseState returned {}: {}", status, body);
        }

        let equity = body["marginSummary"]["accountValue"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        let withdrawable = body["withdrawable"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        let mut positions = Vec::new();
        if let Some(arr) = body["assetPositions"].as_array() {
            for entry in arr {
                let pos = &entry["position"];
                let symbol = pos["coin"].as_str().unwrap_or_default().to_string();
                if symbol.is_empty() {
                    continue;
                }
                let signed_size = pos["szi"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let entry_price = pos["entryPx"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let liquidation_price = pos["liquidationPx"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                let leverage = pos["leverage"]["value"].as_f64().unwrap_or(1.0);

                positions.push(Position {
                    symbol,
                    signed_size,
                    leverage,
                    entry_price,
                    liquidation_price,
                });
            }
        }

        debug!(account, equity, withdrawable, positions = positions.len(), "clearinghouse state fetched");
        Ok((PortfolioSnapshot { equity, withdrawable }, positions))
    }

    #[instrument(skip(self), name = "venue::update_leverage")]
    async fn update_leverage(&self, asset_index: u32, cross: bool, leverage: u32) -> Result<()> {
        let (signature, body) = self.signed_body(
            &self.api_key,
            &serde_json::json!({
                "type": "updateLeverage",
                "asset": asset_index,
                "isCross": cross,
                "leverage": leverage,
            }),
        );

        let url = format!("{}/exchange", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(std::time::Duration::from_secs(10))
            .header("X-VENUE-SIGNATURE", signature)
            .json(&body)
            .send()
            .await
            .context("POST updateLeverage request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            anyhow::bail!("venue updateLeverage returned {}: {}", status, body);
        }

        debug!(asset_index, leverage, cross, "leverage updated");
        Ok(())
    }

    #[instrument(skip(self), name = "venue::submit_market_order")]
    async fn submit_market_order(
        &self,
        asset_index: u32,
        buy: bool,
        limit_price: f64,
        size: f64,
        reduce_only: bool,
    ) -> Result<()> {
        let (signature, body) = self.signed_body(
            &self.api_key,
            &serde_json::json!({
                "type": "order",
                "asset": asset_index,
                "isBuy": buy,
                "limitPx": limit_price,
                "size": size,
                "reduceOnly": reduce_only,
                "orderType": { "limit": { "tif": "Ioc" } },
            }),
        );

        let url = format!("{}/exchange", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(std::time::Duration::from_secs(30))
            .header("X-VENUE-SIGNATURE", signature)
            .json(&body)
            .send()
            .await
            .context("POST order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order response")?;
        if !status.is_success() || body["status"].as_str() == Some("error") {
            warn!(asset_index, buy, size, "order rejected by venue");
            anyhow::bail!("venue order rejected: {}", body);
        }

        debug!(asset_index, buy, size, limit_price, "order submitted");
        Ok(())
    }
}

impl std::fmt::Debug for RestVenueClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestVenueClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
