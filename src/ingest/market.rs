// src/ingest/market.rs
//! Market snapshot: latest quotes per ticker from a CoinMarketCap-style listing
//! (or any proxy that serves a flat `symbol -> quote` map).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{FetchError, PipelineWarning};
use crate::ingest::fetcher::{FetchRequest, RateLimitedFetcher};

pub const UNAVAILABLE_SUMMARY: &str = "MARKET CONTEXT: Data Unavailable.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketQuote {
    pub price: f64,
    #[serde(default, alias = "percent_change_1h", skip_serializing_if = "Option::is_none")]
    pub change_1h: Option<f64>,
    #[serde(default, alias = "percent_change_24h", skip_serializing_if = "Option::is_none")]
    pub change_24h: Option<f64>,
    #[serde(default, alias = "percent_change_7d", skip_serializing_if = "Option::is_none")]
    pub change_7d: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_24h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<f64>,
}

/// Uppercase ticker -> quote. Keys are normalized on insert, so lookups are
/// case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarketSnapshot {
    quotes: BTreeMap<String, MarketQuote>,
}

impl MarketSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later inserts for the same ticker (any case) replace earlier ones.
    pub fn insert(&mut self, symbol: &str, quote: MarketQuote) {
        let key = symbol.trim().to_uppercase();
        if !key.is_empty() {
            self.quotes.insert(key, quote);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<&MarketQuote> {
        self.quotes.get(&symbol.trim().to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.quotes.keys().map(String::as_str)
    }

    /// Accepts a CMC listing (`{"data": [{symbol, quote: {USD: {...}}}]}`),
    /// the same wrapped in `{"success": .., "data": ..}`, or a flat map.
    pub fn from_json(body: Value) -> Result<Self, FetchError> {
        let payload: MarketPayload =
            serde_json::from_value(body).map_err(|e| FetchError::Parse(format!("market payload: {e}")))?;
        let mut snap = Self::new();
        match payload {
            MarketPayload::Listing {
                success: Some(false),
                error,
                ..
            } => {
                return Err(FetchError::Parse(
                    error.unwrap_or_else(|| "market source reported failure".to_string()),
                ));
            }
            MarketPayload::Listing { data, .. } => {
                for coin in data {
                    if let Some(q) = coin.quote.usd {
                        snap.insert(&coin.symbol, q);
                    }
                }
            }
            MarketPayload::Flat(map) => {
                for (sym, q) in map {
                    snap.insert(&sym, q);
                }
            }
        }
        Ok(snap)
    }

    /// One line per ticker, ordered by market cap when known (largest first).
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return UNAVAILABLE_SUMMARY.to_string();
        }
        let mut rows: Vec<(&String, &MarketQuote)> = self.quotes.iter().collect();
        rows.sort_by(|a, b| {
            let ca = a.1.market_cap.unwrap_or(0.0);
            let cb = b.1.market_cap.unwrap_or(0.0);
            cb.total_cmp(&ca).then_with(|| a.0.cmp(b.0))
        });

        let mut out = format!("MARKET CONTEXT (Top {} Coins):", rows.len());
        for (sym, q) in rows {
            let _ = write!(
                out,
                "\n{sym}: {:.2} (24h: {:.1}%, 7d: {:.1}%)",
                q.price,
                q.change_24h.unwrap_or(0.0),
                q.change_7d.unwrap_or(0.0)
            );
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct ListingCoin {
    symbol: String,
    #[serde(default)]
    quote: ListingQuote,
}

#[derive(Debug, Default, Deserialize)]
struct ListingQuote {
    #[serde(rename = "USD", default)]
    usd: Option<MarketQuote>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MarketPayload {
    Listing {
        #[serde(default)]
        success: Option<bool>,
        #[serde(default)]
        error: Option<String>,
        data: Vec<ListingCoin>,
    },
    Flat(BTreeMap<String, MarketQuote>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketSettings {
    pub enabled: bool,
    pub base_url: String,
    pub path: String,
    pub limit: u32,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub api_key_header: String,
}

impl Default for MarketSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://pro-api.coinmarketcap.com".to_string(),
            path: "/v1/cryptocurrency/listings/latest".to_string(),
            limit: 100,
            api_key: None,
            api_key_env: "CMC_API_KEY".to_string(),
            api_key_header: "X-CMC_PRO_API_KEY".to_string(),
        }
    }
}

pub struct MarketDataClient {
    fetcher: Arc<RateLimitedFetcher>,
    settings: MarketSettings,
}

impl MarketDataClient {
    pub fn new(fetcher: Arc<RateLimitedFetcher>, settings: MarketSettings) -> Self {
        Self { fetcher, settings }
    }

    pub async fn fetch_snapshot(&self) -> Result<MarketSnapshot, FetchError> {
        let url = format!(
            "{}{}",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.path
        );
        let mut req = FetchRequest::get(url)
            .query("start", 1)
            .query("limit", self.settings.limit)
            .query("convert", "USD");
        if let Some(key) = &self.settings.api_key {
            req = req.header(&self.settings.api_key_header, key.clone());
        }
        let body = self.fetcher.fetch(&req).await?;
        let snap = MarketSnapshot::from_json(body)?;
        info!(target: "ingest", symbols = snap.len(), "market snapshot fetched");
        Ok(snap)
    }

    /// Never fails: an unreachable market source yields an empty snapshot and a warning.
    pub async fn snapshot_or_empty(&self) -> (MarketSnapshot, Option<PipelineWarning>) {
        if !self.settings.enabled {
            return (MarketSnapshot::new(), None);
        }
        match self.fetch_snapshot().await {
            Ok(snap) => (snap, None),
            Err(e) => {
                warn!(target: "ingest", error = %e, "market data unavailable, continuing without quotes");
                (
                    MarketSnapshot::new(),
                    Some(PipelineWarning::MarketDataUnavailable { reason: e.to_string() }),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_cmc_listing_and_normalizes_keys() {
        let body = json!({
            "status": {"error_code": 0},
            "data": [
                {"symbol": "btc", "quote": {"USD": {
                    "price": 65000.5, "percent_change_1h": 0.1, "percent_change_24h": 1.25,
                    "percent_change_7d": -3.0, "volume_24h": 1.0e10, "market_cap": 1.2e12
                }}},
                {"symbol": "SOL", "quote": {"USD": {"price": 150.0}}},
                {"symbol": "NOQ"}
            ]
        });
        let snap = MarketSnapshot::from_json(body).unwrap();
        assert_eq!(snap.len(), 2);
        let btc = snap.get("Btc").unwrap();
        assert_eq!(btc.change_1h, Some(0.1));
        assert_eq!(btc.change_24h, Some(1.25));
        assert!(snap.get("NOQ").is_none());
    }

    #[test]
    fn parses_flat_map() {
        let snap = MarketSnapshot::from_json(json!({
            "eth": {"price": 3000.0, "percent_change_24h": 2.0, "percent_change_7d": 5.0,
                    "volume_24h": 1.0, "market_cap": 2.0}
        }))
        .unwrap();
        assert_eq!(snap.get("ETH").map(|q| q.price), Some(3000.0));
    }

    #[test]
    fn wrapped_failure_is_error() {
        let err = MarketSnapshot::from_json(json!({"success": false, "error": "API key not configured", "data": []}))
            .unwrap_err();
        assert_eq!(err, FetchError::Parse("API key not configured".into()));
    }

    #[test]
    fn summary_lines() {
        let mut snap = MarketSnapshot::new();
        assert_eq!(snap.summary(), UNAVAILABLE_SUMMARY);
        snap.insert(
            "btc",
            MarketQuote {
                price: 65000.0,
                change_1h: None,
                change_24h: Some(1.23),
                change_7d: Some(-4.56),
                volume_24h: None,
                market_cap: Some(1.0),
            },
        );
        assert_eq!(
            snap.summary(),
            "MARKET CONTEXT (Top 1 Coins):\nBTC: 65000.00 (24h: 1.2%, 7d: -4.6%)"
        );
    }
}
