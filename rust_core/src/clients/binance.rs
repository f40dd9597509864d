//! Binance USD-M Futures market data client
//!
//! Public endpoints only, no API key required:
//! - `GET /fapi/v1/ticker/price?symbol=` for the latest price
//! - `GET /fapi/v1/klines` for candles
//!
//! Klines come back as positional arrays
//! `[open_time, open, high, low, close, volume, close_time, ...]` whose price
//! cells are usually strings; numeric cells are accepted too. Rows that cannot
//! be read are dropped.

use super::backoff::{send_with_backoff, FeedError, RateLimitPolicy};
use super::price_feed::{Candle, CandleWindow, PriceFeed};
use crate::utils::parse_decimal;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Largest page the klines endpoint serves
const MAX_KLINES_LIMIT: u32 = 1500;

/// Binance futures client implementing PriceFeed
pub struct BinanceFuturesFeed {
    client: Client,
    base_url: String,
    policy: RateLimitPolicy,
}

impl BinanceFuturesFeed {
    pub fn new(base_url: &str, timeout: Duration, policy: RateLimitPolicy) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Kifu/1.0")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            policy,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(
            DEFAULT_BASE_URL,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            RateLimitPolicy::default(),
        )
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Candle>, FeedError> {
        let url = format!("{}/fapi/v1/klines", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("limit", limit.clamp(1, MAX_KLINES_LIMIT).to_string()),
        ];
        if let Some(start) = start {
            query.push(("startTime", start.timestamp_millis().to_string()));
        }
        if let Some(end) = end {
            query.push(("endTime", end.timestamp_millis().to_string()));
        }

        debug!("Fetching {} {} klines (limit {})", symbol, interval, limit);

        let response = send_with_backoff(&self.policy, "klines", || {
            self.client.get(&url).query(&query)
        })
        .await?;

        let rows: Vec<Vec<Value>> = response.json().await.map_err(|e| FeedError::Decode {
            endpoint: "klines".to_string(),
            reason: e.to_string(),
        })?;

        Ok(parse_klines(&rows))
    }
}

#[async_trait]
impl PriceFeed for BinanceFuturesFeed {
    fn name(&self) -> &str {
        "binance-futures"
    }

    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        let url = format!("{}/fapi/v1/ticker/price", self.base_url);
        let response = send_with_backoff(&self.policy, "ticker/price", || {
            self.client.get(&url).query(&[("symbol", symbol)])
        })
        .await
        .with_context(|| format!("Failed to fetch ticker for {}", symbol))?;

        let ticker: TickerPrice = response
            .json()
            .await
            .context("Failed to parse Binance ticker response")?;

        parse_decimal(&ticker.price)
            .with_context(|| format!("Invalid ticker price '{}' for {}", ticker.price, symbol))
    }

    async fn historical_close(&self, symbol: &str, window: CandleWindow) -> Result<Option<Decimal>> {
        let candles = self
            .klines(symbol, "1m", Some(window.start), window.end, window.limit)
            .await
            .with_context(|| format!("Failed to fetch historical klines for {}", symbol))?;
        Ok(candles.last().map(|c| c.close))
    }

    async fn recent_candles(&self, symbol: &str, timeframe: &str, count: u32) -> Result<Vec<Candle>> {
        let candles = self
            .klines(symbol, timeframe, None, None, count)
            .await
            .with_context(|| format!("Failed to fetch {} klines for {}", timeframe, symbol))?;
        Ok(candles)
    }
}

/// Binance ticker/price response
#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

/// Read a price cell that may be a JSON string or number
fn decimal_cell(cell: &Value) -> Option<Decimal> {
    match cell {
        Value::String(s) => parse_decimal(s),
        Value::Number(n) => parse_decimal(&n.to_string()),
        _ => None,
    }
}

fn time_cell(cell: &Value) -> Option<DateTime<Utc>> {
    let millis = match cell {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_millis_opt(millis).single()
}

/// Convert raw kline rows into candles, oldest first
pub fn parse_klines(rows: &[Vec<Value>]) -> Vec<Candle> {
    rows.iter()
        .filter_map(|row| {
            if row.len() < 5 {
                return None;
            }
            Some(Candle {
                open_time: time_cell(&row[0])?,
                high: decimal_cell(&row[2])?,
                low: decimal_cell(&row[3])?,
                close: decimal_cell(&row[4])?,
            })
        })
        .collect()
}
