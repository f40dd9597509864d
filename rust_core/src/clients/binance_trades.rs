//! Binance signed trade-history client
//!
//! - Futures: `GET /fapi/v1/userTrades` (has `side` and `realizedPnl`)
//! - Spot: `GET /api/v3/myTrades` (side derived from `isBuyer`)
//!
//! Requests are signed with HMAC-SHA256 over the encoded query string and carry
//! the key in `X-MBX-APIKEY`.

use super::backoff::{send_with_backoff, FeedError, RateLimitPolicy};
use super::venue::{TradeCursor, VenueTrade, VenueTradeClient};
use crate::models::{Exchange, TradeSide, VenueCredential};
use crate::utils::parse_decimal;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

pub const FUTURES_BASE_URL: &str = "https://fapi.binance.com";
pub const SPOT_BASE_URL: &str = "https://api.binance.com";
const RECV_WINDOW_MS: u64 = 5000;
const MAX_PAGE_SIZE: u32 = 1000;

pub struct BinanceTradeClient {
    client: Client,
    futures_base_url: String,
    spot_base_url: String,
    policy: RateLimitPolicy,
}

impl BinanceTradeClient {
    pub fn new(timeout: Duration, policy: RateLimitPolicy) -> Result<Self> {
        Self::with_base_urls(FUTURES_BASE_URL, SPOT_BASE_URL, timeout, policy)
    }

    pub fn with_base_urls(
        futures_base_url: &str,
        spot_base_url: &str,
        timeout: Duration,
        policy: RateLimitPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Kifu/1.0")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            futures_base_url: futures_base_url.trim_end_matches('/').to_string(),
            spot_base_url: spot_base_url.trim_end_matches('/').to_string(),
            policy,
        })
    }

    fn endpoint(&self, exchange: Exchange) -> Result<String> {
        match exchange {
            Exchange::BinanceFutures => Ok(format!("{}/fapi/v1/userTrades", self.futures_base_url)),
            Exchange::BinanceSpot => Ok(format!("{}/api/v3/myTrades", self.spot_base_url)),
            other => Err(anyhow!("{} is not a Binance venue", other)),
        }
    }
}

pub fn signing_key(secret: &str) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow!("failed to create signing key: {}", e))
}

/// Hex-encoded HMAC-SHA256 of `payload`
pub fn sign(key: &HmacSha256, payload: &str) -> String {
    let mut mac = key.clone();
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Signed request URL for one attempt. The timestamp is part of the signed
/// payload, so every retry signs afresh.
fn signed_url(
    base: &Url,
    key: &HmacSha256,
    symbol: &str,
    cursor: TradeCursor,
    limit: u32,
    timestamp_ms: i64,
) -> Url {
    let mut url = base.clone();
    {
        let mut pairs = url.query_pairs_mut();
        pairs
            .append_pair("symbol", symbol)
            .append_pair("timestamp", &timestamp_ms.to_string())
            .append_pair("recvWindow", &RECV_WINDOW_MS.to_string())
            .append_pair("limit", &limit.clamp(1, MAX_PAGE_SIZE).to_string());
        match cursor {
            TradeCursor::FromId(id) => pairs.append_pair("fromId", &id.to_string()),
            TradeCursor::Since(t) => pairs.append_pair("startTime", &t.timestamp_millis().to_string()),
        };
    }
    let signature = sign(key, url.query().unwrap_or_default());
    url.query_pairs_mut().append_pair("signature", &signature);
    url
}

#[async_trait]
impl VenueTradeClient for BinanceTradeClient {
    async fn list_trades(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        cursor: TradeCursor,
        limit: u32,
    ) -> Result<Vec<VenueTrade>> {
        let base = Url::parse(&self.endpoint(credential.exchange)?)
            .context("Invalid Binance endpoint URL")?;
        let endpoint = match credential.exchange {
            Exchange::BinanceFutures => "userTrades",
            _ => "myTrades",
        };
        let key = signing_key(&credential.api_secret)?;

        debug!(
            "Fetching {} trades for {} from {:?} (user {})",
            credential.exchange, symbol, cursor, credential.user_id
        );

        let response = send_with_backoff(&self.policy, endpoint, || {
            let url = signed_url(&base, &key, symbol, cursor, limit, Utc::now().timestamp_millis());
            self.client.get(url).header("X-MBX-APIKEY", &credential.api_key)
        })
        .await
        .with_context(|| format!("Failed to fetch {} trades for {}", credential.exchange, symbol))?;

        let mut trades = match credential.exchange {
            Exchange::BinanceFutures => {
                let rows: Vec<FuturesTrade> = decode(response, endpoint).await?;
                rows.into_iter().filter_map(FuturesTrade::into_venue).collect::<Vec<_>>()
            }
            _ => {
                let rows: Vec<SpotTrade> = decode(response, endpoint).await?;
                rows.into_iter().filter_map(SpotTrade::into_venue).collect::<Vec<_>>()
            }
        };
        trades.sort_by_key(|t| t.external_id);
        Ok(trades)
    }

    fn supports(&self, exchange: Exchange) -> bool {
        matches!(exchange, Exchange::BinanceFutures | Exchange::BinanceSpot)
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    endpoint: &str,
) -> Result<Vec<T>> {
    let rows = response.json::<Vec<T>>().await.map_err(|e| FeedError::Decode {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })?;
    Ok(rows)
}

fn millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// `/fapi/v1/userTrades` row
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FuturesTrade {
    id: i64,
    symbol: String,
    side: String,
    qty: String,
    price: String,
    #[serde(default)]
    realized_pnl: Option<String>,
    time: i64,
}

impl FuturesTrade {
    fn into_venue(self) -> Option<VenueTrade> {
        let parsed = (|| {
            Some(VenueTrade {
                external_id: self.id,
                symbol: self.symbol.clone(),
                side: TradeSide::parse(&self.side)?,
                quantity: parse_decimal(&self.qty)?,
                price: parse_decimal(&self.price)?,
                realized_pnl: self.realized_pnl.as_deref().and_then(parse_decimal),
                executed_at: millis(self.time)?,
            })
        })();
        if parsed.is_none() {
            warn!("Skipping unreadable futures trade {} for {}", self.id, self.symbol);
        }
        parsed
    }
}

/// `/api/v3/myTrades` row
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotTrade {
    id: i64,
    symbol: String,
    price: String,
    qty: String,
    time: i64,
    is_buyer: bool,
}

impl SpotTrade {
    fn into_venue(self) -> Option<VenueTrade> {
        let side = if self.is_buyer {
            TradeSide::Buy
        } else {
            TradeSide::Sell
        };
        let parsed = (|| {
            Some(VenueTrade {
                external_id: self.id,
                symbol: self.symbol.clone(),
                side,
                quantity: parse_decimal(&self.qty)?,
                price: parse_decimal(&self.price)?,
                realized_pnl: None,
                executed_at: millis(self.time)?,
            })
        })();
        if parsed.is_none() {
            warn!("Skipping unreadable spot trade {} for {}", self.id, self.symbol);
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn base(exchange: Exchange) -> Url {
        let client = BinanceTradeClient::new(Duration::from_secs(15), RateLimitPolicy::default()).unwrap();
        Url::parse(&client.endpoint(exchange).unwrap()).unwrap()
    }

    #[test]
    fn test_signature_is_hex_sha256() {
        let key = signing_key("secret").unwrap();
        let signature = sign(&key, "symbol=BTCUSDT&timestamp=1");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature, sign(&key, "symbol=BTCUSDT&timestamp=1"));
        assert_ne!(signature, sign(&signing_key("other").unwrap(), "symbol=BTCUSDT&timestamp=1"));
    }

    #[test]
    fn test_signed_url_futures_from_id() {
        let key = signing_key("secret").unwrap();
        let url = signed_url(
            &base(Exchange::BinanceFutures),
            &key,
            "BTCUSDT",
            TradeCursor::FromId(1051),
            1000,
            1_700_000_000_000,
        );

        assert_eq!(url.path(), "/fapi/v1/userTrades");
        let query = url.query().unwrap();
        assert!(query.starts_with(
            "symbol=BTCUSDT&timestamp=1700000000000&recvWindow=5000&limit=1000&fromId=1051&signature="
        ));

        // Signature covers everything before it
        let (payload, signature) = query.split_once("&signature=").unwrap();
        assert_eq!(signature, sign(&key, payload));
    }

    #[test]
    fn test_signed_url_spot_since() {
        let key = signing_key("secret").unwrap();
        let since = Utc.timestamp_millis_opt(1_699_000_000_000).unwrap();
        let url = signed_url(
            &base(Exchange::BinanceSpot),
            &key,
            "ETHUSDT",
            TradeCursor::Since(since),
            5000,
            1_700_000_000_000,
        );

        assert_eq!(url.host_str(), Some("api.binance.com"));
        assert_eq!(url.path(), "/api/v3/myTrades");
        let query = url.query().unwrap();
        assert!(query.contains("limit=1000"));
        assert!(query.contains("startTime=1699000000000"));
        assert!(!query.contains("fromId"));
    }

    #[test]
    fn test_futures_row_conversion() {
        let row: FuturesTrade = serde_json::from_str(
            r#"{"id": 1050, "symbol": "BTCUSDT", "side": "SELL", "qty": "0.010",
                "price": "64250.5", "realizedPnl": "-1.25", "time": 1700000000000,
                "buyer": false, "maker": true}"#,
        )
        .unwrap();
        let trade = row.into_venue().unwrap();
        assert_eq!(trade.external_id, 1050);
        assert_eq!(trade.side, TradeSide::Sell);
        assert_eq!(trade.quantity, dec!(0.010));
        assert_eq!(trade.realized_pnl, Some(dec!(-1.25)));
    }

    #[test]
    fn test_spot_row_side_from_is_buyer() {
        let row: SpotTrade = serde_json::from_str(
            r#"{"id": 7, "symbol": "ETHUSDT", "price": "3100", "qty": "1.5",
                "time": 1700000000000, "isBuyer": true, "isMaker": false}"#,
        )
        .unwrap();
        let trade = row.into_venue().unwrap();
        assert_eq!(trade.side, TradeSide::Buy);
        assert_eq!(trade.realized_pnl, None);
    }

    #[test]
    fn test_upbit_is_not_a_binance_venue() {
        let client = BinanceTradeClient::new(Duration::from_secs(15), RateLimitPolicy::default()).unwrap();
        assert!(client.endpoint(Exchange::Upbit).is_err());
        assert!(!client.supports(Exchange::Upbit));
        assert!(client.supports(Exchange::BinanceSpot));
    }

    #[test]
    fn test_unreadable_row_skipped() {
        let row: FuturesTrade = serde_json::from_str(
            r#"{"id": 9, "symbol": "BTCUSDT", "side": "HOLD", "qty": "1",
                "price": "1", "time": 1700000000000}"#,
        )
        .unwrap();
        assert!(row.into_venue().is_none());
    }
}
