//! Upbit signed order-history client
//!
//! Upbit has no per-fill endpoint with numeric ids, so completed orders from
//! `GET /v1/orders/closed` are read instead. History is walked backwards in
//! 7-day windows (the widest range the endpoint accepts), paging each window
//! until a short page.
//!
//! Requests carry a JWT (HS512) whose `query_hash` claim is the SHA-512 of the
//! exact query string sent.

use super::backoff::{send_with_backoff, FeedError, RateLimitPolicy};
use super::venue::{TradeCursor, VenueTrade, VenueTradeClient};
use crate::models::{Exchange, TradeSide, VenueCredential, ALL_MARKETS};
use crate::utils::parse_decimal;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Url};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256, Sha512};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha512 = Hmac<Sha512>;

pub const BASE_URL: &str = "https://api.upbit.com";
const MAX_PAGE_SIZE: u32 = 1000;
const MAX_PAGES_PER_WINDOW: u32 = 50;
const WINDOW_DAYS: i64 = 7;
/// Consecutive empty windows after which older history is assumed empty
const MAX_EMPTY_WINDOWS: u32 = 12;
/// Oldest history read when the cursor carries no start time
const MAX_HISTORY_DAYS: i64 = 3650;

pub struct UpbitTradeClient {
    client: Client,
    base_url: String,
    policy: RateLimitPolicy,
}

impl UpbitTradeClient {
    pub fn new(timeout: Duration, policy: RateLimitPolicy) -> Result<Self> {
        Self::with_base_url(BASE_URL, timeout, policy)
    }

    pub fn with_base_url(base_url: &str, timeout: Duration, policy: RateLimitPolicy) -> Result<Self> {
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

    #[allow(clippy::too_many_arguments)]
    async fn fetch_page(
        &self,
        key: &HmacSha512,
        credential: &VenueCredential,
        market: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<ClosedOrder>> {
        let base = Url::parse(&format!("{}/v1/orders/closed", self.base_url))
            .context("Invalid Upbit endpoint URL")?;
        let url = orders_url(&base, market, start, end, page, limit);
        let query_hash = sha512_hex(url.query().unwrap_or_default());

        let response = send_with_backoff(&self.policy, "orders/closed", || {
            // Upbit rejects a reused nonce, so every attempt signs afresh
            let token = jwt(key, &credential.api_key, &query_hash, &Uuid::new_v4().to_string());
            self.client.get(url.clone()).bearer_auth(token)
        })
        .await
        .with_context(|| format!("Failed to fetch Upbit orders page {}", page))?;

        let orders = response
            .json::<Vec<ClosedOrder>>()
            .await
            .map_err(|e| FeedError::Decode {
                endpoint: "orders/closed".to_string(),
                reason: e.to_string(),
            })?;
        Ok(orders)
    }
}

#[async_trait]
impl VenueTradeClient for UpbitTradeClient {
    async fn list_trades(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        cursor: TradeCursor,
        limit: u32,
    ) -> Result<Vec<VenueTrade>> {
        let market = upbit_market(symbol).ok_or_else(|| anyhow!("unsupported Upbit symbol {}", symbol))?;
        let market = (market != ALL_MARKETS).then_some(market);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let key = signing_key(&credential.api_secret)?;

        let now = Utc::now();
        let oldest = match cursor {
            TradeCursor::Since(since) => since,
            TradeCursor::FromId(_) => now - ChronoDuration::days(MAX_HISTORY_DAYS),
        };

        let mut seen = HashSet::new();
        let mut trades = Vec::new();
        let mut empty_windows = 0;
        let mut window_end = now;
        while window_end > oldest {
            let window_start = (window_end - ChronoDuration::days(WINDOW_DAYS)).max(oldest);
            let mut window_orders = 0;
            for page in 1..=MAX_PAGES_PER_WINDOW {
                let orders = self
                    .fetch_page(&key, credential, market.as_deref(), window_start, window_end, page, limit)
                    .await?;
                window_orders += orders.len();
                let last_page = orders.len() < limit as usize;
                trades.extend(orders_to_fills(orders, oldest, &mut seen));
                if last_page {
                    break;
                }
            }

            if window_orders == 0 {
                empty_windows += 1;
                if empty_windows >= MAX_EMPTY_WINDOWS {
                    debug!(
                        "Stopping Upbit history walk for user {} at {} after {} empty windows",
                        credential.user_id, window_start, empty_windows
                    );
                    break;
                }
            } else {
                empty_windows = 0;
            }
            window_end = window_start;
        }

        debug!(
            "Fetched {} Upbit fills for {} since {} (user {})",
            trades.len(),
            symbol,
            oldest,
            credential.user_id
        );
        trades.sort_by_key(|t| t.executed_at);
        Ok(trades)
    }

    fn supports(&self, exchange: Exchange) -> bool {
        exchange == Exchange::Upbit
    }
}

// ============================================================================
// Signing
// ============================================================================

pub fn signing_key(secret: &str) -> Result<HmacSha512> {
    HmacSha512::new_from_slice(secret.as_bytes()).map_err(|e| anyhow!("failed to create signing key: {}", e))
}

pub fn sha512_hex(payload: &str) -> String {
    hex::encode(Sha512::digest(payload.as_bytes()))
}

/// HS512 JWT carrying the access key, a one-time nonce and the query hash
pub fn jwt(key: &HmacSha512, access_key: &str, query_hash: &str, nonce: &str) -> String {
    let header = json!({ "alg": "HS512", "typ": "JWT" });
    let claims = json!({
        "access_key": access_key,
        "nonce": nonce,
        "query_hash": query_hash,
        "query_hash_alg": "SHA512",
    });
    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );
    let mut mac = key.clone();
    mac.update(signing_input.as_bytes());
    format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

fn orders_url(
    base: &Url,
    market: Option<&str>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    page: u32,
    limit: u32,
) -> Url {
    let mut url = base.clone();
    {
        let mut pairs = url.query_pairs_mut();
        if let Some(market) = market {
            pairs.append_pair("market", market);
        }
        pairs
            .append_pair("state", "done")
            .append_pair("order_by", "desc")
            .append_pair("limit", &limit.to_string())
            .append_pair("page", &page.to_string())
            .append_pair("start_time", &start.timestamp_millis().to_string())
            .append_pair("end_time", &end.timestamp_millis().to_string());
    }
    url
}

// ============================================================================
// Symbols
// ============================================================================

/// Upbit market code for a symbol: `BTC/KRW` and `BTCKRW` become `KRW-BTC`.
/// Codes already in `QUOTE-BASE` form pass through.
pub fn upbit_market(symbol: &str) -> Option<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return None;
    }
    if symbol == ALL_MARKETS || symbol.contains('-') {
        return Some(symbol);
    }
    if let Some((base, quote)) = symbol.split_once('/') {
        if base.is_empty() || quote.is_empty() || quote.contains('/') {
            return None;
        }
        return Some(format!("{}-{}", quote, base));
    }
    symbol
        .strip_suffix("KRW")
        .filter(|base| !base.is_empty())
        .map(|base| format!("KRW-{}", base))
}

/// Journal symbol for a market code: `KRW-BTC` becomes `BTCKRW`
pub fn internal_symbol(market: &str) -> String {
    let market = market.trim().to_uppercase();
    match market.split('-').collect::<Vec<_>>().as_slice() {
        [quote, base] => format!("{}{}", base, quote),
        _ => market,
    }
}

// ============================================================================
// Orders
// ============================================================================

/// `/v1/orders/closed` row
#[derive(Debug, Deserialize)]
struct ClosedOrder {
    uuid: String,
    side: String,
    #[serde(default)]
    price: Option<String>,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    funds: Option<String>,
    state: String,
    market: String,
    created_at: String,
    #[serde(default)]
    executed_volume: Option<String>,
    #[serde(default)]
    executed_fund: Option<String>,
    #[serde(default)]
    executed_funds: Option<String>,
    #[serde(default)]
    trades: Vec<OrderFill>,
}

#[derive(Debug, Deserialize)]
struct OrderFill {
    price: String,
    volume: String,
}

fn positive(value: Option<&str>) -> Option<Decimal> {
    value.and_then(parse_decimal).filter(|v| v.is_sign_positive() && !v.is_zero())
}

impl ClosedOrder {
    /// Order price, else average, else executed funds over volume, else the
    /// volume-weighted mean of its fills
    fn fill_price(&self, quantity: Decimal) -> Option<Decimal> {
        let per_unit = |funds: Option<&str>| {
            positive(funds)
                .and_then(|f| f.checked_div(quantity))
                .map(|p| p.round_dp(8).normalize())
        };
        positive(self.price.as_deref())
            .or_else(|| positive(self.avg_price.as_deref()))
            .or_else(|| per_unit(self.executed_funds.as_deref()))
            .or_else(|| per_unit(self.executed_fund.as_deref()))
            .or_else(|| per_unit(self.funds.as_deref()))
            .or_else(|| self.weighted_fill_price())
    }

    fn weighted_fill_price(&self) -> Option<Decimal> {
        let (notional, volume) = self
            .trades
            .iter()
            .filter_map(|t| Some((positive(Some(t.price.as_str()))?, positive(Some(t.volume.as_str()))?)))
            .fold((Decimal::ZERO, Decimal::ZERO), |(n, v), (price, volume)| {
                (n + price * volume, v + volume)
            });
        notional.checked_div(volume).map(|p| p.round_dp(8).normalize())
    }

    fn side(&self) -> Option<TradeSide> {
        match self.side.trim().to_uppercase().as_str() {
            "BID" | "BUY" => Some(TradeSide::Buy),
            "ASK" | "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

/// Stable positive id derived from the order's identity
fn order_trade_id(uuid: &str, market: &str, side: TradeSide, created_at: &str) -> i64 {
    let digest = Sha256::digest(format!("{}|{}|{}|{}", uuid, market, side, created_at).as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(head).checked_abs().unwrap_or(i64::MAX)
}

/// Completed orders executed at or after `since`, one fill per order and side
fn orders_to_fills(orders: Vec<ClosedOrder>, since: DateTime<Utc>, seen: &mut HashSet<String>) -> Vec<VenueTrade> {
    let mut fills = Vec::with_capacity(orders.len());
    for order in orders {
        if order.state != "done" {
            continue;
        }
        let created_at = match DateTime::parse_from_rfc3339(order.created_at.trim()) {
            Ok(t) => t,
            Err(_) => {
                debug!("Skipping Upbit order {} with unreadable time {}", order.uuid, order.created_at);
                continue;
            }
        };
        let executed_at = created_at.with_timezone(&Utc);
        if executed_at < since {
            continue;
        }
        let Some(quantity) = positive(order.executed_volume.as_deref()) else {
            continue;
        };
        let Some(price) = order.fill_price(quantity) else {
            warn!("Skipping Upbit order {} on {}: no usable price", order.uuid, order.market);
            continue;
        };
        let Some(side) = order.side() else {
            debug!("Skipping Upbit order {} with side {}", order.uuid, order.side);
            continue;
        };
        if !seen.insert(format!("{}|{}", order.uuid, side)) {
            continue;
        }

        let stamp = created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        fills.push(VenueTrade {
            external_id: order_trade_id(&order.uuid, &order.market, side, &stamp),
            symbol: internal_symbol(&order.market),
            side,
            quantity,
            price,
            realized_pnl: None,
            executed_at,
        });
    }
    fills
}
