//! Price Feed Trait
//!
//! Common interface for the market-data sources used by alert evaluation and
//! outcome calculation. "No data yet" is a normal answer (`Ok(None)` or an
//! empty candle list), not an error.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One OHLC candle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Candle {
    /// High-low range
    pub fn range(&self) -> Decimal {
        self.high - self.low
    }
}

/// Time window for a historical close lookup over 1-minute candles.
///
/// The close reported is that of the last candle returned in the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandleWindow {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub limit: u32,
}

impl CandleWindow {
    /// The single candle opening at `start`
    pub fn starting(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: None,
            limit: 1,
        }
    }

    /// The minute `[target, target + 1m]`
    pub fn at_minute(target: DateTime<Utc>) -> Self {
        Self {
            start: target,
            end: Some(target + Duration::minutes(1)),
            limit: 1,
        }
    }

    /// `[target - span, target]`, up to `limit` candles
    pub fn lookback(target: DateTime<Utc>, span: Duration, limit: u32) -> Self {
        Self {
            start: target - span,
            end: Some(target),
            limit,
        }
    }
}

/// Market-data source for current and historical prices
///
/// Implementations must be Send + Sync for use from spawned scheduler tasks.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Feed name for logs
    fn name(&self) -> &str;

    /// Latest traded price
    async fn current_price(&self, symbol: &str) -> Result<Decimal>;

    /// Close of the last 1-minute candle inside `window`, `None` when the feed
    /// has no candle there yet
    async fn historical_close(&self, symbol: &str, window: CandleWindow) -> Result<Option<Decimal>>;

    /// Most recent `count` candles of `timeframe`, oldest first; the last one
    /// is the candle still in progress
    async fn recent_candles(&self, symbol: &str, timeframe: &str, count: u32) -> Result<Vec<Candle>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_windows() {
        let target = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let exact = CandleWindow::at_minute(target);
        assert_eq!(exact.end, Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 0).unwrap()));
        assert_eq!(exact.limit, 1);

        let fallback = CandleWindow::lookback(target, Duration::minutes(5), 5);
        assert_eq!(fallback.start, Utc.with_ymd_and_hms(2024, 5, 1, 11, 55, 0).unwrap());
        assert_eq!(fallback.end, Some(target));

        assert_eq!(CandleWindow::starting(target).end, None);
    }
}
