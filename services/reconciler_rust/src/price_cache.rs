//! Short-lived current-price cache shared by alert evaluation

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use kifu_rust_core::clients::PriceFeed;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Clone)]
pub struct PriceCache {
    /// symbol -> (price, fetched_at)
    entries: Arc<RwLock<HashMap<String, (Decimal, DateTime<Utc>)>>>,
    ttl: Duration,
}

impl PriceCache {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(10)),
        }
    }

    /// Cached price if younger than the TTL at `now`
    pub async fn get(&self, symbol: &str, now: DateTime<Utc>) -> Option<Decimal> {
        let entries = self.entries.read().await;
        entries
            .get(symbol)
            .filter(|(_, fetched_at)| now.signed_duration_since(*fetched_at) < self.ttl)
            .map(|(price, _)| *price)
    }

    pub async fn insert(&self, symbol: &str, price: Decimal, fetched_at: DateTime<Utc>) {
        let mut entries = self.entries.write().await;
        entries.insert(symbol.to_string(), (price, fetched_at));
    }

    /// Cached price, or a fresh one from `feed` which is then cached
    pub async fn get_or_fetch(&self, feed: &dyn PriceFeed, symbol: &str) -> Result<Decimal> {
        let now = Utc::now();
        if let Some(price) = self.get(symbol, now).await {
            debug!("Price cache hit for {}", symbol);
            return Ok(price);
        }

        let price = feed.current_price(symbol).await?;
        self.insert(symbol, price, Utc::now()).await;
        Ok(price)
    }

    /// Drop entries past their TTL
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, fetched_at)| now.signed_duration_since(*fetched_at) < self.ttl);
        before - entries.len()
    }
}
