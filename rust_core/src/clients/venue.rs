//! Exchange trade-history port

use crate::models::{Exchange, TradeSide, VenueCredential};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// Where a trade-history page starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeCursor {
    /// Trades with id >= the given id
    FromId(i64),
    /// Trades executed at or after the given time
    Since(DateTime<Utc>),
}

/// A fill as reported by the exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VenueTrade {
    pub external_id: i64,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    /// Futures only
    pub realized_pnl: Option<Decimal>,
    pub executed_at: DateTime<Utc>,
}

/// Authenticated trade-history source for one or more exchanges
#[async_trait]
pub trait VenueTradeClient: Send + Sync {
    /// The credential owner's fills for `symbol` starting at `cursor`.
    ///
    /// Id-cursored venues return one page ascending by id. Time-cursored
    /// venues return everything since the cursor, ascending by execution time.
    async fn list_trades(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        cursor: TradeCursor,
        limit: u32,
    ) -> Result<Vec<VenueTrade>>;

    fn supports(&self, _exchange: Exchange) -> bool {
        true
    }
}

/// Dispatches each request to the client registered for the credential's
/// exchange
#[derive(Default, Clone)]
pub struct VenueRouter {
    clients: HashMap<Exchange, Arc<dyn VenueTradeClient>>,
}

impl VenueRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, exchange: Exchange, client: Arc<dyn VenueTradeClient>) -> Self {
        self.clients.insert(exchange, client);
        self
    }
}

#[async_trait]
impl VenueTradeClient for VenueRouter {
    async fn list_trades(
        &self,
        credential: &VenueCredential,
        symbol: &str,
        cursor: TradeCursor,
        limit: u32,
    ) -> Result<Vec<VenueTrade>> {
        let client = self
            .clients
            .get(&credential.exchange)
            .ok_or_else(|| anyhow!("no trade client for {}", credential.exchange))?;
        client.list_trades(credential, symbol, cursor, limit).await
    }

    fn supports(&self, exchange: Exchange) -> bool {
        self.clients.get(&exchange).is_some_and(|c| c.supports(exchange))
    }
}
