//! In-memory fakes for the storage ports, the price feed and the venue

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kifu_rust_core::clients::{Candle, CandleWindow, PriceFeed, TradeCursor, VenueTrade, VenueTradeClient};
use kifu_rust_core::models::{
    AiOpinion, AiOpinionAccuracy, Alert, AlertOutcome, AlertRule, AlertStatus, Bubble, CheckState,
    Exchange, Outcome, PendingAlertDecision, PendingOutcomeBubble, Trade, TradeSyncState,
    UserSymbol, VenueCredential, ALL_MARKETS,
};
use kifu_rust_core::repositories::{
    AccuracyRepository, AiOpinionRepository, AlertOutcomeRepository, AlertRepository,
    AlertRuleRepository, CredentialRepository, OutcomeRepository, PairedInsertOutcome,
    TradeJournalRepository, TradeSyncStateRepository, UserSymbolRepository,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use uuid::Uuid;

// ============================================================================
// Storage
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    pub rules: Mutex<Vec<AlertRule>>,
    pub alerts: Mutex<Vec<Alert>>,
    pub bubbles: Mutex<Vec<Bubble>>,
    pub outcomes: Mutex<Vec<Outcome>>,
    pub decisions: Mutex<Vec<PendingAlertDecision>>,
    pub alert_outcomes: Mutex<Vec<AlertOutcome>>,
    pub opinions: Mutex<Vec<AiOpinion>>,
    pub accuracies: Mutex<Vec<AiOpinionAccuracy>>,
    pub sync_states: Mutex<HashMap<(Uuid, String, String), TradeSyncState>>,
    pub symbols: Mutex<Vec<UserSymbol>>,
    pub credentials: Mutex<Vec<VenueCredential>>,
    pub trades: Mutex<Vec<Trade>>,

    pub fail_alert_create: AtomicBool,
    pub fail_journal: AtomicBool,
}

impl MemoryStore {
    pub fn rule(&self, id: Uuid) -> AlertRule {
        self.rules
            .lock()
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .expect("rule exists")
    }

    pub fn cursor(&self, user_id: Uuid, exchange: Exchange, symbol: &str) -> Option<i64> {
        self.sync_states
            .lock()
            .get(&(user_id, exchange.as_str().to_string(), symbol.to_string()))
            .map(|s| s.last_trade_id)
    }
}

#[async_trait]
impl AlertRuleRepository for MemoryStore {
    async fn list_all_active(&self) -> Result<Vec<AlertRule>> {
        Ok(self.rules.lock().iter().filter(|r| r.enabled).cloned().collect())
    }

    async fn update_check_state(&self, rule_id: Uuid, state: &CheckState) -> Result<()> {
        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| anyhow!("rule {} not found", rule_id))?;
        rule.last_check_state = Some(state.clone());
        Ok(())
    }

    async fn update_last_triggered(
        &self,
        rule_id: Uuid,
        triggered_at: DateTime<Utc>,
        state: &CheckState,
    ) -> Result<()> {
        let mut rules = self.rules.lock();
        let rule = rules
            .iter_mut()
            .find(|r| r.id == rule_id)
            .ok_or_else(|| anyhow!("rule {} not found", rule_id))?;
        rule.last_triggered_at = Some(triggered_at);
        rule.last_check_state = Some(state.clone());
        Ok(())
    }
}

#[async_trait]
impl AlertRepository for MemoryStore {
    async fn create(&self, alert: &Alert) -> Result<()> {
        if self.fail_alert_create.load(Ordering::SeqCst) {
            return Err(anyhow!("alerts table unavailable"));
        }
        self.alerts.lock().push(alert.clone());
        Ok(())
    }

    async fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut expired = 0;
        for alert in self.alerts.lock().iter_mut() {
            if matches!(alert.status, AlertStatus::Pending | AlertStatus::Briefed) && alert.created_at < cutoff {
                alert.status = AlertStatus::Expired;
                expired += 1;
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl OutcomeRepository for MemoryStore {
    async fn list_pending(
        &self,
        period: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingOutcomeBubble>> {
        let outcomes = self.outcomes.lock();
        let mut pending: Vec<PendingOutcomeBubble> = self
            .bubbles
            .lock()
            .iter()
            .filter(|b| b.candle_time <= cutoff)
            .filter(|b| !outcomes.iter().any(|o| o.bubble_id == b.id && o.period == period))
            .map(|b| PendingOutcomeBubble {
                bubble_id: b.id,
                symbol: b.symbol.clone(),
                candle_time: b.candle_time,
                price: b.price,
            })
            .collect();
        pending.sort_by_key(|p| p.candle_time);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn create_if_not_exists(&self, outcome: &Outcome) -> Result<bool> {
        let mut outcomes = self.outcomes.lock();
        if outcomes
            .iter()
            .any(|o| o.bubble_id == outcome.bubble_id && o.period == outcome.period)
        {
            return Ok(false);
        }
        outcomes.push(outcome.clone());
        Ok(true)
    }

    async fn list_recent_without_accuracy(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<Outcome>> {
        let opinions = self.opinions.lock();
        let accuracies = self.accuracies.lock();
        let mut recent: Vec<Outcome> = self
            .outcomes
            .lock()
            .iter()
            .filter(|o| o.calculated_at >= since)
            .filter(|o| opinions.iter().any(|op| op.bubble_id == o.bubble_id))
            .filter(|o| !accuracies.iter().any(|a| a.outcome_id == o.id))
            .cloned()
            .collect();
        recent.sort_by_key(|o| o.calculated_at);
        recent.truncate(limit as usize);
        Ok(recent)
    }
}

#[async_trait]
impl AlertOutcomeRepository for MemoryStore {
    async fn list_pending_decisions(
        &self,
        period: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingAlertDecision>> {
        let outcomes = self.alert_outcomes.lock();
        let mut pending: Vec<PendingAlertDecision> = self
            .decisions
            .lock()
            .iter()
            .filter(|d| d.decision_time <= cutoff)
            .filter(|d| !outcomes.iter().any(|o| o.alert_id == d.alert_id && o.period == period))
            .cloned()
            .collect();
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn create_if_not_exists(&self, outcome: &AlertOutcome) -> Result<bool> {
        let mut outcomes = self.alert_outcomes.lock();
        if outcomes
            .iter()
            .any(|o| o.alert_id == outcome.alert_id && o.period == outcome.period)
        {
            return Ok(false);
        }
        outcomes.push(outcome.clone());
        Ok(true)
    }
}

#[async_trait]
impl AiOpinionRepository for MemoryStore {
    async fn list_by_bubble(&self, bubble_id: Uuid) -> Result<Vec<AiOpinion>> {
        Ok(self
            .opinions
            .lock()
            .iter()
            .filter(|o| o.bubble_id == bubble_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccuracyRepository for MemoryStore {
    async fn exists_by_opinion_and_outcome(&self, opinion_id: Uuid, outcome_id: Uuid) -> Result<bool> {
        Ok(self
            .accuracies
            .lock()
            .iter()
            .any(|a| a.opinion_id == opinion_id && a.outcome_id == outcome_id))
    }

    async fn create(&self, accuracy: &AiOpinionAccuracy) -> Result<bool> {
        let mut accuracies = self.accuracies.lock();
        if accuracies
            .iter()
            .any(|a| a.opinion_id == accuracy.opinion_id && a.outcome_id == accuracy.outcome_id)
        {
            return Ok(false);
        }
        accuracies.push(accuracy.clone());
        Ok(true)
    }
}

#[async_trait]
impl TradeSyncStateRepository for MemoryStore {
    async fn get(&self, user_id: Uuid, exchange: &str, symbol: &str) -> Result<Option<TradeSyncState>> {
        Ok(self
            .sync_states
            .lock()
            .get(&(user_id, exchange.to_string(), symbol.to_string()))
            .cloned())
    }

    async fn upsert(&self, state: &TradeSyncState) -> Result<()> {
        let key = (state.user_id, state.exchange.clone(), state.symbol.clone());
        let mut states = self.sync_states.lock();
        let stored = states.entry(key).or_insert_with(|| state.clone());
        stored.last_trade_id = stored.last_trade_id.max(state.last_trade_id);
        stored.last_sync_at = state.last_sync_at;
        Ok(())
    }
}

#[async_trait]
impl UserSymbolRepository for MemoryStore {
    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<UserSymbol>> {
        Ok(self
            .symbols
            .lock()
            .iter()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create(&self, symbol: &UserSymbol) -> Result<()> {
        self.symbols.lock().push(symbol.clone());
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for MemoryStore {
    async fn list_valid(&self, exchange: Exchange) -> Result<Vec<VenueCredential>> {
        Ok(self
            .credentials
            .lock()
            .iter()
            .filter(|c| c.exchange == exchange)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TradeJournalRepository for MemoryStore {
    async fn insert_trade_with_bubble(&self, bubble: &Bubble, trade: &Trade) -> Result<PairedInsertOutcome> {
        if self.fail_journal.load(Ordering::SeqCst) {
            return Err(anyhow!("transaction aborted"));
        }
        let mut trades = self.trades.lock();
        let duplicate = trades.iter().any(|t| {
            t.user_id == trade.user_id
                && t.exchange == trade.exchange
                && t.symbol == trade.symbol
                && t.external_trade_id == trade.external_trade_id
        });
        if duplicate {
            return Ok(PairedInsertOutcome::Duplicate);
        }
        self.bubbles.lock().push(bubble.clone());
        trades.push(trade.clone());
        Ok(PairedInsertOutcome::Inserted)
    }
}

// ============================================================================
// Price feed
// ============================================================================

/// Feed answering from scripted prices, 1-minute closes and candles
#[derive(Default)]
pub struct ScriptedFeed {
    pub prices: Mutex<HashMap<String, Decimal>>,
    /// symbol -> (minute open time, close)
    pub closes: Mutex<HashMap<String, Vec<(DateTime<Utc>, Decimal)>>>,
    pub candles: Mutex<HashMap<String, Vec<Candle>>>,
    pub failing: Mutex<HashSet<String>>,
    pub price_calls: AtomicU32,
}

impl ScriptedFeed {
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().insert(symbol.to_string(), price);
    }

    pub fn add_close(&self, symbol: &str, minute: DateTime<Utc>, close: Decimal) {
        self.closes
            .lock()
            .entry(symbol.to_string())
            .or_default()
            .push((minute, close));
    }

    pub fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.candles.lock().insert(symbol.to_string(), candles);
    }

    pub fn fail(&self, symbol: &str) {
        self.failing.lock().insert(symbol.to_string());
    }
}

#[async_trait]
impl PriceFeed for ScriptedFeed {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn current_price(&self, symbol: &str) -> Result<Decimal> {
        self.price_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(symbol) {
            return Err(anyhow!("feed unavailable for {}", symbol));
        }
        self.prices
            .lock()
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no price for {}", symbol))
    }

    /// Candles opening inside the window, ascending, first `limit` kept;
    /// the close of the last one kept
    async fn historical_close(&self, symbol: &str, window: CandleWindow) -> Result<Option<Decimal>> {
        let end = window.end.unwrap_or(window.start);
        let mut inside: Vec<(DateTime<Utc>, Decimal)> = self
            .closes
            .lock()
            .get(symbol)
            .map(|closes| {
                closes
                    .iter()
                    .filter(|(t, _)| *t >= window.start && *t <= end)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        inside.sort_by_key(|(t, _)| *t);
        inside.truncate(window.limit as usize);
        Ok(inside.last().map(|(_, close)| *close))
    }

    async fn recent_candles(&self, symbol: &str, _timeframe: &str, count: u32) -> Result<Vec<Candle>> {
        let candles = self.candles.lock().get(symbol).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(count as usize);
        Ok(candles.into_iter().skip(skip).collect())
    }
}

// ============================================================================
// Venue
// ============================================================================

/// Venue serving a fixed trade history
#[derive(Default)]
pub struct ScriptedVenue {
    pub history: Mutex<Vec<VenueTrade>>,
    pub calls: Mutex<Vec<(String, TradeCursor, u32)>>,
    /// Serve the same first page whatever the cursor says
    pub ignore_cursor: AtomicBool,
    /// Return pages newest first
    pub descending: AtomicBool,
    /// Exchanges this venue refuses to serve
    pub unsupported: Mutex<Vec<Exchange>>,
}

#[async_trait]
impl VenueTradeClient for ScriptedVenue {
    async fn list_trades(
        &self,
        _credential: &VenueCredential,
        symbol: &str,
        cursor: TradeCursor,
        limit: u32,
    ) -> Result<Vec<VenueTrade>> {
        self.calls.lock().push((symbol.to_string(), cursor, limit));
        let ignore_cursor = self.ignore_cursor.load(Ordering::SeqCst);

        let mut page: Vec<VenueTrade> = self
            .history
            .lock()
            .iter()
            .filter(|t| symbol == ALL_MARKETS || t.symbol == symbol)
            .filter(|t| {
                ignore_cursor
                    || match cursor {
                        TradeCursor::FromId(id) => t.external_id >= id,
                        TradeCursor::Since(since) => t.executed_at >= since,
                    }
            })
            .cloned()
            .collect();
        page.sort_by_key(|t| t.external_id);
        page.truncate(limit as usize);
        if self.descending.load(Ordering::SeqCst) {
            page.reverse();
        }
        Ok(page)
    }

    fn supports(&self, exchange: Exchange) -> bool {
        !self.unsupported.lock().contains(&exchange)
    }
}
