//! Storage ports used by the reconciliation schedulers.
//!
//! Each scheduler depends only on the traits it needs, so tests can supply an
//! in-memory store and production wires [`crate::db::PgStore`].

use crate::models::{
    AiOpinion, AiOpinionAccuracy, Alert, AlertOutcome, AlertRule, Bubble, CheckState, Exchange,
    Outcome, PendingAlertDecision, PendingOutcomeBubble, Trade, TradeSyncState, UserSymbol,
    VenueCredential,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait AlertRuleRepository: Send + Sync {
    /// Enabled rules across all users
    async fn list_all_active(&self) -> Result<Vec<AlertRule>>;

    async fn update_check_state(&self, rule_id: Uuid, state: &CheckState) -> Result<()>;

    /// Record a firing: stamps `last_triggered_at` and stores the new check state
    async fn update_last_triggered(
        &self,
        rule_id: Uuid,
        triggered_at: DateTime<Utc>,
        state: &CheckState,
    ) -> Result<()>;
}

#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn create(&self, alert: &Alert) -> Result<()>;

    /// Move pending and briefed alerts created before `cutoff` to expired.
    /// Returns the number of alerts changed.
    async fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait OutcomeRepository: Send + Sync {
    /// Journal entries with `candle_time <= cutoff` lacking an outcome for
    /// `period`, oldest first
    async fn list_pending(
        &self,
        period: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingOutcomeBubble>>;

    /// Insert unless an outcome for (bubble, period) exists. Returns whether a
    /// row was written.
    async fn create_if_not_exists(&self, outcome: &Outcome) -> Result<bool>;

    /// Outcomes calculated since `since` that have at least one opinion on the
    /// bubble and no accuracy record yet, oldest first
    async fn list_recent_without_accuracy(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Outcome>>;
}

#[async_trait]
pub trait AlertOutcomeRepository: Send + Sync {
    /// Decided alerts whose decision happened at or before `cutoff` and that
    /// lack an outcome for `period`
    async fn list_pending_decisions(
        &self,
        period: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingAlertDecision>>;

    async fn create_if_not_exists(&self, outcome: &AlertOutcome) -> Result<bool>;
}

#[async_trait]
pub trait AiOpinionRepository: Send + Sync {
    async fn list_by_bubble(&self, bubble_id: Uuid) -> Result<Vec<AiOpinion>>;
}

#[async_trait]
pub trait AccuracyRepository: Send + Sync {
    async fn exists_by_opinion_and_outcome(&self, opinion_id: Uuid, outcome_id: Uuid) -> Result<bool>;

    /// Conflict-ignoring insert keyed by (opinion, outcome)
    async fn create(&self, accuracy: &AiOpinionAccuracy) -> Result<bool>;
}

#[async_trait]
pub trait TradeSyncStateRepository: Send + Sync {
    async fn get(&self, user_id: Uuid, exchange: &str, symbol: &str) -> Result<Option<TradeSyncState>>;

    /// Store the cursor. A stored `last_trade_id` never decreases.
    async fn upsert(&self, state: &TradeSyncState) -> Result<()>;
}

#[async_trait]
pub trait UserSymbolRepository: Send + Sync {
    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<UserSymbol>>;

    async fn create(&self, symbol: &UserSymbol) -> Result<()>;
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    /// Credentials with usable keys for `exchange`
    async fn list_valid(&self, exchange: Exchange) -> Result<Vec<VenueCredential>>;
}

/// Result of the paired journal-entry + trade insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairedInsertOutcome {
    Inserted,
    /// The trade was already imported; nothing was written
    Duplicate,
}

#[async_trait]
pub trait TradeJournalRepository: Send + Sync {
    /// Write the bubble and its trade atomically, or neither when the trade is
    /// already known.
    async fn insert_trade_with_bubble(&self, bubble: &Bubble, trade: &Trade) -> Result<PairedInsertOutcome>;
}
