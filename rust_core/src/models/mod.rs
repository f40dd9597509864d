// Shared models for the kifu reconciliation services
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub mod check_state;
pub mod timeframe;

pub use check_state::{CheckState, RuleConfig, RuleConfigError, RuleState};
pub use timeframe::Horizon;

// ============================================================================
// Alert Rules & Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    PriceChange,
    MaCross,
    PriceLevel,
    VolatilitySpike,
}

impl RuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::PriceChange => "price_change",
            RuleType::MaCross => "ma_cross",
            RuleType::PriceLevel => "price_level",
            RuleType::VolatilitySpike => "volatility_spike",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "price_change" => Some(RuleType::PriceChange),
            "ma_cross" => Some(RuleType::MaCross),
            "price_level" => Some(RuleType::PriceLevel),
            "volatility_spike" => Some(RuleType::VolatilitySpike),
            _ => None,
        }
    }

    /// Crossing rules need their check state saved on every cycle, not only
    /// when they fire.
    pub fn is_crossing(&self) -> bool {
        matches!(self, RuleType::PriceLevel | RuleType::MaCross)
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-defined market condition evaluated by the alert scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub symbol: String,
    pub rule_type: RuleType,
    /// Type-specific payload, parsed lazily by [`RuleConfig::parse`]
    pub config: serde_json::Value,
    pub cooldown_minutes: i32,
    pub enabled: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_check_state: Option<CheckState>,
}

impl AlertRule {
    /// True once `now` is strictly past `last_triggered_at + cooldown`.
    pub fn cooldown_passed(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered_at {
            None => true,
            Some(last) => now > last + Duration::minutes(self.cooldown_minutes as i64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Normal,
    Urgent,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Normal => "normal",
            AlertSeverity::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Briefed,
    Decided,
    Expired,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Briefed => "briefed",
            AlertStatus::Decided => "decided",
            AlertStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(AlertStatus::Pending),
            "briefed" => Some(AlertStatus::Briefed),
            "decided" => Some(AlertStatus::Decided),
            "expired" => Some(AlertStatus::Expired),
            _ => None,
        }
    }
}

/// One firing of an alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub user_id: Uuid,
    pub rule_id: Uuid,
    pub symbol: String,
    pub trigger_price: Decimal,
    pub trigger_reason: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn pending(
        rule: &AlertRule,
        trigger_price: Decimal,
        reason: String,
        severity: AlertSeverity,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: rule.user_id,
            rule_id: rule.id,
            symbol: rule.symbol.clone(),
            trigger_price,
            trigger_reason: reason,
            severity,
            status: AlertStatus::Pending,
            created_at: now,
        }
    }
}

// ============================================================================
// Journal Entries & Trades
// ============================================================================

/// Journal marker tied to a symbol, candle and price
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bubble {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub timeframe: String,
    pub candle_time: DateTime<Utc>,
    pub price: Decimal,
    pub bubble_type: String,
    pub memo: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An executed trade imported from a venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bubble_id: Option<Uuid>,
    pub exchange: String,
    /// Venue-assigned trade id; unique per (user, exchange, symbol)
    pub external_trade_id: i64,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub trade_time: DateTime<Utc>,
}

/// Incremental sync cursor per (user, exchange, symbol)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSyncState {
    pub user_id: Uuid,
    pub exchange: String,
    pub symbol: String,
    pub last_trade_id: i64,
    pub last_sync_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSymbol {
    pub id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub timeframe_default: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    BinanceFutures,
    BinanceSpot,
    Upbit,
}

/// How a venue's trade history is resumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// Monotonic numeric trade ids; the cursor is the highest id seen
    TradeId,
    /// Time windows; the cursor is the latest execution time in epoch millis
    ExecutionTime,
}

impl Exchange {
    pub const SUPPORTED: [Exchange; 3] = [Exchange::BinanceFutures, Exchange::BinanceSpot, Exchange::Upbit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::BinanceFutures => "binance_futures",
            Exchange::BinanceSpot => "binance_spot",
            Exchange::Upbit => "upbit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "binance_futures" => Some(Exchange::BinanceFutures),
            "binance_spot" => Some(Exchange::BinanceSpot),
            "upbit" => Some(Exchange::Upbit),
            _ => None,
        }
    }

    pub fn cursor_kind(&self) -> CursorKind {
        match self {
            Exchange::BinanceFutures | Exchange::BinanceSpot => CursorKind::TradeId,
            Exchange::Upbit => CursorKind::ExecutionTime,
        }
    }

    /// Symbol watched for users who have none yet
    pub fn default_symbol(&self) -> &'static str {
        match self {
            Exchange::BinanceFutures | Exchange::BinanceSpot => "BTCUSDT",
            Exchange::Upbit => "KRW-BTC",
        }
    }

    /// Venues whose history is fetched across every market in one request
    /// report under this pseudo-symbol instead of per watched symbol.
    pub fn market_wide_symbol(&self) -> Option<&'static str> {
        match self {
            Exchange::Upbit => Some(ALL_MARKETS),
            _ => None,
        }
    }
}

/// Pseudo-symbol for a market-wide trade history sync
pub const ALL_MARKETS: &str = "ALL_MARKETS";

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Usable API keys for one user on one exchange
#[derive(Clone)]
pub struct VenueCredential {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: Exchange,
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for VenueCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VenueCredential")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("exchange", &self.exchange)
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Forward return of a journal entry at one horizon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub id: Uuid,
    pub bubble_id: Uuid,
    pub period: String,
    pub reference_price: Decimal,
    pub outcome_price: Decimal,
    pub pnl_percent: Decimal,
    pub calculated_at: DateTime<Utc>,
}

/// Forward return of an alert decision at one horizon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertOutcome {
    pub id: Uuid,
    pub alert_id: Uuid,
    pub decision_id: Uuid,
    pub period: String,
    pub reference_price: Decimal,
    pub outcome_price: Decimal,
    pub pnl_percent: Decimal,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PendingOutcomeBubble {
    pub bubble_id: Uuid,
    pub symbol: String,
    pub candle_time: DateTime<Utc>,
    pub price: Decimal,
}

#[derive(Debug, Clone)]
pub struct PendingAlertDecision {
    pub alert_id: Uuid,
    pub decision_id: Uuid,
    pub symbol: String,
    pub trigger_price: Decimal,
    pub decision_time: DateTime<Utc>,
}

// ============================================================================
// AI Opinions & Accuracy
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiOpinion {
    pub id: Uuid,
    pub bubble_id: Uuid,
    pub provider: String,
    pub model: String,
    pub response: String,
}

/// Predicted (BUY/SELL/HOLD) and realized (UP/DOWN/NEUTRAL) directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
    Up,
    Down,
    Neutral,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Neutral => "NEUTRAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BUY" => Some(Direction::Buy),
            "SELL" => Some(Direction::Sell),
            "HOLD" => Some(Direction::Hold),
            "UP" => Some(Direction::Up),
            "DOWN" => Some(Direction::Down),
            "NEUTRAL" => Some(Direction::Neutral),
            _ => None,
        }
    }

    /// BUY pairs with UP, SELL with DOWN, HOLD with NEUTRAL.
    pub fn is_correct(predicted: Direction, actual: Direction) -> bool {
        matches!(
            (predicted, actual),
            (Direction::Buy, Direction::Up)
                | (Direction::Sell, Direction::Down)
                | (Direction::Hold, Direction::Neutral)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiOpinionAccuracy {
    pub id: Uuid,
    pub opinion_id: Uuid,
    pub outcome_id: Uuid,
    pub bubble_id: Uuid,
    pub provider: String,
    pub period: String,
    pub predicted_direction: Direction,
    pub actual_direction: Direction,
    pub is_correct: bool,
    pub created_at: DateTime<Utc>,
}
