//! Alert rule configuration payloads and persisted check state.
//!
//! Rules keep a small JSON blob between evaluation cycles:
//! `{"last_price": "...", "was_above_ma": bool, "was_above_level": bool}` with
//! absent fields omitted. [`CheckState`] is that blob; [`RuleState`] is the typed
//! view the evaluator works with, one variant per rule family.

use super::RuleType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stored check-state blob
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub was_above_ma: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub was_above_level: Option<bool>,
}

impl CheckState {
    /// Decode a stored blob. Unreadable blobs count as "no prior state".
    pub fn from_json(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Typed check state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleState {
    /// price_change and volatility_spike: only the last observed price
    Plain { last_price: Option<Decimal> },
    /// price_level crossing memory
    Level {
        last_price: Option<Decimal>,
        was_above: Option<bool>,
    },
    /// ma_cross crossing memory
    MovingAverage {
        last_price: Option<Decimal>,
        was_above: Option<bool>,
    },
}

impl RuleState {
    /// State before a rule has ever been evaluated
    pub fn initial(rule_type: RuleType) -> Self {
        Self::from_stored(rule_type, &CheckState::default())
    }

    pub fn from_stored(rule_type: RuleType, stored: &CheckState) -> Self {
        match rule_type {
            RuleType::PriceLevel => RuleState::Level {
                last_price: stored.last_price,
                was_above: stored.was_above_level,
            },
            RuleType::MaCross => RuleState::MovingAverage {
                last_price: stored.last_price,
                was_above: stored.was_above_ma,
            },
            RuleType::PriceChange | RuleType::VolatilitySpike => RuleState::Plain {
                last_price: stored.last_price,
            },
        }
    }

    /// State after observing `price`, carrying `was_above` for crossing rules
    pub fn observed(rule_type: RuleType, price: Decimal, was_above: Option<bool>) -> Self {
        let last_price = Some(price);
        match rule_type {
            RuleType::PriceLevel => RuleState::Level {
                last_price,
                was_above,
            },
            RuleType::MaCross => RuleState::MovingAverage {
                last_price,
                was_above,
            },
            RuleType::PriceChange | RuleType::VolatilitySpike => RuleState::Plain { last_price },
        }
    }

    pub fn to_stored(&self) -> CheckState {
        match *self {
            RuleState::Plain { last_price } => CheckState {
                last_price,
                ..Default::default()
            },
            RuleState::Level {
                last_price,
                was_above,
            } => CheckState {
                last_price,
                was_above_level: was_above,
                ..Default::default()
            },
            RuleState::MovingAverage {
                last_price,
                was_above,
            } => CheckState {
                last_price,
                was_above_ma: was_above,
                ..Default::default()
            },
        }
    }

    /// Crossing memory, if this state carries any
    pub fn was_above(&self) -> Option<bool> {
        match self {
            RuleState::Plain { .. } => None,
            RuleState::Level { was_above, .. } | RuleState::MovingAverage { was_above, .. } => {
                *was_above
            }
        }
    }

    pub fn last_price(&self) -> Option<Decimal> {
        match self {
            RuleState::Plain { last_price }
            | RuleState::Level { last_price, .. }
            | RuleState::MovingAverage { last_price, .. } => *last_price,
        }
    }
}

// ============================================================================
// Rule configuration payloads
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDirection {
    Drop,
    Rise,
    #[default]
    #[serde(other)]
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdType {
    Percent,
    #[default]
    #[serde(other)]
    Absolute,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceChangeConfig {
    #[serde(default)]
    pub direction: ChangeDirection,
    #[serde(default)]
    pub threshold_type: ThresholdType,
    pub threshold_value: Decimal,
    /// "1h" | "4h" | "24h"
    #[serde(default)]
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelDirection {
    /// Fires every cycle the price is at or above the level
    Gte,
    /// Fires every cycle the price is below the level
    Lte,
    /// Fires once when the price crosses up through the level
    Above,
    /// Fires once when the price crosses down through the level
    Below,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PriceLevelConfig {
    pub price: Decimal,
    pub direction: LevelDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossDirection {
    Above,
    Below,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MaCrossConfig {
    pub ma_period: u32,
    pub ma_timeframe: String,
    pub direction: CrossDirection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VolatilitySpikeConfig {
    #[serde(default)]
    pub timeframe: String,
    pub multiplier: Decimal,
}

impl VolatilitySpikeConfig {
    pub fn timeframe_or_default(&self) -> &str {
        if self.timeframe.trim().is_empty() {
            "1h"
        } else {
            self.timeframe.trim()
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleConfigError {
    #[error("malformed {rule_type} config: {source}")]
    Malformed {
        rule_type: RuleType,
        #[source]
        source: serde_json::Error,
    },
    #[error("ma_period must be at least 1")]
    InvalidPeriod,
}

/// Parsed configuration, tagged by rule type
#[derive(Debug, Clone, PartialEq)]
pub enum RuleConfig {
    PriceChange(PriceChangeConfig),
    PriceLevel(PriceLevelConfig),
    MaCross(MaCrossConfig),
    VolatilitySpike(VolatilitySpikeConfig),
}

impl RuleConfig {
    pub fn parse(rule_type: RuleType, raw: &serde_json::Value) -> Result<Self, RuleConfigError> {
        let malformed = |source| RuleConfigError::Malformed { rule_type, source };
        Ok(match rule_type {
            RuleType::PriceChange => {
                RuleConfig::PriceChange(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            RuleType::PriceLevel => {
                RuleConfig::PriceLevel(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
            RuleType::MaCross => {
                let cfg: MaCrossConfig = serde_json::from_value(raw.clone()).map_err(malformed)?;
                if cfg.ma_period == 0 {
                    return Err(RuleConfigError::InvalidPeriod);
                }
                RuleConfig::MaCross(cfg)
            }
            RuleType::VolatilitySpike => {
                RuleConfig::VolatilitySpike(serde_json::from_value(raw.clone()).map_err(malformed)?)
            }
        })
    }
}
