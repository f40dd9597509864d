//! Rule evaluation
//!
//! Evaluates one alert rule against the current price and the rule's prior
//! check state. Price-level evaluation is pure; price-change, moving-average
//! and volatility rules make one feed call each. Nothing here returns an error:
//! a malformed config or a failed feed call means "no trigger".

use kifu_rust_core::clients::{Candle, CandleWindow, PriceFeed};
use kifu_rust_core::models::check_state::{
    ChangeDirection, CrossDirection, LevelDirection, MaCrossConfig, PriceChangeConfig,
    PriceLevelConfig, ThresholdType, VolatilitySpikeConfig,
};
use kifu_rust_core::models::timeframe::reference_lookback;
use kifu_rust_core::models::{AlertRule, AlertSeverity, RuleConfig, RuleState};
use kifu_rust_core::utils::decimal::{format_decimal, mean, percent_change, variance};
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, warn};

/// |change| at or above this percentage makes a price-change alert urgent
const URGENT_CHANGE_PCT: Decimal = dec!(5);

/// Completed candles used as the volatility baseline
const VOLATILITY_HISTORY: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub reason: String,
    pub severity: AlertSeverity,
}

impl Trigger {
    fn normal(reason: String) -> Self {
        Self {
            reason,
            severity: AlertSeverity::Normal,
        }
    }

    fn urgent(reason: String) -> Self {
        Self {
            reason,
            severity: AlertSeverity::Urgent,
        }
    }
}

/// Outcome of evaluating one rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub trigger: Option<Trigger>,
    /// State to persist for the next cycle
    pub next_state: RuleState,
}

pub struct RuleEvaluator {
    feed: Arc<dyn PriceFeed>,
}

impl RuleEvaluator {
    pub fn new(feed: Arc<dyn PriceFeed>) -> Self {
        Self { feed }
    }

    pub async fn evaluate(
        &self,
        rule: &AlertRule,
        current: Decimal,
        prior: &RuleState,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let config = match RuleConfig::parse(rule.rule_type, &rule.config) {
            Ok(config) => config,
            Err(e) => {
                warn!("Rule {} ({}): {}", rule.id, rule.name, e);
                return Evaluation {
                    trigger: None,
                    next_state: RuleState::observed(rule.rule_type, current, None),
                };
            }
        };

        match config {
            RuleConfig::PriceChange(cfg) => Evaluation {
                trigger: self.price_change(rule, &cfg, current, now).await,
                next_state: RuleState::observed(rule.rule_type, current, None),
            },
            RuleConfig::PriceLevel(cfg) => {
                let is_above = current >= cfg.price;
                Evaluation {
                    trigger: price_level(rule, &cfg, current, prior.was_above(), is_above),
                    next_state: RuleState::observed(rule.rule_type, current, Some(is_above)),
                }
            }
            RuleConfig::MaCross(cfg) => self.ma_cross(rule, &cfg, current, prior).await,
            RuleConfig::VolatilitySpike(cfg) => Evaluation {
                trigger: self.volatility_spike(rule, &cfg).await,
                next_state: RuleState::observed(rule.rule_type, current, None),
            },
        }
    }

    async fn price_change(
        &self,
        rule: &AlertRule,
        cfg: &PriceChangeConfig,
        current: Decimal,
        now: DateTime<Utc>,
    ) -> Option<Trigger> {
        let window = CandleWindow::starting(now - reference_lookback(&cfg.reference));
        let reference = match self.feed.historical_close(&rule.symbol, window).await {
            Ok(Some(price)) => price,
            Ok(None) => {
                debug!("No reference candle for {} ({})", rule.symbol, cfg.reference);
                return None;
            }
            Err(e) => {
                warn!("Reference price fetch failed for {}: {:#}", rule.symbol, e);
                return None;
            }
        };

        let diff = current.checked_sub(reference)?;
        let abs_diff = diff.abs();
        let threshold = match cfg.threshold_type {
            ThresholdType::Percent => reference
                .checked_mul(cfg.threshold_value)?
                .checked_div(Decimal::ONE_HUNDRED)?
                .abs(),
            ThresholdType::Absolute => cfg.threshold_value,
        };
        if abs_diff < threshold {
            return None;
        }

        let is_down = diff < Decimal::ZERO;
        match cfg.direction {
            ChangeDirection::Drop if !is_down => return None,
            ChangeDirection::Rise if is_down => return None,
            _ => {}
        }

        let pct = match percent_change(reference, current) {
            Ok(pct) => pct,
            Err(e) => {
                warn!("Rule {}: {}", rule.id, e);
                return None;
            }
        };
        let reference_label = if cfg.reference.trim().is_empty() {
            "24h"
        } else {
            cfg.reference.trim()
        };
        let reason = format!(
            "{} {} ${} ({}% vs {})",
            rule.symbol,
            if is_down { "fell" } else { "rose" },
            format_decimal(abs_diff, 2),
            format_decimal(pct, 2),
            reference_label
        );

        Some(if pct.abs() >= URGENT_CHANGE_PCT {
            Trigger::urgent(reason)
        } else {
            Trigger::normal(reason)
        })
    }

    async fn ma_cross(
        &self,
        rule: &AlertRule,
        cfg: &MaCrossConfig,
        current: Decimal,
        prior: &RuleState,
    ) -> Evaluation {
        let ma = match self.moving_average(&rule.symbol, &cfg.ma_timeframe, cfg.ma_period).await {
            Some(ma) => ma,
            None => {
                // Keep the crossing memory until the average is available again
                return Evaluation {
                    trigger: None,
                    next_state: RuleState::observed(rule.rule_type, current, prior.was_above()),
                };
            }
        };

        let is_above = current >= ma;
        let next_state = RuleState::observed(rule.rule_type, current, Some(is_above));
        let trigger = crossing(cfg.direction, prior.was_above(), is_above).then(|| {
            Trigger::urgent(format!(
                "{} crossed {} the {}-period {} MA (MA: ${}, now: ${})",
                rule.symbol,
                direction_word(cfg.direction),
                cfg.ma_period,
                cfg.ma_timeframe,
                ma,
                current
            ))
        });

        Evaluation {
            trigger,
            next_state,
        }
    }

    /// Simple moving average of the last `period` closes, rounded to 2 places.
    /// `None` when the feed returns fewer candles than asked for.
    async fn moving_average(&self, symbol: &str, timeframe: &str, period: u32) -> Option<Decimal> {
        let candles = match self.feed.recent_candles(symbol, timeframe, period).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!("Candle fetch for {} {} MA failed: {:#}", symbol, timeframe, e);
                return None;
            }
        };
        if candles.len() < period as usize {
            debug!(
                "Only {} of {} {} candles for {} MA",
                candles.len(),
                period,
                timeframe,
                symbol
            );
            return None;
        }

        let closes: Vec<Decimal> = candles.iter().map(|c| c.close).collect();
        mean(&closes).map(|ma| ma.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }

    async fn volatility_spike(&self, rule: &AlertRule, cfg: &VolatilitySpikeConfig) -> Option<Trigger> {
        let timeframe = cfg.timeframe_or_default();
        let candles = match self
            .feed
            .recent_candles(&rule.symbol, timeframe, (VOLATILITY_HISTORY + 1) as u32)
            .await
        {
            Ok(candles) => candles,
            Err(e) => {
                warn!("Candle fetch for {} {} failed: {:#}", rule.symbol, timeframe, e);
                return None;
            }
        };

        let spike = detect_volatility_spike(&candles, cfg.multiplier)?;
        Some(Trigger::urgent(format!(
            "{} volatility spike ({}, current range ${}, mean ${})",
            rule.symbol,
            timeframe,
            format_decimal(spike.latest_range, 2),
            format_decimal(spike.mean_range, 2)
        )))
    }
}

fn price_level(
    rule: &AlertRule,
    cfg: &PriceLevelConfig,
    current: Decimal,
    was_above: Option<bool>,
    is_above: bool,
) -> Option<Trigger> {
    match cfg.direction {
        LevelDirection::Gte if is_above => Some(Trigger::normal(format!(
            "{} reached ${} or above (now ${})",
            rule.symbol, cfg.price, current
        ))),
        LevelDirection::Lte if !is_above => Some(Trigger::normal(format!(
            "{} reached ${} or below (now ${})",
            rule.symbol, cfg.price, current
        ))),
        LevelDirection::Gte | LevelDirection::Lte => None,
        LevelDirection::Above | LevelDirection::Below => {
            let direction = if cfg.direction == LevelDirection::Above {
                CrossDirection::Above
            } else {
                CrossDirection::Below
            };
            crossing(direction, was_above, is_above).then(|| {
                Trigger::normal(format!(
                    "{} crossed {} ${} (now ${})",
                    rule.symbol,
                    direction_word(direction),
                    cfg.price,
                    current
                ))
            })
        }
    }
}

/// True only on the transition; without prior memory nothing fires.
fn crossing(direction: CrossDirection, was_above: Option<bool>, is_above: bool) -> bool {
    match (direction, was_above) {
        (_, None) => false,
        (CrossDirection::Above, Some(was_above)) => !was_above && is_above,
        (CrossDirection::Below, Some(was_above)) => was_above && !is_above,
    }
}

fn direction_word(direction: CrossDirection) -> &'static str {
    match direction {
        CrossDirection::Above => "above",
        CrossDirection::Below => "below",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolatilitySpike {
    pub latest_range: Decimal,
    pub mean_range: Decimal,
}

/// Spike test over `VOLATILITY_HISTORY` completed candles plus the
/// in-progress one (last). Compares `excess^2` against
/// `multiplier^2 * variance` so no square root is taken; only a range above
/// the mean can fire.
pub fn detect_volatility_spike(candles: &[Candle], multiplier: Decimal) -> Option<VolatilitySpike> {
    if candles.len() < VOLATILITY_HISTORY + 1 {
        return None;
    }
    let (latest, history) = candles.split_last()?;
    let ranges: Vec<Decimal> = history.iter().map(Candle::range).collect();
    if ranges.len() < 2 {
        return None;
    }

    let mean_range = mean(&ranges)?;
    let var = variance(&ranges, mean_range)?;
    let latest_range = latest.range();
    let excess = latest_range.checked_sub(mean_range)?;
    if excess <= Decimal::ZERO {
        return None;
    }

    let threshold = multiplier.checked_mul(multiplier)?.checked_mul(var)?;
    if excess.checked_mul(excess)? < threshold {
        return None;
    }
    Some(VolatilitySpike {
        latest_range,
        mean_range,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::Duration;
    use kifu_rust_core::models::RuleType;
    use serde_json::json;
    use uuid::Uuid;

    struct FixedFeed {
        close: Option<Decimal>,
        candles: Vec<Candle>,
        fail: bool,
    }

    #[async_trait]
    impl PriceFeed for FixedFeed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn current_price(&self, _symbol: &str) -> Result<Decimal> {
            Err(anyhow!("not used"))
        }

        async fn historical_close(&self, _symbol: &str, _window: CandleWindow) -> Result<Option<Decimal>> {
            if self.fail {
                return Err(anyhow!("feed down"));
            }
            Ok(self.close)
        }

        async fn recent_candles(&self, _symbol: &str, _timeframe: &str, count: u32) -> Result<Vec<Candle>> {
            if self.fail {
                return Err(anyhow!("feed down"));
            }
            Ok(self.candles.iter().rev().take(count as usize).rev().cloned().collect())
        }
    }

    fn evaluator(close: Option<Decimal>, candles: Vec<Candle>) -> RuleEvaluator {
        RuleEvaluator::new(Arc::new(FixedFeed {
            close,
            candles,
            fail: false,
        }))
    }

    fn rule(rule_type: RuleType, config: serde_json::Value) -> AlertRule {
        AlertRule {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "test rule".to_string(),
            symbol: "BTCUSDT".to_string(),
            rule_type,
            config,
            cooldown_minutes: 0,
            enabled: true,
            last_triggered_at: None,
            last_check_state: None,
        }
    }

    fn candle(range: Decimal, close: Decimal) -> Candle {
        Candle {
            open_time: Utc::now(),
            high: dec!(100) + range,
            low: dec!(100),
            close,
        }
    }

    fn closes(values: &[Decimal]) -> Vec<Candle> {
        values.iter().map(|c| candle(dec!(1), *c)).collect()
    }

    fn volatility_candles(latest: Decimal) -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..20)
            .map(|i| candle(if i % 2 == 0 { dec!(8) } else { dec!(12) }, dec!(100)))
            .collect();
        candles.push(candle(latest, dec!(100)));
        candles
    }

    #[tokio::test]
    async fn test_level_crossing_fires_once() {
        let eval = evaluator(None, vec![]);
        let r = rule(RuleType::PriceLevel, json!({"price": "100", "direction": "above"}));
        let below = RuleState::observed(RuleType::PriceLevel, dec!(99), Some(false));

        let first = eval.evaluate(&r, dec!(100), &below, Utc::now()).await;
        assert!(first.trigger.is_some());
        assert_eq!(first.next_state.was_above(), Some(true));

        let second = eval.evaluate(&r, dec!(100), &first.next_state, Utc::now()).await;
        assert!(second.trigger.is_none());
    }

    #[tokio::test]
    async fn test_level_first_observation_never_fires() {
        let eval = evaluator(None, vec![]);
        let r = rule(RuleType::PriceLevel, json!({"price": "100", "direction": "above"}));
        let result = eval
            .evaluate(&r, dec!(150), &RuleState::initial(RuleType::PriceLevel), Utc::now())
            .await;
        assert!(result.trigger.is_none());
        assert_eq!(result.next_state.was_above(), Some(true));
        assert_eq!(result.next_state.last_price(), Some(dec!(150)));
    }

    #[tokio::test]
    async fn test_level_threshold_modes_need_no_state() {
        let eval = evaluator(None, vec![]);
        let gte = rule(RuleType::PriceLevel, json!({"price": "100", "direction": "gte"}));
        let lte = rule(RuleType::PriceLevel, json!({"price": "100", "direction": "lte"}));
        let initial = RuleState::initial(RuleType::PriceLevel);

        let fired = eval.evaluate(&gte, dec!(100), &initial, Utc::now()).await;
        assert_eq!(
            fired.trigger.map(|t| t.reason),
            Some("BTCUSDT reached $100 or above (now $100)".to_string())
        );
        assert!(eval.evaluate(&gte, dec!(99.99), &initial, Utc::now()).await.trigger.is_none());
        assert!(eval.evaluate(&lte, dec!(99.99), &initial, Utc::now()).await.trigger.is_some());
    }

    #[tokio::test]
    async fn test_malformed_config_fails_closed() {
        let eval = evaluator(None, vec![]);
        let r = rule(RuleType::PriceLevel, json!({"price": "abc", "direction": "above"}));
        let prior = RuleState::observed(RuleType::PriceLevel, dec!(90), Some(false));
        let result = eval.evaluate(&r, dec!(110), &prior, Utc::now()).await;
        assert!(result.trigger.is_none());
        assert_eq!(result.next_state.was_above(), None);
        assert_eq!(result.next_state.last_price(), Some(dec!(110)));
    }

    #[tokio::test]
    async fn test_price_change_percent_threshold() {
        let eval = evaluator(Some(dec!(100)), vec![]);
        let r = rule(
            RuleType::PriceChange,
            json!({"direction": "both", "threshold_type": "percent", "threshold_value": "3", "reference": "1h"}),
        );
        let initial = RuleState::initial(RuleType::PriceChange);

        let small = eval.evaluate(&r, dec!(102.99), &initial, Utc::now()).await;
        assert!(small.trigger.is_none());

        let drop = eval.evaluate(&r, dec!(94), &initial, Utc::now()).await.trigger.unwrap();
        assert_eq!(drop.severity, AlertSeverity::Urgent);
        assert_eq!(drop.reason, "BTCUSDT fell $6 (-6% vs 1h)");

        let rise = eval.evaluate(&r, dec!(103.5), &initial, Utc::now()).await.trigger.unwrap();
        assert_eq!(rise.severity, AlertSeverity::Normal);
    }

    #[tokio::test]
    async fn test_price_change_direction_filter() {
        let eval = evaluator(Some(dec!(100)), vec![]);
        let r = rule(
            RuleType::PriceChange,
            json!({"direction": "drop", "threshold_type": "absolute", "threshold_value": "1", "reference": "4h"}),
        );
        let initial = RuleState::initial(RuleType::PriceChange);
        assert!(eval.evaluate(&r, dec!(105), &initial, Utc::now()).await.trigger.is_none());
        assert!(eval.evaluate(&r, dec!(95), &initial, Utc::now()).await.trigger.is_some());
    }

    #[tokio::test]
    async fn test_price_change_without_reference_does_not_fire() {
        let eval = RuleEvaluator::new(Arc::new(FixedFeed {
            close: None,
            candles: vec![],
            fail: true,
        }));
        let r = rule(
            RuleType::PriceChange,
            json!({"threshold_type": "absolute", "threshold_value": "1"}),
        );
        let result = eval
            .evaluate(&r, dec!(1000), &RuleState::initial(RuleType::PriceChange), Utc::now())
            .await;
        assert!(result.trigger.is_none());
    }

    #[tokio::test]
    async fn test_ma_cross_above() {
        // MA of 10, 20, 30 = 20
        let eval = evaluator(None, closes(&[dec!(10), dec!(20), dec!(30)]));
        let r = rule(
            RuleType::MaCross,
            json!({"ma_period": 3, "ma_timeframe": "1h", "direction": "above"}),
        );
        let below = RuleState::observed(RuleType::MaCross, dec!(19), Some(false));

        let result = eval.evaluate(&r, dec!(21), &below, Utc::now()).await;
        let trigger = result.trigger.unwrap();
        assert_eq!(trigger.severity, AlertSeverity::Urgent);
        assert!(trigger.reason.contains("MA: $20"));
        assert_eq!(result.next_state.was_above(), Some(true));
    }

    #[tokio::test]
    async fn test_ma_unavailable_keeps_memory() {
        let eval = evaluator(None, closes(&[dec!(10)]));
        let r = rule(
            RuleType::MaCross,
            json!({"ma_period": 5, "ma_timeframe": "1h", "direction": "below"}),
        );
        let prior = RuleState::observed(RuleType::MaCross, dec!(50), Some(true));
        let result = eval.evaluate(&r, dec!(1), &prior, Utc::now()).await;
        assert!(result.trigger.is_none());
        assert_eq!(result.next_state.was_above(), Some(true));
        assert_eq!(result.next_state.last_price(), Some(dec!(1)));
    }

    #[test]
    fn test_volatility_spike_threshold() {
        // History ranges alternate 8 and 12: mean 10, variance 4
        assert!(detect_volatility_spike(&volatility_candles(dec!(14.01)), dec!(2)).is_some());
        assert!(detect_volatility_spike(&volatility_candles(dec!(14)), dec!(2)).is_some());
        assert!(detect_volatility_spike(&volatility_candles(dec!(13)), dec!(2)).is_none());
        // Below-mean ranges never fire, even with a zero multiplier
        assert!(detect_volatility_spike(&volatility_candles(dec!(5)), dec!(0)).is_none());
    }

    #[test]
    fn test_volatility_needs_full_window() {
        let mut candles = volatility_candles(dec!(50));
        candles.remove(0);
        assert!(detect_volatility_spike(&candles, dec!(2)).is_none());
    }

    #[tokio::test]
    async fn test_volatility_reason() {
        let eval = evaluator(None, volatility_candles(dec!(14.01)));
        let r = rule(RuleType::VolatilitySpike, json!({"multiplier": "2"}));
        let trigger = eval
            .evaluate(&r, dec!(100), &RuleState::initial(RuleType::VolatilitySpike), Utc::now() - Duration::seconds(1))
            .await
            .trigger
            .unwrap();
        assert_eq!(trigger.reason, "BTCUSDT volatility spike (1h, current range $14.01, mean $10)");
        assert_eq!(trigger.severity, AlertSeverity::Urgent);
    }
}
