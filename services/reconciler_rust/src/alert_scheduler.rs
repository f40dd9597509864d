//! Alert scheduler
//!
//! One cycle: load enabled rules, drop those still in cooldown, group the rest
//! by symbol, fetch each symbol's price once through the shared cache,
//! evaluate every rule, persist alerts and check state, then expire stale
//! alerts.

use crate::evaluator::RuleEvaluator;
use crate::events::{AlertEvent, TriggerPublisher};
use crate::price_cache::PriceCache;
use crate::stats::ReconcilerStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use kifu_rust_core::clients::PriceFeed;
use kifu_rust_core::models::{Alert, AlertRule, RuleState};
use kifu_rust_core::repositories::{AlertRepository, AlertRuleRepository};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertCycleReport {
    pub rules_evaluated: u64,
    pub triggered: u64,
    pub state_updates: u64,
    pub expired: u64,
    pub errors: u64,
}

pub struct AlertScheduler {
    rules: Arc<dyn AlertRuleRepository>,
    alerts: Arc<dyn AlertRepository>,
    feed: Arc<dyn PriceFeed>,
    evaluator: RuleEvaluator,
    cache: PriceCache,
    publisher: TriggerPublisher,
    retention: Duration,
    stats: Arc<ReconcilerStats>,
}

impl AlertScheduler {
    pub fn new(
        rules: Arc<dyn AlertRuleRepository>,
        alerts: Arc<dyn AlertRepository>,
        feed: Arc<dyn PriceFeed>,
        cache: PriceCache,
        publisher: TriggerPublisher,
        retention: Duration,
        stats: Arc<ReconcilerStats>,
    ) -> Self {
        Self {
            rules,
            alerts,
            evaluator: RuleEvaluator::new(feed.clone()),
            feed,
            cache,
            publisher,
            retention,
            stats,
        }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<AlertCycleReport> {
        let rules = self.rules.list_all_active().await.context("Failed to list alert rules")?;
        let total = rules.len();

        let mut by_symbol: BTreeMap<String, Vec<AlertRule>> = BTreeMap::new();
        for rule in rules {
            if rule.enabled && rule.cooldown_passed(now) {
                by_symbol.entry(rule.symbol.clone()).or_default().push(rule);
            }
        }
        debug!("{} active rules, {} symbols out of cooldown", total, by_symbol.len());

        let mut report = AlertCycleReport::default();
        for (symbol, group) in &by_symbol {
            let price = match self.cache.get_or_fetch(self.feed.as_ref(), symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!("Price fetch for {} failed, skipping {} rules: {:#}", symbol, group.len(), e);
                    report.errors += 1;
                    continue;
                }
            };

            for rule in group {
                self.process_rule(rule, price, now, &mut report).await;
            }
        }

        let cutoff = now - self.retention;
        match self.alerts.expire_older_than(cutoff).await {
            Ok(expired) => {
                if expired > 0 {
                    info!("Expired {} alerts created before {}", expired, cutoff);
                }
                report.expired = expired;
            }
            Err(e) => {
                warn!("Alert expiry failed: {:#}", e);
                report.errors += 1;
            }
        }

        self.cache.evict_expired(now).await;
        self.record(&report);

        if report.triggered > 0 || report.errors > 0 {
            info!(
                "Alert cycle: evaluated={}, triggered={}, states={}, expired={}, errors={}",
                report.rules_evaluated, report.triggered, report.state_updates, report.expired, report.errors
            );
        }
        Ok(report)
    }

    async fn process_rule(
        &self,
        rule: &AlertRule,
        price: Decimal,
        now: DateTime<Utc>,
        report: &mut AlertCycleReport,
    ) {
        let prior = RuleState::from_stored(rule.rule_type, &rule.last_check_state.clone().unwrap_or_default());
        let evaluation = self.evaluator.evaluate(rule, price, &prior, now).await;
        report.rules_evaluated += 1;
        let next_state = evaluation.next_state.to_stored();

        let trigger = match evaluation.trigger {
            Some(trigger) => trigger,
            None => {
                if rule.rule_type.is_crossing() {
                    match self.rules.update_check_state(rule.id, &next_state).await {
                        Ok(()) => report.state_updates += 1,
                        Err(e) => {
                            warn!("Check state update for rule {} failed: {:#}", rule.id, e);
                            report.errors += 1;
                        }
                    }
                }
                return;
            }
        };

        let alert = Alert::pending(rule, price, trigger.reason, trigger.severity, now);
        if let Err(e) = self.alerts.create(&alert).await {
            // State is left untouched so the rule is re-evaluated next cycle
            warn!("Alert create for rule {} failed: {:#}", rule.id, e);
            report.errors += 1;
            return;
        }
        report.triggered += 1;
        info!(
            "Rule {} ({}) triggered on {} at {}: {}",
            rule.id, rule.name, rule.symbol, price, alert.trigger_reason
        );

        match self.rules.update_last_triggered(rule.id, now, &next_state).await {
            Ok(()) => report.state_updates += 1,
            Err(e) => {
                warn!("Trigger bookkeeping for rule {} failed: {:#}", rule.id, e);
                report.errors += 1;
            }
        }

        self.publisher.publish(AlertEvent {
            alert,
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            rule_type: rule.rule_type,
        });
    }

    fn record(&self, report: &AlertCycleReport) {
        ReconcilerStats::add(&self.stats.rules_evaluated, report.rules_evaluated);
        ReconcilerStats::add(&self.stats.alerts_triggered, report.triggered);
        ReconcilerStats::add(&self.stats.check_states_saved, report.state_updates);
        ReconcilerStats::add(&self.stats.alerts_expired, report.expired);
        ReconcilerStats::add(&self.stats.errors, report.errors);
    }
}
