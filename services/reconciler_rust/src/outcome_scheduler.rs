//! Outcome scheduler
//!
//! For each horizon, computes forward returns for journal entries and for
//! decided alerts once the horizon has elapsed. Outcomes are written with a
//! create-if-not-exists keyed by (subject, period), so overlapping or repeated
//! cycles never produce a second row.

use crate::stats::ReconcilerStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use kifu_rust_core::clients::{CandleWindow, PriceFeed};
use kifu_rust_core::models::timeframe::floor_to_minute;
use kifu_rust_core::models::{AlertOutcome, Horizon, Outcome, PendingAlertDecision, PendingOutcomeBubble};
use kifu_rust_core::repositories::{AlertOutcomeRepository, OutcomeRepository};
use kifu_rust_core::utils::pnl_percent;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backward window searched when the target minute has no candle
const FALLBACK_SPAN_MINUTES: i64 = 5;
const FALLBACK_CANDLES: u32 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutcomeCycleReport {
    pub outcomes_created: u64,
    pub decision_outcomes_created: u64,
    /// Subjects whose outcome already existed
    pub already_present: u64,
    /// Subjects skipped because the feed has no price yet
    pub missing_price: u64,
    pub errors: u64,
}

pub struct OutcomeScheduler {
    outcomes: Arc<dyn OutcomeRepository>,
    alert_outcomes: Arc<dyn AlertOutcomeRepository>,
    feed: Arc<dyn PriceFeed>,
    horizons: Vec<Horizon>,
    batch_size: i64,
    decision_batch_size: i64,
    stats: Arc<ReconcilerStats>,
}

/// Close at the target minute, else the last close in the few minutes before
/// it. `None` means "not available yet".
pub async fn resolve_outcome_price(
    feed: &dyn PriceFeed,
    symbol: &str,
    target: DateTime<Utc>,
) -> Result<Option<Decimal>> {
    if let Some(price) = feed.historical_close(symbol, CandleWindow::at_minute(target)).await? {
        return Ok(Some(price));
    }
    let fallback = CandleWindow::lookback(target, Duration::minutes(FALLBACK_SPAN_MINUTES), FALLBACK_CANDLES);
    feed.historical_close(symbol, fallback).await
}

impl OutcomeScheduler {
    pub fn new(
        outcomes: Arc<dyn OutcomeRepository>,
        alert_outcomes: Arc<dyn AlertOutcomeRepository>,
        feed: Arc<dyn PriceFeed>,
        horizons: Vec<Horizon>,
        batch_size: i64,
        decision_batch_size: i64,
        stats: Arc<ReconcilerStats>,
    ) -> Self {
        Self {
            outcomes,
            alert_outcomes,
            feed,
            horizons,
            batch_size,
            decision_batch_size,
            stats,
        }
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> OutcomeCycleReport {
        let mut report = OutcomeCycleReport::default();

        for horizon in &self.horizons {
            let cutoff = now - horizon.duration;

            match self.outcomes.list_pending(&horizon.period, cutoff, self.batch_size).await {
                Ok(pending) => {
                    for bubble in &pending {
                        if let Err(e) = self.bubble_outcome(horizon, bubble, &mut report).await {
                            warn!("Outcome {} for bubble {} failed: {:#}", horizon.period, bubble.bubble_id, e);
                            report.errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Listing pending {} outcomes failed: {:#}", horizon.period, e);
                    report.errors += 1;
                }
            }

            match self
                .alert_outcomes
                .list_pending_decisions(&horizon.period, cutoff, self.decision_batch_size)
                .await
            {
                Ok(pending) => {
                    for decision in &pending {
                        if let Err(e) = self.decision_outcome(horizon, decision, &mut report).await {
                            warn!("Outcome {} for alert {} failed: {:#}", horizon.period, decision.alert_id, e);
                            report.errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Listing pending {} decisions failed: {:#}", horizon.period, e);
                    report.errors += 1;
                }
            }
        }

        self.record(&report);
        if report.outcomes_created > 0 || report.decision_outcomes_created > 0 || report.errors > 0 {
            info!(
                "Outcome cycle: bubbles={}, decisions={}, present={}, no_price={}, errors={}",
                report.outcomes_created,
                report.decision_outcomes_created,
                report.already_present,
                report.missing_price,
                report.errors
            );
        }
        report
    }

    async fn bubble_outcome(
        &self,
        horizon: &Horizon,
        bubble: &PendingOutcomeBubble,
        report: &mut OutcomeCycleReport,
    ) -> Result<()> {
        let target = floor_to_minute(bubble.candle_time + horizon.duration);
        let Some(outcome_price) = resolve_outcome_price(self.feed.as_ref(), &bubble.symbol, target).await? else {
            debug!("No {} price at {} for bubble {}", bubble.symbol, target, bubble.bubble_id);
            report.missing_price += 1;
            return Ok(());
        };

        let pnl = pnl_percent(bubble.price, outcome_price)
            .with_context(|| format!("PnL for reference {} outcome {}", bubble.price, outcome_price))?;
        let outcome = Outcome {
            id: Uuid::new_v4(),
            bubble_id: bubble.bubble_id,
            period: horizon.period.clone(),
            reference_price: bubble.price,
            outcome_price,
            pnl_percent: pnl,
            calculated_at: Utc::now(),
        };

        if self.outcomes.create_if_not_exists(&outcome).await? {
            report.outcomes_created += 1;
        } else {
            report.already_present += 1;
        }
        Ok(())
    }

    async fn decision_outcome(
        &self,
        horizon: &Horizon,
        decision: &PendingAlertDecision,
        report: &mut OutcomeCycleReport,
    ) -> Result<()> {
        let target = floor_to_minute(decision.decision_time + horizon.duration);
        let Some(outcome_price) = resolve_outcome_price(self.feed.as_ref(), &decision.symbol, target).await?
        else {
            debug!("No {} price at {} for alert {}", decision.symbol, target, decision.alert_id);
            report.missing_price += 1;
            return Ok(());
        };

        let pnl = pnl_percent(decision.trigger_price, outcome_price)
            .with_context(|| format!("PnL for reference {} outcome {}", decision.trigger_price, outcome_price))?;
        let outcome = AlertOutcome {
            id: Uuid::new_v4(),
            alert_id: decision.alert_id,
            decision_id: decision.decision_id,
            period: horizon.period.clone(),
            reference_price: decision.trigger_price,
            outcome_price,
            pnl_percent: pnl,
            calculated_at: Utc::now(),
        };

        if self.alert_outcomes.create_if_not_exists(&outcome).await? {
            report.decision_outcomes_created += 1;
        } else {
            report.already_present += 1;
        }
        Ok(())
    }

    fn record(&self, report: &OutcomeCycleReport) {
        ReconcilerStats::add(&self.stats.outcomes_created, report.outcomes_created);
        ReconcilerStats::add(&self.stats.decision_outcomes_created, report.decision_outcomes_created);
        ReconcilerStats::add(&self.stats.outcome_prices_missing, report.missing_price);
        ReconcilerStats::add(&self.stats.errors, report.errors);
    }
}
