//! Accuracy reconciler
//!
//! Scores AI opinions on a journal entry against the realized outcome of that
//! entry. Polls for recent outcomes rather than being called by the outcome
//! scheduler.

use crate::stats::ReconcilerStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use kifu_rust_core::direction::{actual_direction, DirectionExtractor};
use kifu_rust_core::models::{AiOpinionAccuracy, Direction, Outcome};
use kifu_rust_core::repositories::{AccuracyRepository, AiOpinionRepository, OutcomeRepository};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccuracyCycleReport {
    pub outcomes_scanned: u64,
    pub created: u64,
    pub already_scored: u64,
    pub errors: u64,
}

pub struct AccuracyReconciler {
    outcomes: Arc<dyn OutcomeRepository>,
    opinions: Arc<dyn AiOpinionRepository>,
    accuracies: Arc<dyn AccuracyRepository>,
    extractor: DirectionExtractor,
    lookback: Duration,
    batch_size: i64,
    dead_zone: Decimal,
    stats: Arc<ReconcilerStats>,
}

impl AccuracyReconciler {
    pub fn new(
        outcomes: Arc<dyn OutcomeRepository>,
        opinions: Arc<dyn AiOpinionRepository>,
        accuracies: Arc<dyn AccuracyRepository>,
        lookback: Duration,
        batch_size: i64,
        dead_zone: Decimal,
        stats: Arc<ReconcilerStats>,
    ) -> Result<Self> {
        Ok(Self {
            outcomes,
            opinions,
            accuracies,
            extractor: DirectionExtractor::new().context("Failed to compile direction patterns")?,
            lookback,
            batch_size,
            dead_zone,
            stats,
        })
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<AccuracyCycleReport> {
        let since = now - self.lookback;
        let outcomes = self
            .outcomes
            .list_recent_without_accuracy(since, self.batch_size)
            .await
            .context("Failed to list outcomes awaiting accuracy")?;

        let mut report = AccuracyCycleReport::default();
        for outcome in &outcomes {
            report.outcomes_scanned += 1;
            if let Err(e) = self.score_outcome(outcome, &mut report).await {
                warn!("Accuracy for outcome {} failed: {:#}", outcome.id, e);
                report.errors += 1;
            }
        }

        ReconcilerStats::add(&self.stats.accuracies_created, report.created);
        ReconcilerStats::add(&self.stats.errors, report.errors);
        if report.created > 0 || report.errors > 0 {
            info!(
                "Accuracy cycle: outcomes={}, created={}, existing={}, errors={}",
                report.outcomes_scanned, report.created, report.already_scored, report.errors
            );
        }
        Ok(report)
    }

    async fn score_outcome(&self, outcome: &Outcome, report: &mut AccuracyCycleReport) -> Result<()> {
        let opinions = self.opinions.list_by_bubble(outcome.bubble_id).await?;
        if opinions.is_empty() {
            return Ok(());
        }

        let actual = actual_direction(outcome.pnl_percent, self.dead_zone);
        for opinion in &opinions {
            match self.accuracies.exists_by_opinion_and_outcome(opinion.id, outcome.id).await {
                Ok(true) => {
                    report.already_scored += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Accuracy lookup for opinion {} failed: {:#}", opinion.id, e);
                    report.errors += 1;
                    continue;
                }
            }

            let predicted = self.extractor.extract(&opinion.response);
            let accuracy = AiOpinionAccuracy {
                id: Uuid::new_v4(),
                opinion_id: opinion.id,
                outcome_id: outcome.id,
                bubble_id: outcome.bubble_id,
                provider: opinion.provider.clone(),
                period: outcome.period.clone(),
                predicted_direction: predicted,
                actual_direction: actual,
                is_correct: Direction::is_correct(predicted, actual),
                created_at: Utc::now(),
            };

            match self.accuracies.create(&accuracy).await {
                Ok(true) => {
                    debug!(
                        "Opinion {} ({}) {} vs {}: correct={}",
                        opinion.id,
                        opinion.provider,
                        predicted.as_str(),
                        actual.as_str(),
                        accuracy.is_correct
                    );
                    report.created += 1;
                }
                Ok(false) => report.already_scored += 1,
                Err(e) => {
                    warn!("Accuracy create for opinion {} failed: {:#}", opinion.id, e);
                    report.errors += 1;
                }
            }
        }
        Ok(())
    }
}
