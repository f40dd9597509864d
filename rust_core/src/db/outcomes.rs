//! Journal-entry and alert-decision outcomes

use super::retry::execute_with_retry;
use super::PgStore;
use crate::models::{AlertOutcome, Outcome, PendingAlertDecision, PendingOutcomeBubble};
use crate::repositories::{AlertOutcomeRepository, OutcomeRepository};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;

fn outcome_from_row(row: &PgRow) -> Result<Outcome> {
    Ok(Outcome {
        id: row.try_get("id")?,
        bubble_id: row.try_get("bubble_id")?,
        period: row.try_get("period")?,
        reference_price: row.try_get("reference_price")?,
        outcome_price: row.try_get("outcome_price")?,
        pnl_percent: row.try_get("pnl_percent")?,
        calculated_at: row.try_get("calculated_at")?,
    })
}

#[async_trait]
impl OutcomeRepository for PgStore {
    async fn list_pending(
        &self,
        period: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingOutcomeBubble>> {
        let pool = &self.pool;
        let rows = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                SELECT b.id, b.symbol, b.candle_time, b.price
                FROM bubbles b
                WHERE b.candle_time <= $1
                  AND NOT EXISTS (
                    SELECT 1 FROM outcomes o
                    WHERE o.bubble_id = b.id AND o.period = $2
                  )
                ORDER BY b.candle_time ASC
                LIMIT $3
                "#,
            )
            .bind(cutoff)
            .bind(period)
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to list pending {} outcomes", period))?;

        rows.iter()
            .map(|row| -> Result<PendingOutcomeBubble> {
                Ok(PendingOutcomeBubble {
                    bubble_id: row.try_get("id")?,
                    symbol: row.try_get("symbol")?,
                    candle_time: row.try_get("candle_time")?,
                    price: row.try_get("price")?,
                })
            })
            .collect()
    }

    async fn create_if_not_exists(&self, outcome: &Outcome) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                INSERT INTO outcomes (id, bubble_id, period, reference_price, outcome_price,
                                      pnl_percent, calculated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (bubble_id, period) DO NOTHING
                "#,
            )
            .bind(outcome.id)
            .bind(outcome.bubble_id)
            .bind(&outcome.period)
            .bind(outcome.reference_price)
            .bind(outcome.outcome_price)
            .bind(outcome.pnl_percent)
            .bind(outcome.calculated_at)
            .execute(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to create outcome for bubble {}", outcome.bubble_id))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_recent_without_accuracy(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Outcome>> {
        let pool = &self.pool;
        let rows = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                SELECT o.id, o.bubble_id, o.period, o.reference_price, o.outcome_price,
                       o.pnl_percent, o.calculated_at
                FROM outcomes o
                WHERE o.calculated_at >= $1
                  AND NOT EXISTS (
                    SELECT 1 FROM ai_opinion_accuracies a WHERE a.outcome_id = o.id
                  )
                  AND EXISTS (
                    SELECT 1 FROM ai_opinions ao WHERE ao.bubble_id = o.bubble_id
                  )
                ORDER BY o.calculated_at ASC
                LIMIT $2
                "#,
            )
            .bind(since)
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .context("Failed to list outcomes awaiting accuracy")?;

        rows.iter().map(outcome_from_row).collect()
    }
}

#[async_trait]
impl AlertOutcomeRepository for PgStore {
    async fn list_pending_decisions(
        &self,
        period: &str,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<PendingAlertDecision>> {
        let pool = &self.pool;
        let rows = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                SELECT a.id AS alert_id, d.id AS decision_id, a.symbol, a.trigger_price,
                       d.created_at AS decision_time
                FROM alerts a
                JOIN alert_decisions d ON d.alert_id = a.id
                LEFT JOIN alert_outcomes o ON o.alert_id = a.id AND o.period = $1
                WHERE a.status = 'decided' AND o.id IS NULL AND d.created_at <= $2
                ORDER BY d.created_at ASC
                LIMIT $3
                "#,
            )
            .bind(period)
            .bind(cutoff)
            .bind(limit)
            .fetch_all(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to list pending {} decision outcomes", period))?;

        rows.iter()
            .map(|row| -> Result<PendingAlertDecision> {
                Ok(PendingAlertDecision {
                    alert_id: row.try_get("alert_id")?,
                    decision_id: row.try_get("decision_id")?,
                    symbol: row.try_get("symbol")?,
                    trigger_price: row.try_get("trigger_price")?,
                    decision_time: row.try_get("decision_time")?,
                })
            })
            .collect()
    }

    async fn create_if_not_exists(&self, outcome: &AlertOutcome) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                INSERT INTO alert_outcomes (id, alert_id, decision_id, period, reference_price,
                                            outcome_price, pnl_percent, calculated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (alert_id, period) DO NOTHING
                "#,
            )
            .bind(outcome.id)
            .bind(outcome.alert_id)
            .bind(outcome.decision_id)
            .bind(&outcome.period)
            .bind(outcome.reference_price)
            .bind(outcome.outcome_price)
            .bind(outcome.pnl_percent)
            .bind(outcome.calculated_at)
            .execute(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to create outcome for alert {}", outcome.alert_id))?;
        Ok(result.rows_affected() > 0)
    }
}
