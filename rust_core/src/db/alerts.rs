//! Alert rules and alerts

use super::retry::execute_with_retry;
use super::PgStore;
use crate::models::{Alert, AlertRule, CheckState, RuleType};
use crate::repositories::{AlertRepository, AlertRuleRepository};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

fn alert_rule_from_row(row: &PgRow) -> Result<Option<AlertRule>> {
    let id: Uuid = row.try_get("id")?;
    let raw_type: String = row.try_get("rule_type")?;
    let Some(rule_type) = RuleType::parse(&raw_type) else {
        warn!("Skipping alert rule {} with unknown type '{}'", id, raw_type);
        return Ok(None);
    };
    let state: Option<serde_json::Value> = row.try_get("last_check_state")?;

    Ok(Some(AlertRule {
        id,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        symbol: row.try_get("symbol")?,
        rule_type,
        config: row.try_get("config")?,
        cooldown_minutes: row.try_get("cooldown_minutes")?,
        enabled: row.try_get("enabled")?,
        last_triggered_at: row.try_get("last_triggered_at")?,
        last_check_state: state.as_ref().map(CheckState::from_json),
    }))
}

#[async_trait]
impl AlertRuleRepository for PgStore {
    async fn list_all_active(&self) -> Result<Vec<AlertRule>> {
        let pool = &self.pool;
        let rows = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                SELECT id, user_id, name, symbol, rule_type, config, cooldown_minutes, enabled,
                       last_triggered_at, last_check_state
                FROM alert_rules
                WHERE enabled = true
                "#,
            )
            .fetch_all(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .context("Failed to list active alert rules")?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(rule) = alert_rule_from_row(row)? {
                rules.push(rule);
            }
        }
        Ok(rules)
    }

    async fn update_check_state(&self, rule_id: Uuid, state: &CheckState) -> Result<()> {
        let pool = &self.pool;
        let blob = &state.to_json();
        execute_with_retry(self.retry, move || async move {
            sqlx::query("UPDATE alert_rules SET last_check_state = $1 WHERE id = $2")
                .bind(blob)
                .bind(rule_id)
                .execute(pool)
                .await
                .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to update check state for rule {}", rule_id))?;
        Ok(())
    }

    async fn update_last_triggered(
        &self,
        rule_id: Uuid,
        triggered_at: DateTime<Utc>,
        state: &CheckState,
    ) -> Result<()> {
        let pool = &self.pool;
        let blob = &state.to_json();
        execute_with_retry(self.retry, move || async move {
            sqlx::query(
                "UPDATE alert_rules SET last_triggered_at = $1, last_check_state = $2 WHERE id = $3",
            )
            .bind(triggered_at)
            .bind(blob)
            .bind(rule_id)
            .execute(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to record trigger for rule {}", rule_id))?;
        Ok(())
    }
}

#[async_trait]
impl AlertRepository for PgStore {
    async fn create(&self, alert: &Alert) -> Result<()> {
        // Not retried: a retry after a lost acknowledgement would duplicate the alert
        sqlx::query(
            r#"
            INSERT INTO alerts (id, user_id, rule_id, symbol, trigger_price, trigger_reason,
                                severity, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(alert.id)
        .bind(alert.user_id)
        .bind(alert.rule_id)
        .bind(&alert.symbol)
        .bind(alert.trigger_price)
        .bind(&alert.trigger_reason)
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create alert for rule {}", alert.rule_id))?;
        Ok(())
    }

    async fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let pool = &self.pool;
        let result = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                UPDATE alerts SET status = 'expired'
                WHERE status IN ('pending', 'briefed') AND created_at < $1
                "#,
            )
            .bind(cutoff)
            .execute(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .context("Failed to expire old alerts")?;
        Ok(result.rows_affected())
    }
}
