//! AI opinions and their accuracy records

use super::retry::execute_with_retry;
use super::PgStore;
use crate::models::{AiOpinion, AiOpinionAccuracy};
use crate::repositories::{AccuracyRepository, AiOpinionRepository};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

#[async_trait]
impl AiOpinionRepository for PgStore {
    async fn list_by_bubble(&self, bubble_id: Uuid) -> Result<Vec<AiOpinion>> {
        let pool = &self.pool;
        let rows = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                SELECT id, bubble_id, provider, model, response
                FROM ai_opinions
                WHERE bubble_id = $1
                ORDER BY created_at ASC
                "#,
            )
            .bind(bubble_id)
            .fetch_all(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to list opinions for bubble {}", bubble_id))?;

        rows.iter()
            .map(|row| -> Result<AiOpinion> {
                Ok(AiOpinion {
                    id: row.try_get("id")?,
                    bubble_id: row.try_get("bubble_id")?,
                    provider: row.try_get("provider")?,
                    model: row.try_get("model")?,
                    response: row.try_get("response")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AccuracyRepository for PgStore {
    async fn exists_by_opinion_and_outcome(&self, opinion_id: Uuid, outcome_id: Uuid) -> Result<bool> {
        let pool = &self.pool;
        let exists: bool = execute_with_retry(self.retry, move || async move {
            sqlx::query_scalar(
                r#"
                SELECT EXISTS(
                    SELECT 1 FROM ai_opinion_accuracies WHERE opinion_id = $1 AND outcome_id = $2
                )
                "#,
            )
            .bind(opinion_id)
            .bind(outcome_id)
            .fetch_one(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .context("Failed to check accuracy record")?;
        Ok(exists)
    }

    async fn create(&self, accuracy: &AiOpinionAccuracy) -> Result<bool> {
        let pool = &self.pool;
        let result = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                INSERT INTO ai_opinion_accuracies (id, opinion_id, outcome_id, bubble_id, provider,
                    period, predicted_direction, actual_direction, is_correct, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (opinion_id, outcome_id) DO NOTHING
                "#,
            )
            .bind(accuracy.id)
            .bind(accuracy.opinion_id)
            .bind(accuracy.outcome_id)
            .bind(accuracy.bubble_id)
            .bind(&accuracy.provider)
            .bind(&accuracy.period)
            .bind(accuracy.predicted_direction.as_str())
            .bind(accuracy.actual_direction.as_str())
            .bind(accuracy.is_correct)
            .bind(accuracy.created_at)
            .execute(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to create accuracy for opinion {}", accuracy.opinion_id))?;
        Ok(result.rows_affected() > 0)
    }
}
