//! Trade import: sync cursors, watched symbols, credentials and the paired
//! journal-entry + trade insert

use super::retry::execute_with_retry;
use super::PgStore;
use crate::models::{Bubble, Exchange, Trade, TradeSyncState, UserSymbol, VenueCredential};
use crate::repositories::{
    CredentialRepository, PairedInsertOutcome, TradeJournalRepository, TradeSyncStateRepository,
    UserSymbolRepository,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use tracing::{debug, warn};
use uuid::Uuid;

#[async_trait]
impl TradeSyncStateRepository for PgStore {
    async fn get(&self, user_id: Uuid, exchange: &str, symbol: &str) -> Result<Option<TradeSyncState>> {
        let pool = &self.pool;
        let row = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                SELECT user_id, exchange, symbol, last_trade_id, last_sync_at
                FROM trade_sync_state
                WHERE user_id = $1 AND exchange = $2 AND symbol = $3
                "#,
            )
            .bind(user_id)
            .bind(exchange)
            .bind(symbol)
            .fetch_optional(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to load sync state for {} {}", exchange, symbol))?;

        row.map(|row| -> Result<TradeSyncState> {
            Ok(TradeSyncState {
                user_id: row.try_get("user_id")?,
                exchange: row.try_get("exchange")?,
                symbol: row.try_get("symbol")?,
                last_trade_id: row.try_get("last_trade_id")?,
                last_sync_at: row.try_get("last_sync_at")?,
            })
        })
        .transpose()
    }

    async fn upsert(&self, state: &TradeSyncState) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                INSERT INTO trade_sync_state (id, user_id, exchange, symbol, last_trade_id, last_sync_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (user_id, exchange, symbol) DO UPDATE SET
                    last_trade_id = GREATEST(trade_sync_state.last_trade_id, EXCLUDED.last_trade_id),
                    last_sync_at = EXCLUDED.last_sync_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(state.user_id)
            .bind(&state.exchange)
            .bind(&state.symbol)
            .bind(state.last_trade_id)
            .bind(state.last_sync_at)
            .execute(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to store sync cursor for {} {}", state.exchange, state.symbol))?;
        Ok(())
    }
}

#[async_trait]
impl UserSymbolRepository for PgStore {
    async fn list_by_user(&self, user_id: Uuid) -> Result<Vec<UserSymbol>> {
        let pool = &self.pool;
        let rows = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                SELECT id, user_id, symbol, timeframe_default
                FROM user_symbols
                WHERE user_id = $1
                ORDER BY created_at ASC
                "#,
            )
            .bind(user_id)
            .fetch_all(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to list symbols for user {}", user_id))?;

        rows.iter()
            .map(|row| -> Result<UserSymbol> {
                Ok(UserSymbol {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    symbol: row.try_get("symbol")?,
                    timeframe_default: row.try_get("timeframe_default")?,
                })
            })
            .collect()
    }

    async fn create(&self, symbol: &UserSymbol) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_symbols (id, user_id, symbol, timeframe_default, created_at)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(symbol.id)
        .bind(symbol.user_id)
        .bind(&symbol.symbol)
        .bind(&symbol.timeframe_default)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create symbol {} for user {}", symbol.symbol, symbol.user_id))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialRepository for PgStore {
    async fn list_valid(&self, exchange: Exchange) -> Result<Vec<VenueCredential>> {
        let pool = &self.pool;
        let rows = execute_with_retry(self.retry, move || async move {
            sqlx::query(
                r#"
                SELECT id, user_id, api_key_enc, api_secret_enc
                FROM exchange_credentials
                WHERE exchange = $1 AND is_valid = true
                "#,
            )
            .bind(exchange.as_str())
            .fetch_all(pool)
            .await
            .map_err(anyhow::Error::from)
        })
        .await
        .with_context(|| format!("Failed to list {} credentials", exchange))?;

        let mut credentials = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let sealed_key: String = row.try_get("api_key_enc")?;
            let sealed_secret: String = row.try_get("api_secret_enc")?;
            let opened = self
                .secrets
                .open(&sealed_key)
                .and_then(|key| Ok((key, self.secrets.open(&sealed_secret)?)));
            match opened {
                Ok((api_key, api_secret)) => credentials.push(VenueCredential {
                    id,
                    user_id: row.try_get("user_id")?,
                    exchange,
                    api_key,
                    api_secret,
                }),
                Err(e) => warn!("Skipping {} credential {}: {}", exchange, id, e),
            }
        }
        Ok(credentials)
    }
}

#[async_trait]
impl TradeJournalRepository for PgStore {
    async fn insert_trade_with_bubble(&self, bubble: &Bubble, trade: &Trade) -> Result<PairedInsertOutcome> {
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(
            r#"
            INSERT INTO bubbles (id, user_id, symbol, timeframe, candle_time, price, bubble_type,
                                 memo, tags, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(bubble.id)
        .bind(bubble.user_id)
        .bind(&bubble.symbol)
        .bind(&bubble.timeframe)
        .bind(bubble.candle_time)
        .bind(bubble.price)
        .bind(&bubble.bubble_type)
        .bind(&bubble.memo)
        .bind(&bubble.tags)
        .bind(bubble.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert journal entry")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO trades (id, user_id, bubble_id, binance_trade_id, exchange, symbol, side,
                                quantity, price, realized_pnl, trade_time)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (user_id, exchange, symbol, binance_trade_id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(trade.user_id)
        .bind(trade.bubble_id)
        .bind(trade.external_trade_id)
        .bind(&trade.exchange)
        .bind(&trade.symbol)
        .bind(trade.side.as_str())
        .bind(trade.quantity)
        .bind(trade.price)
        .bind(trade.realized_pnl)
        .bind(trade.trade_time)
        .execute(&mut *tx)
        .await
        .context("Failed to insert trade")?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.context("Failed to roll back duplicate trade")?;
            debug!(
                "Trade {} {} {} already imported",
                trade.exchange, trade.symbol, trade.external_trade_id
            );
            return Ok(PairedInsertOutcome::Duplicate);
        }

        tx.commit().await.context("Failed to commit trade import")?;
        Ok(PairedInsertOutcome::Inserted)
    }
}
