//! Trade sync scheduler
//!
//! One poller per (user, exchange) credential pages through the venue's
//! trade history for each watched symbol, writes every new fill as a journal
//! entry + trade pair in one transaction, and only then advances the
//! per-symbol cursor.
//!
//! Id-cursored venues (Binance) page forward by trade id. Time-cursored venues
//! (Upbit) are read market-wide under one pseudo-symbol and resume from the
//! latest execution time seen, less a small overlap.

use crate::scheduler::run_periodic;
use crate::stats::ReconcilerStats;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use kifu_rust_core::clients::{TradeCursor, VenueTrade, VenueTradeClient};
use kifu_rust_core::models::timeframe::floor_to_timeframe;
use kifu_rust_core::models::{
    Bubble, CursorKind, Exchange, Trade, TradeSyncState, UserSymbol, VenueCredential,
};
use kifu_rust_core::repositories::{
    CredentialRepository, PairedInsertOutcome, TradeJournalRepository, TradeSyncStateRepository,
    UserSymbolRepository,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_TIMEFRAME: &str = "1h";
/// Largest page the venue returns; a shorter page is the last one
pub const PAGE_SIZE: u32 = 1000;
pub const MAX_HISTORY_DAYS: u32 = 3650;
/// Time-cursored venues re-read this much before the last execution seen
const RESUME_OVERLAP_MINUTES: i64 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ignore the stored cursor and page from the first trade
    pub full_backfill: bool,
    /// Lookback for symbols without a cursor (capped at ten years)
    pub history_days: Option<u32>,
}

/// Result of syncing one symbol
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub symbol: String,
    pub pages: u64,
    pub fetched: u64,
    pub inserted: u64,
    pub duplicates: u64,
    /// Stored cursor after the sync
    pub cursor: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct TradeSyncSettings {
    pub poll_interval: std::time::Duration,
    pub max_symbols: usize,
    pub lookback_days: u32,
}

// ============================================================================
// Poller registry
// ============================================================================

/// Running pollers keyed by `user|exchange`
#[derive(Clone, Default)]
pub struct SyncRegistry {
    pollers: Arc<Mutex<HashMap<String, (Uuid, CancellationToken)>>>,
}

fn registry_key(user_id: Uuid, exchange: Exchange) -> String {
    format!("{}|{}", user_id, exchange)
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for (user, exchange). `None` when a poller already runs.
    /// The returned token is a child of `parent`.
    pub fn try_register(
        &self,
        user_id: Uuid,
        exchange: Exchange,
        parent: &CancellationToken,
    ) -> Option<(Uuid, CancellationToken)> {
        let mut pollers = self.pollers.lock();
        let key = registry_key(user_id, exchange);
        if pollers.contains_key(&key) {
            return None;
        }
        let entry = (Uuid::new_v4(), parent.child_token());
        pollers.insert(key, entry.clone());
        Some(entry)
    }

    /// Release a slot, unless it has since been claimed by another poller
    pub fn deregister(&self, user_id: Uuid, exchange: Exchange, poller_id: Uuid) {
        let mut pollers = self.pollers.lock();
        let key = registry_key(user_id, exchange);
        if pollers.get(&key).map(|(id, _)| *id) == Some(poller_id) {
            pollers.remove(&key);
        }
    }

    /// Cancel the poller for (user, exchange). Returns whether one was running.
    pub fn stop(&self, user_id: Uuid, exchange: Exchange) -> bool {
        match self.pollers.lock().remove(&registry_key(user_id, exchange)) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, user_id: Uuid, exchange: Exchange) -> bool {
        self.pollers.lock().contains_key(&registry_key(user_id, exchange))
    }

    pub fn len(&self) -> usize {
        self.pollers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Cursor & record helpers
// ============================================================================

/// Where paging starts for one symbol.
///
/// Every lookback, configured or requested, is capped at [`MAX_HISTORY_DAYS`].
pub fn initial_cursor(
    kind: CursorKind,
    state: Option<&TradeSyncState>,
    options: Option<&SyncOptions>,
    now: DateTime<Utc>,
    default_lookback_days: u32,
) -> TradeCursor {
    let full_backfill = options.is_some_and(|o| o.full_backfill);
    let history_days = options.and_then(|o| o.history_days).filter(|d| *d > 0);
    let resume = state.filter(|s| s.last_trade_id > 0 && !full_backfill);

    match kind {
        CursorKind::TradeId => {
            if full_backfill {
                return TradeCursor::FromId(0);
            }
            if let Some(state) = resume {
                return TradeCursor::FromId(state.last_trade_id + 1);
            }
        }
        CursorKind::ExecutionTime => {
            let latest = resume.and_then(|s| Utc.timestamp_millis_opt(s.last_trade_id).single());
            if let Some(latest) = latest {
                return TradeCursor::Since(latest - Duration::minutes(RESUME_OVERLAP_MINUTES));
            }
            if full_backfill {
                return since_days(now, history_days.unwrap_or(MAX_HISTORY_DAYS));
            }
        }
    }
    since_days(now, history_days.unwrap_or(default_lookback_days))
}

fn since_days(now: DateTime<Utc>, days: u32) -> TradeCursor {
    TradeCursor::Since(now - Duration::days(days.min(MAX_HISTORY_DAYS) as i64))
}

/// Cursor value a fill advances to
pub fn watermark(kind: CursorKind, fill: &VenueTrade) -> i64 {
    match kind {
        CursorKind::TradeId => fill.external_id,
        CursorKind::ExecutionTime => fill.executed_at.timestamp_millis(),
    }
}

/// The journal entry and trade rows for one fill
pub fn journal_pair(
    user_id: Uuid,
    exchange: Exchange,
    timeframe: &str,
    fill: &VenueTrade,
    now: DateTime<Utc>,
) -> (Bubble, Trade) {
    let bubble = Bubble {
        id: Uuid::new_v4(),
        user_id,
        symbol: fill.symbol.clone(),
        timeframe: timeframe.to_string(),
        candle_time: floor_to_timeframe(fill.executed_at, timeframe),
        price: fill.price,
        bubble_type: "auto".to_string(),
        memo: Some(format!("Auto-recorded: {} {} @ {}", fill.symbol, fill.side, fill.price)),
        tags: Vec::new(),
        created_at: now,
    };
    let trade = Trade {
        id: Uuid::new_v4(),
        user_id,
        bubble_id: Some(bubble.id),
        exchange: exchange.as_str().to_string(),
        external_trade_id: fill.external_id,
        symbol: fill.symbol.clone(),
        side: fill.side,
        quantity: fill.quantity,
        price: fill.price,
        realized_pnl: fill.realized_pnl,
        trade_time: fill.executed_at,
    };
    (bubble, trade)
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct TradeSyncScheduler {
    credentials: Arc<dyn CredentialRepository>,
    symbols: Arc<dyn UserSymbolRepository>,
    sync_state: Arc<dyn TradeSyncStateRepository>,
    journal: Arc<dyn TradeJournalRepository>,
    venue: Arc<dyn VenueTradeClient>,
    registry: SyncRegistry,
    settings: TradeSyncSettings,
    stats: Arc<ReconcilerStats>,
}

impl TradeSyncScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        credentials: Arc<dyn CredentialRepository>,
        symbols: Arc<dyn UserSymbolRepository>,
        sync_state: Arc<dyn TradeSyncStateRepository>,
        journal: Arc<dyn TradeJournalRepository>,
        venue: Arc<dyn VenueTradeClient>,
        registry: SyncRegistry,
        settings: TradeSyncSettings,
        stats: Arc<ReconcilerStats>,
    ) -> Self {
        Self {
            credentials,
            symbols,
            sync_state,
            journal,
            venue,
            registry,
            settings,
            stats,
        }
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    /// Start a poller for every valid credential not already being polled.
    /// Returns the handles of newly started pollers.
    pub async fn discover(self: &Arc<Self>, shutdown: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let mut started = Vec::new();
        for exchange in Exchange::SUPPORTED {
            let credentials = match self.credentials.list_valid(exchange).await {
                Ok(credentials) => credentials,
                Err(e) => {
                    warn!("Listing {} credentials failed: {:#}", exchange, e);
                    ReconcilerStats::add(&self.stats.errors, 1);
                    continue;
                }
            };
            if !self.venue.supports(exchange) {
                if !credentials.is_empty() {
                    warn!("{} {} credentials have no trade client, not syncing them", credentials.len(), exchange);
                    ReconcilerStats::add(&self.stats.unsupported_credentials, credentials.len() as u64);
                }
                continue;
            }
            for credential in credentials {
                if let Some(handle) = self.start_poller(credential, shutdown) {
                    started.push(handle);
                }
            }
        }
        if !started.is_empty() {
            info!("Started {} trade pollers ({} running)", started.len(), self.registry.len());
        }
        Ok(started)
    }

    /// Spawn the periodic poller for one credential unless one is running
    pub fn start_poller(
        self: &Arc<Self>,
        credential: VenueCredential,
        shutdown: &CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let (poller_id, token) = self.registry.try_register(credential.user_id, credential.exchange, shutdown)?;

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            let name = format!("Trade poller {} {}", credential.user_id, credential.exchange);
            let cycle_this = Arc::clone(&this);
            let cycle_credential = credential.clone();
            run_periodic(&name, this.settings.poll_interval, token, move || {
                let this = Arc::clone(&cycle_this);
                let credential = cycle_credential.clone();
                async move { this.sync_credential_once(&credential, None).await.map(|_| ()) }
            })
            .await;
            this.registry.deregister(credential.user_id, credential.exchange, poller_id);
        }))
    }

    /// Sync every watched symbol of one credential. Per-symbol failures are
    /// logged and do not stop the remaining symbols.
    pub async fn sync_credential_once(
        &self,
        credential: &VenueCredential,
        options: Option<SyncOptions>,
    ) -> Result<Vec<SyncReport>> {
        let mut symbols = self
            .symbols
            .list_by_user(credential.user_id)
            .await
            .with_context(|| format!("Failed to list symbols for user {}", credential.user_id))?;

        if symbols.is_empty() {
            let default = UserSymbol {
                id: Uuid::new_v4(),
                user_id: credential.user_id,
                symbol: credential.exchange.default_symbol().to_string(),
                timeframe_default: DEFAULT_TIMEFRAME.to_string(),
            };
            if let Err(e) = self.symbols.create(&default).await {
                warn!("Creating default symbol for user {} failed: {:#}", credential.user_id, e);
            }
            symbols.push(default);
        }

        if let Some(pseudo) = credential.exchange.market_wide_symbol() {
            symbols = vec![UserSymbol {
                id: Uuid::new_v4(),
                user_id: credential.user_id,
                symbol: pseudo.to_string(),
                timeframe_default: DEFAULT_TIMEFRAME.to_string(),
            }];
        } else if symbols.len() > self.settings.max_symbols {
            warn!(
                "User {} has {} symbols, syncing the first {}",
                credential.user_id,
                symbols.len(),
                self.settings.max_symbols
            );
            symbols.truncate(self.settings.max_symbols);
        }

        let mut reports = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            match self.sync_symbol(credential, symbol, options.as_ref()).await {
                Ok(report) => {
                    if report.inserted > 0 {
                        info!(
                            "Imported {} {} trades for user {} on {} ({} duplicates, cursor {:?})",
                            report.inserted,
                            report.symbol,
                            credential.user_id,
                            credential.exchange,
                            report.duplicates,
                            report.cursor
                        );
                    }
                    ReconcilerStats::add(&self.stats.trades_imported, report.inserted);
                    ReconcilerStats::add(&self.stats.trade_duplicates, report.duplicates);
                    reports.push(report);
                }
                Err(e) => {
                    warn!(
                        "Trade sync {} {} for user {} failed: {:#}",
                        credential.exchange, symbol.symbol, credential.user_id, e
                    );
                    ReconcilerStats::add(&self.stats.sync_failures, 1);
                }
            }
        }
        Ok(reports)
    }

    async fn sync_symbol(
        &self,
        credential: &VenueCredential,
        symbol: &UserSymbol,
        options: Option<&SyncOptions>,
    ) -> Result<SyncReport> {
        let exchange = credential.exchange;
        let state = self
            .sync_state
            .get(credential.user_id, exchange.as_str(), &symbol.symbol)
            .await?;
        let timeframe = if symbol.timeframe_default.trim().is_empty() {
            DEFAULT_TIMEFRAME
        } else {
            symbol.timeframe_default.trim()
        };

        let kind = exchange.cursor_kind();
        let mut cursor = initial_cursor(kind, state.as_ref(), options, Utc::now(), self.settings.lookback_days);
        let mut report = SyncReport {
            symbol: symbol.symbol.clone(),
            ..Default::default()
        };
        let mut latest: Option<i64> = None;

        loop {
            debug!("Fetching {} {} trades from {:?}", exchange, symbol.symbol, cursor);
            let mut page = self
                .venue
                .list_trades(credential, &symbol.symbol, cursor, PAGE_SIZE)
                .await
                .with_context(|| format!("Failed to fetch {} trades", symbol.symbol))?;
            report.pages += 1;
            if page.is_empty() {
                break;
            }
            page.sort_by_key(|t| watermark(kind, t));
            report.fetched += page.len() as u64;

            for fill in &page {
                let (bubble, trade) = journal_pair(credential.user_id, exchange, timeframe, fill, Utc::now());
                match self.journal.insert_trade_with_bubble(&bubble, &trade).await? {
                    PairedInsertOutcome::Inserted => report.inserted += 1,
                    PairedInsertOutcome::Duplicate => report.duplicates += 1,
                }
            }

            let page_max = page.last().map(|t| watermark(kind, t));
            latest = latest.max(page_max);
            match page_max {
                // Time-cursored venues return the whole range in one call
                Some(max_id) if kind == CursorKind::TradeId && page.len() >= PAGE_SIZE as usize => {
                    cursor = TradeCursor::FromId(max_id + 1)
                }
                _ => break,
            }
        }

        report.cursor = state.map(|s| s.last_trade_id);
        if let Some(last_trade_id) = latest {
            self.sync_state
                .upsert(&TradeSyncState {
                    user_id: credential.user_id,
                    exchange: exchange.as_str().to_string(),
                    symbol: symbol.symbol.clone(),
                    last_trade_id,
                    last_sync_at: Utc::now(),
                })
                .await?;
            report.cursor = report.cursor.max(Some(last_trade_id));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use kifu_rust_core::models::TradeSide;
    use rust_decimal_macros::dec;

    fn state(last_trade_id: i64) -> TradeSyncState {
        TradeSyncState {
            user_id: Uuid::new_v4(),
            exchange: "binance_futures".to_string(),
            symbol: "BTCUSDT".to_string(),
            last_trade_id,
            last_sync_at: Utc::now(),
        }
    }

    #[test]
    fn test_cursor_resumes_after_last_id() {
        let now = Utc::now();
        assert_eq!(
            initial_cursor(CursorKind::TradeId, Some(&state(1050)), None, now, 7),
            TradeCursor::FromId(1051)
        );
    }

    #[test]
    fn test_cursor_without_state_uses_lookback() {
        let now = Utc::now();
        assert_eq!(
            initial_cursor(CursorKind::TradeId, None, None, now, 7),
            TradeCursor::Since(now - Duration::days(7))
        );
        assert_eq!(
            initial_cursor(CursorKind::TradeId, Some(&state(0)), None, now, 7),
            TradeCursor::Since(now - Duration::days(7))
        );

        let options = SyncOptions {
            full_backfill: false,
            history_days: Some(99_999),
        };
        assert_eq!(
            initial_cursor(CursorKind::TradeId, None, Some(&options), now, 7),
            TradeCursor::Since(now - Duration::days(3650))
        );
    }

    #[test]
    fn test_full_backfill_ignores_cursor() {
        let options = SyncOptions {
            full_backfill: true,
            history_days: None,
        };
        assert_eq!(
            initial_cursor(CursorKind::TradeId, Some(&state(1050)), Some(&options), Utc::now(), 7),
            TradeCursor::FromId(0)
        );
    }

    #[test]
    fn test_configured_lookback_is_capped() {
        let now = Utc::now();
        assert_eq!(
            initial_cursor(CursorKind::TradeId, None, None, now, u32::MAX),
            TradeCursor::Since(now - Duration::days(3650))
        );
        assert_eq!(
            initial_cursor(CursorKind::ExecutionTime, None, None, now, u32::MAX),
            TradeCursor::Since(now - Duration::days(3650))
        );
    }

    #[test]
    fn test_time_cursor_resumes_before_last_execution() {
        let now = Utc::now();
        let last = Utc.with_ymd_and_hms(2024, 6, 3, 14, 37, 12).unwrap();
        assert_eq!(
            initial_cursor(CursorKind::ExecutionTime, Some(&state(last.timestamp_millis())), None, now, 7),
            TradeCursor::Since(last - Duration::minutes(1))
        );

        let backfill = SyncOptions {
            full_backfill: true,
            history_days: Some(30),
        };
        assert_eq!(
            initial_cursor(CursorKind::ExecutionTime, Some(&state(last.timestamp_millis())), Some(&backfill), now, 7),
            TradeCursor::Since(now - Duration::days(30))
        );
        let everything = SyncOptions {
            full_backfill: true,
            history_days: None,
        };
        assert_eq!(
            initial_cursor(CursorKind::ExecutionTime, None, Some(&everything), now, 7),
            TradeCursor::Since(now - Duration::days(3650))
        );
    }

    #[test]
    fn test_journal_pair_links_rows() {
        let executed_at = Utc.with_ymd_and_hms(2024, 6, 3, 14, 37, 12).unwrap();
        let fill = VenueTrade {
            external_id: 77,
            symbol: "ETHUSDT".to_string(),
            side: TradeSide::Sell,
            quantity: dec!(0.5),
            price: dec!(3521.4),
            realized_pnl: Some(dec!(-1.2)),
            executed_at,
        };
        let user = Uuid::new_v4();
        let (bubble, trade) = journal_pair(user, Exchange::BinanceFutures, "4h", &fill, Utc::now());

        assert_eq!(trade.bubble_id, Some(bubble.id));
        assert_eq!(bubble.candle_time, Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap());
        assert_eq!(bubble.memo.as_deref(), Some("Auto-recorded: ETHUSDT SELL @ 3521.4"));
        assert_eq!(bubble.bubble_type, "auto");
        assert_eq!(trade.exchange, "binance_futures");
        assert_eq!(trade.external_trade_id, 77);
    }

    #[test]
    fn test_registry_blocks_duplicate_pollers() {
        let registry = SyncRegistry::new();
        let shutdown = CancellationToken::new();
        let user = Uuid::new_v4();

        let (id, token) = registry
            .try_register(user, Exchange::BinanceSpot, &shutdown)
            .unwrap();
        assert!(registry.try_register(user, Exchange::BinanceSpot, &shutdown).is_none());
        assert!(registry.try_register(user, Exchange::BinanceFutures, &shutdown).is_some());

        // Parent cancellation reaches the child
        shutdown.cancel();
        assert!(token.is_cancelled());

        registry.deregister(user, Exchange::BinanceSpot, id);
        assert!(!registry.is_running(user, Exchange::BinanceSpot));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_stop_cancels_one_poller() {
        let registry = SyncRegistry::new();
        let shutdown = CancellationToken::new();
        let user = Uuid::new_v4();
        let (stale_id, token) = registry
            .try_register(user, Exchange::BinanceFutures, &shutdown)
            .unwrap();

        assert!(registry.stop(user, Exchange::BinanceFutures));
        assert!(token.is_cancelled());
        assert!(!shutdown.is_cancelled());

        // A replacement poller is not removed by the old one exiting
        registry
            .try_register(user, Exchange::BinanceFutures, &shutdown)
            .unwrap();
        registry.deregister(user, Exchange::BinanceFutures, stale_id);
        assert!(registry.is_running(user, Exchange::BinanceFutures));
    }
}
