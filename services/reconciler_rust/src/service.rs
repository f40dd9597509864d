//! ReconcilerService: wires the schedulers to storage and feeds and spawns
//! their tasks

use crate::accuracy::AccuracyReconciler;
use crate::alert_scheduler::AlertScheduler;
use crate::config::ReconcilerConfig;
use crate::events::{trigger_channel, TriggerSink};
use crate::outcome_scheduler::OutcomeScheduler;
use crate::price_cache::PriceCache;
use crate::scheduler::run_periodic;
use crate::stats::{run_stats_logger, ReconcilerStats};
use crate::trade_sync::{SyncRegistry, TradeSyncScheduler, TradeSyncSettings};
use anyhow::Result;
use chrono::Utc;
use kifu_rust_core::clients::{PriceFeed, VenueTradeClient};
use kifu_rust_core::repositories::{
    AccuracyRepository, AiOpinionRepository, AlertOutcomeRepository, AlertRepository,
    AlertRuleRepository, CredentialRepository, OutcomeRepository, TradeJournalRepository,
    TradeSyncStateRepository, UserSymbolRepository,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Storage ports used by the schedulers
#[derive(Clone)]
pub struct Ports {
    pub rules: Arc<dyn AlertRuleRepository>,
    pub alerts: Arc<dyn AlertRepository>,
    pub outcomes: Arc<dyn OutcomeRepository>,
    pub alert_outcomes: Arc<dyn AlertOutcomeRepository>,
    pub opinions: Arc<dyn AiOpinionRepository>,
    pub accuracies: Arc<dyn AccuracyRepository>,
    pub sync_state: Arc<dyn TradeSyncStateRepository>,
    pub symbols: Arc<dyn UserSymbolRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub journal: Arc<dyn TradeJournalRepository>,
}

impl Ports {
    /// Use one store for every port
    pub fn from_store<S>(store: S) -> Self
    where
        S: AlertRuleRepository
            + AlertRepository
            + OutcomeRepository
            + AlertOutcomeRepository
            + AiOpinionRepository
            + AccuracyRepository
            + TradeSyncStateRepository
            + UserSymbolRepository
            + CredentialRepository
            + TradeJournalRepository
            + 'static,
    {
        let store = Arc::new(store);
        Self {
            rules: store.clone(),
            alerts: store.clone(),
            outcomes: store.clone(),
            alert_outcomes: store.clone(),
            opinions: store.clone(),
            accuracies: store.clone(),
            sync_state: store.clone(),
            symbols: store.clone(),
            credentials: store.clone(),
            journal: store,
        }
    }
}

pub struct ReconcilerService {
    config: ReconcilerConfig,
    ports: Ports,
    feed: Arc<dyn PriceFeed>,
    venue: Arc<dyn VenueTradeClient>,
    sink: Arc<dyn TriggerSink>,
    stats: Arc<ReconcilerStats>,
    registry: SyncRegistry,
}

impl ReconcilerService {
    pub fn new(
        config: ReconcilerConfig,
        ports: Ports,
        feed: Arc<dyn PriceFeed>,
        venue: Arc<dyn VenueTradeClient>,
        sink: Arc<dyn TriggerSink>,
    ) -> Self {
        Self {
            config,
            ports,
            feed,
            venue,
            sink,
            stats: Arc::new(ReconcilerStats::new()),
            registry: SyncRegistry::new(),
        }
    }

    pub fn stats(&self) -> Arc<ReconcilerStats> {
        self.stats.clone()
    }

    pub fn registry(&self) -> &SyncRegistry {
        &self.registry
    }

    /// Spawn every background task. All of them stop once `shutdown` is
    /// cancelled; the returned handles complete after their last cycle.
    pub fn start(&self, shutdown: &CancellationToken) -> Result<Vec<JoinHandle<()>>> {
        let config = &self.config;
        let mut tasks = Vec::new();

        // 1. Trigger dispatch
        let (publisher, dispatcher) =
            trigger_channel(config.trigger_channel_capacity, self.sink.clone(), self.stats.clone());
        tasks.push(tokio::spawn(dispatcher.run()));

        // 2. Alert scheduler
        let alerts = Arc::new(AlertScheduler::new(
            self.ports.rules.clone(),
            self.ports.alerts.clone(),
            self.feed.clone(),
            PriceCache::new(Duration::from_secs(config.price_cache_ttl_secs)),
            publisher,
            config.alert_retention(),
            self.stats.clone(),
        ));
        tasks.push(tokio::spawn(run_periodic(
            "Alert scheduler",
            config.alert_interval(),
            shutdown.clone(),
            move || {
                let alerts = alerts.clone();
                async move { alerts.run_cycle(Utc::now()).await.map(|_| ()) }
            },
        )));

        // 3. Outcome scheduler (journal entries + alert decisions)
        let outcomes = Arc::new(OutcomeScheduler::new(
            self.ports.outcomes.clone(),
            self.ports.alert_outcomes.clone(),
            self.feed.clone(),
            config.outcome_horizons.clone(),
            config.outcome_batch_size,
            config.decision_outcome_batch_size,
            self.stats.clone(),
        ));
        tasks.push(tokio::spawn(run_periodic(
            "Outcome scheduler",
            config.outcome_interval(),
            shutdown.clone(),
            move || {
                let outcomes = outcomes.clone();
                async move {
                    outcomes.run_cycle(Utc::now()).await;
                    Ok(())
                }
            },
        )));

        // 4. Accuracy reconciler
        let accuracy = Arc::new(AccuracyReconciler::new(
            self.ports.outcomes.clone(),
            self.ports.opinions.clone(),
            self.ports.accuracies.clone(),
            config.accuracy_lookback(),
            config.accuracy_batch_size,
            config.accuracy_dead_zone_pct,
            self.stats.clone(),
        )?);
        tasks.push(tokio::spawn(run_periodic(
            "Accuracy reconciler",
            config.accuracy_interval(),
            shutdown.clone(),
            move || {
                let accuracy = accuracy.clone();
                async move { accuracy.run_cycle(Utc::now()).await.map(|_| ()) }
            },
        )));

        // 5. Trade sync discovery + per-credential pollers
        if config.trade_sync_enabled {
            tasks.push(self.spawn_trade_sync(shutdown));
        } else {
            info!("Trade sync disabled");
        }

        // 6. Stats logger
        tasks.push(tokio::spawn(run_stats_logger(
            self.stats.clone(),
            Duration::from_secs(config.stats_log_interval_secs),
            shutdown.clone(),
        )));

        info!("Reconciler started {} tasks", tasks.len());
        Ok(tasks)
    }

    fn spawn_trade_sync(&self, shutdown: &CancellationToken) -> JoinHandle<()> {
        let config = &self.config;
        let sync = Arc::new(TradeSyncScheduler::new(
            self.ports.credentials.clone(),
            self.ports.symbols.clone(),
            self.ports.sync_state.clone(),
            self.ports.journal.clone(),
            self.venue.clone(),
            self.registry.clone(),
            TradeSyncSettings {
                poll_interval: config.trade_sync_interval(),
                max_symbols: config.trade_sync_max_symbols,
                lookback_days: config.trade_sync_lookback_days,
            },
            self.stats.clone(),
        ));

        let refresh = Duration::from_secs(config.trade_sync_credential_refresh_secs);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let pollers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

            let cycle_pollers = pollers.clone();
            let cycle_shutdown = shutdown.clone();
            run_periodic("Trade sync discovery", refresh, shutdown.clone(), move || {
                let sync = sync.clone();
                let pollers = cycle_pollers.clone();
                let shutdown = cycle_shutdown.clone();
                async move {
                    let started = sync.discover(&shutdown).await?;
                    let mut pollers = pollers.lock();
                    pollers.retain(|handle| !handle.is_finished());
                    pollers.extend(started);
                    Ok(())
                }
            })
            .await;

            let remaining: Vec<JoinHandle<()>> = pollers.lock().drain(..).collect();
            for handle in remaining {
                if let Err(e) = handle.await {
                    warn!("Trade poller ended abnormally: {}", e);
                }
            }
        })
    }
}
