//! Process-wide counters, logged periodically

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
pub struct ReconcilerStats {
    // Alerts
    pub rules_evaluated: AtomicU64,
    pub alerts_triggered: AtomicU64,
    pub check_states_saved: AtomicU64,
    pub alerts_expired: AtomicU64,
    pub triggers_delivered: AtomicU64,
    pub triggers_dropped: AtomicU64,

    // Outcomes & accuracy
    pub outcomes_created: AtomicU64,
    pub decision_outcomes_created: AtomicU64,
    pub outcome_prices_missing: AtomicU64,
    pub accuracies_created: AtomicU64,

    // Trade sync
    pub trades_imported: AtomicU64,
    pub trade_duplicates: AtomicU64,
    pub sync_failures: AtomicU64,
    /// Credentials skipped because no trade client serves their exchange
    pub unsupported_credentials: AtomicU64,

    /// Per-subject failures across every scheduler
    pub errors: AtomicU64,
}

impl ReconcilerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> ReconcilerStatsSnapshot {
        ReconcilerStatsSnapshot {
            rules_evaluated: self.rules_evaluated.load(Ordering::Relaxed),
            alerts_triggered: self.alerts_triggered.load(Ordering::Relaxed),
            check_states_saved: self.check_states_saved.load(Ordering::Relaxed),
            alerts_expired: self.alerts_expired.load(Ordering::Relaxed),
            triggers_delivered: self.triggers_delivered.load(Ordering::Relaxed),
            triggers_dropped: self.triggers_dropped.load(Ordering::Relaxed),
            outcomes_created: self.outcomes_created.load(Ordering::Relaxed),
            decision_outcomes_created: self.decision_outcomes_created.load(Ordering::Relaxed),
            outcome_prices_missing: self.outcome_prices_missing.load(Ordering::Relaxed),
            accuracies_created: self.accuracies_created.load(Ordering::Relaxed),
            trades_imported: self.trades_imported.load(Ordering::Relaxed),
            trade_duplicates: self.trade_duplicates.load(Ordering::Relaxed),
            sync_failures: self.sync_failures.load(Ordering::Relaxed),
            unsupported_credentials: self.unsupported_credentials.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStatsSnapshot {
    pub rules_evaluated: u64,
    pub alerts_triggered: u64,
    pub check_states_saved: u64,
    pub alerts_expired: u64,
    pub triggers_delivered: u64,
    pub triggers_dropped: u64,
    pub outcomes_created: u64,
    pub decision_outcomes_created: u64,
    pub outcome_prices_missing: u64,
    pub accuracies_created: u64,
    pub trades_imported: u64,
    pub trade_duplicates: u64,
    pub sync_failures: u64,
    pub unsupported_credentials: u64,
    pub errors: u64,
}

/// Log a snapshot every `interval` until shutdown
pub async fn run_stats_logger(stats: Arc<ReconcilerStats>, interval: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let s = stats.snapshot();
        info!(
            "Reconciler stats: rules={}, triggered={}, states={}, expired={}, delivered={}, dropped={}",
            s.rules_evaluated,
            s.alerts_triggered,
            s.check_states_saved,
            s.alerts_expired,
            s.triggers_delivered,
            s.triggers_dropped
        );
        info!(
            "Reconciler stats: outcomes={}, decision_outcomes={}, missing_prices={}, accuracies={}, trades={}, duplicates={}, sync_failures={}, unsupported_credentials={}, errors={}",
            s.outcomes_created,
            s.decision_outcomes_created,
            s.outcome_prices_missing,
            s.accuracies_created,
            s.trades_imported,
            s.trade_duplicates,
            s.sync_failures,
            s.unsupported_credentials,
            s.errors
        );
    }

    let s = stats.snapshot();
    info!(
        "Final stats: triggered={}, outcomes={}, accuracies={}, trades={}, errors={}",
        s.alerts_triggered,
        s.outcomes_created + s.decision_outcomes_created,
        s.accuracies_created,
        s.trades_imported,
        s.errors
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = ReconcilerStats::new();
        ReconcilerStats::add(&stats.alerts_triggered, 2);
        ReconcilerStats::add(&stats.errors, 0);
        stats.trades_imported.fetch_add(5, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.alerts_triggered, 2);
        assert_eq!(snap.trades_imported, 5);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn test_logger_stops_on_shutdown() {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_stats_logger(
            Arc::new(ReconcilerStats::new()),
            Duration::from_secs(3600),
            shutdown.clone(),
        ));
        shutdown.cancel();
        assert!(handle.await.is_ok());
    }
}
