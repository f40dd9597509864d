//! Outbound trigger events
//!
//! The alert scheduler publishes one [`AlertEvent`] per created alert onto a
//! bounded channel and never waits on it. A [`TriggerDispatcher`] task drains
//! the channel into a [`TriggerSink`] (notification delivery, briefing
//! generation, ...). Sink failures are logged and counted only.

use crate::stats::ReconcilerStats;
use anyhow::Result;
use async_trait::async_trait;
use kifu_rust_core::models::{Alert, RuleType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert: Alert,
    pub rule_id: Uuid,
    pub rule_name: String,
    pub rule_type: RuleType,
}

/// Receiver side of alert triggers
#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn deliver(&self, event: &AlertEvent) -> Result<()>;
}

/// Default sink: writes the alert to the log
pub struct LogTriggerSink;

#[async_trait]
impl TriggerSink for LogTriggerSink {
    async fn deliver(&self, event: &AlertEvent) -> Result<()> {
        info!(
            "Alert {} [{}] {} rule '{}': {}",
            event.alert.id,
            event.alert.severity.as_str(),
            event.alert.symbol,
            event.rule_name,
            event.alert.trigger_reason
        );
        Ok(())
    }
}

/// Create a linked publisher/dispatcher pair
pub fn trigger_channel(
    capacity: usize,
    sink: Arc<dyn TriggerSink>,
    stats: Arc<ReconcilerStats>,
) -> (TriggerPublisher, TriggerDispatcher) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        TriggerPublisher {
            tx,
            stats: stats.clone(),
        },
        TriggerDispatcher { rx, sink, stats },
    )
}

#[derive(Clone)]
pub struct TriggerPublisher {
    tx: mpsc::Sender<AlertEvent>,
    stats: Arc<ReconcilerStats>,
}

impl TriggerPublisher {
    /// Non-blocking publish. Returns false when the event was dropped.
    pub fn publish(&self, event: AlertEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("Trigger channel full, dropping event for alert {}", event.alert.id);
                ReconcilerStats::add(&self.stats.triggers_dropped, 1);
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!("Trigger channel closed, dropping event for alert {}", event.alert.id);
                ReconcilerStats::add(&self.stats.triggers_dropped, 1);
                false
            }
        }
    }
}

pub struct TriggerDispatcher {
    rx: mpsc::Receiver<AlertEvent>,
    sink: Arc<dyn TriggerSink>,
    stats: Arc<ReconcilerStats>,
}

impl TriggerDispatcher {
    /// Deliver events until every publisher is gone.
    ///
    /// Publishers live inside the alert scheduler, so the channel closes only
    /// after its last cycle has returned and everything it published is
    /// delivered here.
    pub async fn run(mut self) {
        info!("Trigger dispatcher started");
        while let Some(event) = self.rx.recv().await {
            self.dispatch(&event).await;
        }
        info!("Trigger dispatcher stopped");
    }

    async fn dispatch(&self, event: &AlertEvent) {
        match self.sink.deliver(event).await {
            Ok(()) => {
                debug!("Delivered trigger for alert {}", event.alert.id);
                ReconcilerStats::add(&self.stats.triggers_delivered, 1);
            }
            Err(e) => {
                warn!("Trigger delivery for alert {} failed: {:#}", event.alert.id, e);
                ReconcilerStats::add(&self.stats.errors, 1);
            }
        }
    }
}
