//! reconciler_rust: background reconciliation for the trading journal
//!
//! - Alert scheduler: evaluates user rules against live prices
//! - Outcome scheduler: forward returns for journal entries and alert decisions
//! - Accuracy reconciler: scores AI opinions against realized outcomes
//! - Trade sync: incremental import of exchange fills as journal entries

pub mod accuracy;
pub mod alert_scheduler;
pub mod config;
pub mod evaluator;
pub mod events;
pub mod outcome_scheduler;
pub mod price_cache;
pub mod scheduler;
pub mod service;
pub mod stats;
pub mod trade_sync;

pub use config::ReconcilerConfig;
pub use service::{Ports, ReconcilerService};
