//! Timer-driven cycle runner shared by every scheduler

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run `cycle` now and then once per `interval` until `shutdown` is raised.
///
/// Cancellation is observed between cycles, so a running cycle always
/// finishes. A failed cycle is logged and the next one runs on schedule.
pub async fn run_periodic<F, Fut>(
    name: &str,
    interval: Duration,
    shutdown: CancellationToken,
    mut cycle: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    info!("{} started (every {}s)", name, interval.as_secs());

    while !shutdown.is_cancelled() {
        if let Err(e) = cycle().await {
            warn!("{} cycle failed: {:#}", name, e);
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = sleep(interval) => {}
        }
    }

    info!("{} stopped", name);
}
