use anyhow::{Context, Result};
use dotenv::dotenv;
use kifu_rust_core::clients::{
    BinanceFuturesFeed, BinanceTradeClient, RateLimitPolicy, UpbitTradeClient, VenueRouter,
};
use kifu_rust_core::models::Exchange;
use kifu_rust_core::db::{create_pool, DbPoolConfig, PgStore, PlaintextSecrets};
use reconciler_rust::events::LogTriggerSink;
use reconciler_rust::{Ports, ReconcilerConfig, ReconcilerService};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("Starting reconciler_rust...");

    let config = ReconcilerConfig::from_env()?;
    config.log_config();

    // Database
    let pool_config = DbPoolConfig::from_env()?;
    let pool = create_pool(&config.database_url, pool_config)
        .await
        .context("Failed to connect to database")?;
    let store = PgStore::new(pool, Arc::new(PlaintextSecrets));

    // Market data and exchange clients
    let policy = RateLimitPolicy::with_max_attempts(config.rate_limit_max_attempts);
    let feed = BinanceFuturesFeed::new(
        &config.price_feed_base_url,
        Duration::from_secs(config.price_feed_timeout_secs),
        policy.clone(),
    )
    .context("Failed to initialize price feed")?;
    let venue_timeout = Duration::from_secs(config.trade_sync_timeout_secs);
    let binance = Arc::new(
        BinanceTradeClient::new(venue_timeout, policy.clone()).context("Failed to initialize Binance trade client")?,
    );
    let upbit = UpbitTradeClient::new(venue_timeout, policy).context("Failed to initialize Upbit trade client")?;
    let venue = VenueRouter::new()
        .with(Exchange::BinanceFutures, binance.clone())
        .with(Exchange::BinanceSpot, binance)
        .with(Exchange::Upbit, Arc::new(upbit));

    let service = ReconcilerService::new(
        config,
        Ports::from_store(store),
        Arc::new(feed),
        Arc::new(venue),
        Arc::new(LogTriggerSink),
    );

    let shutdown = CancellationToken::new();
    let tasks = service.start(&shutdown)?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, waiting for running cycles");
    shutdown.cancel();

    for result in futures_util::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("Task ended abnormally: {}", e);
        }
    }

    info!("reconciler_rust stopped");
    Ok(())
}
