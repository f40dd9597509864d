//! Configuration for reconciler_rust

use anyhow::{anyhow, Result};
use chrono::Duration as ChronoDuration;
use kifu_rust_core::models::timeframe::parse_horizons;
use kifu_rust_core::models::Horizon;
use kifu_rust_core::utils::parse_decimal;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::env;
use std::time::Duration;
use tracing::info;

/// Upper bound for hour-based retention and lookback windows (ten years)
pub const MAX_WINDOW_HOURS: u64 = 24 * 3650;
/// Upper bound for the trade sync lookback
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    // Database
    pub database_url: String,

    // Alert scheduler
    pub alert_interval_secs: u64,
    pub price_cache_ttl_secs: u64,
    pub alert_retention_hours: u64,
    pub trigger_channel_capacity: usize,

    // Outcome scheduler
    pub outcome_interval_secs: u64,
    pub outcome_horizons: Vec<Horizon>,
    pub outcome_batch_size: i64,
    pub decision_outcome_batch_size: i64,

    // Accuracy reconciler
    pub accuracy_interval_secs: u64,
    pub accuracy_lookback_hours: u64,
    pub accuracy_batch_size: i64,
    pub accuracy_dead_zone_pct: Decimal,

    // Trade sync
    pub trade_sync_enabled: bool,
    pub trade_sync_interval_secs: u64,
    pub trade_sync_timeout_secs: u64,
    pub trade_sync_max_symbols: usize,
    pub trade_sync_lookback_days: u32,
    pub trade_sync_credential_refresh_secs: u64,

    // Price feed
    pub price_feed_base_url: String,
    pub price_feed_timeout_secs: u64,
    pub rate_limit_max_attempts: u32,

    // Monitoring
    pub stats_log_interval_secs: u64,
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow!("DATABASE_URL must be set"))?;

        let config = Self {
            database_url,

            alert_interval_secs: parse_u64("ALERT_INTERVAL_SECS", 30)?,
            price_cache_ttl_secs: parse_u64("PRICE_CACHE_TTL_SECS", 10)?,
            alert_retention_hours: parse_u64("ALERT_RETENTION_HOURS", 24)?,
            trigger_channel_capacity: parse_u64("TRIGGER_CHANNEL_CAPACITY", 256)? as usize,

            outcome_interval_secs: parse_u64("OUTCOME_INTERVAL_SECS", 60)?,
            outcome_horizons: parse_horizons(
                &env::var("OUTCOME_INTERVALS").unwrap_or_else(|_| "1h,4h,1d".to_string()),
            ),
            outcome_batch_size: parse_u64("OUTCOME_BATCH_SIZE", 200)? as i64,
            decision_outcome_batch_size: parse_u64("DECISION_OUTCOME_BATCH_SIZE", 100)? as i64,

            accuracy_interval_secs: parse_u64("ACCURACY_INTERVAL_SECS", 90)?,
            accuracy_lookback_hours: parse_u64("ACCURACY_LOOKBACK_HOURS", 48)?,
            accuracy_batch_size: parse_u64("ACCURACY_BATCH_SIZE", 100)? as i64,
            accuracy_dead_zone_pct: parse_dec("ACCURACY_DEAD_ZONE_PCT", dec!(0.5))?,

            trade_sync_enabled: parse_bool("TRADE_SYNC_ENABLED", true)?,
            trade_sync_interval_secs: parse_u64("TRADE_SYNC_INTERVAL_SECS", 300)?,
            trade_sync_timeout_secs: parse_u64("TRADE_SYNC_TIMEOUT_SECS", 15)?,
            trade_sync_max_symbols: parse_u64("TRADE_SYNC_MAX_SYMBOLS", 20)? as usize,
            trade_sync_lookback_days: parse_u32("TRADE_SYNC_LOOKBACK_DAYS", 7)?,
            trade_sync_credential_refresh_secs: parse_u64("TRADE_SYNC_CREDENTIAL_REFRESH_SECS", 600)?,

            price_feed_base_url: env::var("PRICE_FEED_BASE_URL")
                .unwrap_or_else(|_| "https://fapi.binance.com".to_string()),
            price_feed_timeout_secs: parse_u64("PRICE_FEED_TIMEOUT_SECS", 10)?,
            rate_limit_max_attempts: parse_u32("RATE_LIMIT_MAX_ATTEMPTS", 3)?,

            stats_log_interval_secs: parse_u64("STATS_LOG_INTERVAL_SECS", 300)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let intervals = [
            ("ALERT_INTERVAL_SECS", self.alert_interval_secs),
            ("OUTCOME_INTERVAL_SECS", self.outcome_interval_secs),
            ("ACCURACY_INTERVAL_SECS", self.accuracy_interval_secs),
            ("TRADE_SYNC_INTERVAL_SECS", self.trade_sync_interval_secs),
            ("TRADE_SYNC_CREDENTIAL_REFRESH_SECS", self.trade_sync_credential_refresh_secs),
            ("STATS_LOG_INTERVAL_SECS", self.stats_log_interval_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(anyhow!("{} must be > 0", name));
            }
        }
        if self.trigger_channel_capacity == 0 {
            return Err(anyhow!("TRIGGER_CHANNEL_CAPACITY must be > 0"));
        }
        if self.rate_limit_max_attempts == 0 {
            return Err(anyhow!("RATE_LIMIT_MAX_ATTEMPTS must be >= 1"));
        }
        if self.accuracy_dead_zone_pct.is_sign_negative() {
            return Err(anyhow!("ACCURACY_DEAD_ZONE_PCT must be >= 0"));
        }
        let windows = [
            ("ALERT_RETENTION_HOURS", self.alert_retention_hours),
            ("ACCURACY_LOOKBACK_HOURS", self.accuracy_lookback_hours),
        ];
        for (name, value) in windows {
            if value > MAX_WINDOW_HOURS {
                return Err(anyhow!("{} must be <= {}", name, MAX_WINDOW_HOURS));
            }
        }
        if self.trade_sync_lookback_days > MAX_LOOKBACK_DAYS {
            return Err(anyhow!("TRADE_SYNC_LOOKBACK_DAYS must be <= {}", MAX_LOOKBACK_DAYS));
        }
        if self.outcome_batch_size <= 0 || self.decision_outcome_batch_size <= 0 || self.accuracy_batch_size <= 0 {
            return Err(anyhow!("batch sizes must be > 0"));
        }
        Ok(())
    }

    pub fn alert_interval(&self) -> Duration {
        Duration::from_secs(self.alert_interval_secs)
    }

    pub fn outcome_interval(&self) -> Duration {
        Duration::from_secs(self.outcome_interval_secs)
    }

    pub fn accuracy_interval(&self) -> Duration {
        Duration::from_secs(self.accuracy_interval_secs)
    }

    pub fn trade_sync_interval(&self) -> Duration {
        Duration::from_secs(self.trade_sync_interval_secs)
    }

    /// Age after which pending alerts expire, capped at [`MAX_WINDOW_HOURS`]
    pub fn alert_retention(&self) -> ChronoDuration {
        hours_window(self.alert_retention_hours)
    }

    /// How far back outcomes are scored, capped at [`MAX_WINDOW_HOURS`]
    pub fn accuracy_lookback(&self) -> ChronoDuration {
        hours_window(self.accuracy_lookback_hours)
    }

    pub fn log_config(&self) {
        info!("Reconciler configuration:");
        info!(
            "  Alerts: every {}s, price cache {}s, retention {}h, trigger channel {}",
            self.alert_interval_secs,
            self.price_cache_ttl_secs,
            self.alert_retention_hours,
            self.trigger_channel_capacity
        );
        info!(
            "  Outcomes: every {}s, horizons [{}], batch {} / decisions {}",
            self.outcome_interval_secs,
            self.outcome_horizons
                .iter()
                .map(|h| format!("{}={}m", h.period, h.duration.num_minutes()))
                .collect::<Vec<_>>()
                .join(", "),
            self.outcome_batch_size,
            self.decision_outcome_batch_size
        );
        info!(
            "  Accuracy: every {}s, lookback {}h, batch {}, dead zone {}%",
            self.accuracy_interval_secs,
            self.accuracy_lookback_hours,
            self.accuracy_batch_size,
            self.accuracy_dead_zone_pct
        );
        info!(
            "  Trade sync: enabled={}, every {}s, timeout {}s, max symbols {}, lookback {}d",
            self.trade_sync_enabled,
            self.trade_sync_interval_secs,
            self.trade_sync_timeout_secs,
            self.trade_sync_max_symbols,
            self.trade_sync_lookback_days
        );
        info!(
            "  Price feed: {} (timeout {}s, 429 attempts {})",
            self.price_feed_base_url, self.price_feed_timeout_secs, self.rate_limit_max_attempts
        );
    }
}

fn hours_window(hours: u64) -> ChronoDuration {
    ChronoDuration::hours(hours.min(MAX_WINDOW_HOURS) as i64)
}

/// Parse environment variable as u64 with default fallback
fn parse_u64(var_name: &str, default: u64) -> Result<u64> {
    match env::var(var_name) {
        Ok(val) => val.trim().parse().map_err(|_| anyhow!("{} must be a valid u64", var_name)),
        Err(_) => Ok(default),
    }
}

/// Parse environment variable as u32 with default fallback
fn parse_u32(var_name: &str, default: u32) -> Result<u32> {
    match env::var(var_name) {
        Ok(val) => val.trim().parse().map_err(|_| anyhow!("{} must be a valid u32", var_name)),
        Err(_) => Ok(default),
    }
}

fn parse_bool(var_name: &str, default: bool) -> Result<bool> {
    match env::var(var_name) {
        Ok(val) => val
            .trim()
            .to_lowercase()
            .parse()
            .map_err(|_| anyhow!("{} must be true or false", var_name)),
        Err(_) => Ok(default),
    }
}

fn parse_dec(var_name: &str, default: Decimal) -> Result<Decimal> {
    match env::var(var_name) {
        Ok(val) => parse_decimal(&val).ok_or_else(|| anyhow!("{} must be a valid decimal", var_name)),
        Err(_) => Ok(default),
    }
}
