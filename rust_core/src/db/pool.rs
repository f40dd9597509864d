//! Database connection pool configuration

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Database pool configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbPoolConfig {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum lifetime of a connection (prevents stale connections)
    pub max_lifetime: Duration,
    /// Maximum idle time before a connection is closed
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        // Four schedulers plus one poller per credential; most work is serial
        Self {
            max_connections: 10,
            min_connections: 2,
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl DbPoolConfig {
    /// Load overrides from `DB_POOL_*` environment variables.
    ///
    /// Unset variables keep the defaults; unparseable values are an error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_connections: env_or("DB_POOL_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_or("DB_POOL_MIN_CONNECTIONS", defaults.min_connections)?,
            max_lifetime: Duration::from_secs(env_or(
                "DB_POOL_MAX_LIFETIME_SECS",
                defaults.max_lifetime.as_secs(),
            )?),
            idle_timeout: Duration::from_secs(env_or(
                "DB_POOL_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )?),
            acquire_timeout: Duration::from_secs(env_or(
                "DB_POOL_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout.as_secs(),
            )?),
        };
        if config.min_connections > config.max_connections {
            anyhow::bail!(
                "DB_POOL_MIN_CONNECTIONS ({}) exceeds DB_POOL_MAX_CONNECTIONS ({})",
                config.min_connections,
                config.max_connections
            );
        }
        Ok(config)
    }
}

fn env_or<T: FromStr>(var: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", var, raw, e)),
        _ => Ok(default),
    }
}

/// Create a PostgreSQL connection pool
pub async fn create_pool(database_url: &str, config: DbPoolConfig) -> Result<PgPool> {
    info!(
        "Creating database pool: max={}, min={}, max_lifetime={:?}, idle_timeout={:?}",
        config.max_connections, config.min_connections, config.max_lifetime, config.idle_timeout
    );

    let connect_opts = PgConnectOptions::from_str(database_url)
        .context("Failed to parse database URL")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_opts)
        .await
        .context("Failed to create database pool")?;

    info!("Database pool created successfully");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbPoolConfig::default();
        assert_eq!(config.max_connections, 10);
        assert!(config.min_connections <= config.max_connections);
    }

    #[test]
    fn test_env_or() {
        std::env::set_var("KIFU_TEST_POOL_VALUE", " 7 ");
        assert_eq!(env_or("KIFU_TEST_POOL_VALUE", 1_u32).unwrap(), 7);
        std::env::set_var("KIFU_TEST_POOL_VALUE", "seven");
        assert!(env_or("KIFU_TEST_POOL_VALUE", 1_u32).is_err());
        std::env::remove_var("KIFU_TEST_POOL_VALUE");
        assert_eq!(env_or("KIFU_TEST_POOL_VALUE", 1_u32).unwrap(), 1);
    }
}
