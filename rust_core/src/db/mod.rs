//! PostgreSQL storage.
//!
//! [`PgStore`] implements every port in [`crate::repositories`] with raw
//! `sqlx::query` statements. Idempotent statements go through
//! [`retry::execute_with_retry`]; the paired journal insert runs in a single
//! transaction and is not retried.

pub mod pool;
pub mod retry;

mod alerts;
mod opinions;
mod outcomes;
mod trades;

pub use pool::{create_pool, DbPoolConfig};
pub use retry::{execute_with_retry, RetryPolicy};

use anyhow::Result;
use sqlx::PgPool;
use std::sync::Arc;

/// Turns stored credential material into usable API keys.
///
/// Encryption at rest is owned by the service that writes credentials; this
/// crate only needs the inverse.
pub trait SecretOpener: Send + Sync {
    fn open(&self, sealed: &str) -> Result<String>;
}

/// For deployments where credentials are already decrypted upstream (a view
/// or a sidecar), so the stored value is the key itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextSecrets;

impl SecretOpener for PlaintextSecrets {
    fn open(&self, sealed: &str) -> Result<String> {
        Ok(sealed.to_string())
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    secrets: Arc<dyn SecretOpener>,
    retry: RetryPolicy,
}

impl PgStore {
    pub fn new(pool: PgPool, secrets: Arc<dyn SecretOpener>) -> Self {
        Self {
            pool,
            secrets,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
