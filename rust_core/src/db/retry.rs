//! Database retry logic for transient failures
//!
//! Idempotent statements are retried with exponential backoff when the failure
//! looks like a dropped connection, pool exhaustion or a serialization conflict.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff settings for [`execute_with_retry`]
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Execute a database operation, retrying transient failures
///
/// # Example
/// ```ignore
/// let rows = execute_with_retry(RetryPolicy::default(), || async {
///     sqlx::query("UPDATE alerts SET status = 'expired' WHERE created_at < $1")
///         .bind(cutoff)
///         .execute(&pool)
///         .await
///         .map_err(anyhow::Error::from)
/// })
/// .await?;
/// ```
pub async fn execute_with_retry<F, Fut, T>(policy: RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < policy.max_attempts && is_transient(&e) => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "Database operation failed (attempt {}/{}): {}. Retrying in {:?}",
                    attempt, policy.max_attempts, e, backoff
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// SQLSTATE codes worth retrying
const TRANSIENT_SQLSTATES: &[&str] = &[
    "40001", // serialization_failure
    "40P01", // deadlock_detected
    "53300", // too_many_connections
    "57P01", // admin_shutdown
    "08006", // connection_failure
];

/// Check if a database error is worth retrying
pub fn is_transient(e: &anyhow::Error) -> bool {
    if let Some(db_err) = e.downcast_ref::<sqlx::Error>() {
        return match db_err {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
            sqlx::Error::Database(inner) => inner
                .code()
                .map(|code| TRANSIENT_SQLSTATES.iter().any(|c| code == *c))
                .unwrap_or(false),
            _ => false,
        };
    }

    let err_str = e.to_string().to_lowercase();
    err_str.contains("connection reset")
        || err_str.contains("connection refused")
        || err_str.contains("connection closed")
        || err_str.contains("broken pipe")
        || err_str.contains("timed out")
        || err_str.contains("deadlock detected")
        || err_str.contains("could not serialize")
}
