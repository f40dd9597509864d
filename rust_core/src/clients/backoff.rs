//! Rate-limit aware request retry
//!
//! Market-data and venue endpoints answer HTTP 429 when we call them too often.
//! Only that response is retried, honouring `Retry-After` when present and
//! falling back to exponential backoff; every other failure is returned to the
//! caller immediately.

use reqwest::{RequestBuilder, Response, StatusCode};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{endpoint} still rate limited after {attempts} attempts")]
    RateLimited { endpoint: String, attempts: u32 },
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("malformed response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

/// Retry policy for 429 responses
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub max_attempts: u32,
    /// First fallback delay when no Retry-After header is sent
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RateLimitPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Delay before retrying after `attempt` (1-based) was rate limited
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(wait) = retry_after {
            return wait.min(self.max_delay);
        }
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Outcome of a single attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Done(T),
    RateLimited { retry_after: Option<Duration> },
}

/// Parse a `Retry-After` header given in whole seconds
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}

/// Run `f` until it stops reporting a rate limit or attempts are exhausted
pub async fn retry_rate_limited<F, Fut, T>(
    policy: &RateLimitPolicy,
    endpoint: &str,
    mut f: F,
) -> Result<T, FeedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, FeedError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::RateLimited { retry_after } => {
                if attempt >= policy.max_attempts {
                    return Err(FeedError::RateLimited {
                        endpoint: endpoint.to_string(),
                        attempts: attempt,
                    });
                }
                let wait = policy.delay_for(attempt, retry_after);
                warn!(
                    "{} rate limited (attempt {}/{}), retrying in {:?}",
                    endpoint, attempt, policy.max_attempts, wait
                );
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Send a request built fresh for every attempt, retrying only on 429.
///
/// Non-success statuses other than 429 become [`FeedError::Status`].
pub async fn send_with_backoff<B>(
    policy: &RateLimitPolicy,
    endpoint: &str,
    build: B,
) -> Result<Response, FeedError>
where
    B: Fn() -> RequestBuilder,
{
    let build = &build;
    retry_rate_limited(policy, endpoint, move || async move {
        let response = build().send().await?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            return Ok(Attempt::RateLimited { retry_after });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Status {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }
        Ok(Attempt::Done(response))
    })
    .await
}
