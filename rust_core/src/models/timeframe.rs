//! Candle timeframes and outcome horizons.

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

/// Forward offset at which an outcome is evaluated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Horizon {
    /// Label stored with the outcome ("1h", "4h", "1d")
    pub period: String,
    pub duration: Duration,
}

impl Horizon {
    pub fn new(period: impl Into<String>, duration: Duration) -> Self {
        Self {
            period: period.into(),
            duration,
        }
    }
}

pub fn default_horizons() -> Vec<Horizon> {
    vec![
        Horizon::new("1h", Duration::hours(1)),
        Horizon::new("4h", Duration::hours(4)),
        Horizon::new("1d", Duration::days(1)),
    ]
}

/// Parse a comma-separated horizon list.
///
/// Tokens are labels (`1h`, `30m`, `1d`) or `label=duration` pairs such as
/// `1h=1m`, which keep the stored label but shorten the wait. Invalid tokens
/// are skipped; an empty result falls back to [`default_horizons`].
pub fn parse_horizons(spec: &str) -> Vec<Horizon> {
    let mut horizons = Vec::new();
    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let (label, span) = match token.split_once('=') {
            Some((label, span)) => (label.trim(), span.trim()),
            None => (token, token),
        };
        match (timeframe_duration(label), timeframe_duration(span)) {
            (Some(_), Some(duration)) => {
                if horizons.iter().any(|h: &Horizon| h.period == label) {
                    warn!("Duplicate outcome horizon '{}' ignored", label);
                    continue;
                }
                horizons.push(Horizon::new(label, duration));
            }
            _ => warn!("Ignoring invalid outcome horizon '{}'", token),
        }
    }
    if horizons.is_empty() {
        return default_horizons();
    }
    horizons
}

/// Longest span a timeframe label may describe
pub const MAX_TIMEFRAME_DAYS: i64 = 3650;

/// Duration of a timeframe label: `<n>m`, `<n>h`, `<n>d` or `<n>w`.
///
/// Spans beyond [`MAX_TIMEFRAME_DAYS`] are rejected so they can always be
/// added to a timestamp.
pub fn timeframe_duration(label: &str) -> Option<Duration> {
    let label = label.trim();
    if label.len() < 2 || !label.is_ascii() {
        return None;
    }
    let (count, unit) = label.split_at(label.len() - 1);
    let count: i64 = count.parse().ok().filter(|n| *n > 0)?;
    let duration = match unit {
        "m" => Duration::try_minutes(count)?,
        "h" => Duration::try_hours(count)?,
        "d" => Duration::try_days(count)?,
        "w" => Duration::try_weeks(count)?,
        _ => return None,
    };
    (duration <= Duration::days(MAX_TIMEFRAME_DAYS)).then_some(duration)
}

/// Lookback for price-change rules: "1h", "4h", "24h"; anything else is 24h.
pub fn reference_lookback(reference: &str) -> Duration {
    match reference.trim() {
        "1h" => Duration::hours(1),
        "4h" => Duration::hours(4),
        _ => Duration::hours(24),
    }
}

fn floor_to_step(t: DateTime<Utc>, step_secs: i64) -> DateTime<Utc> {
    let secs = t.timestamp();
    let floored = secs - secs.rem_euclid(step_secs);
    DateTime::from_timestamp(floored, 0).unwrap_or(t)
}

pub fn floor_to_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    floor_to_step(t, 60)
}

/// Floor a timestamp to the start of its candle. Unknown timeframes floor to
/// the hour.
pub fn floor_to_timeframe(t: DateTime<Utc>, timeframe: &str) -> DateTime<Utc> {
    match timeframe {
        "1m" => floor_to_step(t, 60),
        "15m" => floor_to_step(t, 15 * 60),
        "1h" => floor_to_step(t, 3600),
        "4h" => floor_to_step(t, 4 * 3600),
        "1d" => floor_to_step(t, 86_400),
        _ => floor_to_step(t, 3600),
    }
}
