//! Exact decimal helpers for prices and percentages.
//!
//! Every price and return in the reconciliation services goes through
//! `rust_decimal::Decimal`; floating point never touches money values.
//!
//! # Usage
//!
//! ```rust
//! use kifu_rust_core::utils::decimal::{format_decimal, parse_decimal, pnl_percent};
//!
//! let reference = parse_decimal("100").unwrap();
//! let outcome = parse_decimal("97.5").unwrap();
//! let pnl = pnl_percent(reference, outcome).unwrap();
//! assert_eq!(format_decimal(pnl, 8), "-2.5");
//! ```

use rust_decimal::prelude::*;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

/// Scale used when persisting percentage returns
pub const PNL_SCALE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecimalError {
    #[error("invalid decimal value: {0:?}")]
    Invalid(String),
    #[error("reference price is zero")]
    ZeroReference,
    #[error("decimal overflow")]
    Overflow,
}

/// Parse a decimal from text, accepting plain and scientific notation.
pub fn parse_decimal(value: &str) -> Option<Decimal> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
}

/// Like [`parse_decimal`] but reports the offending input.
pub fn require_decimal(value: &str) -> Result<Decimal, DecimalError> {
    parse_decimal(value).ok_or_else(|| DecimalError::Invalid(value.to_string()))
}

/// Round half away from zero to `scale` places and strip trailing zeros.
///
/// Negative zero renders as `"0"`.
pub fn format_decimal(value: Decimal, scale: u32) -> String {
    let rounded = value
        .round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    if rounded.is_zero() {
        return "0".to_string();
    }
    rounded.to_string()
}

/// `(outcome - reference) / reference * 100`
pub fn percent_change(reference: Decimal, outcome: Decimal) -> Result<Decimal, DecimalError> {
    if reference.is_zero() {
        return Err(DecimalError::ZeroReference);
    }
    outcome
        .checked_sub(reference)
        .and_then(|diff| diff.checked_div(reference))
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .ok_or(DecimalError::Overflow)
}

/// Percent return in its persisted form: rounded to [`PNL_SCALE`] places,
/// trailing zeros removed.
pub fn pnl_percent(reference: Decimal, outcome: Decimal) -> Result<Decimal, DecimalError> {
    let pct = percent_change(reference, outcome)?;
    let rounded = pct
        .round_dp_with_strategy(PNL_SCALE, RoundingStrategy::MidpointAwayFromZero)
        .normalize();
    Ok(if rounded.is_zero() { Decimal::ZERO } else { rounded })
}

/// Arithmetic mean. `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let mut sum = Decimal::ZERO;
    for v in values {
        sum = sum.checked_add(*v)?;
    }
    sum.checked_div(Decimal::from(values.len() as u64))
}

/// Population variance: `sum((x - mean)^2) / n`.
pub fn variance(values: &[Decimal], mean: Decimal) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let mut acc = Decimal::ZERO;
    for v in values {
        let diff = v.checked_sub(mean)?;
        acc = acc.checked_add(diff.checked_mul(diff)?)?;
    }
    acc.checked_div(Decimal::from(values.len() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal(" 42.50 "), Some(dec!(42.50)));
        assert_eq!(parse_decimal("1e3"), Some(dec!(1000)));
        assert_eq!(parse_decimal(""), None);
        assert_eq!(parse_decimal("abc"), None);
    }

    #[test]
    fn test_format_trims_trailing_zeros() {
        assert_eq!(format_decimal(dec!(5.00000000), 8), "5");
        assert_eq!(format_decimal(dec!(-2.50), 8), "-2.5");
        assert_eq!(format_decimal(dec!(1.005), 2), "1.01");
        assert_eq!(format_decimal(dec!(-1.005), 2), "-1.01");
        assert_eq!(format_decimal(dec!(-0.000000001), 8), "0");
    }

    #[test]
    fn test_pnl_formula() {
        assert_eq!(pnl_percent(dec!(100), dec!(105)).unwrap(), dec!(5));
        assert_eq!(pnl_percent(dec!(100), dec!(97.5)).unwrap(), dec!(-2.5));
        assert_eq!(format_decimal(pnl_percent(dec!(100), dec!(105)).unwrap(), 8), "5");
    }

    #[test]
    fn test_pnl_rounds_to_eight_places() {
        // 1/3 % = 0.333333333...
        let pnl = pnl_percent(dec!(300), dec!(301)).unwrap();
        assert_eq!(pnl.to_string(), "0.33333333");
    }

    #[test]
    fn test_zero_reference_is_error() {
        assert_eq!(percent_change(Decimal::ZERO, dec!(1)), Err(DecimalError::ZeroReference));
    }

    #[test]
    fn test_mean_and_variance() {
        let values = [dec!(8), dec!(12), dec!(8), dec!(12)];
        let m = mean(&values).unwrap();
        assert_eq!(m, dec!(10));
        assert_eq!(variance(&values, m).unwrap(), dec!(4));
        assert!(mean(&[]).is_none());
    }
}
