pub mod decimal;

pub use decimal::{format_decimal, parse_decimal, pnl_percent, DecimalError};
