//! Kifu Core - shared building blocks for the trading-journal reconciler.
//!
//! This crate provides:
//! - Domain models for alert rules, journal entries, trades and outcomes
//! - Exact decimal arithmetic for prices and PnL
//! - Market-data and signed trade-history clients for Binance
//! - Direction scoring for AI opinions
//! - Storage ports and their PostgreSQL implementation

pub mod clients;
pub mod db;
pub mod direction;
pub mod models;
pub mod repositories;
pub mod utils;

pub use direction::{actual_direction, DirectionExtractor};
