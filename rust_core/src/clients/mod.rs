pub mod backoff;
pub mod binance;
pub mod binance_trades;
pub mod price_feed;
pub mod upbit_trades;
pub mod venue;

// Re-export commonly used types
pub use backoff::{FeedError, RateLimitPolicy};
pub use binance::BinanceFuturesFeed;
pub use binance_trades::BinanceTradeClient;
pub use price_feed::{Candle, CandleWindow, PriceFeed};
pub use upbit_trades::UpbitTradeClient;
pub use venue::{TradeCursor, VenueRouter, VenueTrade, VenueTradeClient};
