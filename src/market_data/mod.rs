pub mod aggregator;
pub mod cache;

// Re-export the chart-facing types for convenient access
// (e.g. `use crate::market_data::Candle`).
pub use aggregator::{Candle, CandleAggregator, SeriesEvent, SeriesKey, SeriesUpdate};
pub use cache::{CachedTick, MarketDataCache};
