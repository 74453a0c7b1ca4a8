pub mod ingestor;
pub mod kline;
pub mod kline_store;
pub mod tickers;
pub mod update_batcher;
pub mod update_bus;

// Re-export the hot-path types for convenient access
// (e.g. `use crate::market_data::Kline`).
pub use kline::Kline;
pub use kline_store::{KlineStore, KlineStoreConfig, KlineUpdateOutcome, SeriesKey, SeriesView};
pub use tickers::TickerTable;
pub use update_batcher::{UpdateBatcher, UpdateBatcherConfig};
pub use update_bus::UpdateBus;
