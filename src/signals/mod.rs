// =============================================================================
// Signals Module
// =============================================================================
//
// The signal pipeline:
// - Live signal store with per-(trader, symbol) bar-window deduplication
// - Historical replay of trader predicates over stored klines

pub mod historical;
pub mod manager;

pub use historical::{
    HistoricalResultStore, HistoricalScanConfig, HistoricalScanner, ScanHandle, ScanProgress,
    ScanSummary,
};
pub use manager::{SignalFilter, SignalManager, SignalManagerConfig, SubmitOutcome};
