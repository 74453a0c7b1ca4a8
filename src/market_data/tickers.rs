// =============================================================================
// TickerTable — latest 24h summary per symbol
// =============================================================================
//
// Tickers are transient: only the most recent update per symbol is retained.
// The batcher flushes into `apply_batch`; the cleanup supervisor evicts
// symbols that stop updating.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::types::Ticker;

pub struct TickerTable {
    tickers: RwLock<HashMap<String, Ticker>>,
}

impl TickerTable {
    pub fn new() -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the ticker for one symbol.
    pub fn update(&self, ticker: Ticker) {
        self.tickers.write().insert(ticker.symbol.clone(), ticker);
    }

    /// Replace tickers for every symbol in the batch (batcher flush sink).
    pub fn apply_batch(&self, batch: HashMap<String, Ticker>) {
        let mut tickers = self.tickers.write();
        for (symbol, ticker) in batch {
            tickers.insert(symbol, ticker);
        }
    }

    pub fn get(&self, symbol: &str) -> Option<Ticker> {
        self.tickers.read().get(symbol).cloned()
    }

    pub fn len(&self) -> usize {
        self.tickers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickers.read().is_empty()
    }

    /// Symbols with an update at or after `cutoff_ms`.
    pub fn symbols_updated_since(&self, cutoff_ms: i64) -> HashSet<String> {
        self.tickers
            .read()
            .values()
            .filter(|t| t.event_time >= cutoff_ms)
            .map(|t| t.symbol.clone())
            .collect()
    }

    /// Drop tickers last updated before `cutoff_ms`, keeping any symbol in
    /// `keep`. Returns the number evicted.
    pub fn evict_stale(&self, cutoff_ms: i64, keep: &HashSet<String>) -> usize {
        let mut tickers = self.tickers.write();
        let before = tickers.len();
        tickers.retain(|symbol, t| keep.contains(symbol) || t.event_time >= cutoff_ms);
        before - tickers.len()
    }
}

impl Default for TickerTable {
    fn default() -> Self {
        Self::new()
    }
}
