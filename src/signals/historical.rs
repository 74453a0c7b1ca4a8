// =============================================================================
// HistoricalScanner — predicate replay over stored history
// =============================================================================
//
// Walks the primary-interval series backward from the most recent closed bar
// and evaluates each trader against views truncated to that bar's close:
// every required timeframe is positioned at the greatest open time at or
// before the primary bar's open time. Symbol scans are independent and run
// on a bounded worker pool; cancellation is cooperative at bar boundaries.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::indicators;
use crate::market_data::kline::Kline;
use crate::market_data::KlineStore;
use crate::predicate::{EvalContext, Predicate, PredicateConfig};
use crate::types::{HistoricalSignal, Interval, Trader};

#[derive(Debug, Clone, Copy)]
pub struct HistoricalScanConfig {
    pub lookback_bars: usize,
    pub max_signals_per_symbol: Option<usize>,
    /// Hard bound on total output; overflow is counted, not delivered.
    pub max_total_signals: usize,
    /// Bounded parallelism across symbols.
    pub symbol_workers: usize,
    /// Minimum truncated-series length before a bar is evaluated.
    pub min_warmup_bars: usize,
    /// Closed bars visible to one evaluation per timeframe.
    pub history_bars: usize,
    /// Attach an indicator snapshot to each emitted signal.
    pub record_metadata: bool,
    pub predicate: PredicateConfig,
}

impl Default for HistoricalScanConfig {
    fn default() -> Self {
        Self {
            lookback_bars: 200,
            max_signals_per_symbol: None,
            max_total_signals: 1000,
            symbol_workers: 8,
            min_warmup_bars: 25,
            history_bars: 250,
            record_metadata: false,
            predicate: PredicateConfig::default(),
        }
    }
}

/// Progress snapshot published after every completed symbol.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    pub symbol_index: usize,
    pub total_symbols: usize,
    pub current_symbol: String,
    pub percent_complete: f64,
    pub signals_found: usize,
}

/// Final accounting for one scan run.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub signals_found: usize,
    pub dropped_overflow: usize,
    pub cancelled: bool,
}

/// Live handle onto a running scan.
pub struct ScanHandle {
    pub progress: mpsc::UnboundedReceiver<ScanProgress>,
    pub signals: mpsc::UnboundedReceiver<HistoricalSignal>,
    pub done: oneshot::Receiver<ScanSummary>,
    cancel: Arc<AtomicBool>,
}

impl ScanHandle {
    /// Stop in-flight work at the next bar boundary. Partial results already
    /// delivered remain valid.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

pub struct HistoricalScanner {
    store: Arc<KlineStore>,
    config: HistoricalScanConfig,
}

impl HistoricalScanner {
    pub fn new(config: HistoricalScanConfig, store: Arc<KlineStore>) -> Self {
        Self { store, config }
    }

    /// Start a scan of `traders` over `symbols`. Traders whose predicates do
    /// not compile are skipped with a warning.
    pub fn start(&self, traders: Vec<Trader>, symbols: Vec<String>) -> ScanHandle {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let compiled: Vec<(Trader, Predicate)> = traders
            .into_iter()
            .filter_map(|t| {
                match Predicate::parse(&t.filter.predicate, self.config.predicate) {
                    Ok(p) => Some((t, p)),
                    Err(e) => {
                        warn!(trader_id = %t.id, error = %e, "scan skips uncompilable trader");
                        None
                    }
                }
            })
            .collect();

        let run = Arc::new(ScanRun {
            store: self.store.clone(),
            config: self.config,
            compiled,
            cancel: cancel.clone(),
            total_signals: AtomicUsize::new(0),
            dropped_overflow: AtomicUsize::new(0),
            completed_symbols: AtomicUsize::new(0),
            progress_tx,
            signals_tx,
        });

        let total = symbols.len();
        info!(
            symbols = total,
            traders = run.compiled.len(),
            lookback = self.config.lookback_bars,
            "historical scan starting"
        );

        let workers = Arc::new(Semaphore::new(self.config.symbol_workers.max(1)));
        let coordinator_run = run.clone();
        tokio::spawn(async move {
            let mut handles = Vec::with_capacity(total);
            for symbol in symbols {
                let run = coordinator_run.clone();
                let workers = workers.clone();
                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = workers.acquire().await else {
                        return;
                    };
                    run.scan_symbol(&symbol, total);
                }));
            }
            for handle in handles {
                let _ = handle.await;
            }

            let summary = ScanSummary {
                signals_found: coordinator_run.total_signals.load(Ordering::SeqCst),
                dropped_overflow: coordinator_run.dropped_overflow.load(Ordering::SeqCst),
                cancelled: coordinator_run.cancel.load(Ordering::SeqCst),
            };
            info!(
                signals = summary.signals_found,
                dropped = summary.dropped_overflow,
                cancelled = summary.cancelled,
                "historical scan finished"
            );
            let _ = done_tx.send(summary);
        });

        ScanHandle {
            progress: progress_rx,
            signals: signals_rx,
            done: done_rx,
            cancel,
        }
    }

    /// Convenience wrapper: run to completion and collect everything.
    pub async fn run_to_completion(
        &self,
        traders: Vec<Trader>,
        symbols: Vec<String>,
    ) -> (Vec<HistoricalSignal>, ScanSummary) {
        let mut handle = self.start(traders, symbols);
        let mut signals = Vec::new();
        while let Some(signal) = handle.signals.recv().await {
            signals.push(signal);
        }
        let summary = handle.done.await.unwrap_or_default();
        (signals, summary)
    }
}

struct ScanRun {
    store: Arc<KlineStore>,
    config: HistoricalScanConfig,
    compiled: Vec<(Trader, Predicate)>,
    cancel: Arc<AtomicBool>,
    total_signals: AtomicUsize,
    dropped_overflow: AtomicUsize,
    completed_symbols: AtomicUsize,
    progress_tx: mpsc::UnboundedSender<ScanProgress>,
    signals_tx: mpsc::UnboundedSender<HistoricalSignal>,
}

impl ScanRun {
    fn scan_symbol(&self, symbol: &str, total_symbols: usize) {
        let mut found_for_symbol = 0usize;

        if !self.cancel.load(Ordering::SeqCst) {
            found_for_symbol = self.scan_symbol_bars(symbol);
        }

        let completed = self.completed_symbols.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.progress_tx.send(ScanProgress {
            symbol_index: completed,
            total_symbols,
            current_symbol: symbol.to_string(),
            percent_complete: completed as f64 / total_symbols.max(1) as f64 * 100.0,
            signals_found: self.total_signals.load(Ordering::SeqCst),
        });
        debug!(symbol, found_for_symbol, "symbol scan complete");
    }

    fn scan_symbol_bars(&self, symbol: &str) -> usize {
        // Full closed history per required timeframe, snapshotted once.
        let mut intervals: BTreeSet<Interval> = BTreeSet::from([Interval::PRIMARY]);
        for (trader, _) in &self.compiled {
            intervals.extend(trader.filter.required_timeframes.iter().copied());
        }

        let mut series: HashMap<Interval, Vec<Kline>> = HashMap::new();
        for interval in intervals {
            series.insert(
                interval,
                self.store.last_n_closed(symbol, interval, usize::MAX),
            );
        }

        let Some(primary) = series.get(&Interval::PRIMARY) else {
            return 0;
        };
        if primary.is_empty() {
            return 0;
        }
        let primary = primary.clone();

        let mut found_for_symbol = 0usize;
        let bars = self.config.lookback_bars.min(primary.len());

        'bars: for offset in 0..bars {
            if self.cancel.load(Ordering::SeqCst) {
                break;
            }
            if let Some(cap) = self.config.max_signals_per_symbol {
                if found_for_symbol >= cap {
                    break;
                }
            }

            let idx = primary.len() - 1 - offset;
            if idx + 1 < self.config.min_warmup_bars {
                break; // older bars only get shorter
            }
            let cutoff = primary[idx].open_time;

            // Views truncated to the current primary bar.
            let mut views: HashMap<Interval, &[Kline]> = HashMap::new();
            for (interval, full) in &series {
                let end = full.partition_point(|k| k.open_time <= cutoff);
                let start = end.saturating_sub(self.config.history_bars);
                views.insert(*interval, &full[start..end]);
            }

            let primary_view = views.get(&Interval::PRIMARY).copied().unwrap_or_default();
            let hvn_nodes = indicators::hvn::volume_nodes(primary_view, 200, 24);

            for (trader, predicate) in &self.compiled {
                let refresh = trader.filter.refresh_interval;
                let Some(refresh_view) = views.get(&refresh) else {
                    continue;
                };
                let Some(trigger_bar) = refresh_view.last() else {
                    continue;
                };

                let ctx = EvalContext {
                    ticker: None,
                    timeframes: &views,
                    default_interval: refresh,
                    hvn_nodes: &hvn_nodes,
                };

                match predicate.evaluate(&ctx) {
                    Ok(outcome) if outcome.matched => {
                        if self.total_signals.load(Ordering::SeqCst)
                            >= self.config.max_total_signals
                        {
                            self.dropped_overflow.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        self.total_signals.fetch_add(1, Ordering::SeqCst);
                        found_for_symbol += 1;

                        let metadata = self
                            .config
                            .record_metadata
                            .then(|| indicator_snapshot(primary_view));

                        let _ = self.signals_tx.send(HistoricalSignal {
                            id: uuid::Uuid::new_v4().to_string(),
                            trader_id: trader.id.clone(),
                            symbol: symbol.to_string(),
                            detected_at: chrono::Utc::now().timestamp_millis(),
                            bar_open_time: trigger_bar.open_time,
                            price_at_signal: trigger_bar.close,
                            bars_ago: offset,
                            metadata,
                            replayed: true,
                        });

                        if let Some(cap) = self.config.max_signals_per_symbol {
                            if found_for_symbol >= cap {
                                continue 'bars;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Replay errors are expected near series edges; they
                        // never abort the scan.
                        debug!(trader_id = %trader.id, symbol, error = %e, "replay evaluation failed");
                    }
                }
            }
        }

        found_for_symbol
    }
}

// =============================================================================
// HistoricalResultStore — bounded retention of scan output
// =============================================================================

/// Keeps the most recent scan results for consumers that attach after a scan
/// finished. Hard-bounded by count and aged out by the cleanup supervisor.
pub struct HistoricalResultStore {
    results: Mutex<Vec<(i64, HistoricalSignal)>>,
    capacity: usize,
}

impl HistoricalResultStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            results: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, signal: HistoricalSignal) {
        self.record_at(signal, chrono::Utc::now().timestamp_millis());
    }

    fn record_at(&self, signal: HistoricalSignal, now_ms: i64) {
        let mut results = self.results.lock();
        results.push((now_ms, signal));
        let overflow = results.len().saturating_sub(self.capacity);
        if overflow > 0 {
            results.drain(..overflow);
        }
    }

    pub fn list(&self) -> Vec<HistoricalSignal> {
        self.results.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// Drop results stored before `cutoff_ms`. Returns the number removed.
    pub fn evict_older_than(&self, cutoff_ms: i64) -> usize {
        let mut results = self.results.lock();
        let before = results.len();
        results.retain(|(stored_at, _)| *stored_at >= cutoff_ms);
        before - results.len()
    }
}

fn indicator_snapshot(primary: &[Kline]) -> serde_json::Value {
    let closes = indicators::closes(primary);
    serde_json::json!({
        "close": closes.last().copied(),
        "sma_20": indicators::ma::sma_latest(&closes, 20),
        "rsi_14": indicators::rsi::rsi_latest(&closes, 14),
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::KlineStoreConfig;
    use crate::types::{AccessTier, TraderFilter};

    fn bar(open_time: i64, close: f64) -> Kline {
        Kline {
            open_time,
            close_time: open_time + 59_999,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: close * 100.0,
            trades: 10,
            is_final: true,
        }
    }

    fn trader(id: &str, predicate: &str) -> Trader {
        Trader {
            id: id.into(),
            name: id.into(),
            enabled: true,
            access_tier: AccessTier::Free,
            user_id: None,
            filter: TraderFilter {
                predicate: predicate.into(),
                refresh_interval: Interval::M1,
                required_timeframes: BTreeSet::from([Interval::M1]),
                indicator_panel: Vec::new(),
            }
            .normalize(),
        }
    }

    fn seeded_store(symbols: &[&str], bars: usize) -> Arc<KlineStore> {
        let store = Arc::new(KlineStore::new(KlineStoreConfig::default()));
        for symbol in symbols {
            let series: Vec<Kline> = (0..bars)
                .map(|i| bar(i as i64 * 60_000, 100.0 + i as f64))
                .collect();
            store.bulk_load(symbol, Interval::M1, series).unwrap();
        }
        store
    }

    #[tokio::test]
    async fn trivially_true_scan_respects_per_symbol_cap() {
        let symbols = ["AUSDT", "BUSDT", "CUSDT", "DUSDT", "EUSDT"];
        let store = seeded_store(&symbols, 150);
        let scanner = HistoricalScanner::new(
            HistoricalScanConfig {
                lookback_bars: 100,
                max_signals_per_symbol: Some(2),
                ..HistoricalScanConfig::default()
            },
            store,
        );

        let (signals, summary) = scanner
            .run_to_completion(
                vec![trader("t", "true")],
                symbols.iter().map(|s| s.to_string()).collect(),
            )
            .await;

        assert_eq!(signals.len(), symbols.len() * 2);
        assert_eq!(summary.signals_found, 10);
        assert!(!summary.cancelled);
        // Most recent bars first per symbol.
        for symbol in symbols {
            let ours: Vec<_> = signals.iter().filter(|s| s.symbol == symbol).collect();
            assert_eq!(ours.len(), 2);
            assert_eq!(ours[0].bars_ago, 0);
            assert_eq!(ours[1].bars_ago, 1);
            assert!(ours.iter().all(|s| s.replayed));
        }
    }

    #[tokio::test]
    async fn progress_reaches_100_percent() {
        let symbols = ["AUSDT", "BUSDT", "CUSDT"];
        let store = seeded_store(&symbols, 60);
        let scanner = HistoricalScanner::new(
            HistoricalScanConfig {
                lookback_bars: 10,
                ..HistoricalScanConfig::default()
            },
            store,
        );

        let mut handle = scanner.start(
            vec![trader("t", "false")],
            symbols.iter().map(|s| s.to_string()).collect(),
        );

        let mut last_percent = 0.0;
        while let Some(progress) = handle.progress.recv().await {
            assert!(progress.percent_complete >= last_percent);
            last_percent = progress.percent_complete;
        }
        assert!((last_percent - 100.0).abs() < 1e-9);

        let summary = handle.done.await.unwrap();
        assert_eq!(summary.signals_found, 0);
    }

    #[tokio::test]
    async fn total_bound_drops_overflow() {
        let symbols = ["AUSDT", "BUSDT"];
        let store = seeded_store(&symbols, 100);
        let scanner = HistoricalScanner::new(
            HistoricalScanConfig {
                lookback_bars: 50,
                max_total_signals: 10,
                ..HistoricalScanConfig::default()
            },
            store,
        );

        let (signals, summary) = scanner
            .run_to_completion(
                vec![trader("t", "true")],
                symbols.iter().map(|s| s.to_string()).collect(),
            )
            .await;

        assert_eq!(signals.len(), 10);
        assert!(summary.dropped_overflow > 0);
    }

    #[tokio::test]
    async fn cancellation_yields_partial_results() {
        let symbols: Vec<String> = (0..20).map(|i| format!("S{i}USDT")).collect();
        let symbol_refs: Vec<&str> = symbols.iter().map(String::as_str).collect();
        let store = seeded_store(&symbol_refs, 300);
        let scanner = HistoricalScanner::new(
            HistoricalScanConfig {
                lookback_bars: 250,
                symbol_workers: 1,
                ..HistoricalScanConfig::default()
            },
            store,
        );

        let mut handle = scanner.start(vec![trader("t", "true")], symbols.clone());
        handle.cancel();

        let mut collected = Vec::new();
        while let Some(signal) = handle.signals.recv().await {
            collected.push(signal);
        }
        let summary = handle.done.await.unwrap();
        assert!(summary.cancelled);
        // Partial: well under the uncancelled total (20 * 226 bars).
        assert!(summary.signals_found < 1000);
        assert_eq!(collected.len(), summary.signals_found);
    }

    #[tokio::test]
    async fn deterministic_over_static_store() {
        let symbols = ["AUSDT"];
        let store = seeded_store(&symbols, 120);
        let config = HistoricalScanConfig {
            lookback_bars: 60,
            ..HistoricalScanConfig::default()
        };

        let scanner = HistoricalScanner::new(config, store.clone());
        let (first, _) = scanner
            .run_to_completion(vec![trader("t", "close(0) > sma(20)")], vec!["AUSDT".into()])
            .await;
        let scanner = HistoricalScanner::new(config, store);
        let (second, _) = scanner
            .run_to_completion(vec![trader("t", "close(0) > sma(20)")], vec!["AUSDT".into()])
            .await;

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.bar_open_time, b.bar_open_time);
            assert_eq!(a.bars_ago, b.bars_ago);
        }
    }

    #[tokio::test]
    async fn uncompilable_trader_is_skipped() {
        let store = seeded_store(&["AUSDT"], 60);
        let scanner = HistoricalScanner::new(HistoricalScanConfig::default(), store);
        let (signals, summary) = scanner
            .run_to_completion(vec![trader("bad", "((")], vec!["AUSDT".into()])
            .await;
        assert!(signals.is_empty());
        assert_eq!(summary.signals_found, 0);
    }

    #[test]
    fn result_store_is_bounded_and_ages_out() {
        let store = HistoricalResultStore::new(3);
        for i in 0..5 {
            store.record_at(
                HistoricalSignal {
                    id: format!("h{i}"),
                    trader_id: "t".into(),
                    symbol: format!("S{i}"),
                    detected_at: i * 1_000,
                    bar_open_time: i,
                    price_at_signal: 1.0,
                    bars_ago: 0,
                    metadata: None,
                    replayed: true,
                },
                i * 1_000,
            );
        }
        assert_eq!(store.len(), 3);
        // Oldest two were dropped by the capacity bound.
        assert_eq!(store.list()[0].symbol, "S2");

        let evicted = store.evict_older_than(4_000);
        assert_eq!(evicted, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn metadata_snapshot_is_attached_when_enabled() {
        let store = seeded_store(&["AUSDT"], 80);
        let scanner = HistoricalScanner::new(
            HistoricalScanConfig {
                lookback_bars: 5,
                record_metadata: true,
                ..HistoricalScanConfig::default()
            },
            store,
        );
        let (signals, _) = scanner
            .run_to_completion(vec![trader("t", "true")], vec!["AUSDT".into()])
            .await;
        assert!(!signals.is_empty());
        let meta = signals[0].metadata.as_ref().unwrap();
        assert!(meta.get("sma_20").is_some());
        assert!(meta.get("rsi_14").is_some());
    }
}
