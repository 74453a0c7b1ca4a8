// =============================================================================
// CleanupSupervisor — periodic memory sweeps across all stores
// =============================================================================
//
// Two loops: a 30 s sweep (stale tickers, idle kline series, aged signal
// history, historical-result age-out, error-dedup pruning) and a 5 min sweep
// (signal store age-out). The active set protects symbols that are still
// interesting: recently ticking, referenced by recent signals, or explicitly
// selected (chart focus). Under heap pressure every age threshold is halved
// for the cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error_monitor::ErrorMonitor;
use crate::market_data::{KlineStore, TickerTable};
use crate::signals::{HistoricalResultStore, SignalManager};

/// Host memory usage probe, injectable so tests can fake pressure.
pub trait HeapGauge: Send + Sync {
    /// Fraction of host memory in use, in [0, 1].
    fn usage_fraction(&self) -> f64;
}

/// `sysinfo`-backed gauge used in production.
pub struct SysinfoHeapGauge {
    system: Mutex<sysinfo::System>,
}

impl SysinfoHeapGauge {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoHeapGauge {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapGauge for SysinfoHeapGauge {
    fn usage_fraction(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    pub sweep_period: Duration,
    pub signal_sweep_period: Duration,
    /// Tickers older than this (and outside the active set) are evicted.
    pub ticker_max_age: Duration,
    /// Kline series untouched this long (and outside the active set) go.
    pub series_max_idle: Duration,
    /// Signal-history (dedup) entries older than this are dropped.
    pub history_max_age: Duration,
    /// Historical scan results older than this are dropped.
    pub historical_result_max_age: Duration,
    pub live_signal_max_age: Duration,
    pub closed_signal_max_age: Duration,
    /// Heap usage fraction above which age thresholds halve for one cycle.
    pub memory_pressure_threshold: f64,
    /// Recent signals whose symbols stay protected.
    pub recent_signal_window: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_period: Duration::from_secs(30),
            signal_sweep_period: Duration::from_secs(300),
            ticker_max_age: Duration::from_secs(300),
            series_max_idle: Duration::from_secs(300),
            history_max_age: Duration::from_secs(24 * 3600),
            historical_result_max_age: Duration::from_secs(4 * 3600),
            live_signal_max_age: Duration::from_secs(3600),
            closed_signal_max_age: Duration::from_secs(24 * 3600),
            memory_pressure_threshold: 0.7,
            recent_signal_window: 20,
        }
    }
}

pub struct CleanupSupervisor {
    config: CleanupConfig,
    store: Arc<KlineStore>,
    tickers: Arc<TickerTable>,
    signals: Arc<SignalManager>,
    historical_results: Arc<HistoricalResultStore>,
    monitor: Arc<ErrorMonitor>,
    heap: Arc<dyn HeapGauge>,
    /// Explicitly protected symbols (chart focus).
    selected_symbols: RwLock<HashSet<String>>,
    /// Symbols whose klines changed since the last sweep, drained from the
    /// ingestor's change set. Consumed (and cleared) once per sweep.
    recently_changed: Mutex<HashSet<String>>,
}

impl CleanupSupervisor {
    pub fn new(
        config: CleanupConfig,
        store: Arc<KlineStore>,
        tickers: Arc<TickerTable>,
        signals: Arc<SignalManager>,
        historical_results: Arc<HistoricalResultStore>,
        monitor: Arc<ErrorMonitor>,
        heap: Arc<dyn HeapGauge>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            tickers,
            signals,
            historical_results,
            monitor,
            heap,
            selected_symbols: RwLock::new(HashSet::new()),
            recently_changed: Mutex::new(HashSet::new()),
        })
    }

    /// Feed symbols whose market data changed since the last sweep. They are
    /// protected for exactly one cycle.
    pub fn note_activity(&self, symbols: impl IntoIterator<Item = String>) {
        self.recently_changed.lock().extend(symbols);
    }

    /// Mark a symbol as explicitly selected; it survives every sweep.
    pub fn select_symbol(&self, symbol: impl Into<String>) {
        self.selected_symbols.write().insert(symbol.into());
    }

    pub fn deselect_symbol(&self, symbol: &str) {
        self.selected_symbols.write().remove(symbol);
    }

    /// Spawn both periodic loops. They run until the process exits.
    pub fn start(self: &Arc<Self>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.sweep_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                supervisor.sweep_once();
            }
        });

        let supervisor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(supervisor.config.signal_sweep_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                supervisor.signal_sweep_once();
            }
        });
        info!(
            sweep_s = self.config.sweep_period.as_secs(),
            signal_sweep_s = self.config.signal_sweep_period.as_secs(),
            "cleanup supervisor started"
        );
    }

    /// The 30-second sweep. Public so hosts and tests can force a cycle.
    pub fn sweep_once(&self) {
        let now_ms = Utc::now().timestamp_millis();
        let factor = self.pressure_factor();

        let ticker_age = self.config.ticker_max_age / factor;
        let series_idle = self.config.series_max_idle / factor;
        let history_age = self.config.history_max_age / factor;
        let historical_age = self.config.historical_result_max_age / factor;

        let active = self.active_set(now_ms, ticker_age);

        let tickers_evicted = self
            .tickers
            .evict_stale(now_ms - ticker_age.as_millis() as i64, &active);
        let series_evicted = self.store.evict_untouched(series_idle, &active);
        let history_pruned = self
            .signals
            .prune_history(now_ms - history_age.as_millis() as i64);
        let results_evicted = self
            .historical_results
            .evict_older_than(now_ms - historical_age.as_millis() as i64);
        self.monitor.prune_dedup();

        debug!(
            tickers_evicted,
            series_evicted,
            history_pruned,
            results_evicted,
            pressure = factor > 1,
            "cleanup sweep complete"
        );
    }

    /// The 5-minute sweep over the signal stores.
    pub fn signal_sweep_once(&self) {
        let factor = self.pressure_factor();
        let (live, closed) = self.signals.cleanup_old_signals(
            self.config.live_signal_max_age / factor,
            self.config.closed_signal_max_age / factor,
        );
        if live + closed > 0 {
            debug!(live, closed, "signal sweep complete");
        }
    }

    /// Union of: recently ticking symbols, symbols of the most recent
    /// signals, and explicitly selected symbols.
    fn active_set(&self, now_ms: i64, ticker_age: Duration) -> HashSet<String> {
        let mut active = self
            .tickers
            .symbols_updated_since(now_ms - ticker_age.as_millis() as i64);
        active.extend(
            self.signals
                .recent_signal_symbols(self.config.recent_signal_window),
        );
        active.extend(self.selected_symbols.read().iter().cloned());
        active.extend(std::mem::take(&mut *self.recently_changed.lock()));
        active
    }

    fn pressure_factor(&self) -> u32 {
        let usage = self.heap.usage_fraction();
        if usage > self.config.memory_pressure_threshold {
            warn!(usage, "heap pressure: halving age thresholds for this cycle");
            2
        } else {
            1
        }
    }
}
