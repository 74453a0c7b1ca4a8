// =============================================================================
// SignalManager — live signal store with bar-window deduplication
// =============================================================================
//
// Per (trader, symbol) the manager tracks how many refresh-interval bars have
// closed since the last *created* signal. A re-fire inside the dedup window
// increments the existing signal's count instead of creating a new one. Bar
// counting is advanced by kline close events, never by wall clock.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::collections::{BoundedMap, CircularBuffer, EvictionPolicy};
use crate::types::{Interval, Signal, SignalStatus};

#[derive(Debug, Clone, Copy)]
pub struct SignalManagerConfig {
    /// Bars that must pass before the same (trader, symbol) yields a fresh
    /// signal instead of a count increment.
    pub dedupe_threshold: u32,
    /// Capacity of the per-(trader, symbol) dedup history (LRU).
    pub dedup_capacity: usize,
    pub live_max_age: Duration,
    pub closed_max_age: Duration,
    /// Capacity of the recent-signal log.
    pub log_capacity: usize,
}

impl Default for SignalManagerConfig {
    fn default() -> Self {
        Self {
            dedupe_threshold: 50,
            dedup_capacity: 1000,
            live_max_age: Duration::from_secs(3600),
            closed_max_age: Duration::from_secs(24 * 3600),
            log_capacity: 100,
        }
    }
}

/// Per-(trader, symbol) dedup state. Persisted across restarts through
/// `export_history` / `load_history`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SignalHistoryEntry {
    pub bar_count: u32,
    pub last_open_time: i64,
}

#[derive(Debug, Clone)]
struct DedupState {
    /// Open time of the bar that created or last incremented the signal.
    last_bar_open_time: i64,
    /// Refresh-interval bars closed since the last created signal.
    bars_since_last: u32,
    /// The cadence whose closes advance this counter.
    interval: Interval,
    /// Id of the signal receiving count increments.
    signal_id: Option<String>,
}

/// What `submit` did with a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created { signal_id: String },
    Deduplicated { signal_id: String, count: u32 },
}

/// Query filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct SignalFilter {
    pub limit: Option<usize>,
    pub offset: usize,
    pub trader_ids: Option<Vec<String>>,
    pub symbol: Option<String>,
    pub status: Option<SignalStatus>,
    /// When true, only signals that arrived from the remote feed.
    pub remote_only: bool,
}

type SignalListener = Box<dyn Fn(&Signal) + Send + Sync>;

pub struct SignalManager {
    config: SignalManagerConfig,
    dedup: Mutex<BoundedMap<(String, String), DedupState>>,
    /// Live signals by id.
    live: RwLock<HashMap<String, Signal>>,
    closed: RwLock<HashMap<String, Signal>>,
    /// Most recent signal symbols, newest last. Feeds the cleanup
    /// supervisor's active set.
    recent_log: Mutex<CircularBuffer<String>>,
    prices: RwLock<HashMap<String, f64>>,
    listeners: RwLock<Vec<SignalListener>>,
    created_total: Mutex<u64>,
    deduped_total: Mutex<u64>,
}

impl SignalManager {
    pub fn new(config: SignalManagerConfig) -> Self {
        Self {
            dedup: Mutex::new(BoundedMap::new(config.dedup_capacity, EvictionPolicy::Lru)),
            live: RwLock::new(HashMap::new()),
            closed: RwLock::new(HashMap::new()),
            recent_log: Mutex::new(CircularBuffer::new(config.log_capacity)),
            prices: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            created_total: Mutex::new(0),
            deduped_total: Mutex::new(0),
            config,
        }
    }

    /// Register a listener for newly created signals (local and remote).
    pub fn on_signal(&self, f: impl Fn(&Signal) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(f));
    }

    // -------------------------------------------------------------------------
    // Submission and dedup
    // -------------------------------------------------------------------------

    /// Submit a local detection candidate.
    pub fn submit(
        &self,
        trader_id: &str,
        symbol: &str,
        interval: Interval,
        bar_open_time: i64,
        price: f64,
        metadata: Option<serde_json::Value>,
    ) -> SubmitOutcome {
        self.submit_at(
            trader_id,
            symbol,
            interval,
            bar_open_time,
            price,
            metadata,
            Utc::now().timestamp_millis(),
        )
    }

    fn submit_at(
        &self,
        trader_id: &str,
        symbol: &str,
        interval: Interval,
        bar_open_time: i64,
        price: f64,
        metadata: Option<serde_json::Value>,
        now_ms: i64,
    ) -> SubmitOutcome {
        let key = (trader_id.to_string(), symbol.to_string());
        let mut dedup = self.dedup.lock();

        if let Some(state) = dedup.get_mut(&key) {
            if state.bars_since_last < self.config.dedupe_threshold {
                // Inside the window: bump the existing signal.
                state.last_bar_open_time = bar_open_time;
                let signal_id = state.signal_id.clone();
                drop(dedup);

                if let Some(id) = signal_id {
                    if let Some(signal) = self.live.write().get_mut(&id) {
                        signal.count += 1;
                        signal.current_price = price;
                        *self.deduped_total.lock() += 1;
                        debug!(
                            trader_id,
                            symbol,
                            count = signal.count,
                            "signal deduplicated inside bar window"
                        );
                        return SubmitOutcome::Deduplicated {
                            signal_id: id,
                            count: signal.count,
                        };
                    }
                }
                // The signal itself was evicted; fall through and create a
                // replacement without resetting the window.
                return self.create_signal(
                    key, interval, bar_open_time, price, metadata, now_ms, false,
                );
            }
        }

        drop(dedup);
        self.create_signal(key, interval, bar_open_time, price, metadata, now_ms, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn create_signal(
        &self,
        key: (String, String),
        interval: Interval,
        bar_open_time: i64,
        price: f64,
        metadata: Option<serde_json::Value>,
        now_ms: i64,
        reset_window: bool,
    ) -> SubmitOutcome {
        let signal = Signal {
            id: Uuid::new_v4().to_string(),
            trader_id: key.0.clone(),
            symbol: key.1.clone(),
            detected_at: now_ms,
            bar_open_time,
            price_at_signal: price,
            current_price: price,
            metadata,
            status: SignalStatus::Active,
            count: 1,
            remote: false,
        };

        {
            let mut dedup = self.dedup.lock();
            let bars_since_last = if reset_window {
                0
            } else {
                dedup.peek(&key).map(|s| s.bars_since_last).unwrap_or(0)
            };
            dedup.set(
                key.clone(),
                DedupState {
                    last_bar_open_time: bar_open_time,
                    bars_since_last,
                    interval,
                    signal_id: Some(signal.id.clone()),
                },
            );
        }

        info!(
            trader_id = %key.0,
            symbol = %key.1,
            price,
            bar_open_time,
            "signal created"
        );
        self.insert_signal(signal.clone());
        SubmitOutcome::Created { signal_id: signal.id }
    }

    /// Insert a remote signal verbatim, bypassing dedup entirely.
    pub fn ingest_remote(&self, mut signal: Signal) {
        signal.remote = true;
        debug!(trader_id = %signal.trader_id, symbol = %signal.symbol, "remote signal ingested");
        self.insert_signal(signal);
    }

    fn insert_signal(&self, signal: Signal) {
        self.recent_log.lock().push(signal.symbol.clone());
        match signal.status {
            SignalStatus::Active => {
                self.live.write().insert(signal.id.clone(), signal.clone());
            }
            SignalStatus::Closed => {
                self.closed.write().insert(signal.id.clone(), signal.clone());
            }
        }
        *self.created_total.lock() += 1;
        for listener in self.listeners.read().iter() {
            listener(&signal);
        }
    }

    /// Advance the bar counter for every (trader, symbol) state keyed to this
    /// symbol and interval. Driven by kline close events.
    pub fn advance_bars(&self, symbol: &str, interval: Interval) {
        let mut dedup = self.dedup.lock();
        dedup.for_each_mut(|(_, sym), state| {
            if sym == symbol && state.interval == interval {
                state.bars_since_last = state.bars_since_last.saturating_add(1);
            }
        });
    }

    // -------------------------------------------------------------------------
    // Price tracking
    // -------------------------------------------------------------------------

    /// Refresh the last-known price for a symbol on every primary-interval
    /// close; active signals for that symbol track it.
    pub fn update_price(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_string(), price);
        let mut live = self.live.write();
        for signal in live.values_mut() {
            if signal.symbol == symbol && signal.status == SignalStatus::Active {
                signal.current_price = price;
            }
        }
    }

    pub fn current_price(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(symbol).copied()
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Explicitly close a signal (position-management consumer operation).
    pub fn close_signal(&self, id: &str) -> bool {
        let Some(mut signal) = self.live.write().remove(id) else {
            return false;
        };
        signal.status = SignalStatus::Closed;
        self.closed.write().insert(id.to_string(), signal);
        true
    }

    /// Age-based eviction. Returns (live_evicted, closed_evicted).
    pub fn cleanup_old_signals(
        &self,
        live_max_age: Duration,
        closed_max_age: Duration,
    ) -> (usize, usize) {
        let now_ms = Utc::now().timestamp_millis();
        self.cleanup_at(live_max_age, closed_max_age, now_ms)
    }

    fn cleanup_at(
        &self,
        live_max_age: Duration,
        closed_max_age: Duration,
        now_ms: i64,
    ) -> (usize, usize) {
        let live_cutoff = now_ms - live_max_age.as_millis() as i64;
        let closed_cutoff = now_ms - closed_max_age.as_millis() as i64;

        let live_evicted = {
            let mut live = self.live.write();
            let before = live.len();
            live.retain(|_, s| s.detected_at >= live_cutoff);
            before - live.len()
        };
        let closed_evicted = {
            let mut closed = self.closed.write();
            let before = closed.len();
            closed.retain(|_, s| s.detected_at >= closed_cutoff);
            before - closed.len()
        };

        if live_evicted + closed_evicted > 0 {
            debug!(live_evicted, closed_evicted, "aged out signals");
        }
        (live_evicted, closed_evicted)
    }

    /// Drop signal-history entries whose last activity is older than the
    /// cutoff. Returns the number removed.
    pub fn prune_history(&self, older_than_ms: i64) -> usize {
        let mut dedup = self.dedup.lock();
        let before = dedup.len();
        dedup.retain(|_, state| state.last_bar_open_time >= older_than_ms);
        before - dedup.len()
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// List signals, newest first.
    pub fn list(&self, filter: &SignalFilter) -> Vec<Signal> {
        let mut out: Vec<Signal> = {
            let live = self.live.read();
            let closed = self.closed.read();
            live.values().chain(closed.values()).cloned().collect()
        };

        out.retain(|s| {
            if let Some(ids) = &filter.trader_ids {
                if !ids.iter().any(|id| *id == s.trader_id) {
                    return false;
                }
            }
            if let Some(symbol) = &filter.symbol {
                if s.symbol != *symbol {
                    return false;
                }
            }
            if let Some(status) = filter.status {
                if s.status != status {
                    return false;
                }
            }
            if filter.remote_only && !s.remote {
                return false;
            }
            true
        });

        out.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        let end = out.len();
        let start = filter.offset.min(end);
        let stop = filter
            .limit
            .map(|l| (start + l).min(end))
            .unwrap_or(end);
        out[start..stop].to_vec()
    }

    /// Symbols of the most recent `n` signals, newest last, deduplicated.
    pub fn recent_signal_symbols(&self, n: usize) -> Vec<String> {
        let log = self.recent_log.lock();
        let mut symbols: Vec<String> = Vec::new();
        for symbol in log.get_recent(n) {
            if !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        symbols
    }

    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    pub fn closed_count(&self) -> usize {
        self.closed.read().len()
    }

    pub fn created_total(&self) -> u64 {
        *self.created_total.lock()
    }

    pub fn deduped_total(&self) -> u64 {
        *self.deduped_total.lock()
    }

    // -------------------------------------------------------------------------
    // History persistence
    // -------------------------------------------------------------------------

    /// Export dedup history as `"traderId:symbol" -> entry`, most recently
    /// used last, truncated to `max_entries` by dropping the oldest.
    pub fn export_history(&self, max_entries: usize) -> HashMap<String, SignalHistoryEntry> {
        let dedup = self.dedup.lock();
        let entries: Vec<(String, SignalHistoryEntry)> = dedup
            .iterate()
            .map(|((trader, symbol), state)| {
                (
                    format!("{trader}:{symbol}"),
                    SignalHistoryEntry {
                        bar_count: state.bars_since_last,
                        last_open_time: state.last_bar_open_time,
                    },
                )
            })
            .collect();
        let skip = entries.len().saturating_sub(max_entries);
        entries.into_iter().skip(skip).collect()
    }

    /// Restore dedup history exported by a previous session. Entries carry no
    /// live signal reference, so a re-fire inside the window creates a signal
    /// but keeps the window position.
    pub fn load_history(&self, history: HashMap<String, SignalHistoryEntry>, interval: Interval) {
        let mut dedup = self.dedup.lock();
        for (key, entry) in history {
            let Some((trader, symbol)) = key.split_once(':') else {
                continue;
            };
            dedup.set(
                (trader.to_string(), symbol.to_string()),
                DedupState {
                    last_bar_open_time: entry.last_open_time,
                    bars_since_last: entry.bar_count,
                    interval,
                    signal_id: None,
                },
            );
        }
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new(SignalManagerConfig::default())
    }
}
