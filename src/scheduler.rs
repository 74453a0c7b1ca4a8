// =============================================================================
// TraderScheduler — bar-close driven predicate evaluation
// =============================================================================
//
// Evaluation is always event-driven: a kline close for (symbol, interval)
// triggers every enabled trader whose refresh interval matches and whose
// required timeframes are warm. Trader-set changes only reconfigure the
// interval index; they never kick an evaluation by themselves.
//
// Dispatch for one (symbol, interval) event happens synchronously on the
// caller (the ingestor drains its stream serially), so close events for a
// key are fully dispatched in order. The evaluations themselves run on a
// semaphore-bounded worker pool.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error_monitor::{ErrorCategory, ErrorMonitor, ErrorSeverity};
use crate::errors::ScreenerError;
use crate::indicators;
use crate::market_data::{KlineStore, TickerTable};
use crate::predicate::{EvalContext, Predicate, PredicateConfig};
use crate::signals::manager::{SignalManager, SubmitOutcome};
use crate::types::{Interval, TierPolicy, Trader};

#[derive(Debug, Clone, Copy)]
pub struct TraderSchedulerConfig {
    /// Worker pool size. Defaults to the CPU core count.
    pub worker_count: usize,
    /// Minimum closed bars a required timeframe must hold before a trader
    /// evaluates against it.
    pub min_warmup_bars: usize,
    /// Closed bars snapshotted per timeframe for one evaluation.
    pub history_bars: usize,
    pub predicate: PredicateConfig,
    /// HVN profile parameters for the evaluation context.
    pub hvn_lookback: usize,
    pub hvn_bins: usize,
}

impl Default for TraderSchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            min_warmup_bars: 25,
            history_bars: 250,
            predicate: PredicateConfig::default(),
            hvn_lookback: 200,
            hvn_bins: 24,
        }
    }
}

/// Differential result of applying a new trader set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraderDiff {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

struct CompiledTrader {
    trader: Trader,
    predicate: Predicate,
    /// Cleared when the trader is removed or disabled; in-flight work checks
    /// it before submitting a signal.
    active: AtomicBool,
}

#[derive(Default)]
struct SchedulerIndex {
    traders: HashMap<String, Arc<CompiledTrader>>,
    by_interval: HashMap<Interval, Vec<String>>,
}

pub struct TraderScheduler {
    store: Arc<KlineStore>,
    tickers: Arc<TickerTable>,
    signals: Arc<SignalManager>,
    monitor: Arc<ErrorMonitor>,
    tier_policy: Arc<dyn TierPolicy>,
    config: TraderSchedulerConfig,
    index: RwLock<SchedulerIndex>,
    workers: Arc<Semaphore>,
    /// Set while the fallback controller has signal generation suspended.
    paused: AtomicBool,
}

impl TraderScheduler {
    pub fn new(
        config: TraderSchedulerConfig,
        store: Arc<KlineStore>,
        tickers: Arc<TickerTable>,
        signals: Arc<SignalManager>,
        monitor: Arc<ErrorMonitor>,
        tier_policy: Arc<dyn TierPolicy>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tickers,
            signals,
            monitor,
            tier_policy,
            workers: Arc::new(Semaphore::new(config.worker_count.max(1))),
            config,
            index: RwLock::new(SchedulerIndex::default()),
            paused: AtomicBool::new(false),
        })
    }

    /// Suspend or resume signal generation (degraded-mode control). Bar
    /// counting continues while paused; only evaluation stops.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        info!(paused, "trader scheduler pause state changed");
    }

    // -------------------------------------------------------------------------
    // Trader set application
    // -------------------------------------------------------------------------

    /// Apply a new trader snapshot, computing the differential against the
    /// previous one. Disabled and tier-vetoed traders are dropped from the
    /// schedule; compile failures are reported and skip the trader.
    pub fn apply_traders(&self, traders: Vec<Trader>) -> TraderDiff {
        let mut diff = TraderDiff::default();
        let mut index = self.index.write();

        let mut next: HashMap<String, Arc<CompiledTrader>> = HashMap::new();
        let mut by_interval: HashMap<Interval, Vec<String>> = HashMap::new();

        for trader in traders {
            let trader = Trader {
                filter: trader.filter.clone().normalize(),
                ..trader
            };

            if !trader.enabled {
                continue;
            }
            if !self
                .tier_policy
                .can_enable(&trader, trader.user_id.as_deref())
            {
                debug!(trader_id = %trader.id, "trader vetoed by tier policy");
                continue;
            }

            let existing = index.traders.get(&trader.id);
            let compiled = match existing {
                Some(prev) if prev.trader.filter == trader.filter => {
                    // Unchanged predicate: keep the compiled form.
                    if prev.trader != trader {
                        diff.updated.push(trader.id.clone());
                    }
                    Arc::new(CompiledTrader {
                        predicate: prev.predicate.clone(),
                        trader,
                        active: AtomicBool::new(true),
                    })
                }
                prev => {
                    match Predicate::parse(&trader.filter.predicate, self.config.predicate) {
                        Ok(predicate) => {
                            if prev.is_some() {
                                diff.updated.push(trader.id.clone());
                            } else {
                                diff.added.push(trader.id.clone());
                            }
                            Arc::new(CompiledTrader {
                                predicate,
                                trader,
                                active: AtomicBool::new(true),
                            })
                        }
                        Err(e) => {
                            self.monitor.track_error(
                                ErrorCategory::Parsing,
                                ErrorSeverity::Medium,
                                format!("trader {} predicate rejected: {e}", trader.id),
                                None,
                            );
                            continue;
                        }
                    }
                }
            };

            by_interval
                .entry(compiled.trader.filter.refresh_interval)
                .or_default()
                .push(compiled.trader.id.clone());
            next.insert(compiled.trader.id.clone(), compiled);
        }

        // Anything in the old index but not the new one is removed; flip its
        // active flag so in-flight evaluations drop their results.
        for (id, old) in index.traders.iter() {
            if !next.contains_key(id) {
                old.active.store(false, Ordering::SeqCst);
                diff.removed.push(id.clone());
            }
        }

        info!(
            added = diff.added.len(),
            updated = diff.updated.len(),
            removed = diff.removed.len(),
            scheduled = next.len(),
            "trader set applied"
        );

        index.traders = next;
        index.by_interval = by_interval;
        diff
    }

    /// Union of timeframes required by the scheduled traders, always
    /// including the primary interval. Drives the ingestor's subscriptions.
    pub fn required_intervals(&self) -> BTreeSet<Interval> {
        let index = self.index.read();
        let mut intervals = BTreeSet::from([Interval::PRIMARY]);
        for compiled in index.traders.values() {
            intervals.extend(compiled.trader.filter.required_timeframes.iter().copied());
        }
        intervals
    }

    pub fn scheduled_count(&self) -> usize {
        self.index.read().traders.len()
    }

    // -------------------------------------------------------------------------
    // Close-event handling
    // -------------------------------------------------------------------------

    /// Handle a bar close for (symbol, interval): advance dedup bar counters,
    /// refresh the symbol price on primary closes, and fan out evaluation
    /// tasks to the worker pool.
    pub fn on_bar_close(self: &Arc<Self>, symbol: &str, interval: Interval) {
        self.signals.advance_bars(symbol, interval);

        if interval == Interval::PRIMARY {
            if let Some(last) = self
                .store
                .last_n_closed(symbol, Interval::PRIMARY, 1)
                .last()
            {
                self.signals.update_price(symbol, last.close);
            }
        }

        if self.paused.load(Ordering::SeqCst) {
            return;
        }

        let candidates: Vec<Arc<CompiledTrader>> = {
            let index = self.index.read();
            index
                .by_interval
                .get(&interval)
                .into_iter()
                .flatten()
                .filter_map(|id| index.traders.get(id).cloned())
                .collect()
        };

        for compiled in candidates {
            if !self.timeframes_warm(symbol, &compiled) {
                continue;
            }
            let scheduler = self.clone();
            let symbol = symbol.to_string();
            let workers = self.workers.clone();
            tokio::spawn(async move {
                let Ok(_permit) = workers.acquire().await else {
                    return; // pool shut down
                };
                scheduler.evaluate_now(&compiled, &symbol);
            });
        }
    }

    fn timeframes_warm(&self, symbol: &str, compiled: &CompiledTrader) -> bool {
        compiled
            .trader
            .filter
            .required_timeframes
            .iter()
            .all(|tf| self.store.closed_len(symbol, *tf) >= self.config.min_warmup_bars)
    }

    /// Run one evaluation synchronously. Called by the spawned workers and
    /// by tests that need deterministic scheduling.
    fn evaluate_now(&self, compiled: &CompiledTrader, symbol: &str) {
        if !compiled.active.load(Ordering::SeqCst) {
            return;
        }

        let mut snapshots: HashMap<Interval, Vec<crate::market_data::Kline>> = HashMap::new();
        for tf in &compiled.trader.filter.required_timeframes {
            snapshots.insert(
                *tf,
                self.store.last_n_closed(symbol, *tf, self.config.history_bars),
            );
        }
        let timeframes: HashMap<Interval, &[crate::market_data::Kline]> = snapshots
            .iter()
            .map(|(tf, series)| (*tf, series.as_slice()))
            .collect();

        let refresh = compiled.trader.filter.refresh_interval;
        let Some(trigger_bar) = snapshots.get(&refresh).and_then(|s| s.last().cloned()) else {
            return;
        };

        let primary_series = timeframes.get(&refresh).copied().unwrap_or_default();
        let hvn_nodes = indicators::hvn::volume_nodes(
            primary_series,
            self.config.hvn_lookback,
            self.config.hvn_bins,
        );
        let ticker = self.tickers.get(symbol);

        let ctx = EvalContext {
            ticker: ticker.as_ref(),
            timeframes: &timeframes,
            default_interval: refresh,
            hvn_nodes: &hvn_nodes,
        };

        match compiled.predicate.evaluate(&ctx) {
            Ok(outcome) if outcome.matched => {
                // Best-effort cancellation: a trader disabled mid-evaluation
                // drops its match here; one already past this check lands.
                if !compiled.active.load(Ordering::SeqCst) {
                    return;
                }
                let result = self.signals.submit(
                    &compiled.trader.id,
                    symbol,
                    refresh,
                    trigger_bar.open_time,
                    trigger_bar.close,
                    None,
                );
                if let SubmitOutcome::Created { signal_id } = result {
                    debug!(
                        trader_id = %compiled.trader.id,
                        symbol,
                        signal_id = %signal_id,
                        elapsed_us = outcome.elapsed.as_micros() as u64,
                        "trader matched"
                    );
                }
            }
            Ok(_) => {}
            Err(e @ ScreenerError::PredicateTimeout { .. }) => {
                self.monitor.track_error(
                    ErrorCategory::Parsing,
                    ErrorSeverity::High,
                    format!("trader {} timed out on {symbol}: {e}", compiled.trader.id),
                    None,
                );
            }
            Err(e) => {
                self.monitor.track_error(
                    ErrorCategory::Parsing,
                    ErrorSeverity::Medium,
                    format!("trader {} failed on {symbol}: {e}", compiled.trader.id),
                    None,
                );
            }
        }
    }

    /// Look up a compiled trader by id (test support).
    fn compiled(&self, trader_id: &str) -> Option<Arc<CompiledTrader>> {
        self.index.read().traders.get(trader_id).cloned()
    }
}
