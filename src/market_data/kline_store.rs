// =============================================================================
// KlineStore — single source of truth for per-(symbol, interval) kline history
// =============================================================================
//
// Each series is an independently locked ring bounded to a configured
// capacity. Readers receive cheap view handles and never a mutable alias.
// Invariants per series:
//   - open_time strictly increases, no duplicates.
//   - At most one non-final bar, and it is the last element.
//   - Same open_time as the tail replaces the tail; a larger open_time
//     appends and, when the previous tail was still open, closes it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::errors::ScreenerError;
use crate::market_data::kline::Kline;
use crate::types::Interval;

/// Identifies one kline series.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Result hint of a single kline update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KlineUpdateOutcome {
    /// True when this update closed a bar (either the final form of the tail
    /// arrived, or a newer bar arrived while the tail was still open).
    pub was_close: bool,
    /// Open time of the bar that closed when `was_close`, otherwise of the
    /// bar that was written.
    pub open_time: i64,
}

/// Capacity configuration. The primary interval keeps a deep ring for
/// screening; higher timeframes keep the smaller analysis depth.
#[derive(Debug, Clone, Copy)]
pub struct KlineStoreConfig {
    pub screener_limit: usize,
    pub analysis_limit: usize,
}

impl Default for KlineStoreConfig {
    fn default() -> Self {
        Self {
            screener_limit: 1440,
            analysis_limit: 500,
        }
    }
}

impl KlineStoreConfig {
    fn capacity_for(&self, interval: Interval) -> usize {
        if interval == Interval::PRIMARY {
            self.screener_limit.max(1)
        } else {
            self.analysis_limit.max(1)
        }
    }
}

struct SeriesInner {
    klines: Vec<Kline>,
    capacity: usize,
    last_write: Instant,
}

impl SeriesInner {
    fn trim(&mut self) {
        while self.klines.len() > self.capacity {
            self.klines.remove(0);
        }
    }
}

/// Read-only, constant-time handle onto one series. Every accessor takes a
/// short read lock; no copy happens at acquisition time.
#[derive(Clone)]
pub struct SeriesView {
    inner: Arc<RwLock<SeriesInner>>,
}

impl SeriesView {
    pub fn len(&self) -> usize {
        self.inner.read().klines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().klines.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Kline> {
        self.inner.read().klines.get(index).cloned()
    }

    pub fn last(&self) -> Option<Kline> {
        self.inner.read().klines.last().cloned()
    }

    /// Full snapshot, oldest first.
    pub fn to_vec(&self) -> Vec<Kline> {
        self.inner.read().klines.clone()
    }

    /// The most recent `n` closed bars, oldest first, excluding any open tail.
    pub fn last_n_closed(&self, n: usize) -> Vec<Kline> {
        let inner = self.inner.read();
        let closed: Vec<&Kline> = inner.klines.iter().filter(|k| k.is_final).collect();
        let start = closed.len().saturating_sub(n);
        closed[start..].iter().map(|k| (*k).clone()).collect()
    }

    /// Closed bars whose open time is `<= cutoff_ms`, oldest first. Used by
    /// the historical scanner to position higher timeframes at a past bar.
    pub fn closed_up_to(&self, cutoff_ms: i64) -> Vec<Kline> {
        let inner = self.inner.read();
        inner
            .klines
            .iter()
            .filter(|k| k.is_final && k.open_time <= cutoff_ms)
            .cloned()
            .collect()
    }
}

/// Owner of all kline history. Per-key locking: readers proceed concurrently
/// with writers on other keys.
pub struct KlineStore {
    series: RwLock<HashMap<SeriesKey, Arc<RwLock<SeriesInner>>>>,
    config: KlineStoreConfig,
}

impl KlineStore {
    pub fn new(config: KlineStoreConfig) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Apply the tail-replace-or-append rule for one inbound kline.
    ///
    /// Never fails on a duplicate tail open time; the tail is replaced.
    /// Fails with `InvalidKline` on structural problems or an out-of-order
    /// open time that differs from the tail.
    pub fn update_kline(
        &self,
        symbol: &str,
        interval: Interval,
        kline: Kline,
    ) -> Result<KlineUpdateOutcome, ScreenerError> {
        kline.validate(symbol, interval)?;

        let handle = self.series_handle(symbol, interval);
        let mut inner = handle.write();
        inner.last_write = Instant::now();

        let Some(tail) = inner.klines.last() else {
            let outcome = KlineUpdateOutcome {
                was_close: kline.is_final,
                open_time: kline.open_time,
            };
            inner.klines.push(kline);
            return Ok(outcome);
        };

        if kline.open_time == tail.open_time {
            // In-place update of the current bar; closing it when the final
            // form arrives. Replaying the identical update is idempotent.
            let was_open = !tail.is_final;
            let was_close = was_open && kline.is_final;
            let open_time = kline.open_time;
            let last = inner.klines.len() - 1;
            inner.klines[last] = kline;
            return Ok(KlineUpdateOutcome {
                was_close,
                open_time,
            });
        }

        if kline.open_time < tail.open_time {
            return Err(ScreenerError::InvalidKline {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                reason: format!(
                    "out-of-order open_time {} behind tail {}",
                    kline.open_time, tail.open_time
                ),
            });
        }

        // Newer bar. If the tail never received its final form, it closes now
        // with its last observed values.
        let tail_was_open = !tail.is_final;
        let closed_open_time = tail.open_time;
        if tail_was_open {
            let last = inner.klines.len() - 1;
            inner.klines[last].is_final = true;
        }

        let appended_open_time = kline.open_time;
        let appended_final = kline.is_final;
        inner.klines.push(kline);
        inner.trim();

        if tail_was_open {
            Ok(KlineUpdateOutcome {
                was_close: true,
                open_time: closed_open_time,
            })
        } else {
            Ok(KlineUpdateOutcome {
                // A pre-closed bar appended onto closed history (REST
                // backfill path) is itself a close.
                was_close: appended_final,
                open_time: appended_open_time,
            })
        }
    }

    /// Replace a series wholesale (bootstrap path). Rejects input that is not
    /// strictly increasing in open time; truncates to capacity by dropping
    /// the oldest bars.
    pub fn bulk_load(
        &self,
        symbol: &str,
        interval: Interval,
        mut klines: Vec<Kline>,
    ) -> Result<usize, ScreenerError> {
        for w in klines.windows(2) {
            if w[1].open_time <= w[0].open_time {
                return Err(ScreenerError::InvalidKline {
                    symbol: symbol.to_string(),
                    interval: interval.to_string(),
                    reason: format!(
                        "bulk load not strictly increasing at open_time {}",
                        w[1].open_time
                    ),
                });
            }
        }
        for k in &klines {
            k.validate(symbol, interval)?;
        }

        let capacity = self.config.capacity_for(interval);
        if klines.len() > capacity {
            klines.drain(..klines.len() - capacity);
        }

        let loaded = klines.len();
        let handle = self.series_handle(symbol, interval);
        let mut inner = handle.write();
        inner.klines = klines;
        inner.last_write = Instant::now();

        debug!(symbol = %symbol, interval = %interval, bars = loaded, "series bulk loaded");
        Ok(loaded)
    }

    /// Constant-time read-only handle. Returns `None` for unknown keys.
    pub fn series(&self, symbol: &str, interval: Interval) -> Option<SeriesView> {
        let map = self.series.read();
        map.get(&SeriesKey::new(symbol, interval))
            .map(|inner| SeriesView {
                inner: inner.clone(),
            })
    }

    /// The most recent `n` closed bars for a key, oldest first.
    pub fn last_n_closed(&self, symbol: &str, interval: Interval, n: usize) -> Vec<Kline> {
        self.series(symbol, interval)
            .map(|v| v.last_n_closed(n))
            .unwrap_or_default()
    }

    /// Number of closed bars currently held for a key.
    pub fn closed_len(&self, symbol: &str, interval: Interval) -> usize {
        self.series(symbol, interval)
            .map(|v| {
                v.inner
                    .read()
                    .klines
                    .iter()
                    .filter(|k| k.is_final)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Remove whole series whose tail bar closed before `older_than_ms`.
    /// Returns the number of series dropped.
    pub fn evict_inactive(&self, older_than_ms: i64) -> usize {
        let mut map = self.series.write();
        let before = map.len();
        map.retain(|_, inner| {
            inner
                .read()
                .klines
                .last()
                .map(|k| k.close_time >= older_than_ms)
                .unwrap_or(false)
        });
        before - map.len()
    }

    /// Remove series that have not been written to for `max_idle`, keeping
    /// any symbol in `keep`. Returns the number of series dropped.
    pub fn evict_untouched(&self, max_idle: Duration, keep: &HashSet<String>) -> usize {
        let mut map = self.series.write();
        let before = map.len();
        map.retain(|key, inner| {
            keep.contains(&key.symbol) || inner.read().last_write.elapsed() < max_idle
        });
        let dropped = before - map.len();
        if dropped > 0 {
            debug!(dropped, "evicted idle kline series");
        }
        dropped
    }

    fn series_handle(&self, symbol: &str, interval: Interval) -> Arc<RwLock<SeriesInner>> {
        let key = SeriesKey::new(symbol, interval);
        {
            let map = self.series.read();
            if let Some(inner) = map.get(&key) {
                return inner.clone();
            }
        }
        let mut map = self.series.write();
        map.entry(key)
            .or_insert_with(|| {
                Arc::new(RwLock::new(SeriesInner {
                    klines: Vec::new(),
                    capacity: self.config.capacity_for(interval),
                    last_write: Instant::now(),
                }))
            })
            .clone()
    }
}

impl Default for KlineStore {
    fn default() -> Self {
        Self::new(KlineStoreConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(open_time: i64, close: f64, is_final: bool) -> Kline {
        Kline {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            quote_volume: 200.0,
            trades: 10,
            is_final,
        }
    }

    fn small_store() -> KlineStore {
        KlineStore::new(KlineStoreConfig {
            screener_limit: 5,
            analysis_limit: 3,
        })
    }

    #[test]
    fn append_then_final_replacement_reports_close() {
        let store = KlineStore::default();
        let out = store
            .update_kline("BTCUSDT", Interval::M1, bar(0, 100.0, false))
            .unwrap();
        assert!(!out.was_close);

        // Still the same bar, still open: replace, no close.
        let out = store
            .update_kline("BTCUSDT", Interval::M1, bar(0, 101.0, false))
            .unwrap();
        assert!(!out.was_close);

        // The final form closes the bar.
        let out = store
            .update_kline("BTCUSDT", Interval::M1, bar(0, 102.0, true))
            .unwrap();
        assert!(out.was_close);
        assert_eq!(out.open_time, 0);

        let view = store.series("BTCUSDT", Interval::M1).unwrap();
        assert_eq!(view.len(), 1);
        assert!((view.last().unwrap().close - 102.0).abs() < f64::EPSILON);
    }

    #[test]
    fn newer_bar_over_open_tail_closes_it() {
        let store = KlineStore::default();
        store
            .update_kline("BTCUSDT", Interval::M1, bar(0, 100.0, false))
            .unwrap();
        let out = store
            .update_kline("BTCUSDT", Interval::M1, bar(60_000, 101.0, false))
            .unwrap();
        assert!(out.was_close);
        assert_eq!(out.open_time, 0);

        let view = store.series("BTCUSDT", Interval::M1).unwrap();
        assert_eq!(view.len(), 2);
        // The abandoned tail was force-finalized.
        assert!(view.get(0).unwrap().is_final);
        assert!(!view.get(1).unwrap().is_final);
    }

    #[test]
    fn at_most_one_open_bar_and_it_is_last() {
        let store = KlineStore::default();
        for i in 0..5 {
            store
                .update_kline("ETHUSDT", Interval::M1, bar(i * 60_000, 100.0, false))
                .unwrap();
        }
        let view = store.series("ETHUSDT", Interval::M1).unwrap();
        let bars = view.to_vec();
        let open_count = bars.iter().filter(|k| !k.is_final).count();
        assert_eq!(open_count, 1);
        assert!(!bars.last().unwrap().is_final);
    }

    #[test]
    fn duplicate_open_update_is_idempotent() {
        let store = KlineStore::default();
        let k = bar(0, 100.0, false);
        store.update_kline("BTCUSDT", Interval::M1, k.clone()).unwrap();
        store.update_kline("BTCUSDT", Interval::M1, k).unwrap();
        assert_eq!(store.series("BTCUSDT", Interval::M1).unwrap().len(), 1);
    }

    #[test]
    fn out_of_order_bar_is_rejected() {
        let store = KlineStore::default();
        store
            .update_kline("BTCUSDT", Interval::M1, bar(120_000, 100.0, true))
            .unwrap();
        let err = store
            .update_kline("BTCUSDT", Interval::M1, bar(60_000, 99.0, true))
            .unwrap_err();
        assert!(matches!(err, ScreenerError::InvalidKline { .. }));
        // Store state unchanged.
        assert_eq!(store.series("BTCUSDT", Interval::M1).unwrap().len(), 1);
    }

    #[test]
    fn capacity_is_enforced_per_interval() {
        let store = small_store();
        for i in 0..10 {
            store
                .update_kline("BTCUSDT", Interval::M1, bar(i * 60_000, 100.0, true))
                .unwrap();
            store
                .update_kline("BTCUSDT", Interval::H1, bar(i * 3_600_000, 100.0, true))
                .unwrap();
        }
        assert_eq!(store.series("BTCUSDT", Interval::M1).unwrap().len(), 5);
        assert_eq!(store.series("BTCUSDT", Interval::H1).unwrap().len(), 3);
    }

    #[test]
    fn open_times_strictly_increase() {
        let store = small_store();
        for i in 0..20 {
            let _ = store.update_kline("BTCUSDT", Interval::M1, bar(i * 60_000, 100.0, true));
        }
        let bars = store.series("BTCUSDT", Interval::M1).unwrap().to_vec();
        for w in bars.windows(2) {
            assert!(w[0].open_time < w[1].open_time);
        }
    }

    #[test]
    fn bulk_load_roundtrips_closed_bars() {
        let store = KlineStore::default();
        let bars: Vec<Kline> = (0..100).map(|i| bar(i * 60_000, 100.0 + i as f64, true)).collect();
        store.bulk_load("BTCUSDT", Interval::M1, bars.clone()).unwrap();

        let tail = store.last_n_closed("BTCUSDT", Interval::M1, 10);
        assert_eq!(tail.len(), 10);
        assert_eq!(tail, bars[90..].to_vec());
    }

    #[test]
    fn bulk_load_rejects_non_increasing() {
        let store = KlineStore::default();
        let bars = vec![bar(60_000, 1.0, true), bar(60_000, 2.0, true)];
        assert!(store.bulk_load("BTCUSDT", Interval::M1, bars).is_err());
    }

    #[test]
    fn bulk_load_truncates_to_capacity() {
        let store = small_store();
        let bars: Vec<Kline> = (0..50).map(|i| bar(i * 60_000, i as f64, true)).collect();
        let loaded = store.bulk_load("BTCUSDT", Interval::M1, bars).unwrap();
        assert_eq!(loaded, 5);
        let view = store.series("BTCUSDT", Interval::M1).unwrap();
        assert_eq!(view.get(0).unwrap().open_time, 45 * 60_000);
    }

    #[test]
    fn last_n_closed_excludes_open_tail() {
        let store = KlineStore::default();
        store.update_kline("BTCUSDT", Interval::M1, bar(0, 1.0, true)).unwrap();
        store.update_kline("BTCUSDT", Interval::M1, bar(60_000, 2.0, true)).unwrap();
        store.update_kline("BTCUSDT", Interval::M1, bar(120_000, 3.0, false)).unwrap();

        let closed = store.last_n_closed("BTCUSDT", Interval::M1, 10);
        assert_eq!(closed.len(), 2);
        assert!((closed[1].close - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn evict_inactive_drops_stale_series() {
        let store = KlineStore::default();
        store.update_kline("OLDUSDT", Interval::M1, bar(0, 1.0, true)).unwrap();
        store
            .update_kline("NEWUSDT", Interval::M1, bar(10_000_000, 1.0, true))
            .unwrap();

        let dropped = store.evict_inactive(5_000_000);
        assert_eq!(dropped, 1);
        assert!(store.series("OLDUSDT", Interval::M1).is_none());
        assert!(store.series("NEWUSDT", Interval::M1).is_some());
    }

    #[test]
    fn evict_untouched_respects_keep_set() {
        let store = KlineStore::default();
        store.update_kline("AUSDT", Interval::M1, bar(0, 1.0, true)).unwrap();
        store.update_kline("BUSDT", Interval::M1, bar(0, 1.0, true)).unwrap();

        let keep: HashSet<String> = ["AUSDT".to_string()].into();
        let dropped = store.evict_untouched(Duration::from_secs(0), &keep);
        assert_eq!(dropped, 1);
        assert!(store.series("AUSDT", Interval::M1).is_some());
        assert!(store.series("BUSDT", Interval::M1).is_none());
    }

    #[test]
    fn closed_up_to_positions_at_past_bar() {
        let store = KlineStore::default();
        for i in 0..5 {
            store
                .update_kline("BTCUSDT", Interval::M1, bar(i * 60_000, i as f64, true))
                .unwrap();
        }
        let view = store.series("BTCUSDT", Interval::M1).unwrap();
        let truncated = view.closed_up_to(2 * 60_000);
        assert_eq!(truncated.len(), 3);
        assert_eq!(truncated.last().unwrap().open_time, 120_000);
    }
}
