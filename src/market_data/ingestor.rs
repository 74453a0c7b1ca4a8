// =============================================================================
// MarketDataIngestor — bootstrap + streaming orchestration
// =============================================================================
//
// Bootstrap: fetch the ticker universe, keep the top-N non-stablecoin pairs
// by quote volume, then backfill kline history for every required
// (symbol, interval) over a bounded-parallelism REST path.
//
// Streaming: one multiplexed websocket carrying <sym>@ticker for every
// symbol plus <sym>@kline_<interval> for the active interval set. Tickers
// coalesce through the update batcher; klines go straight to the store, and
// a close outcome notifies the scheduler. Changed keys are flagged in a
// shared bit set so the cleanup sweep can read "what moved" without
// allocating per update.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::binance::BinanceClient;
use crate::collections::BitSet;
use crate::error_monitor::{ErrorCategory, ErrorMonitor, ErrorSeverity};
use crate::fallback::{FallbackController, SERVICE_NETWORK, SERVICE_PRIMARY_REST};
use crate::market_data::kline::{parse_kline_payload, parse_wire_f64, Kline};
use crate::market_data::{KlineStore, TickerTable, UpdateBatcher, UpdateBus};
use crate::scheduler::TraderScheduler;
use crate::types::{Interval, Ticker};
use crate::ws::{WsHandlers, WsManager};

/// Quote-asset bases excluded from the screening universe. Stable-vs-stable
/// pairs never produce meaningful signals.
const STABLECOIN_BASES: [&str; 7] = ["USDC", "BUSD", "TUSD", "FDUSD", "DAI", "USDP", "EURI"];

/// Name of the multiplexed market stream in the websocket manager.
const STREAM_KEY: &str = "market";

#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Universe size: top-N pairs by 24h quote volume.
    pub universe_size: usize,
    /// Explicit symbol list replacing the top-N scan when set.
    pub universe_override: Option<Vec<String>>,
    /// Bars fetched per (symbol, interval) at bootstrap.
    pub screener_limit: usize,
    /// Concurrent REST fetches during bootstrap.
    pub bootstrap_parallelism: usize,
    /// Settle delay before a subscription change reconnects the stream.
    pub resubscribe_settle: Duration,
    pub stream_base_url: String,
    /// Spacing between REST calls on the degraded polling path.
    pub poll_spacing: Duration,
    /// Capacity of the changed-key bit set.
    pub change_set_size: usize,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            universe_size: 50,
            universe_override: None,
            screener_limit: 1440,
            bootstrap_parallelism: 8,
            resubscribe_settle: Duration::from_millis(300),
            stream_base_url: "wss://stream.binance.com:9443".to_string(),
            poll_spacing: Duration::from_secs(1),
            change_set_size: 4096,
        }
    }
}

/// Parsed inbound stream message.
#[derive(Debug, Clone)]
pub(crate) enum StreamEvent {
    Ticker(Ticker),
    Kline {
        symbol: String,
        interval: Interval,
        kline: Kline,
    },
}

/// Assigns stable bit indices to (symbol, interval) keys.
struct KeyRegistry {
    indices: HashMap<(String, Interval), usize>,
    by_index: Vec<(String, Interval)>,
}

impl KeyRegistry {
    fn index_for(&mut self, symbol: &str, interval: Interval) -> usize {
        if let Some(&i) = self.indices.get(&(symbol.to_string(), interval)) {
            return i;
        }
        let i = self.by_index.len();
        self.indices.insert((symbol.to_string(), interval), i);
        self.by_index.push((symbol.to_string(), interval));
        i
    }

    fn resolve(&self, index: usize) -> Option<&(String, Interval)> {
        self.by_index.get(index)
    }
}

pub struct MarketDataIngestor {
    client: BinanceClient,
    store: Arc<KlineStore>,
    bus: Arc<UpdateBus>,
    tickers: Arc<TickerTable>,
    ticker_batcher: Arc<UpdateBatcher<String, Ticker>>,
    ws: Arc<WsManager>,
    scheduler: Arc<TraderScheduler>,
    fallback: Arc<FallbackController>,
    monitor: Arc<ErrorMonitor>,
    config: IngestorConfig,
    universe: RwLock<Vec<String>>,
    active_intervals: RwLock<BTreeSet<Interval>>,
    change_set: Arc<BitSet>,
    key_registry: Mutex<KeyRegistry>,
    resubscribe_pending: AtomicBool,
}

impl MarketDataIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: IngestorConfig,
        client: BinanceClient,
        store: Arc<KlineStore>,
        bus: Arc<UpdateBus>,
        tickers: Arc<TickerTable>,
        ws: Arc<WsManager>,
        scheduler: Arc<TraderScheduler>,
        fallback: Arc<FallbackController>,
        monitor: Arc<ErrorMonitor>,
    ) -> Arc<Self> {
        let table = tickers.clone();
        let ticker_batcher = UpdateBatcher::new(
            crate::market_data::UpdateBatcherConfig::default(),
            move |batch: HashMap<String, Ticker>| table.apply_batch(batch),
        );

        Arc::new(Self {
            client,
            store,
            bus,
            tickers,
            ticker_batcher,
            ws,
            scheduler,
            fallback,
            monitor,
            change_set: Arc::new(BitSet::new(config.change_set_size)),
            config,
            universe: RwLock::new(Vec::new()),
            active_intervals: RwLock::new(BTreeSet::from([Interval::PRIMARY])),
            key_registry: Mutex::new(KeyRegistry {
                indices: HashMap::new(),
                by_index: Vec::new(),
            }),
            resubscribe_pending: AtomicBool::new(false),
        })
    }

    pub fn universe(&self) -> Vec<String> {
        self.universe.read().clone()
    }

    /// Drain the changed-key set accumulated since the last sweep.
    pub fn take_changed_keys(&self) -> Vec<(String, Interval)> {
        let registry = self.key_registry.lock();
        self.change_set
            .take_set_indices()
            .into_iter()
            .filter_map(|i| registry.resolve(i).cloned())
            .collect()
    }

    // -------------------------------------------------------------------------
    // Bootstrap
    // -------------------------------------------------------------------------

    /// Fetch the universe and backfill history for every required interval.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let tickers = match self.client.get_24h_tickers().await {
            Ok(t) => {
                self.fallback.record_success(SERVICE_PRIMARY_REST);
                t
            }
            Err(e) => {
                self.monitor.track_error(
                    ErrorCategory::Network,
                    ErrorSeverity::High,
                    format!("ticker universe fetch failed: {e}"),
                    None,
                );
                self.fallback.record_failure(SERVICE_PRIMARY_REST);
                return Err(e).context("bootstrap universe fetch");
            }
        };

        let universe = self.resolve_universe(&tickers);
        info!(symbols = universe.len(), "screening universe selected");

        for ticker in tickers {
            if universe.contains(&ticker.symbol) {
                self.tickers.update(ticker);
            }
        }
        *self.universe.write() = universe.clone();

        let intervals: Vec<Interval> = self.active_intervals.read().iter().copied().collect();
        self.backfill(&universe, &intervals).await;
        Ok(())
    }

    /// An explicit `MERIDIAN_SYMBOLS` override wins; otherwise the top-N
    /// pairs by quote volume.
    fn resolve_universe(&self, tickers: &[Ticker]) -> Vec<String> {
        match &self.config.universe_override {
            Some(symbols) if !symbols.is_empty() => {
                info!(symbols = symbols.len(), "universe override active");
                symbols.clone()
            }
            _ => select_universe(tickers, self.config.universe_size),
        }
    }

    /// Fetch history for every (symbol, interval) pair with bounded
    /// parallelism. Per-symbol failures are logged and skipped.
    async fn backfill(self: &Arc<Self>, symbols: &[String], intervals: &[Interval]) {
        let semaphore = Arc::new(Semaphore::new(self.config.bootstrap_parallelism.max(1)));
        let mut handles = Vec::new();

        for symbol in symbols {
            for interval in intervals {
                let ingestor = self.clone();
                let semaphore = semaphore.clone();
                let symbol = symbol.clone();
                let interval = *interval;
                handles.push(tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire().await else {
                        return;
                    };
                    ingestor.backfill_one(&symbol, interval).await;
                }));
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("bootstrap backfill complete");
    }

    async fn backfill_one(self: &Arc<Self>, symbol: &str, interval: Interval) {
        match self
            .client
            .get_klines(symbol, interval, self.config.screener_limit)
            .await
        {
            Ok(klines) => {
                self.fallback.record_success(SERVICE_PRIMARY_REST);
                match self.store.bulk_load(symbol, interval, klines) {
                    Ok(_) => {
                        self.mark_changed(symbol, interval);
                        self.bus.emit(symbol, interval);
                    }
                    Err(e) => self.monitor.track_error(
                        ErrorCategory::Parsing,
                        ErrorSeverity::Medium,
                        format!("bulk load rejected for {symbol}@{interval}: {e}"),
                        None,
                    ),
                }
            }
            Err(e) => {
                // One symbol failing must not abort the batch.
                self.monitor.track_error(
                    ErrorCategory::DataFetch,
                    ErrorSeverity::Medium,
                    format!("history fetch failed for {symbol}@{interval}: {e}"),
                    None,
                );
                self.fallback.record_failure(SERVICE_PRIMARY_REST);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Streaming
    // -------------------------------------------------------------------------

    /// Open the multiplexed stream for the current universe and interval set.
    pub fn start_streaming(self: &Arc<Self>) {
        let universe = self.universe.read().clone();
        if universe.is_empty() {
            warn!("start_streaming called with an empty universe");
            return;
        }
        let intervals: Vec<Interval> = self.active_intervals.read().iter().copied().collect();
        let url = build_stream_url(&self.config.stream_base_url, &universe, &intervals);

        let ingestor = self.clone();
        let handlers = WsHandlers::from_message_fn(move |text| {
            ingestor.handle_stream_text(text);
        });
        self.ws.connect(STREAM_KEY, url, handlers);
        info!(
            symbols = universe.len(),
            intervals = intervals.len(),
            "market stream subscription opened"
        );
    }

    /// Recompute the required interval set from the scheduler. When it
    /// changed, backfill only the newly added intervals, then tear down and
    /// reopen the stream after a settle delay so rapid toggles coalesce.
    pub async fn refresh_subscriptions(self: &Arc<Self>) {
        let required = self.scheduler.required_intervals();
        let added: Vec<Interval> = {
            let active = self.active_intervals.read();
            required.difference(&active).copied().collect()
        };
        if added.is_empty() && *self.active_intervals.read() == required {
            return;
        }

        info!(?added, "required interval set changed");
        *self.active_intervals.write() = required;

        if !added.is_empty() {
            let universe = self.universe.read().clone();
            self.backfill(&universe, &added).await;
        }

        // Coalesce rapid toggles: only the last refresh within the settle
        // window reconnects.
        if self.resubscribe_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let ingestor = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ingestor.config.resubscribe_settle).await;
            ingestor.resubscribe_pending.store(false, Ordering::SeqCst);
            ingestor.start_streaming();
        });
    }

    /// Route one raw stream message. In-flight messages for intervals that
    /// were just unsubscribed still drain through this path.
    pub(crate) fn handle_stream_text(&self, text: &str) {
        match parse_stream_message(text) {
            Ok(StreamEvent::Ticker(ticker)) => {
                self.ticker_batcher.add(ticker.symbol.clone(), ticker);
            }
            Ok(StreamEvent::Kline {
                symbol,
                interval,
                kline,
            }) => {
                self.apply_kline(&symbol, interval, kline);
            }
            Err(e) => {
                self.monitor.track_error(
                    ErrorCategory::Parsing,
                    ErrorSeverity::Low,
                    format!("unparseable stream message: {e}"),
                    None,
                );
            }
        }
    }

    /// Shared write path for streamed and polled klines.
    fn apply_kline(&self, symbol: &str, interval: Interval, kline: Kline) {
        if !self.fallback.mode().allows_writes() {
            return;
        }
        match self.store.update_kline(symbol, interval, kline) {
            Ok(outcome) => {
                self.mark_changed(symbol, interval);
                self.bus.emit(symbol, interval);
                if outcome.was_close {
                    self.scheduler.on_bar_close(symbol, interval);
                }
            }
            Err(e) => {
                self.monitor.track_error(
                    ErrorCategory::Parsing,
                    ErrorSeverity::Medium,
                    format!("kline rejected for {symbol}@{interval}: {e}"),
                    None,
                );
            }
        }
    }

    fn mark_changed(&self, symbol: &str, interval: Interval) {
        let index = self.key_registry.lock().index_for(symbol, interval);
        self.change_set.set(index);
    }

    // -------------------------------------------------------------------------
    // Degraded-mode polling
    // -------------------------------------------------------------------------

    /// Rate-limited REST polling loop that replaces the stream while the
    /// fallback controller sits in DirectExchange. Runs until shutdown.
    pub async fn run_fallback_polling(self: Arc<Self>) {
        loop {
            if self.fallback.mode() != crate::fallback::FallbackMode::DirectExchange {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let universe = self.universe.read().clone();
            let intervals: Vec<Interval> =
                self.active_intervals.read().iter().copied().collect();

            'poll: for symbol in &universe {
                for interval in &intervals {
                    if self.fallback.mode()
                        != crate::fallback::FallbackMode::DirectExchange
                    {
                        break 'poll;
                    }
                    match self.client.get_klines(symbol, *interval, 2).await {
                        Ok(klines) => {
                            self.fallback.record_success(SERVICE_NETWORK);
                            for kline in klines {
                                self.apply_kline(symbol, *interval, kline);
                            }
                        }
                        Err(e) => {
                            debug!(symbol, error = %e, "fallback poll failed");
                            self.monitor.track_error(
                                ErrorCategory::Network,
                                ErrorSeverity::Medium,
                                format!("fallback poll failed for {symbol}: {e}"),
                                None,
                            );
                            self.fallback.record_failure(SERVICE_NETWORK);
                        }
                    }
                    tokio::time::sleep(self.config.poll_spacing).await;
                }
            }
        }
    }

    /// Flush and stop the ticker batcher (shutdown path).
    pub fn dispose(&self) {
        self.ticker_batcher.dispose();
    }
}

// -----------------------------------------------------------------------------
// Pure helpers
// -----------------------------------------------------------------------------

/// Top-N USDT pairs by 24h quote volume, stablecoin bases excluded.
fn select_universe(tickers: &[Ticker], n: usize) -> Vec<String> {
    let mut candidates: Vec<&Ticker> = tickers
        .iter()
        .filter(|t| {
            t.symbol.ends_with("USDT")
                && !STABLECOIN_BASES
                    .iter()
                    .any(|base| t.symbol == format!("{base}USDT"))
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.quote_volume_24h
            .partial_cmp(&a.quote_volume_24h)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    candidates
        .into_iter()
        .take(n)
        .map(|t| t.symbol.clone())
        .collect()
}

/// Combined-stream URL: `<sym>@ticker` per symbol plus `<sym>@kline_<iv>`
/// per (symbol, interval).
fn build_stream_url(base: &str, symbols: &[String], intervals: &[Interval]) -> String {
    let mut streams = Vec::with_capacity(symbols.len() * (1 + intervals.len()));
    for symbol in symbols {
        let lower = symbol.to_lowercase();
        streams.push(format!("{lower}@ticker"));
        for interval in intervals {
            streams.push(format!("{lower}@kline_{interval}"));
        }
    }
    format!("{base}/stream?streams={}", streams.join("/"))
}

/// Parse one combined-stream message into a ticker or kline event.
pub(crate) fn parse_stream_message(text: &str) -> Result<StreamEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse stream JSON")?;

    // Combined-stream envelope or direct payload.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let event_type = data["e"].as_str().context("missing event type")?;
    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();

    match event_type {
        "24hrTicker" => Ok(StreamEvent::Ticker(Ticker {
            symbol,
            last_price: parse_wire_f64(&data["c"], "c")?,
            percent_change_24h: parse_wire_f64(&data["P"], "P")?,
            quote_volume_24h: parse_wire_f64(&data["q"], "q")?,
            event_time: data["E"].as_i64().context("missing field E")?,
        })),
        "kline" => {
            let (interval, kline) = parse_kline_payload(&data["k"])?;
            Ok(StreamEvent::Kline {
                symbol,
                interval,
                kline,
            })
        }
        other => anyhow::bail!("unhandled stream event type '{other}'"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::RateLimitTracker;
    use crate::fallback::{FallbackConfig, FallbackMode};
    use crate::market_data::KlineStoreConfig;
    use crate::signals::manager::SignalManager;
    use crate::types::AllowAllTiers;
    use crate::ws::WsManagerConfig;

    fn ticker(symbol: &str, quote_volume: f64) -> Ticker {
        Ticker {
            symbol: symbol.into(),
            last_price: 1.0,
            percent_change_24h: 0.0,
            quote_volume_24h: quote_volume,
            event_time: 0,
        }
    }

    #[test]
    fn universe_ranks_by_quote_volume_and_drops_stables() {
        let tickers = vec![
            ticker("BTCUSDT", 1000.0),
            ticker("ETHUSDT", 2000.0),
            ticker("USDCUSDT", 9999.0), // stablecoin base — excluded
            ticker("DOGEUSDT", 500.0),
            ticker("ETHBTC", 3000.0), // not a USDT pair — excluded
        ];
        let universe = select_universe(&tickers, 2);
        assert_eq!(universe, vec!["ETHUSDT".to_string(), "BTCUSDT".to_string()]);
    }

    #[tokio::test]
    async fn universe_override_replaces_top_n_scan() {
        let (ingestor, _store, _signals) = wired_ingestor_with(IngestorConfig {
            universe_override: Some(vec!["DOGEUSDT".to_string(), "PEPEUSDT".to_string()]),
            ..IngestorConfig::default()
        });

        // Heavier pairs in the ticker list do not displace the override.
        let tickers = vec![
            ticker("BTCUSDT", 1_000_000.0),
            ticker("ETHUSDT", 500_000.0),
            ticker("DOGEUSDT", 10.0),
        ];
        let universe = ingestor.resolve_universe(&tickers);
        assert_eq!(
            universe,
            vec!["DOGEUSDT".to_string(), "PEPEUSDT".to_string()]
        );

        // Without an override the top-N scan applies.
        let (ingestor, _store, _signals) = wired_ingestor();
        let universe = ingestor.resolve_universe(&tickers);
        assert_eq!(universe[0], "BTCUSDT");
    }

    #[test]
    fn stream_url_contains_all_streams() {
        let url = build_stream_url(
            "wss://stream.binance.com:9443",
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            &[Interval::M1, Interval::M5],
        );
        assert!(url.starts_with("wss://stream.binance.com:9443/stream?streams="));
        assert!(url.contains("btcusdt@ticker"));
        assert!(url.contains("btcusdt@kline_1m"));
        assert!(url.contains("ethusdt@kline_5m"));
    }

    #[test]
    fn parses_combined_ticker_message() {
        let text = r#"{
            "stream": "btcusdt@ticker",
            "data": {
                "e": "24hrTicker", "E": 1700000000000,
                "s": "BTCUSDT", "P": "-1.5", "c": "37000.5", "q": "123456.7"
            }
        }"#;
        match parse_stream_message(text).unwrap() {
            StreamEvent::Ticker(t) => {
                assert_eq!(t.symbol, "BTCUSDT");
                assert!((t.last_price - 37000.5).abs() < 1e-9);
                assert!((t.percent_change_24h + 1.5).abs() < 1e-9);
            }
            other => panic!("expected ticker, got {other:?}"),
        }
    }

    #[test]
    fn parses_combined_kline_message() {
        let text = r#"{
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline", "s": "BTCUSDT",
                "k": {
                    "t": 1700000000000, "T": 1700000059999, "i": "1m",
                    "o": "1", "h": "2", "l": "0.5", "c": "1.5",
                    "v": "10", "q": "15", "n": 3, "x": true
                }
            }
        }"#;
        match parse_stream_message(text).unwrap() {
            StreamEvent::Kline {
                symbol,
                interval,
                kline,
            } => {
                assert_eq!(symbol, "BTCUSDT");
                assert_eq!(interval, Interval::M1);
                assert!(kline.is_final);
            }
            other => panic!("expected kline, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_event_types() {
        let text = r#"{"e": "depthUpdate", "s": "BTCUSDT"}"#;
        assert!(parse_stream_message(text).is_err());
        assert!(parse_stream_message("not json").is_err());
    }

    // -------------------------------------------------------------------------
    // Routing through a fully wired (offline) ingestor
    // -------------------------------------------------------------------------

    fn wired_ingestor() -> (Arc<MarketDataIngestor>, Arc<KlineStore>, Arc<SignalManager>) {
        wired_ingestor_with(IngestorConfig::default())
    }

    fn wired_ingestor_with(
        config: IngestorConfig,
    ) -> (Arc<MarketDataIngestor>, Arc<KlineStore>, Arc<SignalManager>) {
        let monitor = Arc::new(ErrorMonitor::default());
        let store = Arc::new(KlineStore::new(KlineStoreConfig::default()));
        let tickers = Arc::new(TickerTable::new());
        let signals = Arc::new(SignalManager::default());
        let bus = Arc::new(UpdateBus::new(monitor.clone()));
        let ws = WsManager::new(WsManagerConfig::default(), monitor.clone());
        let fallback = FallbackController::new(FallbackConfig::default());
        let scheduler = TraderScheduler::new(
            crate::scheduler::TraderSchedulerConfig::default(),
            store.clone(),
            tickers.clone(),
            signals.clone(),
            monitor.clone(),
            Arc::new(AllowAllTiers),
        );
        let client = BinanceClient::with_base_url(
            "http://127.0.0.1:9",
            Arc::new(RateLimitTracker::new()),
        );
        let ingestor = MarketDataIngestor::new(
            config,
            client,
            store.clone(),
            bus,
            tickers,
            ws,
            scheduler,
            fallback,
            monitor,
        );
        (ingestor, store, signals)
    }

    fn kline_text(open_time: i64, close: f64, is_final: bool) -> String {
        format!(
            r#"{{"stream":"btcusdt@kline_1m","data":{{"e":"kline","s":"BTCUSDT","k":{{
                "t":{open_time},"T":{close_time},"i":"1m",
                "o":"{close}","h":"{close}","l":"{close}","c":"{close}",
                "v":"10","q":"15","n":3,"x":{is_final}}}}}}}"#,
            close_time = open_time + 59_999,
        )
    }

    #[tokio::test]
    async fn kline_messages_flow_into_the_store() {
        let (ingestor, store, _signals) = wired_ingestor();

        ingestor.handle_stream_text(&kline_text(0, 100.0, false));
        ingestor.handle_stream_text(&kline_text(0, 101.0, true));

        let view = store.series("BTCUSDT", Interval::M1).unwrap();
        assert_eq!(view.len(), 1);
        assert!(view.last().unwrap().is_final);

        // The close marked the key as changed.
        let changed = ingestor.take_changed_keys();
        assert!(changed.contains(&("BTCUSDT".to_string(), Interval::M1)));
        // Drained: a second sweep sees nothing.
        assert!(ingestor.take_changed_keys().is_empty());
    }

    #[tokio::test]
    async fn ticker_messages_coalesce_through_the_batcher() {
        let (ingestor, _store, _signals) = wired_ingestor();

        let text = r#"{"data":{"e":"24hrTicker","E":1,"s":"BTCUSDT","P":"1","c":"5","q":"9"}}"#;
        ingestor.handle_stream_text(text);
        // Pending until the batcher flushes.
        assert_eq!(ingestor.tickers.len(), 0);
        ingestor.ticker_batcher.flush();
        assert_eq!(ingestor.tickers.len(), 1);
        assert!((ingestor.tickers.get("BTCUSDT").unwrap().last_price - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn malformed_messages_count_as_parse_errors() {
        let (ingestor, _store, _signals) = wired_ingestor();
        ingestor.handle_stream_text("garbage");
        assert_eq!(
            ingestor
                .monitor
                .stats()
                .by_category
                .get("PARSING")
                .copied()
                .unwrap_or(0),
            1
        );
    }

    #[tokio::test]
    async fn offline_mode_rejects_writes() {
        let (ingestor, store, _signals) = wired_ingestor();
        ingestor.fallback.report_offline();
        ingestor.handle_stream_text(&kline_text(0, 100.0, true));
        assert!(store.series("BTCUSDT", Interval::M1).is_none());
    }

    #[tokio::test]
    async fn cached_only_mode_rejects_writes() {
        let (ingestor, store, _signals) = wired_ingestor();

        // Degrade to DirectExchange: the polling path still writes.
        for _ in 0..3 {
            ingestor.fallback.record_failure(SERVICE_PRIMARY_REST);
        }
        assert_eq!(ingestor.fallback.mode(), FallbackMode::DirectExchange);
        ingestor.handle_stream_text(&kline_text(0, 100.0, true));
        assert_eq!(store.series("BTCUSDT", Interval::M1).unwrap().len(), 1);

        // Sustained network failures fall to CachedOnly: store goes
        // read-only and the in-flight update is dropped.
        for _ in 0..10 {
            ingestor.fallback.record_failure(SERVICE_NETWORK);
        }
        assert_eq!(ingestor.fallback.mode(), FallbackMode::CachedOnly);
        ingestor.handle_stream_text(&kline_text(60_000, 101.0, true));
        assert_eq!(store.series("BTCUSDT", Interval::M1).unwrap().len(), 1);
    }
}
