// =============================================================================
// Engine — subsystem assembly for the Meridian screener
// =============================================================================
//
// The single composition root. All subsystems are constructor-injected and
// strictly layered: the kline store depends on nothing, the scheduler only
// on stores, the ingestor on both. Cross-cutting concerns (error monitor,
// fallback controller, cleanup supervisor) are explicit dependencies, never
// ambient globals.
//
// Thread safety:
//   - Arc references everywhere; every subsystem manages its own interior
//     mutability with parking_lot locks or atomics.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::binance::{BinanceClient, RateLimitTracker};
use crate::cleanup::{CleanupConfig, CleanupSupervisor, HeapGauge, SysinfoHeapGauge};
use crate::error_monitor::{ErrorCategory, ErrorMonitor, ErrorMonitorConfig};
use crate::fallback::{FallbackConfig, FallbackController, SERVICE_NETWORK};
use crate::market_data::ingestor::{IngestorConfig, MarketDataIngestor};
use crate::market_data::{KlineStore, KlineStoreConfig, TickerTable, UpdateBus};
use crate::predicate::PredicateConfig;
use crate::runtime_config::{self, KvStore, RuntimeConfig};
use crate::scheduler::{TraderScheduler, TraderSchedulerConfig};
use crate::signals::{
    HistoricalResultStore, HistoricalScanConfig, HistoricalScanner, SignalManager,
    SignalManagerConfig,
};
use crate::types::{RemoteSignalFeed, TierPolicy, TraderStore};
use crate::ws::{WsManager, WsManagerConfig};

/// Serialisable operational snapshot for dashboards and logs.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub fallback_mode: String,
    pub ws_status: String,
    pub universe_size: usize,
    pub scheduled_traders: usize,
    pub live_signals: usize,
    pub closed_signals: usize,
    pub signals_created_total: u64,
    pub signals_deduped_total: u64,
    pub total_errors: u64,
    pub error_rate_per_minute: usize,
    pub used_request_weight: u32,
    pub uptime_secs: u64,
}

pub struct Engine {
    pub config: RuntimeConfig,
    pub kv: Arc<dyn KvStore>,
    pub monitor: Arc<ErrorMonitor>,
    pub store: Arc<KlineStore>,
    pub tickers: Arc<TickerTable>,
    pub bus: Arc<UpdateBus>,
    pub signals: Arc<SignalManager>,
    pub historical_results: Arc<HistoricalResultStore>,
    pub ws: Arc<WsManager>,
    pub fallback: Arc<FallbackController>,
    pub scheduler: Arc<TraderScheduler>,
    pub ingestor: Arc<MarketDataIngestor>,
    pub cleanup: Arc<CleanupSupervisor>,
    pub rate_limits: Arc<RateLimitTracker>,
    trader_store: Arc<dyn TraderStore>,
    start_time: Instant,
}

impl Engine {
    /// Build and wire every subsystem. Must run inside a tokio runtime.
    pub fn new(
        config: RuntimeConfig,
        kv: Arc<dyn KvStore>,
        trader_store: Arc<dyn TraderStore>,
        tier_policy: Arc<dyn TierPolicy>,
        heap_gauge: Option<Arc<dyn HeapGauge>>,
    ) -> Arc<Self> {
        let monitor = Arc::new(ErrorMonitor::new(ErrorMonitorConfig::default()));
        let store = Arc::new(KlineStore::new(KlineStoreConfig {
            screener_limit: config.kline_history.screener_limit,
            analysis_limit: config.kline_history.analysis_limit,
        }));
        let tickers = Arc::new(TickerTable::new());
        let bus = Arc::new(UpdateBus::new(monitor.clone()));
        let signals = Arc::new(SignalManager::new(SignalManagerConfig {
            dedupe_threshold: config.signal_dedupe_threshold,
            ..SignalManagerConfig::default()
        }));
        let historical_results = Arc::new(HistoricalResultStore::new(1000));
        let ws = WsManager::new(WsManagerConfig::default(), monitor.clone());
        let fallback = FallbackController::new(FallbackConfig::default());
        let rate_limits = Arc::new(RateLimitTracker::new());
        let client = BinanceClient::with_base_url(config.rest_base_url.as_str(), rate_limits.clone());

        let predicate_config = PredicateConfig {
            max_eval_ms: config.max_eval_ms,
            ..PredicateConfig::default()
        };
        let scheduler = TraderScheduler::new(
            TraderSchedulerConfig {
                predicate: predicate_config,
                ..TraderSchedulerConfig::default()
            },
            store.clone(),
            tickers.clone(),
            signals.clone(),
            monitor.clone(),
            tier_policy,
        );

        let ingestor = MarketDataIngestor::new(
            IngestorConfig {
                universe_size: config.universe_size,
                universe_override: config.universe_override.clone(),
                screener_limit: config.kline_history.screener_limit,
                stream_base_url: config.stream_base_url.clone(),
                ..IngestorConfig::default()
            },
            client.clone(),
            store.clone(),
            bus.clone(),
            tickers.clone(),
            ws.clone(),
            scheduler.clone(),
            fallback.clone(),
            monitor.clone(),
        );

        let cleanup = CleanupSupervisor::new(
            CleanupConfig::default(),
            store.clone(),
            tickers.clone(),
            signals.clone(),
            historical_results.clone(),
            monitor.clone(),
            heap_gauge.unwrap_or_else(|| Arc::new(SysinfoHeapGauge::new())),
        );

        // ── Cross-subsystem wiring ──────────────────────────────────────
        // Degraded modes suspend signal generation.
        {
            let scheduler = scheduler.clone();
            fallback.on_transition(move |t| {
                scheduler.set_paused(!t.mode.allows_signal_generation());
            });
        }
        // The recovery probe is a REST ping.
        {
            let probe_client = client.clone();
            fallback.set_probe(move || {
                let client = probe_client.clone();
                Box::pin(async move { client.ping().await.is_ok() })
            });
        }
        // Sustained network/realtime error storms count against the
        // fallback controller.
        {
            let fallback = fallback.clone();
            let monitor_ref = monitor.clone();
            monitor.on_alert(move |event| {
                let advisory = matches!(
                    event.category,
                    ErrorCategory::Network | ErrorCategory::Realtime
                );
                if advisory && monitor_ref.should_recover(event.category) {
                    fallback.record_failure(SERVICE_NETWORK);
                }
            });
        }

        // Restore dedup windows persisted by the previous session.
        let history = runtime_config::load_signal_history(kv.as_ref());
        if !history.is_empty() {
            info!(entries = history.len(), "signal history restored");
            signals.load_history(history, crate::types::Interval::PRIMARY);
        }

        Arc::new(Self {
            config,
            kv,
            monitor,
            store,
            tickers,
            bus,
            signals,
            historical_results,
            ws,
            fallback,
            scheduler,
            ingestor,
            cleanup,
            rate_limits,
            trader_store,
            start_time: Instant::now(),
        })
    }

    /// Apply the current trader set and subscribe to changes, bootstrap
    /// market data, open the stream, and start the background loops.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        // Initial trader set, then change-driven reapplication.
        self.apply_traders();
        {
            let engine = Arc::downgrade(self);
            self.trader_store.subscribe(Box::new(move || {
                if let Some(engine) = engine.upgrade() {
                    tokio::spawn(async move {
                        engine.apply_traders();
                        engine.ingestor.refresh_subscriptions().await;
                    });
                }
            }));
        }

        self.ingestor.bootstrap().await?;
        self.ingestor.refresh_subscriptions().await;
        self.ingestor.start_streaming();
        self.cleanup.start();
        tokio::spawn(self.ingestor.clone().run_fallback_polling());

        // Drain the ingestor's changed-key set into the cleanup supervisor so
        // actively updating symbols survive sweeps even before they tick.
        {
            let ingestor = self.ingestor.clone();
            let cleanup = self.cleanup.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
                loop {
                    interval.tick().await;
                    let changed = ingestor.take_changed_keys();
                    cleanup.note_activity(changed.into_iter().map(|(symbol, _)| symbol));
                }
            });
        }

        info!("engine started");
        Ok(())
    }

    /// Re-read the trader store and apply the differential.
    pub fn apply_traders(&self) {
        let traders = self.trader_store.list();
        self.scheduler.apply_traders(traders);
    }

    /// Fuse a remote signal feed into the local store (dedup bypassed; the
    /// producing server is the authority).
    pub fn attach_remote_feed(&self, feed: &dyn RemoteSignalFeed) {
        let signals = self.signals.clone();
        feed.subscribe(Box::new(move |signal| signals.ingest_remote(signal)));
        info!("remote signal feed attached");
    }

    /// Run a historical scan over the current universe with the engine's
    /// stores, recording results for later consumers.
    pub fn scanner(&self, config: HistoricalScanConfig) -> HistoricalScanner {
        HistoricalScanner::new(config, self.store.clone())
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let error_stats = self.monitor.stats();
        EngineSnapshot {
            fallback_mode: self.fallback.mode().to_string(),
            ws_status: self.ws.overall_status().to_string(),
            universe_size: self.ingestor.universe().len(),
            scheduled_traders: self.scheduler.scheduled_count(),
            live_signals: self.signals.live_count(),
            closed_signals: self.signals.closed_count(),
            signals_created_total: self.signals.created_total(),
            signals_deduped_total: self.signals.deduped_total(),
            total_errors: error_stats.total_errors,
            error_rate_per_minute: error_stats.error_rate_per_minute,
            used_request_weight: self.rate_limits.snapshot().used_weight_1m,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Stop intake, flush batchers, close sockets, persist state.
    pub fn shutdown(&self) {
        self.scheduler.set_paused(true);
        self.ingestor.dispose();
        self.ws.shutdown();

        if let Err(e) = self.config.save(self.kv.as_ref()) {
            warn!(error = %e, "failed to persist runtime config on shutdown");
        }
        let history = self.signals.export_history(500);
        if let Err(e) = runtime_config::save_signal_history(self.kv.as_ref(), history) {
            warn!(error = %e, "failed to persist signal history on shutdown");
        }
        info!("engine shut down");
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::kline::Kline;
    use crate::runtime_config::MemoryKvStore;
    use crate::signals::SignalFilter;
    use crate::types::{
        AccessTier, AllowAllTiers, Interval, Signal, SignalStatus, Trader, TraderFilter,
    };
    use parking_lot::RwLock;
    use std::collections::BTreeSet;

    struct StubTraderStore {
        traders: RwLock<Vec<Trader>>,
        listeners: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
    }

    impl StubTraderStore {
        fn new(traders: Vec<Trader>) -> Arc<Self> {
            Arc::new(Self {
                traders: RwLock::new(traders),
                listeners: RwLock::new(Vec::new()),
            })
        }

        #[allow(dead_code)]
        fn replace(&self, traders: Vec<Trader>) {
            *self.traders.write() = traders;
            for listener in self.listeners.read().iter() {
                listener();
            }
        }
    }

    impl TraderStore for StubTraderStore {
        fn list(&self) -> Vec<Trader> {
            self.traders.read().clone()
        }

        fn subscribe(&self, f: Box<dyn Fn() + Send + Sync>) {
            self.listeners.write().push(f);
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
            },
        }
    }

    fn engine_with(traders: Vec<Trader>) -> Arc<Engine> {
        Engine::new(
            RuntimeConfig::default(),
            Arc::new(MemoryKvStore::default()),
            StubTraderStore::new(traders),
            Arc::new(AllowAllTiers),
            None,
        )
    }

    fn bar(open_time: i64, close: f64, is_final: bool) -> Kline {
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
            is_final,
        }
    }

    #[tokio::test]
    async fn snapshot_reflects_initial_state() {
        let engine = engine_with(vec![trader("t1", "true")]);
        engine.apply_traders();

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.fallback_mode, "normal");
        assert_eq!(snapshot.scheduled_traders, 1);
        assert_eq!(snapshot.live_signals, 0);
        assert_eq!(snapshot.total_errors, 0);
    }

    #[tokio::test]
    async fn degraded_mode_pauses_signal_generation() {
        let engine = engine_with(vec![]);
        engine.fallback.report_offline();
        // Transition listener flips the scheduler pause; evaluation paths
        // check it on dispatch. The mode itself reports the policy:
        assert!(!engine.fallback.mode().allows_signal_generation());
    }

    #[tokio::test]
    async fn stream_to_signal_pipeline_end_to_end() {
        // Full local pipeline: history in the store, one trader, a streamed
        // closing kline produces exactly one signal with the close price.
        let engine = engine_with(vec![trader("sma-cross", "close(0) > sma(20)")]);
        engine.apply_traders();

        for symbol in ["AUSDT", "BUSDT", "CUSDT"] {
            let bars: Vec<Kline> = (0..100).map(|i| bar(i * 60_000, 100.0, true)).collect();
            engine.store.bulk_load(symbol, Interval::M1, bars).unwrap();
        }

        // A crossing close arrives on B through the stream-text path.
        let text = format!(
            r#"{{"stream":"busdt@kline_1m","data":{{"e":"kline","s":"BUSDT","k":{{
                "t":6000000,"T":6059999,"i":"1m",
                "o":"100","h":"111","l":"99","c":"110",
                "v":"10","q":"15","n":3,"x":true}}}}}}"#
        );
        engine.ingestor.handle_stream_text(&text);
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let listed = engine.signals.list(&SignalFilter {
            trader_ids: Some(vec!["sma-cross".into()]),
            ..SignalFilter::default()
        });
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].symbol, "BUSDT");
        assert!((listed[0].price_at_signal - 110.0).abs() < f64::EPSILON);
        assert_eq!(engine.signals.current_price("BUSDT"), Some(110.0));
    }

    #[tokio::test]
    async fn remote_feed_signals_bypass_dedup() {
        struct StubFeed;
        impl RemoteSignalFeed for StubFeed {
            fn subscribe(&self, f: Box<dyn Fn(Signal) + Send + Sync>) {
                f(Signal {
                    id: "remote-1".into(),
                    trader_id: "server-trader".into(),
                    symbol: "BTCUSDT".into(),
                    detected_at: 1,
                    bar_open_time: 0,
                    price_at_signal: 5.0,
                    current_price: 5.0,
                    metadata: None,
                    status: SignalStatus::Active,
                    count: 1,
                    remote: false,
                });
            }
        }

        let engine = engine_with(vec![]);
        engine.attach_remote_feed(&StubFeed);

        let remote = engine.signals.list(&SignalFilter {
            remote_only: true,
            ..SignalFilter::default()
        });
        assert_eq!(remote.len(), 1);
        assert!(remote[0].remote);
    }

    #[tokio::test]
    async fn shutdown_persists_signal_history() {
        let kv = Arc::new(MemoryKvStore::default());
        let engine = Engine::new(
            RuntimeConfig::default(),
            kv.clone(),
            StubTraderStore::new(vec![]),
            Arc::new(AllowAllTiers),
            None,
        );
        engine
            .signals
            .submit("t1", "BTCUSDT", Interval::M1, 60_000, 1.0, None);
        engine.shutdown();

        let restored = crate::runtime_config::load_signal_history(kv.as_ref());
        assert!(restored.contains_key("t1:BTCUSDT"));

        // A fresh engine restores the window.
        let engine2 = Engine::new(
            RuntimeConfig::default(),
            kv,
            StubTraderStore::new(vec![]),
            Arc::new(AllowAllTiers),
            None,
        );
        let history = engine2.signals.export_history(500);
        assert!(history.contains_key("t1:BTCUSDT"));
    }
}
