// =============================================================================
// Meridian Market Screener — Main Entry Point
// =============================================================================
//
// Boot order: env + logging, persisted config, trader store, engine
// assembly, bootstrap + streaming, then run until ctrl-c. Exit codes:
//   0 — clean shutdown
//   1 — fatal configuration error
//   2 — ingestion unrecoverable after the fallback cascade exhausted

// ── Module declarations ──────────────────────────────────────────────────────
mod binance;
mod cleanup;
mod collections;
mod engine;
mod error_monitor;
mod errors;
mod fallback;
mod indicators;
mod market_data;
mod predicate;
mod runtime_config;
mod scheduler;
mod signals;
mod types;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine::Engine;
use crate::runtime_config::{FileKvStore, RuntimeConfig};
use crate::types::{AllowAllTiers, Trader, TraderStore};

/// Bootstrap attempts before the process gives up with exit code 2.
const BOOTSTRAP_ATTEMPTS: u32 = 3;

// =============================================================================
// File-backed trader store (host adapter)
// =============================================================================

/// Reads user-authored traders from a JSON file. Persistence and editing of
/// traders live outside the engine; this adapter only loads and watches.
struct JsonTraderStore {
    path: PathBuf,
    traders: RwLock<Vec<Trader>>,
    listeners: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl JsonTraderStore {
    fn load(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let traders = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<Trader>>(&content) {
                Ok(traders) => {
                    info!(path = %path.display(), count = traders.len(), "traders loaded");
                    traders
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "trader file unparseable, starting empty");
                    Vec::new()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no trader file, starting empty");
                Vec::new()
            }
        };
        Arc::new(Self {
            path,
            traders: RwLock::new(traders),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Re-read the file and notify subscribers on change.
    fn reload(&self) {
        let Ok(content) = std::fs::read_to_string(&self.path) else {
            return;
        };
        match serde_json::from_str::<Vec<Trader>>(&content) {
            Ok(traders) => {
                let changed = {
                    let mut current = self.traders.write();
                    if *current == traders {
                        false
                    } else {
                        *current = traders;
                        true
                    }
                };
                if changed {
                    info!("trader file changed, reapplying");
                    for listener in self.listeners.read().iter() {
                        listener();
                    }
                }
            }
            Err(e) => warn!(error = %e, "ignoring unparseable trader file update"),
        }
    }
}

impl TraderStore for JsonTraderStore {
    fn list(&self) -> Vec<Trader> {
        self.traders.read().clone()
    }

    fn subscribe(&self, f: Box<dyn Fn() + Send + Sync>) {
        self.listeners.write().push(f);
    }
}

// =============================================================================
// Entry point
// =============================================================================

#[tokio::main]
async fn main() {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Market Screener — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Persisted configuration ───────────────────────────────────────
    let config_dir =
        std::env::var("MERIDIAN_CONFIG_DIR").unwrap_or_else(|_| "./meridian-config".into());
    let kv = match FileKvStore::new(&config_dir) {
        Ok(kv) => Arc::new(kv),
        Err(e) => {
            error!(error = %e, dir = %config_dir, "fatal: cannot open config store");
            std::process::exit(1);
        }
    };

    let mut config = RuntimeConfig::load(kv.as_ref());
    config.apply_env();

    // ── 3. Trader store ──────────────────────────────────────────────────
    let traders_path =
        std::env::var("MERIDIAN_TRADERS").unwrap_or_else(|_| "traders.json".into());
    let trader_store = JsonTraderStore::load(traders_path);

    // ── 4. Engine assembly ───────────────────────────────────────────────
    let engine = Engine::new(
        config,
        kv,
        trader_store.clone(),
        Arc::new(AllowAllTiers),
        None,
    );

    // ── 5. Bootstrap + streaming, with bounded retry ─────────────────────
    let mut started = false;
    for attempt in 1..=BOOTSTRAP_ATTEMPTS {
        match engine.start().await {
            Ok(()) => {
                started = true;
                break;
            }
            Err(e) => {
                error!(attempt, error = %e, "engine start failed");
                tokio::time::sleep(std::time::Duration::from_secs(5 * attempt as u64)).await;
            }
        }
    }
    if !started && !engine.fallback.mode().allows_writes() {
        error!(mode = %engine.fallback.mode(), "ingestion unrecoverable, giving up");
        std::process::exit(2);
    }

    // ── 6. Trader file watcher ───────────────────────────────────────────
    {
        let store = trader_store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                interval.tick().await;
                store.reload();
            }
        });
    }

    // ── 7. Periodic status heartbeat ─────────────────────────────────────
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let s = engine.snapshot();
                info!(
                    mode = %s.fallback_mode,
                    ws = %s.ws_status,
                    traders = s.scheduled_traders,
                    live_signals = s.live_signals,
                    errors_per_min = s.error_rate_per_minute,
                    "heartbeat"
                );
            }
        });
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 8. Graceful shutdown ─────────────────────────────────────────────
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    warn!("Shutdown signal received — stopping gracefully");
    engine.shutdown();
    info!("Meridian shut down complete.");
}
