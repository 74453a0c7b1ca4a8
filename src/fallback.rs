// =============================================================================
// FallbackController — ingestion health state machine
// =============================================================================
//
// Tracks failure counters per labeled service and degrades the ingestion
// path when they trip:
//
//   Normal ──(primary failures >= 3)──▶ DirectExchange
//   DirectExchange ──(network failures >= 10)──▶ CachedOnly
//   any degraded ──(successful probe)──▶ Normal
//
// `Offline` is entered when the host reports no network at all. Every
// degraded entry schedules a recovery probe after a cooldown; a successful
// probe clears all counters and returns to Normal.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{info, warn};

/// Operating mode of the ingestion plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Streaming path healthy.
    Normal,
    /// Streaming replaced by rate-limited REST polling.
    DirectExchange,
    /// Store is read-only; signal generation suspended.
    CachedOnly,
    /// Host reports no network.
    Offline,
}

impl FallbackMode {
    /// Whether market-data writes are accepted in this mode.
    pub fn allows_writes(self) -> bool {
        matches!(self, FallbackMode::Normal | FallbackMode::DirectExchange)
    }

    /// Whether trader evaluation may produce new signals.
    pub fn allows_signal_generation(self) -> bool {
        matches!(self, FallbackMode::Normal | FallbackMode::DirectExchange)
    }
}

impl std::fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::DirectExchange => write!(f, "direct_exchange"),
            Self::CachedOnly => write!(f, "cached_only"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Payload delivered to transition listeners.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackTransition {
    pub mode: FallbackMode,
    pub reason: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub affected_features: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_recovery_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackConfig {
    /// Primary-path failures before degrading to DirectExchange.
    pub primary_failure_threshold: u32,
    /// Network failures while degraded before falling to CachedOnly.
    pub network_failure_threshold: u32,
    /// Cooldown before a recovery probe runs.
    pub probe_delay: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            primary_failure_threshold: 3,
            network_failure_threshold: 10,
            probe_delay: Duration::from_secs(30),
        }
    }
}

/// Service labels with special meaning to the state machine.
pub const SERVICE_PRIMARY_STREAM: &str = "primary_stream";
pub const SERVICE_PRIMARY_REST: &str = "primary_rest";
pub const SERVICE_NETWORK: &str = "network";

type ProbeFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;
type TransitionListener = Box<dyn Fn(&FallbackTransition) + Send + Sync>;

pub struct FallbackController {
    config: FallbackConfig,
    mode: RwLock<FallbackMode>,
    counters: Mutex<HashMap<String, u32>>,
    listeners: RwLock<Vec<TransitionListener>>,
    probe: Mutex<Option<ProbeFn>>,
    probe_scheduled: AtomicBool,
}

impl FallbackController {
    pub fn new(config: FallbackConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            mode: RwLock::new(FallbackMode::Normal),
            counters: Mutex::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            probe: Mutex::new(None),
            probe_scheduled: AtomicBool::new(false),
        })
    }

    pub fn mode(&self) -> FallbackMode {
        *self.mode.read()
    }

    pub fn on_transition(&self, f: impl Fn(&FallbackTransition) + Send + Sync + 'static) {
        self.listeners.write().push(Box::new(f));
    }

    /// Install the health-check the recovery loop runs after the cooldown.
    pub fn set_probe(
        &self,
        probe: impl Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync + 'static,
    ) {
        *self.probe.lock() = Some(Arc::new(probe));
    }

    /// Record one failure for a labeled service and evaluate transitions.
    pub fn record_failure(self: &Arc<Self>, service: &str) {
        let count = {
            let mut counters = self.counters.lock();
            let entry = counters.entry(service.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        let mode = self.mode();
        match mode {
            FallbackMode::Normal => {
                let primary_failures = {
                    let counters = self.counters.lock();
                    counters.get(SERVICE_PRIMARY_STREAM).copied().unwrap_or(0)
                        + counters.get(SERVICE_PRIMARY_REST).copied().unwrap_or(0)
                };
                if primary_failures >= self.config.primary_failure_threshold {
                    self.transition(
                        FallbackMode::DirectExchange,
                        format!("{primary_failures} primary ingestion failures"),
                    );
                }
            }
            FallbackMode::DirectExchange => {
                if service == SERVICE_NETWORK && count >= self.config.network_failure_threshold {
                    self.transition(
                        FallbackMode::CachedOnly,
                        format!("{count} network failures while degraded"),
                    );
                }
            }
            FallbackMode::CachedOnly | FallbackMode::Offline => {}
        }
    }

    /// Record a success for a labeled service; clears its counter.
    pub fn record_success(&self, service: &str) {
        self.counters.lock().remove(service);
    }

    /// The host observed a total loss of connectivity.
    pub fn report_offline(self: &Arc<Self>) {
        if self.mode() != FallbackMode::Offline {
            self.transition(FallbackMode::Offline, "no network connectivity".to_string());
        }
    }

    /// Feed a probe outcome directly (used by the probe loop and by hosts
    /// that run their own health checks).
    pub fn handle_probe_result(self: &Arc<Self>, healthy: bool) {
        if healthy && self.mode() != FallbackMode::Normal {
            self.counters.lock().clear();
            self.transition(FallbackMode::Normal, "health check succeeded".to_string());
        } else if !healthy {
            self.schedule_probe();
        }
    }

    fn transition(self: &Arc<Self>, mode: FallbackMode, reason: String) {
        {
            let mut current = self.mode.write();
            if *current == mode {
                return;
            }
            *current = mode;
        }

        let transition = FallbackTransition {
            mode,
            reason,
            timestamp: Utc::now().timestamp_millis(),
            affected_features: affected_features(mode),
            estimated_recovery_ms: match mode {
                FallbackMode::Normal => None,
                _ => Some(self.config.probe_delay.as_millis() as u64),
            },
        };

        match mode {
            FallbackMode::Normal => info!(reason = %transition.reason, "ingestion recovered"),
            _ => warn!(mode = %mode, reason = %transition.reason, "ingestion degraded"),
        }

        for listener in self.listeners.read().iter() {
            listener(&transition);
        }

        if mode != FallbackMode::Normal {
            self.schedule_probe();
        }
    }

    /// Schedule one recovery probe after the cooldown. No-op outside a tokio
    /// runtime or while a probe is already pending.
    fn schedule_probe(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.probe_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let controller = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(controller.config.probe_delay).await;
            controller.probe_scheduled.store(false, Ordering::SeqCst);

            if controller.mode() == FallbackMode::Normal {
                return;
            }
            let probe = controller.probe.lock().clone();
            let healthy = match probe {
                Some(probe) => probe().await,
                // No probe installed: stay degraded until the host reports.
                None => return,
            };
            controller.handle_probe_result(healthy);
        });
    }
}

fn affected_features(mode: FallbackMode) -> Vec<String> {
    match mode {
        FallbackMode::Normal => Vec::new(),
        FallbackMode::DirectExchange => vec!["realtime_streaming".to_string()],
        FallbackMode::CachedOnly => vec![
            "realtime_streaming".to_string(),
            "data_refresh".to_string(),
            "signal_generation".to_string(),
        ],
        FallbackMode::Offline => vec![
            "realtime_streaming".to_string(),
            "data_refresh".to_string(),
            "signal_generation".to_string(),
            "historical_scan".to_string(),
        ],
    }
}
