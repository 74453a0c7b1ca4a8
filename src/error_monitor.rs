// =============================================================================
// ErrorMonitor — categorized, deduplicated, rate-limited error tracking
// =============================================================================
//
// Every subsystem classifies its failures through `track_error` instead of
// unwinding. Storage is hard-bounded: a 100-event ring plus a dedup map of
// representatives, so the monitor survives unbounded error storms.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, warn};

use crate::collections::CircularBuffer;

/// Where an error came from. Labels match the ingestion/evaluation taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Network,
    Realtime,
    DataFetch,
    Cache,
    Websocket,
    Parsing,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 7] = [
        ErrorCategory::Network,
        ErrorCategory::Realtime,
        ErrorCategory::DataFetch,
        ErrorCategory::Cache,
        ErrorCategory::Websocket,
        ErrorCategory::Parsing,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Network => "NETWORK",
            ErrorCategory::Realtime => "REALTIME",
            ErrorCategory::DataFetch => "DATA_FETCH",
            ErrorCategory::Cache => "CACHE",
            ErrorCategory::Websocket => "WEBSOCKET",
            ErrorCategory::Parsing => "PARSING",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A recorded (possibly collapsed) error event.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Wall-clock time of the first occurrence, milliseconds since epoch.
    pub at_ms: i64,
    /// How many occurrences were collapsed into this record.
    pub count: u32,
}

/// Approximate storage accounting, exposed through `stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorMemoryStats {
    pub error_history_size: usize,
    pub dedup_entries: usize,
    pub approx_bytes: usize,
    /// Occurrences absorbed by dedup instead of stored.
    pub dedup_saved: u64,
    /// saved / (saved + stored), 0.0 when nothing was tracked.
    pub dedup_save_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub by_category: HashMap<String, u64>,
    pub by_severity: HashMap<String, u64>,
    pub recent_errors: Vec<ErrorEvent>,
    pub critical_alerts: u64,
    /// Tracked errors in the trailing 60 seconds.
    pub error_rate_per_minute: usize,
    pub memory: ErrorMemoryStats,
}

/// Per-category threshold configuration.
#[derive(Debug, Clone)]
pub struct ErrorMonitorConfig {
    /// Alert threshold per category, errors per rolling minute.
    pub max_per_minute: HashMap<ErrorCategory, usize>,
    /// Dedup window: same category:message within it is collapsed.
    pub dedup_window_ms: i64,
    pub history_capacity: usize,
    pub max_message_len: usize,
}

impl Default for ErrorMonitorConfig {
    fn default() -> Self {
        let mut max_per_minute = HashMap::new();
        for cat in ErrorCategory::ALL {
            max_per_minute.insert(cat, 30);
        }
        Self {
            max_per_minute,
            dedup_window_ms: 5_000,
            history_capacity: 100,
            max_message_len: 500,
        }
    }
}

/// Metadata key fragments that must never reach storage.
const SENSITIVE_KEY_FRAGMENTS: [&str; 5] =
    ["api key", "password", "token", "secret", "credential"];

type AlertListener = Box<dyn Fn(&ErrorEvent) + Send + Sync>;

struct DedupEntry {
    last_at_ms: i64,
    event: ErrorEvent,
}

struct Inner {
    history: CircularBuffer<ErrorEvent>,
    dedup: HashMap<String, DedupEntry>,
    /// Timestamps of tracked errors per category, trailing minute.
    minute_windows: HashMap<ErrorCategory, VecDeque<i64>>,
    total_errors: u64,
    by_category: HashMap<ErrorCategory, u64>,
    by_severity: HashMap<ErrorSeverity, u64>,
    critical_alerts: u64,
    dedup_saved: u64,
    /// Categories currently over their per-minute threshold.
    over_threshold: HashMap<ErrorCategory, bool>,
}

/// Thread-safe categorized error tracker.
pub struct ErrorMonitor {
    inner: Mutex<Inner>,
    config: ErrorMonitorConfig,
    alert_listeners: RwLock<Vec<AlertListener>>,
}

impl ErrorMonitor {
    pub fn new(config: ErrorMonitorConfig) -> Self {
        let history_capacity = config.history_capacity;
        Self {
            inner: Mutex::new(Inner {
                history: CircularBuffer::new(history_capacity),
                dedup: HashMap::new(),
                minute_windows: HashMap::new(),
                total_errors: 0,
                by_category: HashMap::new(),
                by_severity: HashMap::new(),
                critical_alerts: 0,
                dedup_saved: 0,
                over_threshold: HashMap::new(),
            }),
            config,
            alert_listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a callback for synthesized critical alerts.
    pub fn on_alert(&self, f: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.alert_listeners.write().push(Box::new(f));
    }

    /// Track one error occurrence.
    pub fn track_error(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: impl Into<String>,
        metadata: Option<serde_json::Value>,
    ) {
        self.track_at(category, severity, message.into(), metadata, now_ms());
    }

    /// True while `category` is over its per-minute threshold. Consulted by
    /// the fallback controller for `Network` / `Realtime`.
    pub fn should_recover(&self, category: ErrorCategory) -> bool {
        self.inner
            .lock()
            .over_threshold
            .get(&category)
            .copied()
            .unwrap_or(false)
    }

    pub fn stats(&self) -> ErrorStats {
        self.stats_at(now_ms())
    }

    /// Drop dedup representatives older than the dedup window. Called by the
    /// cleanup supervisor; storm-free operation never needs it for safety,
    /// only for memory hygiene.
    pub fn prune_dedup(&self) {
        let now = now_ms();
        let window = self.config.dedup_window_ms;
        let mut inner = self.inner.lock();
        inner.dedup.retain(|_, e| now - e.last_at_ms <= window);
    }

    // -------------------------------------------------------------------------
    // Internals (time-injected for tests)
    // -------------------------------------------------------------------------

    fn track_at(
        &self,
        category: ErrorCategory,
        severity: ErrorSeverity,
        message: String,
        metadata: Option<serde_json::Value>,
        now_ms: i64,
    ) {
        let message = truncate_message(message, self.config.max_message_len);
        let metadata = metadata.map(sanitize_metadata);
        let dedup_key = format!("{}:{}", category.as_str(), message);

        let alert = {
            let mut inner = self.inner.lock();

            inner.total_errors += 1;
            *inner.by_category.entry(category).or_insert(0) += 1;
            *inner.by_severity.entry(severity).or_insert(0) += 1;

            // Rolling per-category minute window.
            let window = inner.minute_windows.entry(category).or_default();
            window.push_back(now_ms);
            while let Some(&front) = window.front() {
                if now_ms - front > 60_000 {
                    window.pop_front();
                } else {
                    break;
                }
            }
            let rate = window.len();

            // Dedup: a repeat inside the window bumps the stored count
            // instead of producing a second record.
            let deduped = match inner.dedup.get_mut(&dedup_key) {
                Some(entry) if now_ms - entry.last_at_ms <= self.config.dedup_window_ms => {
                    entry.last_at_ms = now_ms;
                    entry.event.count += 1;
                    true
                }
                _ => false,
            };

            if deduped {
                inner.dedup_saved += 1;
            } else {
                let event = ErrorEvent {
                    category,
                    severity,
                    message: message.clone(),
                    metadata,
                    at_ms: now_ms,
                    count: 1,
                };
                inner.dedup.insert(
                    dedup_key,
                    DedupEntry {
                        last_at_ms: now_ms,
                        event: event.clone(),
                    },
                );
                inner.history.push(event);
            }

            // Threshold check.
            let limit = self
                .config
                .max_per_minute
                .get(&category)
                .copied()
                .unwrap_or(usize::MAX);
            let over = rate > limit;
            let was_over = inner
                .over_threshold
                .insert(category, over)
                .unwrap_or(false);

            if over && !was_over {
                inner.critical_alerts += 1;
                let alert = ErrorEvent {
                    category,
                    severity: ErrorSeverity::Critical,
                    message: format!(
                        "{} error rate exceeded: {} in the last minute (limit {})",
                        category, rate, limit
                    ),
                    metadata: None,
                    at_ms: now_ms,
                    count: 1,
                };
                inner.history.push(alert.clone());
                Some(alert)
            } else {
                None
            }
        };

        if severity >= ErrorSeverity::High {
            error!(category = %category, %message, "error tracked");
        } else {
            warn!(category = %category, %message, "error tracked");
        }

        if let Some(alert) = alert {
            for listener in self.alert_listeners.read().iter() {
                listener(&alert);
            }
        }
    }

    fn stats_at(&self, now_ms: i64) -> ErrorStats {
        let inner = self.inner.lock();

        let rate: usize = inner
            .minute_windows
            .values()
            .map(|w| w.iter().filter(|&&t| now_ms - t <= 60_000).count())
            .sum();

        let recent = inner.history.get_all();
        let approx_bytes: usize = recent
            .iter()
            .map(approx_event_bytes)
            .chain(inner.dedup.values().map(|e| approx_event_bytes(&e.event)))
            .sum();

        let stored = recent.len() as u64 + inner.dedup_saved;
        let dedup_save_ratio = if stored == 0 {
            0.0
        } else {
            inner.dedup_saved as f64 / stored as f64
        };

        ErrorStats {
            total_errors: inner.total_errors,
            by_category: inner
                .by_category
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), *v))
                .collect(),
            by_severity: inner
                .by_severity
                .iter()
                .map(|(k, v)| (format!("{k:?}").to_uppercase(), *v))
                .collect(),
            recent_errors: recent,
            critical_alerts: inner.critical_alerts,
            error_rate_per_minute: rate,
            memory: ErrorMemoryStats {
                error_history_size: inner.history.len(),
                dedup_entries: inner.dedup.len(),
                approx_bytes,
                dedup_saved: inner.dedup_saved,
                dedup_save_ratio,
            },
        }
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new(ErrorMonitorConfig::default())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn truncate_message(mut message: String, max_len: usize) -> String {
    if message.len() > max_len {
        let mut cut = max_len;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

/// Strip metadata keys that smell like credentials before storage.
fn sanitize_metadata(meta: serde_json::Value) -> serde_json::Value {
    match meta {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(key, _)| {
                    let lower = key.to_lowercase();
                    !SENSITIVE_KEY_FRAGMENTS
                        .iter()
                        .any(|frag| lower.contains(frag))
                })
                .map(|(k, v)| (k, sanitize_metadata(v)))
                .collect(),
        ),
        other => other,
    }
}

fn approx_event_bytes(e: &ErrorEvent) -> usize {
    std::mem::size_of::<ErrorEvent>()
        + e.message.len()
        + e.metadata
            .as_ref()
            .map(|m| m.to_string().len())
            .unwrap_or(0)
}
