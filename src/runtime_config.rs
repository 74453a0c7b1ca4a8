// =============================================================================
// Runtime Configuration — persisted screener settings over a KvStore
// =============================================================================
//
// Every tunable lives here so the engine can be reconfigured without a
// rebuild. Values are JSON-encoded under stable keys in an abstract
// key-value store; the file-backed implementation writes with an atomic
// tmp + rename pattern to prevent corruption on crash. All fields carry
// `#[serde(default)]` so adding new fields never breaks loading an older
// blob.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::signals::manager::SignalHistoryEntry;

/// Persisted keys. Renaming any of these orphans previously saved state.
pub const KEY_KLINE_HISTORY: &str = "klineHistoryConfig";
pub const KEY_DEDUPE_THRESHOLD: &str = "signalDedupeThreshold";
pub const KEY_FAVORITES: &str = "favorites";
pub const KEY_SIGNAL_HISTORY: &str = "signalHistory";

/// Most signal-history entries ever persisted.
const SIGNAL_HISTORY_MAX_ENTRIES: usize = 500;
/// Hard cap on the persisted signal-history blob.
const SIGNAL_HISTORY_MAX_BYTES: usize = 2 * 1024 * 1024;

// =============================================================================
// KvStore
// =============================================================================

/// Abstract persisted key-value storage. Values are JSON strings.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// File-per-key store with atomic writes.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create config dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        // Atomic write: tmp sibling, then rename.
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, value)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;
        debug!(key, path = %path.display(), "config key saved (atomic)");
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryKvStore {
    values: parking_lot::Mutex<HashMap<String, String>>,
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_screener_limit() -> usize {
    1440
}

fn default_analysis_limit() -> usize {
    500
}

fn default_dedupe_threshold() -> u32 {
    50
}

fn default_universe_size() -> usize {
    50
}

fn default_max_eval_ms() -> u64 {
    250
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_stream_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Kline retention depths: the primary interval keeps `screener_limit` bars,
/// higher timeframes keep `analysis_limit`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KlineHistoryConfig {
    #[serde(default = "default_screener_limit")]
    pub screener_limit: usize,
    #[serde(default = "default_analysis_limit")]
    pub analysis_limit: usize,
}

impl Default for KlineHistoryConfig {
    fn default() -> Self {
        Self {
            screener_limit: default_screener_limit(),
            analysis_limit: default_analysis_limit(),
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub kline_history: KlineHistoryConfig,

    /// Bars inside which a repeat detection increments instead of creating.
    #[serde(default = "default_dedupe_threshold")]
    pub signal_dedupe_threshold: u32,

    /// Top-N pairs by quote volume to screen.
    #[serde(default = "default_universe_size")]
    pub universe_size: usize,

    /// Explicit symbol list that replaces the top-N-by-volume universe.
    /// Set from `MERIDIAN_SYMBOLS`; unset means scan the ticker endpoint.
    #[serde(default)]
    pub universe_override: Option<Vec<String>>,

    /// Predicate evaluation budget.
    #[serde(default = "default_max_eval_ms")]
    pub max_eval_ms: u64,

    /// Trader ids pinned by the user.
    #[serde(default)]
    pub favorites: Vec<String>,

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            kline_history: KlineHistoryConfig::default(),
            signal_dedupe_threshold: default_dedupe_threshold(),
            universe_size: default_universe_size(),
            universe_override: None,
            max_eval_ms: default_max_eval_ms(),
            favorites: Vec::new(),
            rest_base_url: default_rest_base_url(),
            stream_base_url: default_stream_base_url(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the store, falling back to defaults for any
    /// missing or unparseable key.
    pub fn load(kv: &dyn KvStore) -> Self {
        let mut config = Self::default();

        if let Some(history) = read_key::<KlineHistoryConfig>(kv, KEY_KLINE_HISTORY) {
            config.kline_history = history;
        }
        if let Some(threshold) = read_key::<u32>(kv, KEY_DEDUPE_THRESHOLD) {
            config.signal_dedupe_threshold = threshold;
        }
        if let Some(favorites) = read_key::<Vec<String>>(kv, KEY_FAVORITES) {
            config.favorites = favorites;
        }

        info!(
            screener_limit = config.kline_history.screener_limit,
            dedupe_threshold = config.signal_dedupe_threshold,
            favorites = config.favorites.len(),
            "runtime config loaded"
        );
        config
    }

    /// Persist the user-tunable keys.
    pub fn save(&self, kv: &dyn KvStore) -> Result<()> {
        kv.set(
            KEY_KLINE_HISTORY,
            &serde_json::to_string(&self.kline_history)?,
        )?;
        kv.set(
            KEY_DEDUPE_THRESHOLD,
            &serde_json::to_string(&self.signal_dedupe_threshold)?,
        )?;
        kv.set(KEY_FAVORITES, &serde_json::to_string(&self.favorites)?)?;
        Ok(())
    }

    /// Apply environment overrides (`MERIDIAN_*`).
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("MERIDIAN_SYMBOLS") {
            let symbols = parse_symbol_list(&value);
            if symbols.is_empty() {
                warn!(value, "ignoring empty MERIDIAN_SYMBOLS");
            } else {
                self.universe_override = Some(symbols);
            }
        }
        if let Ok(value) = std::env::var("MERIDIAN_UNIVERSE_SIZE") {
            match value.parse() {
                Ok(n) => self.universe_size = n,
                Err(_) => warn!(value, "ignoring invalid MERIDIAN_UNIVERSE_SIZE"),
            }
        }
        if let Ok(url) = std::env::var("MERIDIAN_REST_URL") {
            self.rest_base_url = url;
        }
        if let Ok(url) = std::env::var("MERIDIAN_STREAM_URL") {
            self.stream_base_url = url;
        }
    }
}

/// Parse a comma-separated symbol list: trimmed, uppercased, empties dropped.
pub fn parse_symbol_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn read_key<T: serde::de::DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Option<T> {
    match kv.get(key) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "ignoring unparseable config value");
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            warn!(key, error = %e, "config read failed, using default");
            None
        }
    }
}

// =============================================================================
// Signal-history persistence
// =============================================================================

/// Persist dedup history, truncated to the most recent 500 entries (by last
/// bar open time) and hard-capped at 2 MiB.
pub fn save_signal_history(
    kv: &dyn KvStore,
    history: HashMap<String, SignalHistoryEntry>,
) -> Result<()> {
    let mut entries: Vec<(String, SignalHistoryEntry)> = history.into_iter().collect();
    entries.sort_by_key(|(_, e)| e.last_open_time);
    if entries.len() > SIGNAL_HISTORY_MAX_ENTRIES {
        entries.drain(..entries.len() - SIGNAL_HISTORY_MAX_ENTRIES);
    }

    let mut blob = serde_json::to_string(&entries.iter().cloned().collect::<HashMap<_, _>>())?;
    while blob.len() > SIGNAL_HISTORY_MAX_BYTES && !entries.is_empty() {
        // Shed the oldest half and retry.
        entries.drain(..entries.len().div_ceil(2));
        blob = serde_json::to_string(&entries.iter().cloned().collect::<HashMap<_, _>>())?;
    }

    kv.set(KEY_SIGNAL_HISTORY, &blob)
}

pub fn load_signal_history(kv: &dyn KvStore) -> HashMap<String, SignalHistoryEntry> {
    read_key(kv, KEY_SIGNAL_HISTORY).unwrap_or_default()
}
