// =============================================================================
// Shared types used across the Meridian screening engine
// =============================================================================

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

// =============================================================================
// Interval
// =============================================================================

/// A kline timeframe. The engine only operates on this fixed enumeration;
/// anything else on the wire is a parse error.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Interval {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Interval {
    /// The primary interval the screener always ingests.
    pub const PRIMARY: Interval = Interval::M1;

    /// All supported intervals, ascending by width.
    pub const ALL: [Interval; 6] = [
        Interval::M1,
        Interval::M5,
        Interval::M15,
        Interval::H1,
        Interval::H4,
        Interval::D1,
    ];

    /// Width of one bar in milliseconds.
    pub fn width_ms(self) -> i64 {
        match self {
            Interval::M1 => 60_000,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::H1 => 3_600_000,
            Interval::H4 => 14_400_000,
            Interval::D1 => 86_400_000,
        }
    }

    /// Align a timestamp down to the expected bar open time for this interval.
    pub fn align(self, ts_ms: i64) -> i64 {
        ts_ms - ts_ms.rem_euclid(self.width_ms())
    }

    /// The wire suffix used by the exchange stream names (`@kline_1m`).
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1d",
        }
    }

    /// Parse the exchange wire form.
    pub fn parse(s: &str) -> Option<Interval> {
        match s {
            "1m" => Some(Interval::M1),
            "5m" => Some(Interval::M5),
            "15m" => Some(Interval::M15),
            "1h" => Some(Interval::H1),
            "4h" => Some(Interval::H4),
            "1d" => Some(Interval::D1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Ticker
// =============================================================================

/// Latest 24h rolling summary for a symbol. Transient: only the most recent
/// ticker per symbol is retained anywhere in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last_price: f64,
    pub percent_change_24h: f64,
    pub quote_volume_24h: f64,
    /// Server timestamp of the update, milliseconds since epoch.
    pub event_time: i64,
}

// =============================================================================
// Trader
// =============================================================================

/// Subscription tier required to run a trader. Interpretation of tiers is the
/// job of the injected `TierPolicy`; the core only carries the label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessTier {
    Free,
    Pro,
    Elite,
}

impl Default for AccessTier {
    fn default() -> Self {
        Self::Free
    }
}

/// A single chart-layer indicator config. Opaque to the core: it is carried
/// on the trader and forwarded to consumers, never interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorPanelEntry {
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The screening rule attached to a trader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderFilter {
    /// Predicate source, consumed by the predicate runtime.
    pub predicate: String,
    /// The cadence: the trader is evaluated on closes of this interval.
    pub refresh_interval: Interval,
    /// Every timeframe the predicate reads. Always includes the refresh
    /// interval by construction (`normalize` enforces it).
    pub required_timeframes: BTreeSet<Interval>,
    /// Chart-layer indicator panel, forwarded to consumers untouched.
    #[serde(default)]
    pub indicator_panel: Vec<IndicatorPanelEntry>,
}

impl TraderFilter {
    /// Ensure the refresh interval is part of the required timeframes.
    pub fn normalize(mut self) -> Self {
        self.required_timeframes.insert(self.refresh_interval);
        self
    }
}

/// The unit of user intent: a named, enableable predicate over market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trader {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub access_tier: AccessTier,
    #[serde(default)]
    pub user_id: Option<String>,
    pub filter: TraderFilter,
}

// =============================================================================
// Signals
// =============================================================================

/// Lifecycle state of a signal. Closure is an explicit operation by the
/// position-management consumer; the engine never closes signals on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Active,
    Closed,
}

/// A materialized detection: a trader matched a symbol at a specific bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub trader_id: String,
    pub symbol: String,
    /// Wall-clock detection time, milliseconds since epoch.
    pub detected_at: i64,
    /// Open time of the kline whose close triggered the detection.
    pub bar_open_time: i64,
    pub price_at_signal: f64,
    /// Last known price while the signal is active.
    pub current_price: f64,
    /// Snapshot of selected indicator values at detection time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub status: SignalStatus,
    /// Number of detections collapsed into this signal by the dedup window.
    pub count: u32,
    /// True when the signal came from a remote feed rather than local
    /// evaluation.
    #[serde(default)]
    pub remote: bool,
}

/// A signal produced by replaying a predicate over past bars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalSignal {
    pub id: String,
    pub trader_id: String,
    pub symbol: String,
    /// Wall-clock time of the scan that produced this, milliseconds.
    pub detected_at: i64,
    pub bar_open_time: i64,
    pub price_at_signal: f64,
    /// How many closed primary-interval bars ago this bar was.
    pub bars_ago: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Always true; distinguishes replayed signals from live ones when the
    /// two are mixed in a consumer feed.
    pub replayed: bool,
}

// =============================================================================
// External collaborators (opaque to the core)
// =============================================================================

/// Subscription tiering. May veto running a trader; everything else about
/// tiers is out of scope.
pub trait TierPolicy: Send + Sync {
    fn can_enable(&self, trader: &Trader, user_id: Option<&str>) -> bool;
}

/// Permissive policy used by tests and by deployments without tiering.
pub struct AllowAllTiers;

impl TierPolicy for AllowAllTiers {
    fn can_enable(&self, _trader: &Trader, _user_id: Option<&str>) -> bool {
        true
    }
}

/// Source of user-authored traders. The engine holds immutable copies for
/// the duration of a scheduling decision; persistence lives elsewhere.
pub trait TraderStore: Send + Sync {
    fn list(&self) -> Vec<Trader>;
    /// Register a change callback. The callback is invoked after any mutation
    /// to the trader set.
    fn subscribe(&self, f: Box<dyn Fn() + Send + Sync>);
}

/// Inbound server-side signals. The producing server is the authority: these
/// bypass local deduplication entirely.
pub trait RemoteSignalFeed: Send + Sync {
    fn subscribe(&self, f: Box<dyn Fn(Signal) + Send + Sync>);
}
