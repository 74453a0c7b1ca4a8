// =============================================================================
// Kline — immutable OHLCV bar plus exchange wire parsing
// =============================================================================
//
// Binance sends numeric values as JSON strings inside kline payloads; the
// parse helpers below accept both strings and raw numbers.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ScreenerError;
use crate::types::Interval;

/// A single OHLCV candlestick for a fixed interval.
///
/// Derived attributes (typical price, body sign) are computed on demand and
/// never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades: u64,
    /// True once the bar's interval has elapsed and its values are final.
    pub is_final: bool,
}

impl Kline {
    /// Typical price (HLC/3), used by VWAP and HVN binning.
    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    /// True when the bar closed above its open.
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Structural validation applied before a bar enters the store.
    pub fn validate(&self, symbol: &str, interval: Interval) -> Result<(), ScreenerError> {
        if self.volume < 0.0 || self.quote_volume < 0.0 {
            return Err(ScreenerError::InvalidKline {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                reason: format!("negative volume ({})", self.volume),
            });
        }
        if self.close_time <= self.open_time {
            return Err(ScreenerError::InvalidKline {
                symbol: symbol.to_string(),
                interval: interval.to_string(),
                reason: format!(
                    "close_time {} <= open_time {}",
                    self.close_time, self.open_time
                ),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Wire parsing
// =============================================================================

/// Parse a numeric that the exchange may encode as a string or a number.
pub fn parse_wire_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse a kline object (`k` payload of a kline stream event).
///
/// Expected shape:
/// ```json
/// { "t": 1700000000000, "T": 1700000059999, "i": "1m",
///   "o": "37000.0", "h": "...", "l": "...", "c": "...",
///   "v": "...", "q": "...", "n": 1500, "x": false }
/// ```
pub fn parse_kline_payload(k: &serde_json::Value) -> Result<(Interval, Kline)> {
    let interval_str = k["i"].as_str().context("missing field k.i")?;
    let interval = Interval::parse(interval_str)
        .with_context(|| format!("unsupported interval {interval_str}"))?;

    let kline = Kline {
        open_time: k["t"].as_i64().context("missing field k.t")?,
        close_time: k["T"].as_i64().context("missing field k.T")?,
        open: parse_wire_f64(&k["o"], "k.o")?,
        high: parse_wire_f64(&k["h"], "k.h")?,
        low: parse_wire_f64(&k["l"], "k.l")?,
        close: parse_wire_f64(&k["c"], "k.c")?,
        volume: parse_wire_f64(&k["v"], "k.v")?,
        quote_volume: parse_wire_f64(&k["q"], "k.q")?,
        trades: k["n"].as_u64().context("missing field k.n")?,
        is_final: k["x"].as_bool().context("missing field k.x")?,
    };

    Ok((interval, kline))
}

/// Parse one row of the historical-klines REST response:
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume,
///   trades, takerBuyBase, takerBuyQuote, ignored]`.
///
/// Bars from the REST endpoint are closed history by definition, except a
/// trailing bar whose close time is still in the future relative to
/// `now_ms` (the current in-progress bar).
pub fn parse_rest_kline(row: &serde_json::Value, now_ms: i64) -> Result<Kline> {
    let row = row.as_array().context("kline row is not an array")?;
    if row.len() < 9 {
        anyhow::bail!("kline row has {} fields, expected >= 9", row.len());
    }

    let close_time = row[6].as_i64().context("missing closeTime")?;

    Ok(Kline {
        open_time: row[0].as_i64().context("missing openTime")?,
        open: parse_wire_f64(&row[1], "open")?,
        high: parse_wire_f64(&row[2], "high")?,
        low: parse_wire_f64(&row[3], "low")?,
        close: parse_wire_f64(&row[4], "close")?,
        volume: parse_wire_f64(&row[5], "volume")?,
        close_time,
        quote_volume: parse_wire_f64(&row[7], "quoteVolume")?,
        trades: row[8].as_u64().context("missing trades")?,
        is_final: close_time <= now_ms,
    })
}
