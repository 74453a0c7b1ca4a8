// =============================================================================
// Core error types for the Meridian screening engine
// =============================================================================
//
// Subsystems return `Result<_, ScreenerError>` and classify failures through
// the `ErrorMonitor` instead of unwinding. `anyhow` is reserved for the
// application edges (REST client, config IO, main).

use thiserror::Error;

/// Errors produced by the core market-data and evaluation subsystems.
#[derive(Debug, Error)]
pub enum ScreenerError {
    /// A kline failed validation (negative volume, inverted close time, or a
    /// non-monotonic open time that is not a tail replacement).
    #[error("invalid kline for {symbol}@{interval}: {reason}")]
    InvalidKline {
        symbol: String,
        interval: String,
        reason: String,
    },

    /// A caller passed an argument the receiving container rejects, e.g.
    /// pushing a missing value into a `CircularBuffer`.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A trader predicate exceeded its evaluation budget.
    #[error("predicate evaluation exceeded {budget_ms}ms")]
    PredicateTimeout { budget_ms: u64 },

    /// A trader predicate failed to evaluate (type error, unknown function,
    /// missing timeframe data, arithmetic fault).
    #[error("predicate evaluation failed: {0}")]
    PredicateFailed(String),

    /// A predicate source string could not be parsed.
    #[error("predicate parse error: {0}")]
    PredicateParse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats_are_stable() {
        let e = ScreenerError::InvalidKline {
            symbol: "BTCUSDT".into(),
            interval: "1m".into(),
            reason: "negative volume".into(),
        };
        assert_eq!(
            e.to_string(),
            "invalid kline for BTCUSDT@1m: negative volume"
        );

        let e = ScreenerError::PredicateTimeout { budget_ms: 250 };
        assert_eq!(e.to_string(), "predicate evaluation exceeded 250ms");
    }
}
