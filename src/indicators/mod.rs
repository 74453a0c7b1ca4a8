// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free numeric primitives over kline slices. Series
// functions return a vector parallel to the input with `None` where data is
// insufficient; `*_latest` helpers return the most recent value. Every
// function is deterministic and never panics on short input.

pub mod adx;
pub mod bollinger;
pub mod hvn;
pub mod ma;
pub mod macd;
pub mod patterns;
pub mod rsi;
pub mod stochastic;
pub mod volume;
pub mod vwap;

use crate::market_data::kline::Kline;

/// Extract close prices, oldest first.
pub fn closes(klines: &[Kline]) -> Vec<f64> {
    klines.iter().map(|k| k.close).collect()
}
