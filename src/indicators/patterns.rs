// =============================================================================
// Price extremes and candle patterns
// =============================================================================

use crate::market_data::kline::Kline;

/// Highest high over the most recent `n` bars.
pub fn highest_high(klines: &[Kline], n: usize) -> Option<f64> {
    if n == 0 || klines.is_empty() {
        return None;
    }
    let start = klines.len().saturating_sub(n);
    klines[start..]
        .iter()
        .map(|k| k.high)
        .fold(None, |acc, h| match acc {
            Some(prev) if prev >= h => Some(prev),
            _ => Some(h),
        })
}

/// Lowest low over the most recent `n` bars.
pub fn lowest_low(klines: &[Kline], n: usize) -> Option<f64> {
    if n == 0 || klines.is_empty() {
        return None;
    }
    let start = klines.len().saturating_sub(n);
    klines[start..]
        .iter()
        .map(|k| k.low)
        .fold(None, |acc, l| match acc {
            Some(prev) if prev <= l => Some(prev),
            _ => Some(l),
        })
}

/// Bullish engulfing: the last bar is an up candle whose body completely
/// engulfs the previous down candle's body.
pub fn is_bullish_engulfing(klines: &[Kline]) -> bool {
    let n = klines.len();
    if n < 2 {
        return false;
    }
    let prev = &klines[n - 2];
    let last = &klines[n - 1];

    prev.close < prev.open
        && last.close > last.open
        && last.open <= prev.close
        && last.close >= prev.open
}

/// Bearish engulfing: the last bar is a down candle whose body completely
/// engulfs the previous up candle's body.
pub fn is_bearish_engulfing(klines: &[Kline]) -> bool {
    let n = klines.len();
    if n < 2 {
        return false;
    }
    let prev = &klines[n - 2];
    let last = &klines[n - 1];

    prev.close > prev.open
        && last.close < last.open
        && last.open >= prev.close
        && last.close <= prev.open
}
