// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing, plus divergences
// =============================================================================
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — Seed average gain / average loss with the SMA of the first `period`
//          gains / losses.
// Step 3 — Apply Wilder's exponential smoothing:
//            avg_gain = (prev_avg_gain * (period - 1) + current_gain) / period
//            avg_loss = (prev_avg_loss * (period - 1) + current_loss) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)

/// RSI series parallel to `closes`. The first `period` slots are `None`
/// (the seed consumes `period` deltas).
///
/// # Edge cases
/// - `period == 0` => all `None`
/// - `closes.len() < period + 1` => all `None`
/// - If average loss is zero (no down moves), RSI is clamped to 100.0.
/// - A non-finite intermediate stops the series; later slots stay `None`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period].iter().fold((0.0_f64, 0.0_f64), |(g, l), &d| {
        if d > 0.0 {
            (g + d, l)
        } else {
            (g, l + d.abs())
        }
    });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    match rsi_from_averages(avg_gain, avg_loss) {
        Some(rsi) => out[period] = Some(rsi),
        None => return out,
    }

    for (i, &delta) in deltas.iter().enumerate().skip(period) {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_from_averages(avg_gain, avg_loss) {
            Some(rsi) => out[i + 1] = Some(rsi),
            None => break,
        }
    }

    out
}

/// Most recent RSI value.
pub fn rsi_latest(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied().flatten()
}

// =============================================================================
// Divergence detection
// =============================================================================

/// Bullish divergence: price makes a lower low over the lookback while RSI
/// makes a higher low. Compares the most recent half of the lookback window
/// against the older half.
pub fn bullish_divergence(closes: &[f64], period: usize, lookback: usize) -> bool {
    divergence(closes, period, lookback, true)
}

/// Bearish divergence: price makes a higher high while RSI makes a lower high.
pub fn bearish_divergence(closes: &[f64], period: usize, lookback: usize) -> bool {
    divergence(closes, period, lookback, false)
}

fn divergence(closes: &[f64], period: usize, lookback: usize, bullish: bool) -> bool {
    if lookback < 4 || closes.len() < lookback {
        return false;
    }
    let rsi = rsi_series(closes, period);

    let start = closes.len() - lookback;
    let half = lookback / 2;
    let older = start..start + half;
    let recent = start + half..closes.len();

    // Extremes of price and RSI in each half; RSI slots may be None near the
    // start of the series, which disqualifies the window.
    let extreme = |range: std::ops::Range<usize>| -> Option<(f64, f64)> {
        let mut price_ext: Option<f64> = None;
        let mut rsi_ext: Option<f64> = None;
        for i in range {
            let r = rsi[i]?;
            let p = closes[i];
            price_ext = Some(match price_ext {
                Some(prev) if bullish => prev.min(p),
                Some(prev) => prev.max(p),
                None => p,
            });
            rsi_ext = Some(match rsi_ext {
                Some(prev) if bullish => prev.min(r),
                Some(prev) => prev.max(r),
                None => r,
            });
        }
        Some((price_ext?, rsi_ext?))
    };

    let Some((older_price, older_rsi)) = extreme(older) else {
        return false;
    };
    let Some((recent_price, recent_rsi)) = extreme(recent) else {
        return false;
    };

    if bullish {
        recent_price < older_price && recent_rsi > older_rsi
    } else {
        recent_price > older_price && recent_rsi < older_rsi
    }
}

// =============================================================================
// Internal helpers
// =============================================================================

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0 // No movement at all — neutral.
    } else if avg_loss == 0.0 {
        100.0 // All gains, no losses.
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    if rsi.is_finite() {
        Some(rsi)
    } else {
        None
    }
}
