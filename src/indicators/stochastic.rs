// =============================================================================
// Stochastic Oscillator and StochRSI
// =============================================================================
//
// Classical Stochastic:
//   %K = 100 * (close - LL(n)) / (HH(n) - LL(n))
//   %D = SMA(%K, d_period)
//
// StochRSI applies the same normalisation to the RSI series instead of raw
// price, then smooths: K = SMA(raw, k_smooth), D = SMA(K, d_smooth).

use crate::indicators::ma::sma_series;
use crate::indicators::rsi::rsi_series;
use crate::market_data::kline::Kline;

/// %K / %D pair of series, parallel to the input.
#[derive(Debug, Clone)]
pub struct StochSeries {
    pub k: Vec<Option<f64>>,
    pub d: Vec<Option<f64>>,
}

/// Classical Stochastic over OHLC bars.
pub fn stochastic_series(klines: &[Kline], k_period: usize, d_period: usize) -> StochSeries {
    let n = klines.len();
    let mut k = vec![None; n];
    if k_period == 0 || d_period == 0 || n < k_period {
        return StochSeries { d: vec![None; n], k };
    }

    for i in (k_period - 1)..n {
        let window = &klines[i + 1 - k_period..=i];
        let hh = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let ll = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);
        let range = hh - ll;
        if range > 0.0 {
            let value = 100.0 * (klines[i].close - ll) / range;
            if value.is_finite() {
                k[i] = Some(value.clamp(0.0, 100.0));
            }
        } else {
            // Flat window: price pinned mid-range by convention.
            k[i] = Some(50.0);
        }
    }

    let d = smooth_optional(&k, d_period);
    StochSeries { k, d }
}

/// Most recent %K / %D.
pub fn stochastic_latest(klines: &[Kline], k_period: usize, d_period: usize) -> Option<(f64, f64)> {
    let series = stochastic_series(klines, k_period, d_period);
    Some(((*series.k.last()?)?, (*series.d.last()?)?))
}

/// StochRSI K/D series parallel to `closes`.
pub fn stoch_rsi_series(
    closes: &[f64],
    rsi_period: usize,
    stoch_period: usize,
    k_smooth: usize,
    d_smooth: usize,
) -> StochSeries {
    let n = closes.len();
    if rsi_period == 0 || stoch_period == 0 || k_smooth == 0 || d_smooth == 0 {
        return StochSeries {
            k: vec![None; n],
            d: vec![None; n],
        };
    }

    let rsi = rsi_series(closes, rsi_period);

    // Raw StochRSI: normalise each RSI value against its trailing window.
    let mut raw = vec![None; n];
    for i in 0..n {
        let Some(current) = rsi[i] else { continue };
        if i + 1 < stoch_period {
            continue;
        }
        let window = &rsi[i + 1 - stoch_period..=i];
        if window.iter().any(Option::is_none) {
            continue;
        }
        let hi = window.iter().flatten().fold(f64::MIN, |a, &b| a.max(b));
        let lo = window.iter().flatten().fold(f64::MAX, |a, &b| a.min(b));
        let range = hi - lo;
        raw[i] = if range > 0.0 {
            Some(((current - lo) / range * 100.0).clamp(0.0, 100.0))
        } else {
            Some(50.0)
        };
    }

    let k = smooth_optional(&raw, k_smooth);
    let d = smooth_optional(&k, d_smooth);
    StochSeries { k, d }
}

/// Most recent StochRSI K/D.
pub fn stoch_rsi_latest(
    closes: &[f64],
    rsi_period: usize,
    stoch_period: usize,
    k_smooth: usize,
    d_smooth: usize,
) -> Option<(f64, f64)> {
    let series = stoch_rsi_series(closes, rsi_period, stoch_period, k_smooth, d_smooth);
    Some(((*series.k.last()?)?, (*series.d.last()?)?))
}

/// SMA over the defined suffix of an optional series, preserving `None`
/// alignment with the input.
fn smooth_optional(series: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; series.len()];
    let Some(start) = series.iter().position(Option::is_some) else {
        return out;
    };
    let values: Vec<f64> = series[start..].iter().map(|v| v.unwrap_or(0.0)).collect();
    for (offset, value) in sma_series(&values, period).into_iter().enumerate() {
        out[start + offset] = value;
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 1,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            quote_volume: 1.0,
            trades: 1,
            is_final: true,
        }
    }

    #[test]
    fn stochastic_close_at_high_is_100() {
        let klines: Vec<Kline> = (0..20)
            .map(|i| {
                let base = 100.0 + i as f64;
                bar(base, base - 2.0, base) // closes exactly at the high
            })
            .collect();
        let (k, _d) = stochastic_latest(&klines, 14, 3).unwrap();
        assert!((k - 100.0).abs() < 1e-9);
    }

    #[test]
    fn stochastic_close_at_low_is_0() {
        let klines: Vec<Kline> = (0..20)
            .map(|i| {
                let base = 100.0 - i as f64;
                bar(base + 2.0, base, base)
            })
            .collect();
        let (k, _d) = stochastic_latest(&klines, 14, 3).unwrap();
        assert!(k.abs() < 1e-9);
    }

    #[test]
    fn stochastic_flat_window_is_mid() {
        let klines = vec![bar(100.0, 100.0, 100.0); 20];
        let (k, d) = stochastic_latest(&klines, 14, 3).unwrap();
        assert!((k - 50.0).abs() < 1e-9);
        assert!((d - 50.0).abs() < 1e-9);
    }

    #[test]
    fn stochastic_insufficient_data() {
        let klines = vec![bar(101.0, 99.0, 100.0); 5];
        assert!(stochastic_latest(&klines, 14, 3).is_none());
    }

    #[test]
    fn stoch_rsi_in_range() {
        let closes: Vec<f64> = (0..100)
            .map(|i| 100.0 + (i as f64 * 0.5).sin() * 10.0)
            .collect();
        let series = stoch_rsi_series(&closes, 14, 14, 3, 3);
        assert_eq!(series.k.len(), 100);
        for v in series.k.iter().flatten() {
            assert!((0.0..=100.0).contains(v));
        }
        for v in series.d.iter().flatten() {
            assert!((0.0..=100.0).contains(v));
        }
        assert!(stoch_rsi_latest(&closes, 14, 14, 3, 3).is_some());
    }

    #[test]
    fn stoch_rsi_pinned_high_in_steady_uptrend() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        // RSI sits at 100 the whole way: range is flat, so StochRSI reads 50.
        let (k, _d) = stoch_rsi_latest(&closes, 14, 14, 3, 3).unwrap();
        assert!((k - 50.0).abs() < 1e-9);
    }

    #[test]
    fn stoch_rsi_zero_period_is_none() {
        let closes: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        assert!(stoch_rsi_latest(&closes, 0, 14, 3, 3).is_none());
    }
}
