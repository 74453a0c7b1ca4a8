// =============================================================================
// Moving Averages — SMA and EMA
// =============================================================================
//
// EMA formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period`
// closes. Both series are parallel to the input: the first `period - 1`
// slots are `None`.

/// Simple moving average series, parallel to `closes`.
///
/// # Edge cases
/// - `period == 0` => all `None`
/// - Fewer closes than `period` => all `None`
/// - A non-finite window sum yields `None` for that slot.
pub fn sma_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    let mut window_sum: f64 = closes[..period].iter().sum();
    let period_f = period as f64;
    if window_sum.is_finite() {
        out[period - 1] = Some(window_sum / period_f);
    }

    for i in period..closes.len() {
        window_sum += closes[i] - closes[i - period];
        if window_sum.is_finite() {
            out[i] = Some(window_sum / period_f);
        }
    }
    out
}

/// Most recent SMA value.
pub fn sma_latest(closes: &[f64], period: usize) -> Option<f64> {
    sma_series(closes, period).last().copied().flatten()
}

/// Exponential moving average series, parallel to `closes`, seeded with the
/// SMA of the first `period` values.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    let multiplier = 2.0 / (period + 1) as f64;
    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return out;
    }
    out[period - 1] = Some(seed);

    let mut prev = seed;
    for i in period..closes.len() {
        let ema = closes[i] * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            // A broken value poisons everything after it; stop producing.
            break;
        }
        out[i] = Some(ema);
        prev = ema;
    }
    out
}

/// Most recent EMA value.
pub fn ema_latest(closes: &[f64], period: usize) -> Option<f64> {
    ema_series(closes, period).last().copied().flatten()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_empty_and_zero_period() {
        assert!(sma_series(&[], 5).is_empty());
        assert_eq!(sma_series(&[1.0, 2.0], 0), vec![None, None]);
    }

    #[test]
    fn sma_leading_slots_are_none() {
        let closes = [1.0, 2.0, 3.0, 4.0];
        let sma = sma_series(&closes, 3);
        assert_eq!(sma.len(), 4);
        assert_eq!(sma[0], None);
        assert_eq!(sma[1], None);
        assert!((sma[2].unwrap() - 2.0).abs() < 1e-10);
        assert!((sma[3].unwrap() - 3.0).abs() < 1e-10);
    }

    #[test]
    fn sma_latest_matches_series_tail() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let series = sma_series(&closes, 5);
        assert_eq!(sma_latest(&closes, 5), *series.last().unwrap());
    }

    #[test]
    fn sma_insufficient_data_is_all_none() {
        let closes = [1.0, 2.0];
        assert!(sma_series(&closes, 5).iter().all(Option::is_none));
        assert!(sma_latest(&closes, 5).is_none());
    }

    #[test]
    fn ema_seed_is_sma() {
        let closes = [2.0, 4.0, 6.0];
        let ema = ema_series(&closes, 3);
        assert!((ema[2].unwrap() - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of [1..10]: seed SMA = 3.0, multiplier = 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = ema_series(&closes, 5);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        assert!((ema[4].unwrap() - expected).abs() < 1e-10);
        for (i, &c) in closes.iter().enumerate().skip(5) {
            expected = c * mult + expected * (1.0 - mult);
            assert!((ema[i].unwrap() - expected).abs() < 1e-10);
        }
    }

    #[test]
    fn ema_nan_input_stops_series() {
        let closes = [1.0, 2.0, 3.0, f64::NAN, 5.0];
        let ema = ema_series(&closes, 3);
        assert!(ema[2].is_some());
        assert!(ema[3].is_none());
        assert!(ema[4].is_none());
    }

    #[test]
    fn series_is_parallel_to_input() {
        let closes: Vec<f64> = (1..=50).map(|x| x as f64).collect();
        assert_eq!(sma_series(&closes, 20).len(), 50);
        assert_eq!(ema_series(&closes, 20).len(), 50);
    }
}
