// =============================================================================
// Volume primitives — average volume and Positive Volume Index
// =============================================================================
//
// PVI updates only on bars whose volume exceeds the previous bar's volume:
//   vol > prev_vol : PVI_t = PVI_{t-1} * (1 + (close_t - close_{t-1}) / close_{t-1})
//   otherwise      : PVI_t = PVI_{t-1}
// The series is seeded at 1000.

use crate::market_data::kline::Kline;

/// Mean volume over the most recent `period` bars.
pub fn average_volume(klines: &[Kline], period: usize) -> Option<f64> {
    if period == 0 || klines.len() < period {
        return None;
    }
    let window = &klines[klines.len() - period..];
    let mean = window.iter().map(|k| k.volume).sum::<f64>() / period as f64;
    mean.is_finite().then_some(mean)
}

/// Positive Volume Index series, parallel to `klines`. The first slot holds
/// the 1000.0 seed; an empty input yields an empty series.
pub fn pvi_series(klines: &[Kline]) -> Vec<Option<f64>> {
    let mut out = vec![None; klines.len()];
    if klines.is_empty() {
        return out;
    }

    let mut pvi = 1000.0_f64;
    out[0] = Some(pvi);

    for i in 1..klines.len() {
        let prev = &klines[i - 1];
        let cur = &klines[i];
        if cur.volume > prev.volume && prev.close != 0.0 {
            pvi *= 1.0 + (cur.close - prev.close) / prev.close;
        }
        if !pvi.is_finite() {
            break;
        }
        out[i] = Some(pvi);
    }
    out
}

/// Most recent PVI value.
pub fn pvi_latest(klines: &[Kline]) -> Option<f64> {
    pvi_series(klines).last().copied().flatten()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(close: f64, volume: f64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 1,
            open: close,
            high: close,
            low: close,
            close,
            volume,
            quote_volume: close * volume,
            trades: 1,
            is_final: true,
        }
    }

    #[test]
    fn average_volume_basic() {
        let klines = vec![bar(1.0, 10.0), bar(1.0, 20.0), bar(1.0, 30.0)];
        assert!((average_volume(&klines, 2).unwrap() - 25.0).abs() < 1e-10);
        assert!((average_volume(&klines, 3).unwrap() - 20.0).abs() < 1e-10);
    }

    #[test]
    fn average_volume_insufficient() {
        let klines = vec![bar(1.0, 10.0)];
        assert!(average_volume(&klines, 2).is_none());
        assert!(average_volume(&klines, 0).is_none());
    }

    #[test]
    fn pvi_starts_at_seed() {
        let klines = vec![bar(100.0, 10.0)];
        assert_eq!(pvi_latest(&klines), Some(1000.0));
    }

    #[test]
    fn pvi_moves_only_on_rising_volume() {
        let klines = vec![
            bar(100.0, 10.0),
            bar(110.0, 20.0), // volume up, price +10% => PVI 1100
            bar(121.0, 5.0),  // volume down => unchanged
            bar(133.1, 6.0),  // volume up, price +10% => PVI 1210
        ];
        let series = pvi_series(&klines);
        assert!((series[1].unwrap() - 1100.0).abs() < 1e-9);
        assert!((series[2].unwrap() - 1100.0).abs() < 1e-9);
        assert!((series[3].unwrap() - 1210.0).abs() < 1e-9);
    }

    #[test]
    fn pvi_empty_input() {
        assert!(pvi_series(&[]).is_empty());
        assert!(pvi_latest(&[]).is_none());
    }
}
