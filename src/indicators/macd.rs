// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   MACD line = EMA(fast) - EMA(slow)
//   Signal    = EMA(signal_period) of the MACD line
//   Histogram = MACD line - Signal
//
// Standard parameters are (12, 26, 9).

use crate::indicators::ma::ema_series;

/// Per-bar MACD values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Macd {
    pub line: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// The three MACD series, each parallel to `closes`.
#[derive(Debug, Clone)]
pub struct MacdSeries {
    pub line: Vec<Option<f64>>,
    pub signal: Vec<Option<f64>>,
    pub histogram: Vec<Option<f64>>,
}

/// Compute the MACD series. Slots where either EMA (or the signal EMA) is
/// not yet warm are `None`.
pub fn macd_series(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> MacdSeries {
    let n = closes.len();
    let mut line = vec![None; n];
    let mut signal = vec![None; n];
    let mut histogram = vec![None; n];

    if fast == 0 || slow == 0 || signal_period == 0 || fast >= slow {
        return MacdSeries {
            line,
            signal,
            histogram,
        };
    }

    let fast_ema = ema_series(closes, fast);
    let slow_ema = ema_series(closes, slow);

    for i in 0..n {
        if let (Some(f), Some(s)) = (fast_ema[i], slow_ema[i]) {
            line[i] = Some(f - s);
        }
    }

    // Signal: EMA of the line over its defined region.
    let defined_start = match line.iter().position(Option::is_some) {
        Some(start) => start,
        None => {
            return MacdSeries {
                line,
                signal,
                histogram,
            }
        }
    };
    let line_values: Vec<f64> = line[defined_start..].iter().map(|v| v.unwrap_or(0.0)).collect();
    let signal_tail = ema_series(&line_values, signal_period);
    for (offset, value) in signal_tail.into_iter().enumerate() {
        signal[defined_start + offset] = value;
    }

    for i in 0..n {
        if let (Some(l), Some(s)) = (line[i], signal[i]) {
            histogram[i] = Some(l - s);
        }
    }

    MacdSeries {
        line,
        signal,
        histogram,
    }
}

/// Most recent MACD values, or `None` while any component is warming up.
pub fn macd_latest(closes: &[f64], fast: usize, slow: usize, signal_period: usize) -> Option<Macd> {
    let series = macd_series(closes, fast, slow, signal_period);
    Some(Macd {
        line: (*series.line.last()?)?,
        signal: (*series.signal.last()?)?,
        histogram: (*series.histogram.last()?)?,
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        assert!(macd_latest(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_degenerate_parameters() {
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        assert!(macd_latest(&closes, 0, 26, 9).is_none());
        assert!(macd_latest(&closes, 26, 12, 9).is_none()); // fast >= slow
        assert!(macd_latest(&closes, 12, 26, 0).is_none());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        // In a steady uptrend the fast EMA sits above the slow EMA.
        let closes: Vec<f64> = (1..=100).map(|x| x as f64).collect();
        let macd = macd_latest(&closes, 12, 26, 9).unwrap();
        assert!(macd.line > 0.0);
    }

    #[test]
    fn macd_flat_market_is_zero() {
        let closes = vec![100.0; 100];
        let macd = macd_latest(&closes, 12, 26, 9).unwrap();
        assert!(macd.line.abs() < 1e-10);
        assert!(macd.signal.abs() < 1e-10);
        assert!(macd.histogram.abs() < 1e-10);
    }

    #[test]
    fn histogram_is_line_minus_signal() {
        let closes: Vec<f64> = (1..=80).map(|x| (x as f64 * 0.3).sin() * 5.0 + 50.0).collect();
        let series = macd_series(&closes, 12, 26, 9);
        for i in 0..closes.len() {
            if let (Some(l), Some(s), Some(h)) =
                (series.line[i], series.signal[i], series.histogram[i])
            {
                assert!((h - (l - s)).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn series_lengths_are_parallel() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        let series = macd_series(&closes, 12, 26, 9);
        assert_eq!(series.line.len(), 60);
        assert_eq!(series.signal.len(), 60);
        assert_eq!(series.histogram.len(), 60);
        // Line warms up at the slow EMA; signal later still.
        assert!(series.line[..25].iter().all(Option::is_none));
        assert!(series.line[25].is_some());
        assert!(series.signal[25].is_none());
        assert!(series.signal[25 + 8].is_some());
    }
}
