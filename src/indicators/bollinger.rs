// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ). The Band Width (BBW) is the normalised
// distance: BBW = (upper - lower) / middle * 100.

/// One bar's Bollinger values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBands {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    pub width: f64,
}

/// Bollinger series parallel to `closes`. The first `period - 1` slots are
/// `None`, as is any slot with a degenerate (zero) middle band.
pub fn bollinger_series(closes: &[f64], period: usize, num_std: f64) -> Vec<Option<BollingerBands>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    for i in (period - 1)..closes.len() {
        out[i] = bands_at(&closes[i + 1 - period..=i], num_std);
    }
    out
}

/// Bollinger values over the most recent `period` closes.
///
/// Returns `None` when:
/// - `period` is zero or there are fewer than `period` data points.
/// - The middle band is zero (degenerate input).
/// - The width is non-finite.
pub fn bollinger_latest(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerBands> {
    if period == 0 || closes.len() < period {
        return None;
    }
    bands_at(&closes[closes.len() - period..], num_std)
}

fn bands_at(window: &[f64], num_std: f64) -> Option<BollingerBands> {
    let period_f = window.len() as f64;
    let middle = window.iter().sum::<f64>() / period_f;
    if middle == 0.0 || !middle.is_finite() {
        return None;
    }

    let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / period_f;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    if width.is_finite() {
        Some(BollingerBands {
            upper,
            middle,
            lower,
            width,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = bollinger_latest(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        let closes = vec![1.0, 2.0, 3.0];
        assert!(bollinger_latest(&closes, 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat() {
        let closes = vec![100.0; 20];
        let bb = bollinger_latest(&closes, 20, 2.0).unwrap();
        assert!((bb.width - 0.0).abs() < 1e-10);
        assert!((bb.upper - bb.lower).abs() < 1e-10);
    }

    #[test]
    fn series_is_parallel_with_leading_nones() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let series = bollinger_series(&closes, 20, 2.0);
        assert_eq!(series.len(), 30);
        assert!(series[..19].iter().all(Option::is_none));
        assert!(series[19..].iter().all(Option::is_some));
    }

    #[test]
    fn series_tail_matches_latest() {
        let closes: Vec<f64> = (1..=25).map(|x| (x as f64).sin() + 10.0).collect();
        let series = bollinger_series(&closes, 10, 2.0);
        let latest = bollinger_latest(&closes, 10, 2.0);
        assert_eq!(*series.last().unwrap(), latest);
    }
}
