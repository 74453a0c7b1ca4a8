// =============================================================================
// Volume-Weighted Average Price (VWAP)
// =============================================================================
//
//   VWAP_t = Σ (typical_price * volume) / Σ volume,  accumulated from the
//   anchor bar. Without an explicit anchor the whole slice is the session.
//
// Bands place ±k volume-weighted standard deviations of typical price around
// the VWAP.

use crate::market_data::kline::Kline;

/// VWAP series parallel to `klines`, accumulated from `anchor` (index into
/// the slice, default 0). Slots before the anchor are `None`, as are slots
/// where no volume has accumulated yet.
pub fn vwap_series(klines: &[Kline], anchor: Option<usize>) -> Vec<Option<f64>> {
    let mut out = vec![None; klines.len()];
    let start = anchor.unwrap_or(0);
    if start >= klines.len() {
        return out;
    }

    let mut pv_sum = 0.0_f64;
    let mut vol_sum = 0.0_f64;
    for (i, k) in klines.iter().enumerate().skip(start) {
        pv_sum += k.typical_price() * k.volume;
        vol_sum += k.volume;
        if vol_sum > 0.0 {
            let vwap = pv_sum / vol_sum;
            if vwap.is_finite() {
                out[i] = Some(vwap);
            }
        }
    }
    out
}

/// Most recent VWAP value.
pub fn vwap_latest(klines: &[Kline], anchor: Option<usize>) -> Option<f64> {
    vwap_series(klines, anchor).last().copied().flatten()
}

/// VWAP with ±k·σ bands, where σ is the volume-weighted standard deviation
/// of typical price around the VWAP over the anchored window.
///
/// Returns `(upper, vwap, lower)`.
pub fn vwap_bands(klines: &[Kline], num_std: f64, anchor: Option<usize>) -> Option<(f64, f64, f64)> {
    let start = anchor.unwrap_or(0);
    if start >= klines.len() {
        return None;
    }
    let window = &klines[start..];

    let vwap = vwap_latest(window, None)?;
    let vol_sum: f64 = window.iter().map(|k| k.volume).sum();
    if vol_sum <= 0.0 {
        return None;
    }

    let weighted_var = window
        .iter()
        .map(|k| k.volume * (k.typical_price() - vwap).powi(2))
        .sum::<f64>()
        / vol_sum;
    let std_dev = weighted_var.sqrt();
    if !std_dev.is_finite() {
        return None;
    }

    Some((vwap + num_std * std_dev, vwap, vwap - num_std * std_dev))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(price: f64, volume: f64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 1,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            quote_volume: price * volume,
            trades: 1,
            is_final: true,
        }
    }

    #[test]
    fn vwap_weights_by_volume() {
        // Heavy volume at 100, light at 200: VWAP leans toward 100.
        let klines = vec![bar(100.0, 9.0), bar(200.0, 1.0)];
        let vwap = vwap_latest(&klines, None).unwrap();
        assert!((vwap - 110.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_single_bar_is_typical_price() {
        let klines = vec![bar(123.0, 5.0)];
        assert!((vwap_latest(&klines, None).unwrap() - 123.0).abs() < 1e-9);
    }

    #[test]
    fn vwap_anchor_restricts_window() {
        let klines = vec![bar(50.0, 100.0), bar(100.0, 1.0), bar(102.0, 1.0)];
        let anchored = vwap_latest(&klines, Some(1)).unwrap();
        assert!((anchored - 101.0).abs() < 1e-9);

        let series = vwap_series(&klines, Some(1));
        assert!(series[0].is_none());
        assert!(series[1].is_some());
    }

    #[test]
    fn vwap_zero_volume_yields_none() {
        let klines = vec![bar(100.0, 0.0)];
        assert!(vwap_latest(&klines, None).is_none());
        assert!(vwap_bands(&klines, 2.0, None).is_none());
    }

    #[test]
    fn vwap_empty_or_bad_anchor() {
        assert!(vwap_latest(&[], None).is_none());
        let klines = vec![bar(100.0, 1.0)];
        assert!(vwap_latest(&klines, Some(5)).is_none());
    }

    #[test]
    fn bands_are_symmetric_around_vwap() {
        let klines = vec![bar(100.0, 2.0), bar(110.0, 2.0), bar(90.0, 2.0)];
        let (upper, vwap, lower) = vwap_bands(&klines, 2.0, None).unwrap();
        assert!((upper - vwap) > 0.0);
        assert!(((upper - vwap) - (vwap - lower)).abs() < 1e-9);
    }

    #[test]
    fn bands_collapse_on_flat_prices() {
        let klines = vec![bar(100.0, 1.0); 5];
        let (upper, vwap, lower) = vwap_bands(&klines, 2.0, None).unwrap();
        assert!((upper - vwap).abs() < 1e-9);
        assert!((lower - vwap).abs() < 1e-9);
    }
}
