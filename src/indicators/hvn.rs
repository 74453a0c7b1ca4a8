// =============================================================================
// High-Volume Nodes — volume profile binning
// =============================================================================
//
// Bins traded volume by price level within a lookback, ranks the bins, and
// normalises each node's strength to [0, 100] against the heaviest bin.
// A bar's volume is attributed to the bin containing its typical price; the
// buy/sell split is approximated by the bar's direction.

use serde::Serialize;

use crate::market_data::kline::Kline;

/// One ranked price level with concentrated traded volume.
#[derive(Debug, Clone, Serialize)]
pub struct VolumeNode {
    /// Bin midpoint price.
    pub price: f64,
    /// Total volume attributed to the bin.
    pub volume: f64,
    /// Relative weight in [0, 100]; the heaviest node scores 100.
    pub strength: f64,
    pub buy_volume: f64,
    pub sell_volume: f64,
    /// Inclusive lower and exclusive upper price bound of the bin.
    pub price_range: (f64, f64),
}

/// Bin the most recent `lookback` bars into `bins` price levels and return
/// the nodes ranked by volume, heaviest first.
///
/// Returns an empty vector when there are no bars, no volume, or a
/// degenerate (zero-width) price range.
pub fn volume_nodes(klines: &[Kline], lookback: usize, bins: usize) -> Vec<VolumeNode> {
    if bins == 0 || klines.is_empty() {
        return Vec::new();
    }
    let start = klines.len().saturating_sub(lookback.max(1));
    let window = &klines[start..];

    let lo = window.iter().map(|k| k.low).fold(f64::MAX, f64::min);
    let hi = window.iter().map(|k| k.high).fold(f64::MIN, f64::max);
    if !(lo.is_finite() && hi.is_finite()) || hi <= lo {
        return Vec::new();
    }
    let bin_width = (hi - lo) / bins as f64;

    #[derive(Default, Clone, Copy)]
    struct Bin {
        volume: f64,
        buy_volume: f64,
        sell_volume: f64,
    }
    let mut buckets = vec![Bin::default(); bins];

    for k in window {
        let tp = k.typical_price();
        let mut index = ((tp - lo) / bin_width) as usize;
        if index >= bins {
            index = bins - 1;
        }
        let bucket = &mut buckets[index];
        bucket.volume += k.volume;
        if k.is_bullish() {
            bucket.buy_volume += k.volume;
        } else {
            bucket.sell_volume += k.volume;
        }
    }

    let max_volume = buckets.iter().map(|b| b.volume).fold(0.0_f64, f64::max);
    if max_volume <= 0.0 {
        return Vec::new();
    }

    let mut nodes: Vec<VolumeNode> = buckets
        .into_iter()
        .enumerate()
        .filter(|(_, b)| b.volume > 0.0)
        .map(|(i, b)| {
            let low_bound = lo + i as f64 * bin_width;
            VolumeNode {
                price: low_bound + bin_width / 2.0,
                volume: b.volume,
                strength: b.volume / max_volume * 100.0,
                buy_volume: b.buy_volume,
                sell_volume: b.sell_volume,
                price_range: (low_bound, low_bound + bin_width),
            }
        })
        .collect();

    nodes.sort_by(|a, b| b.volume.partial_cmp(&a.volume).unwrap_or(std::cmp::Ordering::Equal));
    nodes
}

/// True when `price` is within `tolerance_pct` percent of any node.
pub fn is_near_hvn(nodes: &[VolumeNode], price: f64, tolerance_pct: f64) -> bool {
    if price <= 0.0 {
        return false;
    }
    nodes
        .iter()
        .any(|n| ((n.price - price).abs() / price * 100.0) <= tolerance_pct)
}

/// The node whose price is closest to `price`.
pub fn closest_hvn<'a>(nodes: &'a [VolumeNode], price: f64) -> Option<&'a VolumeNode> {
    nodes.iter().min_by(|a, b| {
        (a.price - price)
            .abs()
            .partial_cmp(&(b.price - price).abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

/// How many nodes fall inside `[low, high]`.
pub fn count_hvn_in_range(nodes: &[VolumeNode], low: f64, high: f64) -> usize {
    nodes
        .iter()
        .filter(|n| n.price >= low && n.price <= high)
        .count()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn bar(price: f64, volume: f64, bullish: bool) -> Kline {
        let (open, close) = if bullish {
            (price - 0.1, price + 0.1)
        } else {
            (price + 0.1, price - 0.1)
        };
        Kline {
            open_time: 0,
            close_time: 1,
            open,
            high: price + 0.2,
            low: price - 0.2,
            close,
            volume,
            quote_volume: price * volume,
            trades: 1,
            is_final: true,
        }
    }

    #[test]
    fn heaviest_node_ranks_first_with_strength_100() {
        let mut klines = Vec::new();
        // Concentration near 100, lighter trade near 110.
        for _ in 0..10 {
            klines.push(bar(100.0, 50.0, true));
        }
        for _ in 0..3 {
            klines.push(bar(110.0, 5.0, false));
        }

        let nodes = volume_nodes(&klines, 100, 10);
        assert!(!nodes.is_empty());
        assert!((nodes[0].strength - 100.0).abs() < 1e-9);
        assert!((nodes[0].price - 100.0).abs() < 2.0);
        for w in nodes.windows(2) {
            assert!(w[0].volume >= w[1].volume);
        }
    }

    #[test]
    fn strengths_are_in_range() {
        let klines: Vec<Kline> = (0..200)
            .map(|i| bar(100.0 + (i % 20) as f64, 1.0 + (i % 7) as f64, i % 2 == 0))
            .collect();
        for node in volume_nodes(&klines, 150, 24) {
            assert!((0.0..=100.0).contains(&node.strength));
            assert!(node.price >= node.price_range.0 && node.price <= node.price_range.1);
        }
    }

    #[test]
    fn buy_sell_split_follows_bar_direction() {
        let klines = vec![bar(100.0, 30.0, true), bar(100.0, 20.0, false)];
        let nodes = volume_nodes(&klines, 10, 1);
        assert_eq!(nodes.len(), 1);
        assert!((nodes[0].buy_volume - 30.0).abs() < 1e-9);
        assert!((nodes[0].sell_volume - 20.0).abs() < 1e-9);
    }

    #[test]
    fn degenerate_inputs_yield_empty() {
        assert!(volume_nodes(&[], 100, 10).is_empty());
        let klines = vec![bar(100.0, 10.0, true)];
        assert!(volume_nodes(&klines, 100, 0).is_empty());
    }

    #[test]
    fn near_and_closest_helpers() {
        let klines = vec![bar(100.0, 50.0, true), bar(120.0, 30.0, false)];
        let nodes = volume_nodes(&klines, 10, 20);

        assert!(is_near_hvn(&nodes, 100.2, 1.0));
        assert!(!is_near_hvn(&nodes, 150.0, 1.0));
        assert!(!is_near_hvn(&nodes, 0.0, 1.0));

        let closest = closest_hvn(&nodes, 119.0).unwrap();
        assert!((closest.price - 120.0).abs() < 2.0);

        assert_eq!(count_hvn_in_range(&nodes, 90.0, 130.0), nodes.len());
        assert_eq!(count_hvn_in_range(&nodes, 0.0, 1.0), 0);
    }
}
