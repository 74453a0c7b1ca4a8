// =============================================================================
// BitSet — fixed-width atomic bit array for cross-task change marking
// =============================================================================
//
// The ingestor flips a bit per (symbol, interval) key on every update instead
// of allocating event objects; a consumer sweep drains the set periodically.
// All operations are lock-free. Out-of-range indices are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};

const WORD_BITS: usize = 64;

/// A fixed-width bit array backed by atomic words, shareable via `Arc`.
pub struct BitSet {
    words: Vec<AtomicU64>,
    size: usize,
}

impl BitSet {
    /// Create a set over indices `0..size`.
    pub fn new(size: usize) -> Self {
        let word_count = size.div_ceil(WORD_BITS);
        Self {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Set bit `index`. No-op when out of range.
    pub fn set(&self, index: usize) {
        if index >= self.size {
            return;
        }
        let mask = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].fetch_or(mask, Ordering::SeqCst);
    }

    /// Clear bit `index`. No-op when out of range.
    pub fn clear(&self, index: usize) {
        if index >= self.size {
            return;
        }
        let mask = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].fetch_and(!mask, Ordering::SeqCst);
    }

    /// Whether bit `index` is set. Out of range reads as false.
    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.size {
            return false;
        }
        let mask = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].load(Ordering::SeqCst) & mask != 0
    }

    /// Clear every bit.
    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::SeqCst);
        }
    }

    /// Indices of all set bits, ascending.
    pub fn set_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for (wi, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::SeqCst);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let index = wi * WORD_BITS + bit;
                if index < self.size {
                    out.push(index);
                }
                bits &= bits - 1;
            }
        }
        out
    }

    /// Atomically drain the set: returns the indices that were set and leaves
    /// every word zeroed. Bits flipped concurrently with the drain land in
    /// either this sweep or the next, never lost.
    pub fn take_set_indices(&self) -> Vec<usize> {
        let mut out = Vec::new();
        for (wi, word) in self.words.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::SeqCst);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                let index = wi * WORD_BITS + bit;
                if index < self.size {
                    out.push(index);
                }
                bits &= bits - 1;
            }
        }
        out
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::SeqCst).count_ones() as usize)
            .sum()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_and_read_across_word_boundary() {
        let bits = BitSet::new(130);
        bits.set(0);
        bits.set(63);
        bits.set(64);
        bits.set(129);
        assert!(bits.is_set(0));
        assert!(bits.is_set(63));
        assert!(bits.is_set(64));
        assert!(bits.is_set(129));
        assert!(!bits.is_set(1));
        assert_eq!(bits.count(), 4);
        assert_eq!(bits.set_indices(), vec![0, 63, 64, 129]);
    }

    #[test]
    fn out_of_range_is_noop() {
        let bits = BitSet::new(10);
        bits.set(10);
        bits.set(1000);
        assert_eq!(bits.count(), 0);
        assert!(!bits.is_set(1000));
        bits.clear(1000); // must not panic
    }

    #[test]
    fn clear_and_clear_all() {
        let bits = BitSet::new(16);
        bits.set(3);
        bits.set(7);
        bits.clear(3);
        assert!(!bits.is_set(3));
        assert!(bits.is_set(7));
        bits.clear_all();
        assert_eq!(bits.count(), 0);
    }

    #[test]
    fn take_drains_atomically() {
        let bits = BitSet::new(70);
        bits.set(2);
        bits.set(65);
        let drained = bits.take_set_indices();
        assert_eq!(drained, vec![2, 65]);
        assert_eq!(bits.count(), 0);
        assert!(bits.take_set_indices().is_empty());
    }

    #[test]
    fn concurrent_setters_are_all_observed() {
        let bits = Arc::new(BitSet::new(1024));
        let mut handles = Vec::new();
        for t in 0..8 {
            let bits = bits.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..128 {
                    bits.set(t * 128 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bits.count(), 1024);
    }
}
