//! Per-window Bloom filter array backed by plain bit vectors.
//!
//! The array is populated single-threaded during the build phase and
//! immutable afterwards, so scan workers share it by plain reference.

/// A fixed-size bit array backing one filter.
struct BitArray {
    blocks: Vec<u64>,
    nbits: u64,
}

impl BitArray {
    fn new(nbits: u64) -> Self {
        let nblocks = ((nbits + 63) / 64) as usize;
        BitArray {
            blocks: vec![0; nblocks],
            nbits,
        }
    }

    #[inline]
    fn set(&mut self, i: u64) {
        debug_assert!(i < self.nbits);
        self.blocks[(i / 64) as usize] |= 1 << (i % 64);
    }

    #[inline]
    fn get(&self, i: u64) -> bool {
        debug_assert!(i < self.nbits);
        self.blocks[(i / 64) as usize] & (1 << (i % 64)) != 0
    }

    /// Fraction of bits set.
    fn fill_rate(&self) -> f64 {
        let ones: u64 = self.blocks.iter().map(|b| b.count_ones() as u64).sum();
        ones as f64 / self.nbits as f64
    }
}

/// One Bloom filter per anchor window, all sharing the same hash family.
///
/// Sharing the family means the scanner pays for its hash updates once
/// per target position and probes every filter with the same positions.
pub struct BloomArray {
    size: u64,
    filters: Vec<BitArray>,
}

impl BloomArray {
    pub fn new(num_windows: usize, size_bits: u64) -> Self {
        BloomArray {
            size: size_bits,
            filters: (0..num_windows).map(|_| BitArray::new(size_bits)).collect(),
        }
    }

    pub fn num_windows(&self) -> usize {
        self.filters.len()
    }

    /// Set the probe bits for an anchor in filter `k`.
    ///
    /// `sums` are the raw 32-bit hash states; reduction modulo the
    /// filter size happens here.
    pub fn insert(&mut self, k: usize, sums: &[u32]) {
        for &s in sums {
            let bit = s as u64 % self.size;
            self.filters[k].set(bit);
        }
    }

    /// Collect into `hits` every window index whose filter has all probe
    /// bits set, in ascending order.
    ///
    /// `probes` is a reusable scratch buffer for the reduced positions.
    pub fn query_all(&self, sums: &[u32], probes: &mut Vec<u64>, hits: &mut Vec<usize>) {
        probes.clear();
        probes.extend(sums.iter().map(|&s| s as u64 % self.size));
        hits.clear();
        for (k, filter) in self.filters.iter().enumerate() {
            if probes.iter().all(|&p| filter.get(p)) {
                hits.push(k);
            }
        }
    }

    /// Fraction of bits set in filter `k`.
    pub fn fill_rate(&self, k: usize) -> f64 {
        self.filters[k].fill_rate()
    }
}
