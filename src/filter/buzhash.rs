//! BuzHash rolling hash over byte windows.
//!
//! Each hash function is parameterised by a 256-entry table of distinct
//! u32 values; hashing folds table entries with a rotate-left/XOR so
//! that sliding the window forward by one byte is O(1).

use ahash::AHashSet;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed for the table generator, fixed so that the build and scan
/// phases of one run agree on the hash family.
pub const TABLE_SEED: u64 = 0x5eb2_a1d4_9c03_77ef;

/// Generate `num_hash` independent byte tables.
///
/// Entries within one table are pairwise distinct so that no two input
/// bytes collide before mixing.
pub fn generate_tables(num_hash: usize, seed: u64) -> Vec<[u32; 256]> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tables = Vec::with_capacity(num_hash);
    for _ in 0..num_hash {
        let mut seen: AHashSet<u32> = AHashSet::with_capacity(256);
        let mut table = [0u32; 256];
        for entry in table.iter_mut() {
            loop {
                let x: u32 = rng.gen();
                if seen.insert(x) {
                    *entry = x;
                    break;
                }
            }
        }
        tables.push(table);
    }
    tables
}

/// One rolling-hash state over a window of fixed width.
pub struct RollingHash<'a> {
    table: &'a [u32; 256],
    width: usize,
    state: u32,
    /// Ring buffer holding the bytes currently inside the window.
    window: Vec<u8>,
    head: usize,
}

impl<'a> RollingHash<'a> {
    pub fn new(table: &'a [u32; 256], width: usize) -> Self {
        assert!(width > 0, "window width must be positive");
        RollingHash {
            table,
            width,
            state: 0,
            window: vec![0; width],
            head: 0,
        }
    }

    /// Seed the state from exactly `width` bytes.
    pub fn init(&mut self, bytes: &[u8]) {
        assert_eq!(bytes.len(), self.width, "init requires a full window");
        self.state = 0;
        for &b in bytes {
            self.state = self.state.rotate_left(1) ^ self.table[b as usize];
        }
        self.window.copy_from_slice(bytes);
        self.head = 0;
    }

    /// Advance the window by one byte: the oldest byte leaves, `b` enters.
    pub fn roll(&mut self, b: u8) {
        let out = self.window[self.head];
        self.window[self.head] = b;
        self.head = (self.head + 1) % self.width;
        self.state = self.state.rotate_left(1)
            ^ self.table[out as usize].rotate_left((self.width % 32) as u32)
            ^ self.table[b as usize];
    }

    /// Current 32-bit state.
    pub fn sum(&self) -> u32 {
        self.state
    }
}
