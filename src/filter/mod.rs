//! Bloom pre-filter: rolling hashes and the per-window filter array.

pub mod bloom;
pub mod buzhash;

pub use bloom::BloomArray;
pub use buzhash::{generate_tables, RollingHash, TABLE_SEED};
