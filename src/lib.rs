//! readmatch - high-throughput short-read sequence matching library.
//!
//! Given a large collection of short nucleotide reads and a collection
//! of much longer target sequences, readmatch reports, for each read,
//! up to K positions in the target set where the read aligns with at
//! most a configured fraction of mismatched positions and an exactly
//! matching anchor window at one of several configurable offsets.
//!
//! The pipeline runs as a sequence of stages over compressed files in a
//! working directory:
//!
//! 1. normalise targets and reads,
//! 2. sort and dedupe the reads,
//! 3. project each unique read into per-window anchor/flank rows,
//! 4. build one Bloom filter per window and scan every target with a
//!    rolling hash, emitting candidate hits,
//! 5. verify candidates against the projections by sorted block merge,
//! 6. combine the per-window results, keep per-read near-best matches,
//!    and join gene and read identifiers back in.
//!
//! # Example
//!
//! ```ignore
//! use readmatch::{Config, Engine};
//!
//! let config = Config::from_json_file(std::path::Path::new("run.json"))?;
//! Engine::new(config)?.run()?;
//! ```

pub mod config;
pub mod dinuc;
pub mod engine;
pub mod extsort;
pub mod filter;
pub mod parser;
pub mod pipeline;
pub mod types;

pub use config::Config;
pub use engine::{Engine, Stage};
pub use types::MatchMode;
