//! Configuration for the matching pipeline.
//!
//! The configuration can be loaded from a JSON file and selectively
//! overridden from the command line; `validate` is called once before any
//! stage runs.

use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::Deserialize;

use crate::types::MatchMode;

/// Work-queue capacity for the scan and verify worker pools.
pub const CONCURRENCY: usize = 100;

/// Configuration for the matching pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// FASTQ file containing the reads.
    pub read_file: PathBuf,
    /// File containing the target (gene) sequences, text or FASTA.
    pub gene_file: PathBuf,
    /// Sidecar file mapping internal target ids to external names.
    pub gene_id_file: PathBuf,
    /// Left end point of each anchor window within a read.
    pub windows: Vec<usize>,
    /// Width of every anchor window.
    pub window_width: usize,
    /// Size of each Bloom filter in bits.
    pub bloom_size: u64,
    /// Number of hash functions per Bloom filter.
    pub num_hash: usize,
    /// Required proportion of exactly matching positions over the read.
    pub p_match: f64,
    /// Minimum number of distinct dinucleotides within an anchor.
    pub min_dinuc: usize,
    /// Reads shorter than this are dropped.
    pub min_read_length: usize,
    /// Reads longer than this are truncated.
    pub max_read_length: usize,
    /// Cap on emitted matches per read per window.
    pub max_matches: usize,
    /// Number of windows verified concurrently.
    pub max_merge_procs: usize,
    /// Per-block match selection policy.
    pub match_mode: MatchMode,
    /// Allowed mismatch slack above the per-read minimum when combining.
    #[serde(default)]
    pub mm_tol: u32,
    /// Override for the working directory holding intermediate files.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    /// Also index the reverse complement of every target sequence.
    #[serde(default)]
    pub rev: bool,
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
        let config: Config = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid config file {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Check every field before any stage runs.
    ///
    /// Errors name the offending field so misconfigurations are caught
    /// up front rather than deep inside a stage.
    pub fn validate(&self) -> Result<()> {
        if self.read_file.as_os_str().is_empty() {
            bail!("read_file is required");
        }
        if self.gene_file.as_os_str().is_empty() {
            bail!("gene_file is required");
        }
        if self.gene_id_file.as_os_str().is_empty() {
            bail!("gene_id_file is required");
        }
        if self.windows.is_empty() {
            bail!("windows must be a non-empty list of anchor offsets");
        }
        if self.window_width == 0 {
            bail!("window_width must be positive");
        }
        if self.bloom_size == 0 {
            bail!("bloom_size must be positive");
        }
        if self.num_hash == 0 {
            bail!("num_hash must be positive");
        }
        if !(self.p_match > 0.0 && self.p_match <= 1.0) {
            bail!("p_match must lie in (0, 1]");
        }
        if self.min_read_length > self.max_read_length {
            bail!("min_read_length exceeds max_read_length");
        }
        if self.max_read_length == 0 {
            bail!("max_read_length must be positive");
        }
        if self.max_matches == 0 {
            bail!("max_matches must be positive");
        }
        if self.max_merge_procs == 0 {
            bail!("max_merge_procs must be positive");
        }
        for &w in &self.windows {
            if w + self.window_width > self.max_read_length {
                bail!(
                    "window at offset {} does not fit in max_read_length {}",
                    w,
                    self.max_read_length
                );
            }
        }
        Ok(())
    }

    /// Mismatch budget for a read of the given length.
    pub fn max_mismatches(&self, read_len: usize) -> usize {
        ((1.0 - self.p_match) * read_len as f64) as usize
    }

    /// Fixed record width (including the newline) for candidate files.
    pub fn candidate_record_width(&self) -> usize {
        self.max_read_length + 50
    }

    /// Upper bound on any line the verifier is willing to buffer.
    ///
    /// Source rows carry a name list of up to ~1000 bytes next to the
    /// read itself; result rows hold two reads side by side.
    pub fn verify_line_cap(&self) -> usize {
        2 * self.max_read_length + 1200
    }
}
