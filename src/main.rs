//! CLI entry point for readmatch.
//!
//! Every pipeline parameter can come from a JSON configuration file,
//! from a command-line flag, or both; flags win.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;

use readmatch::config::Config;
use readmatch::engine::{Engine, Stage};
use readmatch::types::MatchMode;

/// High-throughput short-read to gene sequence matcher.
///
/// Matches a collection of short reads against a collection of much
/// longer target sequences using a multi-window Bloom pre-filter and an
/// exact block-merge verifier.
#[derive(Parser, Debug)]
#[command(name = "readmatch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file; individual flags override its values
    #[arg(long = "ConfigFileName")]
    config_file: Option<PathBuf>,

    /// FASTQ file containing the reads
    #[arg(long = "ReadFileName")]
    read_file: Option<PathBuf>,

    /// Target (gene) sequence file, text or FASTA
    #[arg(long = "GeneFileName")]
    gene_file: Option<PathBuf>,

    /// Sidecar file mapping internal target ids to external names
    #[arg(long = "GeneIdFileName")]
    gene_id_file: Option<PathBuf>,

    /// Comma-separated anchor offsets within a read
    #[arg(long = "Windows")]
    windows: Option<String>,

    /// Width of every anchor window
    #[arg(long = "WindowWidth")]
    window_width: Option<usize>,

    /// Size of each Bloom filter in bits
    #[arg(long = "BloomSize")]
    bloom_size: Option<u64>,

    /// Number of hash functions per Bloom filter
    #[arg(long = "NumHash")]
    num_hash: Option<usize>,

    /// Required proportion of exactly matching positions
    #[arg(long = "PMatch")]
    p_match: Option<f64>,

    /// Minimum distinct dinucleotides within an anchor
    #[arg(long = "MinDinuc")]
    min_dinuc: Option<usize>,

    /// Working directory for intermediate files
    #[arg(long = "TempDir")]
    temp_dir: Option<PathBuf>,

    /// Drop reads shorter than this
    #[arg(long = "MinReadLength")]
    min_read_length: Option<usize>,

    /// Truncate reads longer than this
    #[arg(long = "MaxReadLength")]
    max_read_length: Option<usize>,

    /// Cap on matches per read per window
    #[arg(long = "MaxMatches")]
    max_matches: Option<usize>,

    /// Number of windows verified concurrently
    #[arg(long = "MaxMergeProcs")]
    max_merge_procs: Option<usize>,

    /// Resume from this stage (1..=11)
    #[arg(long = "StartPoint", default_value_t = 1)]
    start_point: u32,

    /// Match selection policy: first or best
    #[arg(long = "MatchMode")]
    match_mode: Option<String>,

    /// Also index the reverse complement of every target
    #[arg(long = "Rev")]
    rev: bool,
}

fn parse_windows(text: &str) -> Result<Vec<usize>> {
    let mut windows = Vec::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        windows.push(
            part.parse()
                .with_context(|| format!("invalid window offset {:?}", part))?,
        );
    }
    if windows.is_empty() {
        bail!("Windows must list at least one anchor offset");
    }
    Ok(windows)
}

fn pick<T: Clone>(cli: &Option<T>, file: Option<T>, name: &str) -> Result<T> {
    cli.clone()
        .or(file)
        .ok_or_else(|| anyhow::anyhow!("{} is required", name))
}

/// Merge the configuration file with command-line overrides.
fn build_config(args: &Args) -> Result<Config> {
    let file: Option<Config> = match &args.config_file {
        Some(path) => Some(Config::from_json_file(path)?),
        None => None,
    };

    let cli_windows = args.windows.as_deref().map(parse_windows).transpose()?;
    let cli_mode: Option<MatchMode> = args
        .match_mode
        .as_deref()
        .map(|s| s.parse())
        .transpose()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let f = file.as_ref();
    Ok(Config {
        read_file: pick(&args.read_file, f.map(|c| c.read_file.clone()), "ReadFileName")?,
        gene_file: pick(&args.gene_file, f.map(|c| c.gene_file.clone()), "GeneFileName")?,
        gene_id_file: pick(
            &args.gene_id_file,
            f.map(|c| c.gene_id_file.clone()),
            "GeneIdFileName",
        )?,
        windows: pick(&cli_windows, f.map(|c| c.windows.clone()), "Windows")?,
        window_width: pick(&args.window_width, f.map(|c| c.window_width), "WindowWidth")?,
        bloom_size: pick(&args.bloom_size, f.map(|c| c.bloom_size), "BloomSize")?,
        num_hash: pick(&args.num_hash, f.map(|c| c.num_hash), "NumHash")?,
        p_match: pick(&args.p_match, f.map(|c| c.p_match), "PMatch")?,
        min_dinuc: pick(&args.min_dinuc, f.map(|c| c.min_dinuc), "MinDinuc")?,
        min_read_length: pick(
            &args.min_read_length,
            f.map(|c| c.min_read_length),
            "MinReadLength",
        )?,
        max_read_length: pick(
            &args.max_read_length,
            f.map(|c| c.max_read_length),
            "MaxReadLength",
        )?,
        max_matches: pick(&args.max_matches, f.map(|c| c.max_matches), "MaxMatches")?,
        max_merge_procs: pick(
            &args.max_merge_procs,
            f.map(|c| c.max_merge_procs),
            "MaxMergeProcs",
        )?,
        match_mode: pick(&cli_mode, f.map(|c| c.match_mode), "MatchMode")?,
        mm_tol: f.map(|c| c.mm_tol).unwrap_or(0),
        temp_dir: args.temp_dir.clone().or_else(|| f.and_then(|c| c.temp_dir.clone())),
        rev: args.rev || f.map(|c| c.rev).unwrap_or(false),
    })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let start = Stage::from_number(args.start_point)?;
    let config = build_config(&args)?;

    let engine = Engine::new(config)?;
    engine.run_from(start)?;
    Ok(())
}
