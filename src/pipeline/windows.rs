//! Window projection: split each unique read into anchor and flanks.
//!
//! For each configured anchor offset a per-window file receives
//! `anchor \t left \t right \t count \t name_list` rows, in input
//! order. Reads too short for a window, or whose anchor fails the
//! dinucleotide diversity filter, are skipped for that window.

use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{bail, Result};
use log::{debug, info};

use crate::config::Config;
use crate::dinuc::{count_dinuc, NUM_DINUCS};
use crate::parser::util::{create_gz, finish_gz, open_gz};

/// Run the projection stage; returns the row count per window.
pub fn window_reads(
    config: &Config,
    reads_sorted_path: &std::path::Path,
    win_path: impl Fn(usize) -> PathBuf,
) -> Result<Vec<u64>> {
    let mut reader = open_gz(reads_sorted_path)?;
    let mut writers = Vec::with_capacity(config.windows.len());
    for k in 0..config.windows.len() {
        writers.push(create_gz(&win_path(k))?);
    }

    let mut counts = vec![0u64; config.windows.len()];
    let mut work = [false; NUM_DINUCS];
    let mut line = Vec::new();
    let mut lnum: u64 = 0;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        lnum += 1;
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&[u8]> = line.split(|&b| b == b'\t').collect();
        if fields.len() != 3 {
            bail!("unique-read row {} has {} fields, expected 3", lnum, fields.len());
        }
        let (seq, count, names) = (fields[0], fields[1], fields[2]);

        for (k, &q1) in config.windows.iter().enumerate() {
            let q2 = q1 + config.window_width;
            if seq.len() < q2 {
                continue;
            }
            let anchor = &seq[q1..q2];
            if count_dinuc(anchor, &mut work) < config.min_dinuc {
                continue;
            }

            let writer = &mut writers[k];
            writer.write_all(anchor)?;
            writer.write_all(b"\t")?;
            writer.write_all(&seq[..q1])?;
            writer.write_all(b"\t")?;
            writer.write_all(&seq[q2..])?;
            writer.write_all(b"\t")?;
            writer.write_all(count)?;
            writer.write_all(b"\t")?;
            writer.write_all(names)?;
            writer.write_all(b"\n")?;
            counts[k] += 1;
        }

        if lnum % 1_000_000 == 0 {
            debug!("projected {} unique reads", lnum);
        }
    }

    for writer in writers {
        finish_gz(writer)?;
    }
    info!("window projection rows: {:?}", counts);
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchMode;
    use std::io::Read;
    use std::path::{Path, PathBuf};

    fn test_config(windows: Vec<usize>, width: usize, min_dinuc: usize) -> Config {
        Config {
            read_file: PathBuf::from("reads.fastq"),
            gene_file: PathBuf::from("genes.txt"),
            gene_id_file: PathBuf::from("gene_ids.txt"),
            windows,
            window_width: width,
            bloom_size: 1 << 16,
            num_hash: 3,
            p_match: 1.0,
            min_dinuc,
            min_read_length: 4,
            max_read_length: 100,
            max_matches: 4,
            max_merge_procs: 1,
            match_mode: MatchMode::First,
            mm_tol: 0,
            temp_dir: None,
            rev: false,
        }
    }

    fn write_unique_reads(dir: &tempfile::TempDir, rows: &[&str]) -> PathBuf {
        let path = dir.path().join("reads_sorted.txt.gz");
        let mut writer = create_gz(&path).unwrap();
        for row in rows {
            writeln!(writer, "{}", row).unwrap();
        }
        finish_gz(writer).unwrap();
        path
    }

    fn read_gz(path: &Path) -> Vec<String> {
        let mut text = String::new();
        open_gz(path).unwrap().read_to_string(&mut text).unwrap();
        text.lines().map(|l| l.to_string()).collect()
    }

    #[test]
    fn test_projects_anchor_and_flanks() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_unique_reads(&dir, &["ACGTACGT\t2\t@r1;@r2"]);
        let config = test_config(vec![0, 2], 4, 0);
        let paths: Vec<PathBuf> = (0..2).map(|k| dir.path().join(format!("win_{}.txt.gz", k))).collect();
        let paths_for_closure = paths.clone();

        let counts = window_reads(&config, &input, move |k| paths_for_closure[k].clone()).unwrap();
        assert_eq!(counts, vec![1, 1]);
        assert_eq!(read_gz(&paths[0]), vec!["ACGT\t\tACGT\t2\t@r1;@r2"]);
        assert_eq!(read_gz(&paths[1]), vec!["GTAC\tAC\tGT\t2\t@r1;@r2"]);
    }

    #[test]
    fn test_short_read_skips_window() {
        let dir = tempfile::tempdir().unwrap();
        // Length 6: fits the w=0 window, not the w=4 one.
        let input = write_unique_reads(&dir, &["ACGTAC\t1\t@r1"]);
        let config = test_config(vec![0, 4], 4, 0);
        let paths: Vec<PathBuf> = (0..2).map(|k| dir.path().join(format!("win_{}.txt.gz", k))).collect();
        let paths_for_closure = paths.clone();

        let counts = window_reads(&config, &input, move |k| paths_for_closure[k].clone()).unwrap();
        assert_eq!(counts, vec![1, 0]);
        assert!(read_gz(&paths[1]).is_empty());
    }

    #[test]
    fn test_read_of_exact_window_end_has_empty_right() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_unique_reads(&dir, &["ACGTAC\t1\t@r1"]);
        let config = test_config(vec![2], 4, 0);
        let path = dir.path().join("win_0.txt.gz");
        let p = path.clone();

        window_reads(&config, &input, move |_| p.clone()).unwrap();
        assert_eq!(read_gz(&path), vec!["GTAC\tAC\t\t1\t@r1"]);
    }

    #[test]
    fn test_diversity_filter_suppresses_projection() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_unique_reads(&dir, &["AAAAACGT\t1\t@r1"]);
        // AAAA has a single distinct dinucleotide; ACGT has three.
        let config = test_config(vec![0, 4], 4, 2);
        let paths: Vec<PathBuf> = (0..2).map(|k| dir.path().join(format!("win_{}.txt.gz", k))).collect();
        let paths_for_closure = paths.clone();

        let counts = window_reads(&config, &input, move |k| paths_for_closure[k].clone()).unwrap();
        assert_eq!(counts, vec![0, 1]);
    }

    #[test]
    fn test_malformed_row_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_unique_reads(&dir, &["ACGTACGT\t2"]);
        let config = test_config(vec![0], 4, 0);
        let path = dir.path().join("win_0.txt.gz");
        assert!(window_reads(&config, &input, move |_| path.clone()).is_err());
    }
}
