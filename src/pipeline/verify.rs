//! Block-merge verification of Bloom candidates.
//!
//! For one window, the sorted read projections and the sorted candidate
//! records are joined on the anchor. Within each equal-anchor block
//! every (projection, candidate) pair is checked by exact Hamming
//! comparison of the flanks; survivors are capped at K per block by the
//! configured match mode. Joining eliminates the pre-filter's false
//! positives and restores per-read counts.

use std::cmp::Ordering;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, info};

use crate::config::{Config, CONCURRENCY};
use crate::parser::util::{create_gz, finish_gz, open_gz};
use crate::types::MatchMode;

/// Number of byte buffers kept for reuse.
const POOL_SIZE: usize = 10_000;

/// Field counts of the two verifier inputs.
const SOURCE_FIELDS: usize = 5;
const MATCH_FIELDS: usize = 5;

/// Count positions at which two equal-length byte slices differ.
pub fn hamming(a: &[u8], b: &[u8]) -> usize {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).filter(|(x, y)| x != y).count()
}

/// Bounded pool of reusable byte buffers.
///
/// Purely a cache: when the pool is empty a fresh buffer is allocated,
/// and a buffer returned to a full pool is dropped.
pub struct BufPool {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    buf_cap: usize,
}

impl BufPool {
    pub fn new(slots: usize, buf_cap: usize) -> Self {
        let (tx, rx) = bounded(slots);
        BufPool { tx, rx, buf_cap }
    }

    pub fn get(&self) -> Vec<u8> {
        match self.rx.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(_) => Vec::with_capacity(self.buf_cap),
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        let _ = self.tx.try_send(buf);
    }
}

/// One parsed record: the raw line plus its field boundaries.
struct Rec {
    buf: Vec<u8>,
    bounds: Vec<(usize, usize)>,
}

impl Rec {
    fn parse(line: &[u8], pool: &BufPool) -> Self {
        let mut buf = pool.get();
        buf.extend_from_slice(line);
        let mut bounds = Vec::with_capacity(SOURCE_FIELDS);
        let mut start = 0;
        for (i, &b) in buf.iter().enumerate() {
            if b == b'\t' {
                bounds.push((start, i));
                start = i + 1;
            }
        }
        bounds.push((start, buf.len()));
        Rec { buf, bounds }
    }

    fn field(&self, i: usize) -> &[u8] {
        let (s, e) = self.bounds[i];
        &self.buf[s..e]
    }

    fn nfields(&self) -> usize {
        self.bounds.len()
    }

    fn anchor(&self) -> &[u8] {
        self.field(0)
    }
}

/// Reads a sorted stream as blocks of records sharing one anchor.
///
/// Keeps a one-record stash for the lookahead that terminated the
/// previous block, and insists that anchors never decrease.
struct BlockReader<'p, R: BufRead> {
    reader: R,
    name: &'static str,
    pool: &'p BufPool,
    expected_fields: usize,
    line_cap: usize,
    stash: Option<Rec>,
    done: bool,
    lnum: u64,
}

impl<'p, R: BufRead> BlockReader<'p, R> {
    fn new(reader: R, name: &'static str, pool: &'p BufPool, expected_fields: usize, line_cap: usize) -> Self {
        BlockReader {
            reader,
            name,
            pool,
            expected_fields,
            line_cap,
            stash: None,
            done: false,
            lnum: 0,
        }
    }

    /// Return the next equal-anchor block, or `None` when exhausted.
    fn next_block(&mut self) -> Result<Option<Vec<Rec>>> {
        if self.done && self.stash.is_none() {
            return Ok(None);
        }

        let mut recs: Vec<Rec> = Vec::new();
        if let Some(stashed) = self.stash.take() {
            recs.push(stashed);
        }

        let mut line = Vec::new();
        while !self.done {
            line.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut line)
                .with_context(|| format!("{} stream: read failed at line {}", self.name, self.lnum + 1))?;
            if read == 0 {
                self.done = true;
                break;
            }
            self.lnum += 1;
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            if line.len() > self.line_cap {
                bail!("{} stream: line {} is too long", self.name, self.lnum);
            }

            let rec = Rec::parse(&line, self.pool);
            if rec.nfields() != self.expected_fields {
                bail!(
                    "{} stream: line {} has {} fields, expected {}",
                    self.name,
                    self.lnum,
                    rec.nfields(),
                    self.expected_fields
                );
            }

            match recs.last() {
                None => recs.push(rec),
                Some(prev) => match prev.anchor().cmp(rec.anchor()) {
                    Ordering::Equal => recs.push(rec),
                    Ordering::Less => {
                        self.stash = Some(rec);
                        return Ok(Some(recs));
                    }
                    Ordering::Greater => {
                        bail!("{} stream is not sorted at line {}", self.name, self.lnum)
                    }
                },
            }
        }

        if recs.is_empty() {
            Ok(None)
        } else {
            Ok(Some(recs))
        }
    }
}

/// A dispatched unit of verification work.
struct BlockPair {
    source: Vec<Rec>,
    matches: Vec<Rec>,
}

/// A verified match carrying its mismatch count for selection.
struct Scored {
    nx: usize,
    line: Vec<u8>,
}

/// Check one (candidate, projection) pair; `None` when it fails.
fn check_pair(mrec: &Rec, srec: &Rec, config: &Config, pool: &BufPool) -> Result<Option<Scored>> {
    let mtag = mrec.field(0);
    let mlft = mrec.field(1);
    let mrgt = mrec.field(2);
    let mgene = mrec.field(3);
    let mpos = mrec.field(4);

    let stag = srec.field(0);
    let slft = srec.field(1);
    let srgt = srec.field(2);

    if mlft.len() != slft.len() {
        bail!(
            "flank length mismatch: candidate {} vs projection {}",
            mlft.len(),
            slft.len()
        );
    }

    // Target ends before the read would: not a match at this window.
    if mrgt.len() < srgt.len() {
        return Ok(None);
    }

    let read_len = slft.len() + stag.len() + srgt.len();
    let nmiss = config.max_mismatches(read_len);
    let mk = srgt.len();
    let nx = hamming(mlft, slft) + hamming(&mrgt[..mk], srgt);
    if nx > nmiss {
        return Ok(None);
    }

    // The position field of a fixed-width record has trailing padding.
    let pos_text = std::str::from_utf8(mpos)
        .ok()
        .map(|s| s.trim_end_matches(' '))
        .ok_or_else(|| anyhow::anyhow!("candidate position is not valid text"))?;
    let pos: usize = pos_text
        .parse()
        .with_context(|| format!("candidate position {:?} is not numeric", pos_text))?;
    let start = pos.checked_sub(slft.len()).ok_or_else(|| {
        anyhow::anyhow!("candidate position {} precedes its left flank", pos)
    })?;

    let mut line = pool.get();
    line.extend_from_slice(slft);
    line.extend_from_slice(stag);
    line.extend_from_slice(srgt);
    line.push(b'\t');
    line.extend_from_slice(mlft);
    line.extend_from_slice(mtag);
    line.extend_from_slice(&mrgt[..mk]);
    write!(line, "\t{}\t{}\t", start, nx).expect("write to Vec");
    line.extend_from_slice(mgene);
    line.push(b'\n');

    Ok(Some(Scored { nx, line }))
}

/// Verify one block pair, applying the per-block top-K policy.
fn verify_pairs(
    pair: &BlockPair,
    config: &Config,
    pool: &BufPool,
    out_tx: &Sender<Result<Vec<u8>>>,
) -> Result<()> {
    let k_cap = config.max_matches;
    match config.match_mode {
        MatchMode::First => {
            let mut emitted = 0;
            'outer: for mrec in &pair.matches {
                for srec in &pair.source {
                    if let Some(scored) = check_pair(mrec, srec, config, pool)? {
                        if out_tx.send(Ok(scored.line)).is_err() {
                            return Ok(());
                        }
                        emitted += 1;
                        if emitted >= k_cap {
                            break 'outer;
                        }
                    }
                }
            }
        }
        MatchMode::Best => {
            // Sorted descending by mismatch count; index 0 is the worst.
            let mut best: Vec<Scored> = Vec::with_capacity(k_cap);
            for mrec in &pair.matches {
                for srec in &pair.source {
                    let scored = match check_pair(mrec, srec, config, pool)? {
                        Some(s) => s,
                        None => continue,
                    };
                    if best.len() < k_cap {
                        let at = best.partition_point(|e| e.nx > scored.nx);
                        best.insert(at, scored);
                    } else if scored.nx < best[0].nx {
                        let worst = best.remove(0);
                        pool.put(worst.line);
                        let at = best.partition_point(|e| e.nx > scored.nx);
                        best.insert(at, scored);
                    } else {
                        pool.put(scored.line);
                    }
                }
            }
            for scored in best {
                if out_tx.send(Ok(scored.line)).is_err() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn release_block(block: Vec<Rec>, pool: &BufPool) {
    for rec in block {
        pool.put(rec.buf);
    }
}

fn verify_worker(
    work_rx: Receiver<BlockPair>,
    out_tx: Sender<Result<Vec<u8>>>,
    config: &Config,
    pool: &BufPool,
) {
    while let Ok(pair) = work_rx.recv() {
        if let Err(e) = verify_pairs(&pair, config, pool, &out_tx) {
            let _ = out_tx.send(Err(e));
            break;
        }
        release_block(pair.source, pool);
        release_block(pair.matches, pool);
    }
}

fn write_verified(
    out_path: &Path,
    rx: Receiver<Result<Vec<u8>>>,
    pool: &BufPool,
) -> Result<u64> {
    let mut writer = create_gz(out_path)?;
    let mut written: u64 = 0;
    for item in rx {
        let line = item?;
        writer.write_all(&line)?;
        pool.put(line);
        written += 1;
    }
    finish_gz(writer)?;
    Ok(written)
}

/// Join the sorted projection and candidate files for window `k` and
/// write the verified matches. Returns the number of matches written.
pub fn merge_window(
    config: &Config,
    k: usize,
    source_path: &Path,
    match_path: &Path,
    out_path: &Path,
) -> Result<u64> {
    let line_cap = config.verify_line_cap();
    let pool = BufPool::new(POOL_SIZE, line_cap);
    let mut source = BlockReader::new(
        open_gz(source_path)?,
        "source",
        &pool,
        SOURCE_FIELDS,
        line_cap,
    );
    let mut matches = BlockReader::new(
        open_gz(match_path)?,
        "match",
        &pool,
        MATCH_FIELDS,
        line_cap,
    );

    let (work_tx, work_rx) = bounded::<BlockPair>(CONCURRENCY);
    let (out_tx, out_rx) = bounded::<Result<Vec<u8>>>(5 * CONCURRENCY);
    let num_workers = num_cpus::get().max(1);
    let pool_ref = &pool;
    let pool_handle = rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .build()
        .context("failed to create verify thread pool")?;

    let written = std::thread::scope(|s| -> Result<u64> {
        let writer = s.spawn(move || write_verified(out_path, out_rx, pool_ref));

        let workers = s.spawn(move || {
            pool_handle.scope(|ps| {
                for _ in 0..num_workers {
                    let work_rx = work_rx.clone();
                    let out_tx = out_tx.clone();
                    ps.spawn(move |_| verify_worker(work_rx, out_tx, config, pool_ref));
                }
            });
        });

        let driven = drive_merge(&mut source, &mut matches, &work_tx, pool_ref);
        drop(work_tx);
        let workers_ok = workers.join();
        let written = writer.join();

        driven?;
        workers_ok.map_err(|_| anyhow::anyhow!("verify worker panicked"))?;
        written.map_err(|_| anyhow::anyhow!("verified-match writer panicked"))?
    })?;

    info!("window {}: {} verified matches", k, written);
    Ok(written)
}

/// Advance the two block readers, dispatching equal-anchor pairs.
fn drive_merge<R1: BufRead, R2: BufRead>(
    source: &mut BlockReader<'_, R1>,
    matches: &mut BlockReader<'_, R2>,
    work_tx: &Sender<BlockPair>,
    pool: &BufPool,
) -> Result<()> {
    let mut sb = source.next_block()?;
    let mut mb = matches.next_block()?;
    let mut blocks: u64 = 0;

    loop {
        let order = match (&sb, &mb) {
            (Some(s), Some(m)) => s[0].anchor().cmp(m[0].anchor()),
            _ => break,
        };
        match order {
            Ordering::Equal => {
                let pair = BlockPair {
                    source: sb.take().expect("source block"),
                    matches: mb.take().expect("match block"),
                };
                if work_tx.send(pair).is_err() {
                    // Workers stopped early; their error reaches the writer.
                    break;
                }
                blocks += 1;
                if blocks % 100_000 == 0 {
                    debug!("dispatched {} block pairs", blocks);
                }
                sb = source.next_block()?;
                mb = matches.next_block()?;
            }
            Ordering::Less => {
                release_block(sb.take().expect("source block"), pool);
                sb = source.next_block()?;
            }
            Ordering::Greater => {
                release_block(mb.take().expect("match block"), pool);
                mb = matches.next_block()?;
            }
        }
    }

    if let Some(block) = sb.take() {
        release_block(block, pool);
    }
    if let Some(block) = mb.take() {
        release_block(block, pool);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::util::{create_gz, finish_gz};
    use crate::types::MatchMode;
    use std::path::PathBuf;

    fn test_config(mode: MatchMode, k: usize, p_match: f64) -> Config {
        Config {
            read_file: PathBuf::from("reads.fastq"),
            gene_file: PathBuf::from("genes.txt"),
            gene_id_file: PathBuf::from("gene_ids.txt"),
            windows: vec![0],
            window_width: 4,
            bloom_size: 1 << 16,
            num_hash: 3,
            p_match,
            min_dinuc: 0,
            min_read_length: 4,
            max_read_length: 8,
            max_matches: k,
            max_merge_procs: 1,
            match_mode: mode,
            mm_tol: 0,
            temp_dir: None,
            rev: false,
        }
    }

    fn write_gz_lines(path: &Path, rows: &[String]) {
        let mut writer = create_gz(path).unwrap();
        for row in rows {
            writeln!(writer, "{}", row).unwrap();
        }
        finish_gz(writer).unwrap();
    }

    fn read_gz_lines(path: &Path) -> Vec<String> {
        use std::io::Read;
        let mut text = String::new();
        open_gz(path).unwrap().read_to_string(&mut text).unwrap();
        text.lines().map(|l| l.to_string()).collect()
    }

    /// Candidate row padded the way the scanner writes it.
    fn candidate(config: &Config, anchor: &str, left: &str, right: &str, id: u32, pos: u32) -> String {
        let body = format!(
            "{}\t{}\t{}\t{}\t{}",
            anchor,
            left,
            right,
            crate::types::format_target_id(id),
            pos
        );
        let width = config.candidate_record_width();
        format!("{}{}", body, " ".repeat(width - 1 - body.len()))
    }

    fn run_merge(
        config: &Config,
        source_rows: &[String],
        match_rows: &[String],
    ) -> (u64, Vec<String>) {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("win_0_sorted.txt.gz");
        let match_path = dir.path().join("smatch_0.txt.gz");
        let out_path = dir.path().join("rmatch_0.txt.gz");
        write_gz_lines(&source_path, source_rows);
        write_gz_lines(&match_path, match_rows);

        let n = merge_window(config, 0, &source_path, &match_path, &out_path).unwrap();
        (n, read_gz_lines(&out_path))
    }

    #[test]
    fn test_hamming() {
        assert_eq!(hamming(b"ACGT", b"ACGT"), 0);
        assert_eq!(hamming(b"ACGT", b"ACGA"), 1);
        assert_eq!(hamming(b"AAAA", b"TTTT"), 4);
        assert_eq!(hamming(b"", b""), 0);
    }

    #[test]
    fn test_buf_pool_reuse_and_overflow() {
        let pool = BufPool::new(1, 16);
        let a = pool.get();
        pool.put(a);
        pool.put(Vec::with_capacity(16)); // pool full: dropped
        let b = pool.get();
        assert_eq!(b.capacity(), 16);
        assert!(b.is_empty());
    }

    #[test]
    fn test_exact_match_survives() {
        let config = test_config(MatchMode::First, 4, 1.0);
        let (n, lines) = run_merge(
            &config,
            &["ACGT\t\tACGT\t2\t@r1;@r2".to_string()],
            &[candidate(&config, "ACGT", "", "ACGT", 0, 1)],
        );
        assert_eq!(n, 1);
        assert_eq!(lines, vec!["ACGTACGT\tACGTACGT\t1\t0\t00000000000"]);
    }

    #[test]
    fn test_mismatch_over_budget_is_dropped() {
        let config = test_config(MatchMode::First, 4, 1.0);
        let (n, _) = run_merge(
            &config,
            &["ACGT\t\tACGT\t1\t@r1".to_string()],
            &[candidate(&config, "ACGT", "", "ACGA", 0, 1)],
        );
        assert_eq!(n, 0);
    }

    #[test]
    fn test_mismatch_within_budget_is_kept() {
        // p_match = 0.75 over an 8-base read allows two mismatches.
        let config = test_config(MatchMode::First, 4, 0.75);
        let (n, lines) = run_merge(
            &config,
            &["AAAA\t\tAAAA\t1\t@r1".to_string()],
            &[candidate(&config, "AAAA", "", "TAAA", 0, 0)],
        );
        assert_eq!(n, 1);
        assert_eq!(lines[0], "AAAAAAAA\tAAAATAAA\t0\t1\t00000000000");
    }

    #[test]
    fn test_short_target_right_flank_skipped() {
        let config = test_config(MatchMode::First, 4, 1.0);
        // The target ends inside the read's right flank.
        let (n, _) = run_merge(
            &config,
            &["ACGT\t\tACGT\t1\t@r1".to_string()],
            &[candidate(&config, "ACGT", "", "AC", 0, 3)],
        );
        assert_eq!(n, 0);
    }

    #[test]
    fn test_empty_source_right_flank_matches_any_target_tail() {
        let config = test_config(MatchMode::First, 4, 1.0);
        let (n, lines) = run_merge(
            &config,
            &["GTAA\tAC\t\t1\t@r1".to_string()],
            &[candidate(&config, "GTAA", "AC", "CG", 0, 2)],
        );
        assert_eq!(n, 1);
        // Position is rebased to the start of the read within the target.
        assert_eq!(lines[0], "ACGTAA\tACGTAA\t0\t0\t00000000000");
    }

    #[test]
    fn test_first_mode_caps_per_block() {
        let config = test_config(MatchMode::First, 2, 1.0);
        let cands: Vec<String> = (0..5)
            .map(|i| candidate(&config, "ACGT", "", "ACGT", 0, 1 + i))
            .collect();
        let (n, _) = run_merge(&config, &["ACGT\t\tACGT\t1\t@r1".to_string()], &cands);
        assert_eq!(n, 2);
    }

    #[test]
    fn test_best_mode_keeps_lowest_mismatch() {
        // Five candidates with nx = 3,1,2,1,4; K = 2 keeps the two 1s.
        let config = test_config(MatchMode::Best, 2, 0.5);
        let rights = ["GGGG", "ACGT", "GGGA", "ACGC", "TTTT"];
        let cands: Vec<String> = rights
            .iter()
            .enumerate()
            .map(|(i, r)| candidate(&config, "ACGT", "", r, 0, 10 + i as u32))
            .collect();
        let (n, lines) = run_merge(&config, &["ACGT\t\tACGA\t1\t@r1".to_string()], &cands);
        assert_eq!(n, 2);
        for line in &lines {
            let nx: usize = line.split('\t').nth(3).unwrap().parse().unwrap();
            assert_eq!(nx, 1);
        }
    }

    #[test]
    fn test_unsorted_candidates_are_fatal() {
        let config = test_config(MatchMode::First, 4, 1.0);
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("s.txt.gz");
        let match_path = dir.path().join("m.txt.gz");
        let out_path = dir.path().join("o.txt.gz");
        write_gz_lines(&source_path, &["ACGT\t\tACGT\t1\t@r1".to_string()]);
        write_gz_lines(
            &match_path,
            &[
                candidate(&config, "TTTT", "", "A", 0, 1),
                candidate(&config, "ACGT", "", "A", 0, 2),
            ],
        );
        assert!(merge_window(&config, 0, &source_path, &match_path, &out_path).is_err());
    }

    #[test]
    fn test_wrong_field_count_is_fatal() {
        let config = test_config(MatchMode::First, 4, 1.0);
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("s.txt.gz");
        let match_path = dir.path().join("m.txt.gz");
        let out_path = dir.path().join("o.txt.gz");
        write_gz_lines(&source_path, &["ACGT\t\tACGT\t1".to_string()]);
        write_gz_lines(&match_path, &[candidate(&config, "ACGT", "", "A", 0, 1)]);
        assert!(merge_window(&config, 0, &source_path, &match_path, &out_path).is_err());
    }

    #[test]
    fn test_non_numeric_position_is_fatal() {
        let config = test_config(MatchMode::First, 4, 1.0);
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("s.txt.gz");
        let match_path = dir.path().join("m.txt.gz");
        let out_path = dir.path().join("o.txt.gz");
        write_gz_lines(&source_path, &["ACGT\t\t\t1\t@r1".to_string()]);
        write_gz_lines(&match_path, &["ACGT\t\tAA\t00000000000\txy".to_string()]);
        assert!(merge_window(&config, 0, &source_path, &match_path, &out_path).is_err());
    }

    #[test]
    fn test_disjoint_anchors_produce_nothing() {
        let config = test_config(MatchMode::First, 4, 1.0);
        let (n, _) = run_merge(
            &config,
            &["AAAA\t\tAAAA\t1\t@r1".to_string()],
            &[candidate(&config, "CCCC", "", "CCCC", 0, 1)],
        );
        assert_eq!(n, 0);
    }
}
