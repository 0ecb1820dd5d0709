//! Bloom build and target scan.
//!
//! The build phase inserts every admitted anchor of the unique-read
//! stream into the per-window filter array. The scan phase slides the
//! shared rolling-hash family across every target and emits a candidate
//! for each window whose filter reports the current hash window as
//! possibly present. Candidates may be false positives; the verifier
//! removes them. There are no false negatives.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, SendError, Sender};
use log::{debug, info};

use crate::config::{Config, CONCURRENCY};
use crate::dinuc::{count_dinuc, NUM_DINUCS};
use crate::filter::{generate_tables, BloomArray, RollingHash, TABLE_SEED};
use crate::parser::genes::MAX_LINE_BYTES;
use crate::parser::util::{create_gz, finish_gz, open_gz};
use crate::types::format_target_id;

/// One target sequence queued for scanning.
struct Target {
    id: u32,
    seq: Vec<u8>,
}

/// One candidate hit on its way to the per-window output file.
struct Candidate {
    win: usize,
    anchor: Vec<u8>,
    left: Vec<u8>,
    right: Vec<u8>,
    target_id: u32,
    pos: u32,
}

/// The Bloom pre-filter: hash tables plus one filter per window.
///
/// Built single-threaded, then shared read-only by the scan workers.
pub struct ScanStage<'a> {
    config: &'a Config,
    tables: Vec<[u32; 256]>,
    bloom: BloomArray,
}

/// Build the filter array from the sorted unique-read stream.
pub fn build_filters<'a>(config: &'a Config, reads_sorted_path: &Path) -> Result<ScanStage<'a>> {
    let tables = generate_tables(config.num_hash, TABLE_SEED);
    let mut bloom = BloomArray::new(config.windows.len(), config.bloom_size);

    let width = config.window_width;
    {
        let mut hashes: Vec<RollingHash> =
            tables.iter().map(|t| RollingHash::new(t, width)).collect();
        let mut sums = vec![0u32; config.num_hash];
        let mut work = [false; NUM_DINUCS];

        let mut reader = open_gz(reads_sorted_path)?;
        let mut line = Vec::new();
        let mut lnum: u64 = 0;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            lnum += 1;
            let seq = line
                .split(|&b| b == b'\t' || b == b'\n')
                .next()
                .unwrap_or(&[]);

            for (k, &q1) in config.windows.iter().enumerate() {
                let q2 = q1 + width;
                if seq.len() < q2 {
                    continue;
                }
                let anchor = &seq[q1..q2];
                if count_dinuc(anchor, &mut work) < config.min_dinuc {
                    continue;
                }
                for (j, hash) in hashes.iter_mut().enumerate() {
                    hash.init(anchor);
                    sums[j] = hash.sum();
                }
                bloom.insert(k, &sums);
            }

            if lnum % 1_000_000 == 0 {
                debug!("bloom build: {} unique reads", lnum);
            }
        }
    }

    for k in 0..config.windows.len() {
        info!("bloom filter {} fill rate {:.3}", k, bloom.fill_rate(k));
    }
    Ok(ScanStage {
        config,
        tables,
        bloom,
    })
}

impl<'a> ScanStage<'a> {
    /// Scan every target, writing per-window candidate files.
    ///
    /// Returns the total number of candidates emitted.
    pub fn scan(
        &self,
        targets_path: &Path,
        bmatch_path: impl Fn(usize) -> PathBuf + Sync,
    ) -> Result<u64> {
        let (work_tx, work_rx) = bounded::<Target>(CONCURRENCY);
        let (hit_tx, hit_rx) = bounded::<Candidate>(2000);
        let num_workers = num_cpus::get().max(1);
        let bmatch_path = &bmatch_path;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers)
            .build()
            .context("failed to create scan thread pool")?;

        std::thread::scope(|s| -> Result<u64> {
            let writer = s.spawn(move || self.write_candidates(hit_rx, bmatch_path));

            let workers = s.spawn(move || {
                pool.scope(|ps| {
                    for _ in 0..num_workers {
                        let work_rx = work_rx.clone();
                        let hit_tx = hit_tx.clone();
                        ps.spawn(move |_| self.scan_worker(work_rx, hit_tx));
                    }
                });
            });

            let driven = self.drive_scan(targets_path, &work_tx);
            drop(work_tx);
            let workers_ok = workers.join();
            let written = writer.join();

            driven?;
            workers_ok.map_err(|_| anyhow::anyhow!("scan worker panicked"))?;
            written.map_err(|_| anyhow::anyhow!("candidate writer panicked"))?
        })
    }

    /// Feed targets to the work queue, one row per target.
    fn drive_scan(&self, targets_path: &Path, work_tx: &Sender<Target>) -> Result<()> {
        let mut reader = open_gz(targets_path)?;
        let mut line = Vec::new();
        let mut id: u64 = 0;
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.len() > MAX_LINE_BYTES {
                bail!("target row {} exceeds the scanner line cap", id + 1);
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            if id > u32::MAX as u64 {
                bail!("too many target rows");
            }
            let target = Target {
                id: id as u32,
                seq: std::mem::take(&mut line),
            };
            if work_tx.send(target).is_err() {
                // Workers are gone; the writer holds the real error.
                break;
            }
            id += 1;
            if id % 1_000_000 == 0 {
                debug!("scan: {} targets", id);
            }
        }
        Ok(())
    }

    fn scan_worker(&self, work_rx: Receiver<Target>, hit_tx: Sender<Candidate>) {
        let width = self.config.window_width;
        let mut hashes: Vec<RollingHash> =
            self.tables.iter().map(|t| RollingHash::new(t, width)).collect();
        let mut sums = vec![0u32; self.config.num_hash];
        let mut probes = Vec::with_capacity(self.config.num_hash);
        let mut hits = Vec::new();

        while let Ok(target) = work_rx.recv() {
            let done = self.scan_target(
                &target,
                &mut hashes,
                &mut sums,
                &mut probes,
                &mut hits,
                &hit_tx,
            );
            if done.is_err() {
                // The writer hung up; stop quietly.
                break;
            }
        }
    }

    /// Slide the hash family across one target and emit its candidates.
    fn scan_target(
        &self,
        target: &Target,
        hashes: &mut [RollingHash],
        sums: &mut [u32],
        probes: &mut Vec<u64>,
        hits: &mut Vec<usize>,
        hit_tx: &Sender<Candidate>,
    ) -> Result<(), SendError<Candidate>> {
        let seq = &target.seq;
        let width = self.config.window_width;
        let max_read = self.config.max_read_length;
        if seq.len() < width {
            return Ok(());
        }

        for (j, hash) in hashes.iter_mut().enumerate() {
            hash.init(&seq[..width]);
            sums[j] = hash.sum();
        }
        self.bloom.query_all(sums, probes, hits);

        // The window at position 0 can only carry anchors at offset 0.
        for &k in hits.iter() {
            if self.config.windows[k] != 0 {
                continue;
            }
            let jz = seq.len().min(max_read);
            hit_tx.send(Candidate {
                win: k,
                anchor: seq[..width].to_vec(),
                left: Vec::new(),
                right: seq[width..jz].to_vec(),
                target_id: target.id,
                pos: 0,
            })?;
        }

        for j in width..seq.len() {
            for (i, hash) in hashes.iter_mut().enumerate() {
                hash.roll(seq[j]);
                sums[i] = hash.sum();
            }
            self.bloom.query_all(sums, probes, hits);

            for &k in hits.iter() {
                let q1 = self.config.windows[k];
                let q2 = q1 + width;
                // The anchor must sit far enough into a read for this window.
                if j + 1 < q2 {
                    continue;
                }
                let jx = j + 1 - width;
                let jy = j + 1;
                if jx < q1 {
                    continue;
                }
                let jw = jx - q1;
                let jz = seq.len().min(jy + max_read - q2);
                hit_tx.send(Candidate {
                    win: k,
                    anchor: seq[jx..jy].to_vec(),
                    left: seq[jw..jx].to_vec(),
                    right: seq[jy..jz].to_vec(),
                    target_id: target.id,
                    pos: jx as u32,
                })?;
            }
        }
        Ok(())
    }

    /// Drain candidate records into the per-window files.
    ///
    /// Each record is padded with trailing spaces to the fixed width so
    /// that the file consists of equal-length lines.
    fn write_candidates(
        &self,
        hit_rx: Receiver<Candidate>,
        bmatch_path: &(impl Fn(usize) -> PathBuf + Sync),
    ) -> Result<u64> {
        let mut writers = Vec::with_capacity(self.config.windows.len());
        for k in 0..self.config.windows.len() {
            writers.push(create_gz(&bmatch_path(k))?);
        }

        let width = self.config.candidate_record_width();
        let pad = vec![b' '; width];
        let mut record: Vec<u8> = Vec::with_capacity(width);
        let mut written: u64 = 0;

        for c in hit_rx {
            record.clear();
            record.extend_from_slice(&c.anchor);
            record.push(b'\t');
            record.extend_from_slice(&c.left);
            record.push(b'\t');
            record.extend_from_slice(&c.right);
            record.push(b'\t');
            write!(record, "{}\t{}", format_target_id(c.target_id), c.pos)
                .expect("write to Vec");
            if record.len() > width - 1 {
                bail!(
                    "candidate record of {} bytes exceeds the record width {}",
                    record.len(),
                    width
                );
            }

            let writer = &mut writers[c.win];
            writer.write_all(&record)?;
            writer.write_all(&pad[..width - 1 - record.len()])?;
            writer.write_all(b"\n")?;
            written += 1;
        }

        for writer in writers {
            finish_gz(writer)?;
        }
        info!("scan emitted {} candidates", written);
        Ok(written)
    }
}
