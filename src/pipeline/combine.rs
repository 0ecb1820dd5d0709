//! Combination of per-window results into the final output.
//!
//! Step A unions the verified per-window matches and sort-uniques them.
//! Step B keeps, per read, only matches within `mm_tol` of that read's
//! best mismatch count. Steps C and D re-attach the external gene name
//! and the read count/name list by sorted merge joins.

use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

use crate::config::Config;
use crate::extsort::ExtSorter;
use crate::parser::util::{create_gz, finish_gz, open_gz, open_input, OutputFile};
use crate::pipeline::split_fields;

/// Step A: union the per-window verified matches, sorted and uniqued.
pub fn combine_windows(
    rmatch_paths: &[std::path::PathBuf],
    out_path: &Path,
    sort_dir: &Path,
) -> Result<u64> {
    let mut sorter = ExtSorter::new(sort_dir).unique();
    for path in rmatch_paths {
        sorter.push_reader(open_gz(path)?)?;
    }

    let mut writer = create_gz(out_path)?;
    let mut n = 0;
    for line in sorter.finish()? {
        let line = line?;
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        n += 1;
    }
    finish_gz(writer)?;
    info!("combined windows: {} distinct matches", n);
    Ok(n)
}

fn parse_nx(line: &[u8], lnum: u64) -> Result<u32> {
    let fields = split_fields(line);
    if fields.len() != 5 {
        bail!("match row {} has {} fields, expected 5", lnum, fields.len());
    }
    std::str::from_utf8(fields[3])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("match row {}: mismatch count is not numeric", lnum))
}

fn flush_group(
    group: &mut Vec<(u32, Vec<u8>)>,
    mm_tol: u32,
    writer: &mut impl Write,
) -> Result<u64> {
    let best = match group.iter().map(|(nx, _)| *nx).min() {
        Some(best) => best,
        None => return Ok(0),
    };
    let mut kept = 0;
    for (nx, line) in group.drain(..) {
        if nx <= best + mm_tol {
            writer.write_all(&line)?;
            writer.write_all(b"\n")?;
            kept += 1;
        }
    }
    Ok(kept)
}

/// Step B: per read, keep matches within `mm_tol` of the minimum.
///
/// The input is sorted, so each read's matches form one contiguous run
/// keyed by the reconstructed read sequence in the first field.
pub fn best_filter(config: &Config, matches_path: &Path, out_path: &Path) -> Result<u64> {
    let mut reader = open_gz(matches_path)?;
    let mut writer = create_gz(out_path)?;

    let mut group: Vec<(u32, Vec<u8>)> = Vec::new();
    let mut group_key: Vec<u8> = Vec::new();
    let mut kept: u64 = 0;
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

        let nx = parse_nx(&line, lnum)?;
        let key_end = line.iter().position(|&b| b == b'\t').unwrap_or(line.len());
        if group.is_empty() || line[..key_end] != group_key[..] {
            kept += flush_group(&mut group, config.mm_tol, &mut writer)?;
            group_key.clear();
            group_key.extend_from_slice(&line[..key_end]);
        }
        group.push((nx, line.clone()));
    }
    kept += flush_group(&mut group, config.mm_tol, &mut writer)?;
    finish_gz(writer)?;

    info!("best-tolerance filter kept {} matches", kept);
    Ok(kept)
}

/// A sorted lookup table for a streaming merge join.
struct JoinTable {
    reader: Box<dyn BufRead + Send>,
    name: &'static str,
    fields: Vec<Vec<u8>>,
    exhausted: bool,
    lnum: u64,
}

impl JoinTable {
    fn new(path: &Path, name: &'static str) -> Result<Self> {
        let mut table = JoinTable {
            reader: open_input(path)
                .with_context(|| format!("failed to open {} table", name))?,
            name,
            fields: Vec::new(),
            exhausted: false,
            lnum: 0,
        };
        table.step()?;
        Ok(table)
    }

    fn step(&mut self) -> Result<()> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                self.exhausted = true;
                self.fields.clear();
                return Ok(());
            }
            self.lnum += 1;
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            self.fields = split_fields(&line).iter().map(|f| f.to_vec()).collect();
            return Ok(());
        }
    }

    /// Advance to the row with the given key; the table key must exist.
    fn seek(&mut self, key: &[u8]) -> Result<&[Vec<u8>]> {
        loop {
            if self.exhausted {
                bail!("{} table: key {:?} not found", self.name, String::from_utf8_lossy(key));
            }
            match self.fields[0].as_slice().cmp(key) {
                std::cmp::Ordering::Less => self.step()?,
                std::cmp::Ordering::Equal => return Ok(&self.fields),
                std::cmp::Ordering::Greater => {
                    bail!(
                        "{} table: key {:?} not found (table line {})",
                        self.name,
                        String::from_utf8_lossy(key),
                        self.lnum
                    )
                }
            }
        }
    }
}

/// Step C: sort by target id and attach the external gene name.
///
/// The internal id (the last field) is dropped from the output.
pub fn join_gene_names(
    best_path: &Path,
    gene_id_path: &Path,
    out_path: &Path,
    sort_dir: &Path,
) -> Result<u64> {
    let mut sorter = ExtSorter::new(sort_dir).key_field(4);
    sorter.push_reader(open_gz(best_path)?)?;

    let mut table = JoinTable::new(gene_id_path, "gene id")?;
    let mut writer = create_gz(out_path)?;
    let mut n = 0;
    for line in sorter.finish()? {
        let line = line?;
        let fields = split_fields(&line);
        if fields.len() != 5 {
            bail!("match row has {} fields, expected 5", fields.len());
        }
        let row = table.seek(fields[4])?;
        if row.len() < 2 {
            bail!("gene id table row for {:?} is malformed", String::from_utf8_lossy(fields[4]));
        }
        let name = row[1].clone();

        for field in &fields[..4] {
            writer.write_all(field)?;
            writer.write_all(b"\t")?;
        }
        writer.write_all(&name)?;
        writer.write_all(b"\n")?;
        n += 1;
    }
    finish_gz(writer)?;
    info!("joined gene names for {} matches", n);
    Ok(n)
}

/// Step D: sort by read sequence and attach count and name list.
///
/// Writes both the compressed intermediate and the final plain output.
pub fn join_read_names(
    sg_path: &Path,
    reads_sorted_path: &Path,
    sn_path: &Path,
    final_path: &Path,
    sort_dir: &Path,
) -> Result<u64> {
    let mut sorter = ExtSorter::new(sort_dir).key_field(0);
    sorter.push_reader(open_gz(sg_path)?)?;

    let mut table = JoinTable::new(reads_sorted_path, "unique read")?;
    let mut sn_writer = create_gz(sn_path)?;
    let mut final_writer = OutputFile::create(final_path)?;
    let mut n = 0;
    for line in sorter.finish()? {
        let line = line?;
        let key_end = line.iter().position(|&b| b == b'\t').unwrap_or(line.len());
        let row = table.seek(&line[..key_end])?;
        if row.len() != 3 {
            bail!(
                "unique read row for {:?} has {} fields, expected 3",
                String::from_utf8_lossy(&line[..key_end]),
                row.len()
            );
        }
        let (count, names) = (row[1].clone(), row[2].clone());

        for writer in [&mut sn_writer as &mut dyn Write, &mut final_writer] {
            writer.write_all(&line)?;
            writer.write_all(b"\t")?;
            writer.write_all(&count)?;
            writer.write_all(b"\t")?;
            writer.write_all(&names)?;
            writer.write_all(b"\n")?;
        }
        n += 1;
    }
    finish_gz(sn_writer)?;
    final_writer.finish()?;
    info!("final output holds {} matches", n);
    Ok(n)
}
