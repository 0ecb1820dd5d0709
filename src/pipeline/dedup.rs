//! Read dedupe: sort the normalised reads and collapse equal sequences.
//!
//! The collapser is a single pass over the sorted stream holding only
//! its current run: counts sum, names join with `;`, and the joined
//! list is truncated once at the cap.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

use crate::extsort::ExtSorter;
use crate::parser::util::{create_gz, finish_gz, open_gz};

/// Cap on the joined name list of one unique read.
const MAX_NAMES_LEN: usize = 1000;

struct Run {
    seq: Vec<u8>,
    count: u64,
    names: Vec<u8>,
}

impl Run {
    fn start(seq: &[u8], name: &[u8]) -> Self {
        Run {
            seq: seq.to_vec(),
            count: 1,
            names: name.to_vec(),
        }
    }

    fn add(&mut self, name: &[u8]) {
        self.count += 1;
        // Once past the cap there is no point growing the list further.
        if self.names.len() <= MAX_NAMES_LEN {
            self.names.push(b';');
            self.names.extend_from_slice(name);
        }
    }

    fn flush(mut self, writer: &mut impl Write) -> Result<()> {
        if self.names.len() > MAX_NAMES_LEN {
            self.names.truncate(MAX_NAMES_LEN - 3);
            self.names.extend_from_slice(b"...");
        }
        writer.write_all(&self.seq)?;
        writer.write_all(b"\t")?;
        write!(writer, "{}", self.count)?;
        writer.write_all(b"\t")?;
        writer.write_all(&self.names)?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

/// Run the dedupe stage; returns the number of unique sequences.
pub fn dedup_reads(reads_path: &Path, out_path: &Path, sort_dir: &Path) -> Result<u64> {
    let mut sorter = ExtSorter::new(sort_dir);
    let total = sorter
        .push_reader(open_gz(reads_path)?)
        .context("failed to read normalised reads")?;
    if total == 0 {
        bail!("no reads survived normalisation");
    }

    let mut writer = create_gz(out_path)?;
    let mut unique: u64 = 0;
    let mut run: Option<Run> = None;

    for line in sorter.finish()? {
        let line = line?;
        let tab = line
            .iter()
            .position(|&b| b == b'\t')
            .ok_or_else(|| anyhow::anyhow!("malformed read row: missing name field"))?;
        let (seq, name) = (&line[..tab], &line[tab + 1..]);

        match run.as_mut() {
            Some(r) if r.seq == seq => r.add(name),
            _ => {
                if let Some(done) = run.take() {
                    done.flush(&mut writer)?;
                    unique += 1;
                }
                run = Some(Run::start(seq, name));
            }
        }
    }
    if let Some(done) = run.take() {
        done.flush(&mut writer)?;
        unique += 1;
    }
    finish_gz(writer)?;

    info!("collapsed {} reads into {} unique sequences", total, unique);
    Ok(unique)
}
