//! Target preparation: normalise the gene file into the internal layout.
//!
//! Every target becomes one sequence row in `targets.txt.gz`, with the
//! zero-based row number as its internal id; the id-to-name mapping is
//! written to the gene-id sidecar. With `rev` enabled, the reverse
//! complement of each target follows it as an independent extra row.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::info;

use crate::config::Config;
use crate::parser::util::{create_gz, finish_gz, OutputFile};
use crate::parser::GeneReader;
use crate::types::format_target_id;

/// Replace bytes outside {A,T,C,G} with X, in place.
pub fn mask_non_acgt(seq: &mut [u8]) {
    for b in seq.iter_mut() {
        match *b {
            b'A' | b'T' | b'C' | b'G' => {}
            _ => *b = b'X',
        }
    }
}

/// Reverse complement of a masked sequence.
pub fn revcomp(seq: &[u8]) -> Vec<u8> {
    seq.iter()
        .rev()
        .map(|&b| match b {
            b'A' => b'T',
            b'T' => b'A',
            b'C' => b'G',
            b'G' => b'C',
            _ => b'X',
        })
        .collect()
}

fn emit_target(
    row: &mut u32,
    seq: &[u8],
    name: &str,
    seqs: &mut impl Write,
    ids: &mut OutputFile,
) -> Result<()> {
    seqs.write_all(seq)?;
    seqs.write_all(b"\n")?;
    writeln!(ids, "{}\t{}\t{}", format_target_id(*row), name, seq.len())?;
    *row = row
        .checked_add(1)
        .ok_or_else(|| anyhow::anyhow!("too many target sequences"))?;
    Ok(())
}

/// Run the target preparation stage; returns the number of target rows.
pub fn prep_targets(config: &Config, targets_path: &Path) -> Result<u32> {
    let mut reader = GeneReader::new(&config.gene_file)?;
    let mut seq_writer = create_gz(targets_path)?;
    let mut id_writer = OutputFile::create(&config.gene_id_file)
        .context("failed to create gene id file")?;

    let mut row: u32 = 0;
    while let Some(mut rec) = reader.next_record()? {
        if rec.seq.is_empty() {
            bail!("target {} has an empty sequence", rec.name);
        }
        mask_non_acgt(&mut rec.seq);
        emit_target(&mut row, &rec.seq, &rec.name, &mut seq_writer, &mut id_writer)?;
        if config.rev {
            let rc = revcomp(&rec.seq);
            let name = format!("{}_r", rec.name);
            emit_target(&mut row, &rc, &name, &mut seq_writer, &mut id_writer)?;
        }
    }

    finish_gz(seq_writer)?;
    id_writer.finish()?;
    info!("prepared {} target rows", row);
    Ok(row)
}
