//! Streaming reader for the target (gene) sequence file.
//!
//! Two layouts are accepted: `name \t sequence` rows, or FASTA with
//! `>name` headers and sequence continuation lines. The layout is
//! detected from the first byte of the file.

use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::parser::util::open_input;

/// Upper bound on a single input line. Target sequences can reach
/// millions of bases but a line beyond this is treated as corrupt.
pub const MAX_LINE_BYTES: usize = 1 << 26;

/// One named target sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneRecord {
    pub name: String,
    pub seq: Vec<u8>,
}

enum Layout {
    Text,
    Fasta,
}

/// Iterator-style reader over target sequences in either layout.
pub struct GeneReader {
    reader: Box<dyn BufRead + Send>,
    layout: Layout,
    /// FASTA header waiting for its sequence lines.
    pending: Option<String>,
    lnum: u64,
}

impl GeneReader {
    /// Open a gene file (supports .gz) and detect its layout.
    pub fn new(path: &Path) -> Result<Self> {
        let mut reader = open_input(path).context("failed to open gene file")?;
        let first = reader.fill_buf().context("failed to read gene file")?;
        let layout = if first.first() == Some(&b'>') {
            Layout::Fasta
        } else {
            Layout::Text
        };
        Ok(GeneReader {
            reader,
            layout,
            pending: None,
            lnum: 0,
        })
    }

    fn read_line(&mut self, line: &mut Vec<u8>) -> Result<bool> {
        line.clear();
        let read = self
            .reader
            .read_until(b'\n', line)
            .with_context(|| format!("gene file read error near line {}", self.lnum + 1))?;
        if read == 0 {
            return Ok(false);
        }
        self.lnum += 1;
        if line.len() > MAX_LINE_BYTES {
            bail!("gene file line {} exceeds the line cap", self.lnum);
        }
        while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
            line.pop();
        }
        Ok(true)
    }

    /// Read the next named sequence, or `None` at end of input.
    pub fn next_record(&mut self) -> Result<Option<GeneRecord>> {
        match self.layout {
            Layout::Text => self.next_text(),
            Layout::Fasta => self.next_fasta(),
        }
    }

    fn next_text(&mut self) -> Result<Option<GeneRecord>> {
        let mut line = Vec::new();
        loop {
            if !self.read_line(&mut line)? {
                return Ok(None);
            }
            if line.is_empty() {
                continue;
            }
            let tab = match line.iter().position(|&b| b == b'\t') {
                Some(i) => i,
                None => bail!(
                    "gene file line {}: expected name<TAB>sequence",
                    self.lnum
                ),
            };
            let name = String::from_utf8_lossy(&line[..tab]).into_owned();
            let seq = line[tab + 1..].to_vec();
            return Ok(Some(GeneRecord { name, seq }));
        }
    }

    fn next_fasta(&mut self) -> Result<Option<GeneRecord>> {
        let mut line = Vec::new();
        let mut name = self.pending.take();
        let mut seq = Vec::new();

        loop {
            if !self.read_line(&mut line)? {
                return match name {
                    Some(name) => Ok(Some(GeneRecord { name, seq })),
                    None => Ok(None),
                };
            }
            if line.is_empty() {
                continue;
            }
            if line[0] == b'>' {
                let header = String::from_utf8_lossy(&line[1..]).into_owned();
                match name {
                    // Header before any sequence: start of the first record.
                    None => name = Some(header),
                    Some(done) => {
                        self.pending = Some(header);
                        return Ok(Some(GeneRecord { name: done, seq }));
                    }
                }
            } else {
                if name.is_none() {
                    bail!("gene file line {}: sequence before FASTA header", self.lnum);
                }
                seq.extend_from_slice(&line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn collect(path: &std::path::Path) -> Vec<GeneRecord> {
        let mut reader = GeneReader::new(path).unwrap();
        let mut out = Vec::new();
        while let Some(rec) = reader.next_record().unwrap() {
            out.push(rec);
        }
        out
    }

    #[test]
    fn test_text_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "g.txt", "g1\tACGTACGT\ng2\tTTTTAAAA\n");
        let recs = collect(&path);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].name, "g1");
        assert_eq!(recs[0].seq, b"ACGTACGT");
        assert_eq!(recs[1].name, "g2");
    }

    #[test]
    fn test_text_missing_tab_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "g.txt", "g1 ACGT\n");
        let mut reader = GeneReader::new(&path).unwrap();
        assert!(reader.next_record().is_err());
    }

    #[test]
    fn test_fasta_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "g.fasta", ">g1\nACGT\nACGT\n>g2\nTTTT\n");
        let recs = collect(&path);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].name, "g1");
        assert_eq!(recs[0].seq, b"ACGTACGT");
        assert_eq!(recs[1].name, "g2");
        assert_eq!(recs[1].seq, b"TTTT");
    }

    #[test]
    fn test_fasta_blank_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "g.fa", ">g1\nAC\n\nGT\n");
        let recs = collect(&path);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].seq, b"ACGT");
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "g.txt", "");
        assert!(collect(&path).is_empty());
    }
}
