//! Streaming FASTQ reader.
//!
//! Only the header and sequence lines of each four-line record are
//! consumed; the separator and quality lines are discarded.

use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::parser::util::open_input;

/// One sequencing read as it appears in the input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    /// The full header line, as written.
    pub name: String,
    pub seq: Vec<u8>,
}

/// Iterator-style reader over four-line FASTQ records.
pub struct FastqReader {
    reader: Box<dyn BufRead + Send>,
    lnum: u64,
}

impl FastqReader {
    /// Open a FASTQ file (supports .gz).
    pub fn new(path: &Path) -> Result<Self> {
        let reader = open_input(path).context("failed to open read file")?;
        Ok(FastqReader { reader, lnum: 0 })
    }

    fn read_line(&mut self, line: &mut String) -> Result<bool> {
        line.clear();
        let read = self
            .reader
            .read_line(line)
            .with_context(|| format!("read error near line {}", self.lnum + 1))?;
        if read == 0 {
            return Ok(false);
        }
        self.lnum += 1;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(true)
    }

    /// Read the next record, or `None` at end of input.
    ///
    /// A record cut off by end of file is a data-format error.
    pub fn next_record(&mut self) -> Result<Option<FastqRecord>> {
        let mut header = String::new();
        if !self.read_line(&mut header)? {
            return Ok(None);
        }

        let mut seq = String::new();
        let mut sep = String::new();
        let mut qual = String::new();
        for line in [&mut seq, &mut sep, &mut qual] {
            if !self.read_line(line)? {
                bail!("truncated FASTQ record at line {}", self.lnum);
            }
        }

        Ok(Some(FastqRecord {
            name: header,
            seq: seq.into_bytes(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fastq(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
        let path = dir.path().join("reads.fastq");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_reads_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fastq(
            &dir,
            "@r1\nACGT\n+\nIIII\n@r2 extra info\nTTGCA\n+\nJJJJJ\n",
        );

        let mut reader = FastqReader::new(&path).unwrap();
        let r1 = reader.next_record().unwrap().unwrap();
        assert_eq!(r1.name, "@r1");
        assert_eq!(r1.seq, b"ACGT");

        let r2 = reader.next_record().unwrap().unwrap();
        assert_eq!(r2.name, "@r2 extra info");
        assert_eq!(r2.seq, b"TTGCA");

        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_truncated_record_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fastq(&dir, "@r1\nACGT\n+\nIIII\n@r2\nACGT\n");
        let mut reader = FastqReader::new(&path).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().is_err());
    }

    #[test]
    fn test_crlf_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fastq(&dir, "@r1\r\nACGT\r\n+\r\nIIII\r\n");
        let mut reader = FastqReader::new(&path).unwrap();
        let r1 = reader.next_record().unwrap().unwrap();
        assert_eq!(r1.seq, b"ACGT");
    }
}
