//! In-process external merge sort over newline-delimited byte lines.
//!
//! Every pipeline seam orders records by a designated field before the
//! next stage performs a linear streaming merge. Lines are compared as
//! raw bytes, which matches `LC_ALL=C` ordering; an optional primary key
//! selects a tab-separated field, with the whole line as tie-breaker.
//! Sorted runs of a bounded byte budget are spilled to anonymous temp
//! files and merged with a binary heap.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Default in-memory run budget before spilling.
pub const DEFAULT_CHUNK_BYTES: usize = 64 * 1024 * 1024;

/// Return the byte range of tab-separated field `idx` within `line`.
///
/// A field index past the end of the line yields an empty range, which
/// sorts before any non-empty field.
fn field_range(line: &[u8], idx: usize) -> (usize, usize) {
    let mut start = 0;
    let mut seen = 0;
    for (i, &b) in line.iter().enumerate() {
        if b == b'\t' {
            if seen == idx {
                return (start, i);
            }
            seen += 1;
            start = i + 1;
        }
    }
    if seen == idx {
        (start, line.len())
    } else {
        (line.len(), line.len())
    }
}

fn compare(a: &[u8], b: &[u8], key_field: Option<usize>) -> Ordering {
    match key_field {
        None => a.cmp(b),
        Some(idx) => {
            let (as_, ae) = field_range(a, idx);
            let (bs, be) = field_range(b, idx);
            a[as_..ae].cmp(&b[bs..be]).then_with(|| a.cmp(b))
        }
    }
}

/// Accumulates lines, spilling sorted runs to disk.
pub struct ExtSorter {
    temp_dir: PathBuf,
    chunk_bytes: usize,
    unique: bool,
    key_field: Option<usize>,
    cur: Vec<Vec<u8>>,
    cur_bytes: usize,
    runs: Vec<File>,
}

impl ExtSorter {
    pub fn new(temp_dir: &Path) -> Self {
        ExtSorter {
            temp_dir: temp_dir.to_path_buf(),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            unique: false,
            key_field: None,
            cur: Vec::new(),
            cur_bytes: 0,
            runs: Vec::new(),
        }
    }

    /// Drop duplicate lines during the merge.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Order primarily by the given tab-separated field (0-based).
    pub fn key_field(mut self, idx: usize) -> Self {
        self.key_field = Some(idx);
        self
    }

    /// Override the in-memory run budget (mainly for tests).
    pub fn chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes.max(1);
        self
    }

    /// Add one line (without its trailing newline).
    pub fn push(&mut self, line: Vec<u8>) -> Result<()> {
        self.cur_bytes += line.len() + 1;
        self.cur.push(line);
        if self.cur_bytes >= self.chunk_bytes {
            self.spill()?;
        }
        Ok(())
    }

    /// Add every line from a reader; returns the number of lines read.
    pub fn push_reader<R: BufRead>(&mut self, mut reader: R) -> Result<u64> {
        let mut n = 0;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line).context("sort input read failed")?;
            if read == 0 {
                break;
            }
            if line.last() == Some(&b'\n') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            self.push(std::mem::take(&mut line))?;
            n += 1;
        }
        Ok(n)
    }

    fn spill(&mut self) -> Result<()> {
        if self.cur.is_empty() {
            return Ok(());
        }
        let key_field = self.key_field;
        self.cur
            .sort_unstable_by(|a, b| compare(a, b, key_field));

        let file = tempfile::tempfile_in(&self.temp_dir)
            .context("failed to create sort run file")?;
        let mut writer = BufWriter::new(file);
        for line in self.cur.drain(..) {
            writer.write_all(&line)?;
            writer.write_all(b"\n")?;
        }
        let mut file = writer.into_inner().context("failed to flush sort run")?;
        file.seek(SeekFrom::Start(0))?;
        self.runs.push(file);
        self.cur_bytes = 0;
        Ok(())
    }

    /// Finish accepting input and return the merged line stream.
    pub fn finish(mut self) -> Result<SortedLines> {
        self.spill()?;
        let mut readers: Vec<BufReader<File>> =
            self.runs.into_iter().map(BufReader::new).collect();

        let mut heap = BinaryHeap::with_capacity(readers.len());
        for src in 0..readers.len() {
            if let Some(line) = read_line(&mut readers[src])? {
                heap.push(Reverse(HeapEntry::new(line, src, self.key_field)));
            }
        }

        Ok(SortedLines {
            readers,
            heap,
            unique: self.unique,
            key_field: self.key_field,
            last: None,
        })
    }
}

fn read_line(reader: &mut BufReader<File>) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line).context("sort run read failed")?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    Ok(Some(line))
}

struct HeapEntry {
    line: Vec<u8>,
    key: (usize, usize),
    src: usize,
}

impl HeapEntry {
    fn new(line: Vec<u8>, src: usize, key_field: Option<usize>) -> Self {
        let key = match key_field {
            None => (0, line.len()),
            Some(idx) => field_range(&line, idx),
        };
        HeapEntry { line, key, src }
    }

    fn key_bytes(&self) -> &[u8] {
        &self.line[self.key.0..self.key.1]
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key_bytes()
            .cmp(other.key_bytes())
            .then_with(|| self.line.cmp(&other.line))
            .then_with(|| self.src.cmp(&other.src))
    }
}

/// Iterator over the merged, ordered lines.
pub struct SortedLines {
    readers: Vec<BufReader<File>>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    unique: bool,
    key_field: Option<usize>,
    last: Option<Vec<u8>>,
}

impl Iterator for SortedLines {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let Reverse(entry) = self.heap.pop()?;
            match read_line(&mut self.readers[entry.src]) {
                Ok(Some(line)) => {
                    self.heap
                        .push(Reverse(HeapEntry::new(line, entry.src, self.key_field)));
                }
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }
            if self.unique {
                if self.last.as_deref() == Some(entry.line.as_slice()) {
                    continue;
                }
                self.last = Some(entry.line.clone());
            }
            return Some(Ok(entry.line));
        }
    }
}
