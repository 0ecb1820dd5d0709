//! Shared file-handling helpers.
//!
//! External inputs may be plain or gzip-compressed (detected from the
//! file name); every intermediate file the pipeline writes is a gzip
//! stream.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// Buffered writer for a gzip-compressed intermediate file.
pub type GzWriter = BufWriter<GzEncoder<File>>;

/// Open an input file, transparently decompressing if it ends in ".gz".
pub fn open_input(path: &Path) -> Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    if path.to_string_lossy().ends_with(".gz") {
        Ok(Box::new(BufReader::new(GzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Open a gzip-compressed intermediate file for reading.
pub fn open_gz(path: &Path) -> Result<BufReader<GzDecoder<File>>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(BufReader::new(GzDecoder::new(file)))
}

/// Create a gzip-compressed intermediate file for writing.
///
/// Fast compression: the intermediates are throughput-bound scratch
/// files, not archives.
pub fn create_gz(path: &Path) -> Result<GzWriter> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    Ok(BufWriter::new(GzEncoder::new(file, Compression::fast())))
}

/// Flush and finalise a gzip writer, surfacing any deferred I/O error.
pub fn finish_gz(writer: GzWriter) -> Result<()> {
    let encoder = writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("failed to flush output: {}", e.error()))?;
    let mut file = encoder.finish().context("failed to finish gzip stream")?;
    use std::io::Write;
    file.flush().context("failed to flush output file")?;
    Ok(())
}

/// Writer for a user-facing file: gzip-compressed when the name ends in
/// ".gz", plain text otherwise.
pub struct OutputFile {
    inner: OutputInner,
}

enum OutputInner {
    Plain(BufWriter<File>),
    Gz(GzWriter),
}

impl OutputFile {
    pub fn create(path: &Path) -> Result<Self> {
        if path.to_string_lossy().ends_with(".gz") {
            Ok(OutputFile {
                inner: OutputInner::Gz(create_gz(path)?),
            })
        } else {
            let file = File::create(path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            Ok(OutputFile {
                inner: OutputInner::Plain(BufWriter::new(file)),
            })
        }
    }

    pub fn finish(self) -> Result<()> {
        use std::io::Write;
        match self.inner {
            OutputInner::Plain(mut w) => w.flush().context("failed to flush output file"),
            OutputInner::Gz(w) => finish_gz(w),
        }
    }
}

impl std::io::Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            OutputInner::Plain(w) => w.write(buf),
            OutputInner::Gz(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            OutputInner::Plain(w) => w.flush(),
            OutputInner::Gz(w) => w.flush(),
        }
    }
}
