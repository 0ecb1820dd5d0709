//! The pipeline stages, in dataflow order.
//!
//! Stages communicate through newline-delimited gzip files in the
//! working directory; between stages the external sorter orders records
//! by a designated field so the next stage can stream a linear merge.

pub mod combine;
pub mod dedup;
pub mod reads;
pub mod scan;
pub mod targets;
pub mod verify;
pub mod windows;

use std::path::Path;

use anyhow::Result;

use crate::extsort::ExtSorter;
use crate::parser::util::{create_gz, finish_gz, open_gz};

/// Split a line into its tab-separated fields.
pub(crate) fn split_fields(line: &[u8]) -> Vec<&[u8]> {
    line.split(|&b| b == b'\t').collect()
}

/// Sort one gzip line file into another.
///
/// `key_field` selects the primary sort field; `unique` drops duplicate
/// lines. Returns the number of lines written.
pub fn sort_gz_file(
    input: &Path,
    output: &Path,
    sort_dir: &Path,
    key_field: Option<usize>,
    unique: bool,
) -> Result<u64> {
    let mut sorter = ExtSorter::new(sort_dir);
    if let Some(idx) = key_field {
        sorter = sorter.key_field(idx);
    }
    if unique {
        sorter = sorter.unique();
    }
    sorter.push_reader(open_gz(input)?)?;

    let mut writer = create_gz(output)?;
    let mut n = 0;
    use std::io::Write;
    for line in sorter.finish()? {
        let line = line?;
        writer.write_all(&line)?;
        writer.write_all(b"\n")?;
        n += 1;
    }
    finish_gz(writer)?;
    Ok(n)
}
