//! Read normalisation: FASTQ records to `(sequence, name)` rows.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use log::{debug, info};

use crate::config::Config;
use crate::parser::util::{create_gz, finish_gz};
use crate::parser::FastqReader;
use crate::pipeline::targets::mask_non_acgt;

/// Longest read name carried through the pipeline.
const MAX_NAME_LEN: usize = 1000;

/// Truncate an over-long name, marking the cut with "...".
fn clip_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN - 5;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Run the normalisation stage; returns the number of retained reads.
///
/// Bytes outside {A,T,C,G} become X, reads shorter than the minimum are
/// dropped, longer than the maximum are truncated.
pub fn prep_reads(config: &Config, reads_path: &Path) -> Result<u64> {
    let mut reader = FastqReader::new(&config.read_file)?;
    let mut writer = create_gz(reads_path)?;

    let mut kept: u64 = 0;
    let mut dropped: u64 = 0;
    while let Some(mut rec) = reader.next_record()? {
        if rec.seq.len() < config.min_read_length {
            dropped += 1;
            continue;
        }
        mask_non_acgt(&mut rec.seq);
        rec.seq.truncate(config.max_read_length);

        writer.write_all(&rec.seq)?;
        writer.write_all(b"\t")?;
        let name = clip_name(&rec.name);
        writer.write_all(name.as_bytes())?;
        if name.len() < rec.name.len() {
            writer.write_all(b"...")?;
        }
        writer.write_all(b"\n")?;

        kept += 1;
        if kept % 1_000_000 == 0 {
            debug!("normalised {} reads", kept);
        }
    }
    finish_gz(writer)?;

    info!("retained {} reads, dropped {} short reads", kept, dropped);
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MatchMode;
    use std::io::Read;
    use std::path::PathBuf;

    fn test_config(read_file: &Path, min_len: usize, max_len: usize) -> Config {
        Config {
            read_file: read_file.to_path_buf(),
            gene_file: PathBuf::from("genes.txt"),
            gene_id_file: PathBuf::from("gene_ids.txt"),
            windows: vec![0],
            window_width: 4,
            bloom_size: 1 << 16,
            num_hash: 3,
            p_match: 1.0,
            min_dinuc: 0,
            min_read_length: min_len,
            max_read_length: max_len,
            max_matches: 4,
            max_merge_procs: 1,
            match_mode: MatchMode::First,
            mm_tol: 0,
            temp_dir: None,
            rev: false,
        }
    }

    fn read_gz(path: &Path) -> String {
        let mut text = String::new();
        crate::parser::util::open_gz(path)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        text
    }

    #[test]
    fn test_normalises_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let fastq = dir.path().join("r.fastq");
        std::fs::write(
            &fastq,
            "@r1\nACGTNACGTA\n+\nIIIIIIIIII\n@r2\nACG\n+\nIII\n@r3\nTTTTT\n+\nIIIII\n",
        )
        .unwrap();
        let config = test_config(&fastq, 4, 8);
        let out = dir.path().join("reads.txt.gz");

        let kept = prep_reads(&config, &out).unwrap();
        assert_eq!(kept, 2);
        // r1 is masked and truncated to 8 bases; r2 is too short; r3 kept.
        assert_eq!(read_gz(&out), "ACGTXACG\t@r1\nTTTTT\t@r3\n");
    }

    #[test]
    fn test_long_name_is_clipped() {
        let dir = tempfile::tempdir().unwrap();
        let fastq = dir.path().join("r.fastq");
        let long_name = format!("@{}", "n".repeat(1200));
        std::fs::write(&fastq, format!("{}\nACGTACGT\n+\nIIIIIIII\n", long_name)).unwrap();
        let config = test_config(&fastq, 4, 100);
        let out = dir.path().join("reads.txt.gz");

        prep_reads(&config, &out).unwrap();
        let text = read_gz(&out);
        let name = text.trim_end().split('\t').nth(1).unwrap();
        assert_eq!(name.len(), 998);
        assert!(name.ends_with("..."));
    }

    #[test]
    fn test_empty_fastq_keeps_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fastq = dir.path().join("r.fastq");
        std::fs::write(&fastq, "").unwrap();
        let config = test_config(&fastq, 4, 8);
        let out = dir.path().join("reads.txt.gz");
        assert_eq!(prep_reads(&config, &out).unwrap(), 0);
    }
}
