//! Readers for the external input formats and compressed intermediates.

pub mod fastq;
pub mod genes;
pub mod util;

pub use fastq::FastqReader;
pub use genes::GeneReader;
