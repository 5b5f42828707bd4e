//! Writes the reads of one output (a sample or the undetermined sink) to its FASTQ files.

use anyhow::{ensure, Context, Result};
use pooled_writer::PooledWriter;
use seq_io::BaseRecord;

use crate::demux::OutputPerSampleReads;

/// The [`PooledWriter`]s of one output, read 1 first.
///
/// One call to [`PooledSampleWriter::write_records`] writes every mate of every fragment it is
/// given, so holding the lock on a writer for the call keeps the mates of a fragment together.
#[derive(Debug)]
pub struct PooledSampleWriter {
    pub name: String,
    pub writers: Vec<PooledWriter>,
    pub fragments_written: usize,
}

impl PooledSampleWriter {
    pub fn new(name: impl Into<String>, writers: Vec<PooledWriter>) -> Result<Self> {
        ensure!(!writers.is_empty(), "At least one writer must be provided");
        Ok(Self { name: name.into(), writers, fragments_written: 0 })
    }

    /// Write the demultiplexed reads to each of their respective FASTQ files.
    pub fn write_records(&mut self, sample_reads: OutputPerSampleReads) -> Result<()> {
        ensure!(
            sample_reads.per_fastq_reads.len() == self.writers.len(),
            "Expected reads for {} FASTQs for {}, found {}",
            self.writers.len(),
            self.name,
            sample_reads.per_fastq_reads.len()
        );
        let fragments = sample_reads.len();
        for (reads, writer) in sample_reads.per_fastq_reads.into_iter().zip(self.writers.iter_mut())
        {
            for read in reads {
                read.write(writer)
                    .with_context(|| format!("Failed to write a read for {}", self.name))?;
            }
        }
        self.fragments_written += fragments;
        Ok(())
    }

    /// Consumes [`Self`]. For each held writer, call finish and drop to flush all writers.
    pub fn finish(self) -> Result<()> {
        for writer in self.writers {
            writer.close().with_context(|| format!("Failed to close output for {}", self.name))?;
        }
        Ok(())
    }
}
