//! Functionality directly related to demultiplexing a [`RecordSet`] of FASTQ records.

use std::iter::IntoIterator;

use anyhow::{ensure, Result};
use bstr::ByteSlice;
use itertools::Itertools;
use log::debug;
use seq_io::{
    fastq::{OwnedRecord, RecordSet, RefRecord},
    BaseRecord,
};

use crate::{
    distance::{DistanceAlgorithm, DistanceKind, Hamming, Indel, IndelMismatchFirst, KmpHamming},
    matcher::{Locator, LocatorConfig},
    metrics::{CorrectionLog, DemultiplexStats, QualityEncoding},
    sample_metadata::SampleCatalog,
    trim::{TrimConfig, Trimmer},
    utils::MultiZip,
};

/// A [`PerFastqRecordSet`] is a collection of [`RecordSet`], one for each input FASTQ of a unit.
#[derive(Debug)]
pub struct PerFastqRecordSet {
    /// The record sets, one per FASTQ
    per_raw_fastq_reads: Vec<RecordSet>,
}

impl PerFastqRecordSet {
    /// Create a new [`PerFastqRecordSet`] from a [`Vec`] of [`RecordSet`].
    ///
    /// Each record set must contain the same number of reads.
    pub fn new(per_raw_fastq_reads: Vec<RecordSet>) -> Result<Self> {
        ensure!(
            per_raw_fastq_reads.iter().all(|s| s.len() == per_raw_fastq_reads[0].len()),
            "Unequal number of reads in each record set (likely uneven input FASTQs)"
        );
        Ok(Self { per_raw_fastq_reads })
    }

    /// The number of fragments in the set.
    pub fn len(&self) -> usize {
        self.per_raw_fastq_reads.first().map_or(0, RecordSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A trait that defines what is necessary to demultiplex a [`PerFastqRecordSet`].
pub trait Demultiplex: Send + Sync {
    /// Demultiplex a [`PerFastqRecordSet`].
    fn demultiplex(&self, record_set: &PerFastqRecordSet) -> Result<DemuxedGroup>;
    /// Get the index of the undetermined output.
    fn undetermined_index(&self) -> usize;
}

/// Locates, trims and routes every fragment, generic over the distance strategy.
pub struct Demultiplexer<'a, D: DistanceAlgorithm> {
    catalog: &'a SampleCatalog,
    locator: Locator<'a, D>,
    trimmer: Trimmer<'a, D>,
    encoding: QualityEncoding,
    /// The number of FASTQs per unit, one for single end and two for paired end.
    num_fastqs: usize,
}

impl<'a, D: DistanceAlgorithm> Demultiplexer<'a, D> {
    pub fn new(
        catalog: &'a SampleCatalog,
        locator_config: LocatorConfig,
        trim_config: TrimConfig,
        distance: D,
        encoding: QualityEncoding,
        paired: bool,
    ) -> Self {
        Self {
            catalog,
            locator: Locator::new(catalog, locator_config, distance.clone()),
            trimmer: Trimmer::new(catalog, trim_config, distance),
            encoding,
            num_fastqs: if paired { 2 } else { 1 },
        }
    }

    /// Mates must share a name up to the first space.
    fn check_read_names(reads: &[RefRecord]) -> Result<()> {
        let first_head = reads[0].head();
        let end_index = first_head.find_byte(b' ').unwrap_or(first_head.len());
        for read in reads.iter().dropping(1) {
            let cur_head = read.head();
            let ok = cur_head.len() == end_index
                || (cur_head.len() > end_index && cur_head[end_index] == b' ');
            let ok = ok && first_head[0..end_index] == cur_head[0..end_index];
            ensure!(
                ok,
                "Read names did not match: {:?} != {:?}",
                String::from_utf8_lossy(first_head),
                String::from_utf8_lossy(cur_head)
            );
        }
        Ok(())
    }
}

impl<'a, D: DistanceAlgorithm> Demultiplex for Demultiplexer<'a, D> {
    fn demultiplex(&self, record_set: &PerFastqRecordSet) -> Result<DemuxedGroup> {
        ensure!(
            record_set.per_raw_fastq_reads.len() == self.num_fastqs,
            "Expected {} FASTQs per input, found {}",
            self.num_fastqs,
            record_set.per_raw_fastq_reads.len()
        );

        let num_samples = self.catalog.len();
        let undetermined = self.undetermined_index();
        let mut group = DemuxedGroup::new(num_samples, self.num_fastqs, self.encoding);

        let iterators =
            record_set.per_raw_fastq_reads.iter().map(IntoIterator::into_iter).collect();
        for zipped_reads in MultiZip::new(iterators) {
            if self.num_fastqs > 1 {
                Self::check_read_names(&zipped_reads)?;
            }
            let read1 = &zipped_reads[0];
            let read2 = zipped_reads.get(1);

            let located = match self.locator.locate(read1.seq(), read2.map(BaseRecord::seq)) {
                Ok(located) => located,
                Err(invalid) => {
                    let quals = zipped_reads.iter().map(BaseRecord::qual).collect_vec();
                    group.stats.record_undetermined(invalid, &quals);
                    group.push(undetermined, zipped_reads.iter().map(RefRecord::to_owned_record));
                    continue;
                }
            };

            let fragment = self.trimmer.trim(read1, read2, &located);
            group.corrections.record(&located, fragment.trim_category);
            match fragment.rejection {
                Some(rejection) => {
                    debug!(
                        "Rejected {} for sample {}: {} {}",
                        String::from_utf8_lossy(read1.head()),
                        self.catalog.samples()[fragment.sample_index].sample_id,
                        rejection.reason(),
                        fragment.comment
                    );
                    group.stats.record_rejected(
                        fragment.sample_index,
                        fragment.mismatches,
                        rejection,
                    );
                    group.push(undetermined, zipped_reads.iter().map(RefRecord::to_owned_record));
                }
                None => {
                    let mut quals: Vec<&[u8]> = vec![&fragment.read1.qual];
                    if let Some(read2) = &fragment.read2 {
                        quals.push(&read2.qual);
                    }
                    group.stats.record_assigned(fragment.sample_index, fragment.mismatches, &quals);
                    group.push(
                        fragment.sample_index,
                        std::iter::once(fragment.read1).chain(fragment.read2),
                    );
                }
            }
        }

        Ok(group)
    }

    #[inline]
    fn undetermined_index(&self) -> usize {
        self.catalog.undetermined_index()
    }}

/// Builds the [`Demultiplex`] implementation for the chosen distance strategy.
pub fn build_demultiplexer<'a>(
    kind: DistanceKind,
    catalog: &'a SampleCatalog,
    locator_config: LocatorConfig,
    trim_config: TrimConfig,
    encoding: QualityEncoding,
    paired: bool,
) -> Box<dyn Demultiplex + 'a> {
    match kind {
        DistanceKind::Hamming => Box::new(Demultiplexer::new(
            catalog,
            locator_config,
            trim_config,
            Hamming,
            encoding,
            paired,
        )),
        DistanceKind::Kmp => Box::new(Demultiplexer::new(
            catalog,
            locator_config,
            trim_config,
            KmpHamming,
            encoding,
            paired,
        )),
        DistanceKind::Indel => Box::new(Demultiplexer::new(
            catalog,
            locator_config,
            trim_config,
            Indel,
            encoding,
            paired,
        )),
        DistanceKind::IndelMismatch => Box::new(Demultiplexer::new(
            catalog,
            locator_config,
            trim_config,
            IndelMismatchFirst,
            encoding,
            paired,
        )),
    }
}

/// Helper struct that has a vector where each element corresponds to an output FASTQ file.
/// Each inner vector is a vector of [`OwnedRecord`]s to write to the specified FASTQ file.
#[derive(Debug)]
pub struct OutputPerSampleReads {
    /// A vec of vecs to hold reads that go to each output FASTQ file.
    pub per_fastq_reads: Vec<Vec<OwnedRecord>>,
}

impl OutputPerSampleReads {
    /// Create a new [`OutputPerSampleReads`] with space preallocated for each of the fastqs.
    pub fn new(number_of_fastqs_for_sample: usize) -> Self {
        Self { per_fastq_reads: vec![vec![]; number_of_fastqs_for_sample] }
    }

    /// Check if all `per_fastq_reads` are empty.
    pub fn is_empty(&self) -> bool {
        self.per_fastq_reads.iter().all(Vec::is_empty)
    }

    /// Get the number of fragments that have been added.
    pub fn len(&self) -> usize {
        self.per_fastq_reads.first().map_or(0, Vec::len)
    }
}

/// The reads of one chunk grouped by output, plus that chunk's statistics.
#[derive(Debug)]
pub struct DemuxedGroup {
    /// The [`OutputPerSampleReads`] for each sample, with undetermined last.
    pub per_sample_reads: Vec<OutputPerSampleReads>,
    pub stats: DemultiplexStats,
    pub corrections: CorrectionLog,
}

impl DemuxedGroup {
    pub fn new(num_samples: usize, num_fastqs: usize, encoding: QualityEncoding) -> Self {
        Self {
            per_sample_reads: (0..=num_samples)
                .map(|_| OutputPerSampleReads::new(num_fastqs))
                .collect(),
            stats: DemultiplexStats::new(num_samples, encoding),
            corrections: CorrectionLog::new(num_samples),
        }
    }

    /// Adds one fragment, read 1 first, to an output.
    fn push(&mut self, output: usize, reads: impl Iterator<Item = OwnedRecord>) {
        for (fastq, read) in self.per_sample_reads[output].per_fastq_reads.iter_mut().zip(reads) {
            fastq.push(read);
        }
    }
}
