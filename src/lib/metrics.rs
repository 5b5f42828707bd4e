//! Statistics collected while demultiplexing.
//!
//! Every chunk of reads that is demultiplexed produces its own [`DemultiplexStats`] and
//! [`CorrectionLog`].  Workers merge those into run-wide accumulators with `update_with`, and the
//! run-wide accumulators are written once all workers have finished.
//!
//! - [`DemultiplexStats`] holds, per sample, the fragment count, the rejected count, a histogram of
//!   barcode plus enzyme mismatches and the base quality counts of the written reads.  It also
//!   counts why records ended up undetermined.
//! - [`CorrectionLog`] counts, per sample, how the barcode and cut site matched and which
//!   [`TrimCategory`] each fragment fell into.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use ahash::AHashMap;
use anyhow::{Context, Result};
use clap::ArgEnum;
use csv::WriterBuilder;
use fgoxide::io::DelimFile;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    matcher::{InvalidRead, LocatedFragment, Mate},
    sample_metadata::Sample,
    trim::{Rejection, TrimCategory},
};

/// The name of the per-sample statistics file.
pub const DEMULTIPLEX_STATS_FILE: &str = "demultiplex_stats.tsv";
/// The name of the correction log file.
pub const CORRECTION_LOG_FILE: &str = "correction_log.tsv";
/// The name of the file explaining undetermined records.
pub const UNDETERMINED_METRICS_FILE: &str = "undetermined_metrics.tsv";

/// How base qualities are encoded in the input FASTQs.
#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityEncoding {
    Phred33,
    Phred64,
}

impl QualityEncoding {
    /// The ASCII value of quality zero.
    pub fn offset(self) -> u8 {
        match self {
            QualityEncoding::Phred33 => 33,
            QualityEncoding::Phred64 => 64,
        }
    }

    /// Returns the set of possible string values
    pub fn possible_values<'a>() -> impl Iterator<Item = clap::PossibleValue<'a>> {
        QualityEncoding::value_variants().iter().filter_map(ArgEnum::to_possible_value)
    }
}

impl std::str::FromStr for QualityEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        for variant in Self::value_variants() {
            if variant.to_possible_value().map_or(false, |v| v.matches(s, false)) {
                return Ok(*variant);
            }
        }
        Err(format!("Invalid variant: {}", s))
    }
}

/// Base quality totals over a set of reads.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct BaseQualCounter {
    pub bases: u64,
    pub qual_sum: u64,
    pub q30_bases: u64,
}

impl BaseQualCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_with_self(&mut self, other: &Self) {
        self.bases += other.bases;
        self.qual_sum += other.qual_sum;
        self.q30_bases += other.q30_bases;
    }

    /// Adds the qualities of one read.  `offset` is the ASCII value of quality zero.
    pub fn update(&mut self, quals: &[u8], offset: u8) {
        self.bases += quals.len() as u64;
        for q in quals {
            let q = q.saturating_sub(offset);
            self.qual_sum += u64::from(q);
            if q >= 30 {
                self.q30_bases += 1;
            }
        }
    }

    pub fn mean_quality(&self) -> f64 {
        ratio(self.qual_sum, self.bases)
    }

    pub fn percent_q30(&self) -> f64 {
        100.0 * ratio(self.q30_bases, self.bases)
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Why a record was written to the undetermined output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UndeterminedReason {
    /// The locator could not assign the fragment.
    Unassigned(InvalidRead),
    /// The fragment was assigned but rejected after trimming.
    Rejected(Rejection),
}

impl UndeterminedReason {
    pub fn reason(&self) -> &'static str {
        match self {
            UndeterminedReason::Unassigned(invalid) => invalid.reason(),
            UndeterminedReason::Rejected(rejection) => rejection.reason(),
        }
    }

    pub fn mate(&self) -> Mate {
        match self {
            UndeterminedReason::Unassigned(invalid) => invalid.mate(),
            UndeterminedReason::Rejected(rejection) => rejection.mate(),
        }
    }
}

/// Per-sample counters.
#[derive(Debug, Default, Clone)]
pub struct SampleStats {
    /// Every fragment located to the sample, written or rejected.
    pub total: usize,
    pub rejected: usize,
    /// Fragments by their total barcode and enzyme mismatches.
    pub mismatch_counts: Vec<usize>,
    /// Qualities of the reads written to the sample.
    pub base_qual_counter: BaseQualCounter,
}

impl SampleStats {
    pub fn update_with(&mut self, other: &Self) {
        self.total += other.total;
        self.rejected += other.rejected;
        if self.mismatch_counts.len() < other.mismatch_counts.len() {
            self.mismatch_counts.resize(other.mismatch_counts.len(), 0);
        }
        for (s, o) in self.mismatch_counts.iter_mut().zip(other.mismatch_counts.iter()) {
            *s += o;
        }
        self.base_qual_counter.update_with_self(&other.base_qual_counter);
    }

    fn count_mismatches(&mut self, mismatches: usize) {
        if self.mismatch_counts.len() <= mismatches {
            self.mismatch_counts.resize(mismatches + 1, 0);
        }
        self.mismatch_counts[mismatches] += 1;
    }
}

/// Demultiplexing counts for every sample plus the undetermined output.
#[derive(Debug, Clone)]
pub struct DemultiplexStats {
    pub per_sample: Vec<SampleStats>,
    /// Records the locator could not assign.  Their qualities go here too.
    pub undetermined: SampleStats,
    pub undetermined_reasons: AHashMap<UndeterminedReason, usize>,
    quality_offset: u8,
}

impl DemultiplexStats {
    pub fn new(num_samples: usize, encoding: QualityEncoding) -> Self {
        Self {
            per_sample: vec![SampleStats::default(); num_samples],
            undetermined: SampleStats::default(),
            undetermined_reasons: AHashMap::new(),
            quality_offset: encoding.offset(),
        }
    }

    /// Records a fragment that was written to its sample.
    pub fn record_assigned(&mut self, sample_index: usize, mismatches: usize, quals: &[&[u8]]) {
        let stats = &mut self.per_sample[sample_index];
        stats.total += 1;
        stats.count_mismatches(mismatches);
        for q in quals {
            stats.base_qual_counter.update(q, self.quality_offset);
        }
    }

    /// Records a fragment that was located to a sample but rejected after trimming.
    pub fn record_rejected(&mut self, sample_index: usize, mismatches: usize, rejection: Rejection) {
        let stats = &mut self.per_sample[sample_index];
        stats.total += 1;
        stats.rejected += 1;
        stats.count_mismatches(mismatches);
        *self.undetermined_reasons.entry(UndeterminedReason::Rejected(rejection)).or_insert(0) += 1;
    }

    /// Records a fragment the locator could not assign.
    pub fn record_undetermined(&mut self, invalid: InvalidRead, quals: &[&[u8]]) {
        self.undetermined.total += 1;
        for q in quals {
            self.undetermined.base_qual_counter.update(q, self.quality_offset);
        }
        *self.undetermined_reasons.entry(UndeterminedReason::Unassigned(invalid)).or_insert(0) +=
            1;
    }

    pub fn update_with(&mut self, other: Self) {
        for (s, o) in self.per_sample.iter_mut().zip(other.per_sample.iter()) {
            s.update_with(o);
        }
        self.undetermined.update_with(&other.undetermined);
        for (reason, count) in other.undetermined_reasons {
            *self.undetermined_reasons.entry(reason).or_insert(0) += count;
        }
    }

    /// Every fragment processed, assigned or not.
    pub fn grand_total(&self) -> usize {
        self.per_sample.iter().map(|s| s.total).sum::<usize>() + self.undetermined.total
    }

    /// Writes one row per sample and a final undetermined row as TSV.
    ///
    /// `max_mismatches` is the lowest histogram column always written, more columns are added
    /// when a larger count was seen.
    pub fn write<P: AsRef<Path>>(
        &self,
        path: P,
        samples: &[Sample],
        undetermined_name: &str,
        max_mismatches: usize,
    ) -> Result<()> {
        let path = path.as_ref();
        let num_columns = self
            .per_sample
            .iter()
            .chain(std::iter::once(&self.undetermined))
            .map(|s| s.mismatch_counts.len())
            .max()
            .unwrap_or(0)
            .max(max_mismatches + 1);
        let grand_total = self.grand_total() as u64;

        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.to_string_lossy()))?;
        let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(BufWriter::new(file));

        let mut header: Vec<String> =
            ["sample", "barcode", "enzyme", "total_reads", "percent_of_total", "rejected_reads"]
                .iter()
                .map(|s| s.to_string())
                .collect();
        header.push("percent_rejected".to_string());
        header.extend((0..num_columns).map(|i| format!("mismatches_{}", i)));
        header.extend(
            ["bases", "mean_base_quality", "q30_bases", "percent_q30_bases"]
                .iter()
                .map(|s| s.to_string()),
        );
        writer.write_record(&header)?;

        let labelled = samples
            .iter()
            .map(|s| (s.sample_id.clone(), barcode_label(s), enzyme_label(s)))
            .chain(std::iter::once((undetermined_name.to_string(), String::new(), String::new())));
        for ((name, barcode, enzyme), stats) in
            labelled.zip(self.per_sample.iter().chain(std::iter::once(&self.undetermined)))
        {
            let mut row = vec![
                name,
                barcode,
                enzyme,
                stats.total.to_string(),
                format!("{:.4}", 100.0 * ratio(stats.total as u64, grand_total)),
                stats.rejected.to_string(),
                format!("{:.4}", 100.0 * ratio(stats.rejected as u64, grand_total)),
            ];
            row.extend(
                (0..num_columns)
                    .map(|i| stats.mismatch_counts.get(i).copied().unwrap_or(0).to_string()),
            );
            let quals = &stats.base_qual_counter;
            row.push(quals.bases.to_string());
            row.push(format!("{:.4}", quals.mean_quality()));
            row.push(quals.q30_bases.to_string());
            row.push(format!("{:.4}", quals.percent_q30()));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Writes the count of every reason a record went to the undetermined output.
    pub fn write_undetermined_metrics<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let grand_total = self.grand_total() as u64;
        let metrics = self
            .undetermined_reasons
            .iter()
            .map(|(reason, count)| UndeterminedMetric {
                reason: reason.reason().to_string(),
                mate: reason.mate().to_string(),
                count: *count,
                fraction: ratio(*count as u64, grand_total),
            })
            .sorted_by(|a, b| (&a.reason, &a.mate).cmp(&(&b.reason, &b.mate)));
        DelimFile::default().write_tsv(&path, metrics)?;
        Ok(())
    }
}

fn barcode_label(sample: &Sample) -> String {
    match &sample.barcode2 {
        Some(barcode2) => format!("{}+{}", sample.barcode, barcode2),
        None => sample.barcode.to_string(),
    }
}

fn enzyme_label(sample: &Sample) -> String {
    match &sample.enzyme2 {
        Some(enzyme2) => format!("{}+{}", sample.enzyme.name(), enzyme2.name()),
        None => sample.enzyme.name().to_string(),
    }
}

/// One row of the undetermined metrics file.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct UndeterminedMetric {
    pub reason: String,
    pub mate: String,
    pub count: usize,
    /// The fraction of all processed records.
    pub fraction: f64,
}

/// How exactly the barcode and cut site of a located fragment matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter, EnumCount)]
#[strum(serialize_all = "snake_case")]
pub enum BarcodeOutcome {
    Exact,
    BarcodeCorrected,
    EnzymeCorrected,
    BarcodeAndEnzymeCorrected,
}

impl BarcodeOutcome {
    pub fn of(located: &LocatedFragment) -> Self {
        match (located.barcode_mismatches() > 0, located.enzyme_mismatches() > 0) {
            (false, false) => BarcodeOutcome::Exact,
            (true, false) => BarcodeOutcome::BarcodeCorrected,
            (false, true) => BarcodeOutcome::EnzymeCorrected,
            (true, true) => BarcodeOutcome::BarcodeAndEnzymeCorrected,
        }
    }
}

/// Per-sample correction counters.
#[derive(Debug, Default, Clone)]
pub struct SampleCorrections {
    pub barcode_outcomes: [usize; BarcodeOutcome::COUNT],
    /// Fragments whose barcode was found after a non-zero start offset.
    pub shifted_start: usize,
    pub trim_categories: [usize; TrimCategory::COUNT],
}

/// Counts how barcodes matched and how fragments were trimmed, per sample.
#[derive(Debug, Clone)]
pub struct CorrectionLog {
    pub per_sample: Vec<SampleCorrections>,
}

impl CorrectionLog {
    pub fn new(num_samples: usize) -> Self {
        Self { per_sample: vec![SampleCorrections::default(); num_samples] }
    }

    pub fn record(&mut self, located: &LocatedFragment, trim_category: TrimCategory) {
        let corrections = &mut self.per_sample[located.sample_index()];
        corrections.barcode_outcomes[BarcodeOutcome::of(located) as usize] += 1;
        if located.read1.start_offset > 0 {
            corrections.shifted_start += 1;
        }
        corrections.trim_categories[trim_category as usize] += 1;
    }

    pub fn update_with(&mut self, other: Self) {
        for (s, o) in self.per_sample.iter_mut().zip(other.per_sample.into_iter()) {
            for (a, b) in s.barcode_outcomes.iter_mut().zip(o.barcode_outcomes) {
                *a += b;
            }
            s.shifted_start += o.shifted_start;
            for (a, b) in s.trim_categories.iter_mut().zip(o.trim_categories) {
                *a += b;
            }
        }
    }

    /// Writes the barcode correction table, a blank line, then the trim table.
    pub fn write<P: AsRef<Path>>(&self, path: P, samples: &[Sample]) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create {}", path.to_string_lossy()))?;
        let mut out = BufWriter::new(file);

        {
            let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(&mut out);
            let mut header = vec!["sample".to_string()];
            header.extend(BarcodeOutcome::iter().map(|o| o.to_string()));
            header.push("shifted_start".to_string());
            writer.write_record(&header)?;
            for (sample, corrections) in samples.iter().zip(self.per_sample.iter()) {
                let mut row = vec![sample.sample_id.clone()];
                row.extend(corrections.barcode_outcomes.iter().map(|c| c.to_string()));
                row.push(corrections.shifted_start.to_string());
                writer.write_record(&row)?;
            }
            writer.flush()?;
        }
        writeln!(out)?;
        {
            let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(&mut out);
            let mut header = vec!["sample".to_string()];
            header.extend(TrimCategory::iter().map(|c| c.to_string()));
            writer.write_record(&header)?;
            for (sample, corrections) in samples.iter().zip(self.per_sample.iter()) {
                let mut row = vec![sample.sample_id.clone()];
                row.extend(corrections.trim_categories.iter().map(|c| c.to_string()));
                writer.write_record(&row)?;
            }
            writer.flush()?;
        }
        out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bstr::BString;
    use tempfile::tempdir;

    use super::*;
    use crate::enzyme::Enzyme;
    use crate::matcher::MatchResult;

    fn samples() -> Vec<Sample> {
        let enzyme = Arc::new(Enzyme::new("TestI", &["CAGC"], None).unwrap());
        vec![
            Sample::new("S1".to_string(), b"ACGT", enzyme.clone(), 0, None).unwrap(),
            Sample::new("S2".to_string(), b"TTGA", enzyme, 1, None).unwrap(),
        ]
    }

    fn located(
        sample_index: usize,
        barcode_mm: usize,
        enzyme_mm: usize,
        offset: usize,
    ) -> LocatedFragment {
        LocatedFragment {
            read1: MatchResult {
                sample_index,
                start_offset: offset,
                barcode_mismatches: barcode_mm,
                enzyme_mismatches: enzyme_mm,
                barcode_len: 4,
                enzyme_site: BString::from("CAGC"),
                enzyme_len: 4,
            },
            read2: None,
        }
    }

    fn read_rows(path: &Path) -> Vec<Vec<String>> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| l.split('\t').map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_base_qual_counter() {
        let mut counter = BaseQualCounter::new();
        counter.update(b"I+!", 33);
        assert_eq!(counter.bases, 3);
        assert_eq!(counter.qual_sum, 40 + 10);
        assert_eq!(counter.q30_bases, 1);
        let mut phred64 = BaseQualCounter::new();
        phred64.update(b"h", 64);
        assert_eq!(phred64.qual_sum, 40);
        assert_eq!(BaseQualCounter::new().mean_quality(), 0.0);
    }

    #[test]
    fn test_totals_add_up_across_chunks() {
        let mut chunk_a = DemultiplexStats::new(2, QualityEncoding::Phred33);
        chunk_a.record_assigned(0, 0, &[&b"IIII"[..]]);
        chunk_a.record_assigned(0, 2, &[&b"II"[..]]);
        chunk_a.record_undetermined(InvalidRead::NoMatch { mate: Mate::R1 }, &[&b"!!"[..]]);

        let mut chunk_b = DemultiplexStats::new(2, QualityEncoding::Phred33);
        chunk_b.record_rejected(1, 1, Rejection::TooShort);
        chunk_b.record_undetermined(InvalidRead::Ambiguous { mate: Mate::R1 }, &[&b"!!"[..]]);
        chunk_b.record_undetermined(InvalidRead::NoMatch { mate: Mate::R1 }, &[&b"!!"[..]]);

        chunk_a.update_with(chunk_b);
        assert_eq!(chunk_a.grand_total(), 6);
        assert_eq!(chunk_a.per_sample[0].total, 2);
        assert_eq!(chunk_a.per_sample[0].mismatch_counts, vec![1, 0, 1]);
        assert_eq!(chunk_a.per_sample[0].base_qual_counter.bases, 6);
        assert_eq!(chunk_a.per_sample[1].rejected, 1);
        assert_eq!(chunk_a.undetermined.total, 3);
        let no_match = UndeterminedReason::Unassigned(InvalidRead::NoMatch { mate: Mate::R1 });
        assert_eq!(chunk_a.undetermined_reasons[&no_match], 2);
    }

    #[test]
    fn test_write_demultiplex_stats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEMULTIPLEX_STATS_FILE);
        let mut stats = DemultiplexStats::new(2, QualityEncoding::Phred33);
        stats.record_assigned(0, 0, &[&b"IIII"[..]]);
        stats.record_assigned(0, 1, &[&b"++++"[..]]);
        stats.record_rejected(1, 0, Rejection::ContainsN { mate: Mate::R2 });
        stats.record_undetermined(InvalidRead::NoMatch { mate: Mate::R1 }, &[&b"!!"[..]]);
        stats.write(&path, &samples(), "undetermined", 1).unwrap();

        let rows = read_rows(&path);
        assert_eq!(rows.len(), 4);
        assert_eq!(
            rows[0],
            vec![
                "sample",
                "barcode",
                "enzyme",
                "total_reads",
                "percent_of_total",
                "rejected_reads",
                "percent_rejected",
                "mismatches_0",
                "mismatches_1",
                "bases",
                "mean_base_quality",
                "q30_bases",
                "percent_q30_bases"
            ]
        );
        assert_eq!(rows[1][..9], ["S1", "ACGT", "TestI", "2", "50.0000", "0", "0.0000", "1", "1"]);
        assert_eq!(rows[1][9..], ["8", "25.0000", "4", "50.0000"]);
        assert_eq!(rows[2][..7], ["S2", "TTGA", "TestI", "1", "25.0000", "1", "25.0000"]);
        assert_eq!(rows[3][..4], ["undetermined", "", "", "1"]);
    }

    #[test]
    fn test_write_undetermined_metrics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(UNDETERMINED_METRICS_FILE);
        let mut stats = DemultiplexStats::new(1, QualityEncoding::Phred33);
        stats.record_assigned(0, 0, &[&b"II"[..]]);
        stats.record_rejected(0, 0, Rejection::TooShort);
        stats.record_undetermined(InvalidRead::Ambiguous { mate: Mate::R2 }, &[&b"!!"[..]]);
        stats.record_undetermined(InvalidRead::Ambiguous { mate: Mate::R2 }, &[&b"!!"[..]]);
        stats.write_undetermined_metrics(&path).unwrap();

        let metrics: Vec<UndeterminedMetric> = DelimFile::default().read_tsv(&path).unwrap();
        assert_eq!(
            metrics,
            vec![
                UndeterminedMetric {
                    reason: "ambiguous".to_string(),
                    mate: "R2".to_string(),
                    count: 2,
                    fraction: 0.5
                },
                UndeterminedMetric {
                    reason: "too_short".to_string(),
                    mate: "R1".to_string(),
                    count: 1,
                    fraction: 0.25
                },
            ]
        );
    }

    #[test]
    fn test_barcode_outcome() {
        assert_eq!(BarcodeOutcome::of(&located(0, 0, 0, 0)), BarcodeOutcome::Exact);
        assert_eq!(BarcodeOutcome::of(&located(0, 1, 0, 0)), BarcodeOutcome::BarcodeCorrected);
        assert_eq!(BarcodeOutcome::of(&located(0, 0, 1, 0)), BarcodeOutcome::EnzymeCorrected);
        assert_eq!(
            BarcodeOutcome::of(&located(0, 2, 1, 0)),
            BarcodeOutcome::BarcodeAndEnzymeCorrected
        );
    }

    #[test]
    fn test_write_correction_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CORRECTION_LOG_FILE);
        let mut log = CorrectionLog::new(2);
        log.record(&located(0, 0, 0, 0), TrimCategory::TrimOk);
        let mut other = CorrectionLog::new(2);
        other.record(&located(0, 1, 0, 2), TrimCategory::R2Corrected);
        other.record(&located(1, 0, 1, 0), TrimCategory::NotR1NotR2);
        log.update_with(other);
        log.write(&path, &samples()).unwrap();

        let rows = read_rows(&path);
        assert_eq!(rows.len(), 7);
        assert_eq!(
            rows[0],
            vec![
                "sample",
                "exact",
                "barcode_corrected",
                "enzyme_corrected",
                "barcode_and_enzyme_corrected",
                "shifted_start"
            ]
        );
        assert_eq!(rows[1], vec!["S1", "1", "1", "0", "0", "1"]);
        assert_eq!(rows[2], vec!["S2", "0", "0", "1", "0", "0"]);
        assert_eq!(rows[3], vec![""]);
        assert_eq!(rows[4].len(), TrimCategory::COUNT + 1);
        assert_eq!(rows[4][1], "trim_ok");
        assert_eq!(rows[5][..4], ["S1", "1", "0", "1"]);
        assert_eq!(rows[6][6], "1");
    }
}
