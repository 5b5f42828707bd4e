//! Removes the barcode scaffolding from located fragments and cuts away read-through.
//!
//! For each mate the [`Trimmer`] strips the leading barcode and cut-site remnant, then looks for
//! the point where the read ran past the end of the fragment into the far cut site, the other
//! mate's barcode, or the adaptor.  When the two mates of a pair end up at different lengths
//! their ends are compared against each other and the longer mate is cut back if they agree.
//! The outcome of every fragment is summarised as a [`TrimCategory`].
//!
//! Single and double barcode designs share one code path: the only differences are where read 2's
//! scaffold ends and which sequence is expected to follow read 1's far cut site.

use std::ops::Range;

use bstr::BString;
use seq_io::{fastq::OwnedRecord, BaseRecord};
use strum::{Display, EnumCount, EnumIter};

use crate::distance::{DistanceAlgorithm, Location};
use crate::matcher::{LocatedFragment, Mate, MatchResult};
use crate::sample_metadata::{Sample, SampleCatalog};
use crate::sequence::reverse_complement;

/// The base written in place of an empty read.
pub const PLACEHOLDER_BASE: u8 = b'N';
/// The quality written in place of an empty read.
pub const PLACEHOLDER_QUAL: u8 = b'#';

/// How the lengths of a fragment's reads were settled.  Exactly one applies per fragment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, EnumCount,
)]
#[strum(serialize_all = "snake_case")]
pub enum TrimCategory {
    /// Single end read-through was trimmed, or both mates agree.
    TrimOk,
    /// Read 1 was cut back to agree with read 2.
    R1Corrected,
    /// Read 2 was cut back to agree with read 1.
    R2Corrected,
    /// Only read 1 ran through and it was left longer than read 2.
    R1NotCorrected,
    /// Only read 2 ran through and it was left longer than read 1.
    R2NotCorrected,
    /// Neither mate needed trimming.
    NotR1NotR2,
    NotR1TrimR2Ok,
    NotR1TrimR2Fail,
    TrimR1NotR2Fail,
    TrimR1TrimR2LongR1,
    TrimR1TrimR2LongR2,
    TrimR1TrimR2Ok,
}

/// Why a located fragment is not written to its sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rejection {
    /// Read 1 is shorter than the minimum length after trimming.
    TooShort,
    /// A trimmed read still contains an `N`.
    ContainsN { mate: Mate },
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::TooShort => "too_short",
            Rejection::ContainsN { .. } => "contains_n",
        }
    }

    pub fn mate(&self) -> Mate {
        match self {
            Rejection::TooShort => Mate::R1,
            Rejection::ContainsN { mate } => *mate,
        }
    }
}

/// A located fragment after trimming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedFragment {
    pub sample_index: usize,
    pub read1: OwnedRecord,
    pub read2: Option<OwnedRecord>,
    /// Barcode plus enzyme mismatches over both mates.
    pub mismatches: usize,
    pub trim_category: TrimCategory,
    /// Set when the fragment must go to the undetermined output instead of its sample.
    pub rejection: Option<Rejection>,
    /// Where each mate was cut, for debugging.
    pub comment: String,
}

/// Settings for the [`Trimmer`].
#[derive(Debug, Clone)]
pub struct TrimConfig {
    /// The barcode budget for samples without an override.
    pub barcode_mismatches: usize,
    pub enzyme_mismatches: usize,
    pub adaptor_mismatches: usize,
    /// The adaptor bases searched for, already cut to the compare length.
    pub adaptor: BString,
    /// Keep the cut-site remnant bases at both ends of the insert.
    pub keep_cut_sites: bool,
    /// RAD mode: read 2 has no cut site of its own and read-through is found by the adaptor only.
    pub rad: bool,
    /// Only accept a far cut site in read 1 when the expected sequence follows it.
    pub complete_check: bool,
    /// Fragments whose read 1 is shorter than this are rejected.
    pub min_length: usize,
    /// Keep fragments whose reads contain `N`.
    pub keep_n: bool,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            barcode_mismatches: 1,
            enzyme_mismatches: 1,
            adaptor_mismatches: 3,
            adaptor: BString::from(&crate::matcher::DEFAULT_ADAPTOR[..10]),
            keep_cut_sites: false,
            rad: false,
            complete_check: false,
            min_length: 0,
            keep_n: false,
        }
    }
}

/// What told us a read ran past the end of its fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum ReadThrough {
    /// The far cut site alone.
    CutSite,
    /// The far cut site and the sequence that must follow it.
    CutSiteAndFollower,
    /// The adaptor without a cut site.
    Adaptor,
}

/// The kept range of one mate.
#[derive(Debug, Clone)]
struct TrimmedMate {
    range: Range<usize>,
    read_through: Option<ReadThrough>,
    /// The number of leading bases taken up by the barcode and remnant.
    scaffold_len: usize,
}

impl TrimmedMate {
    fn len(&self) -> usize {
        self.range.len()
    }

    fn truncate(&mut self, len: usize) {
        if len < self.len() {
            self.range.end = self.range.start + len;
        }
    }
}

/// How differing mate lengths were dealt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconciliation {
    /// The lengths already agreed, or nothing was trimmed.
    Unneeded,
    /// `long` was the longer mate and `corrected` is the mate whose end was moved.
    Corrected { long: Mate, corrected: Mate },
    /// The mates disagree and `long` was left longer.
    Failed { long: Mate },
}

/// Trims located fragments.
pub struct Trimmer<'a, D: DistanceAlgorithm> {
    samples: &'a [Sample],
    longest_barcode: usize,
    config: TrimConfig,
    distance: D,
}

impl<'a, D: DistanceAlgorithm> Trimmer<'a, D> {
    pub fn new(catalog: &'a SampleCatalog, config: TrimConfig, distance: D) -> Self {
        Self {
            samples: catalog.samples(),
            longest_barcode: catalog.longest_barcode(),
            config,
            distance,
        }
    }

    /// Trims a fragment that the locator assigned to a sample.
    pub fn trim<R: BaseRecord>(
        &self,
        read1: &R,
        read2: Option<&R>,
        located: &LocatedFragment,
    ) -> ProcessedFragment {
        let m1 = &located.read1;
        let sample = &self.samples[m1.sample_index];

        let mut t1 = self.trim_read1(read1.seq(), sample, located);
        let mut t2 = read2.map(|r| self.trim_read2(r.seq(), sample, located));

        let outcome = match (&mut t2, read2) {
            (Some(t2), Some(read2)) if t1.read_through.is_some() || t2.read_through.is_some() => {
                self.reconcile(read1.seq(), &mut t1, read2.seq(), t2, m1, sample)
            }
            _ => Reconciliation::Unneeded,
        };
        let trim_category = classify(
            t2.is_some(),
            t1.read_through.is_some(),
            t2.as_ref().map_or(false, |t| t.read_through.is_some()),
            outcome,
        );

        let seq1 = &read1.seq()[t1.range.clone()];
        let seq2 = read2.zip(t2.as_ref()).map(|(r, t)| &r.seq()[t.range.clone()]);
        let rejection = self.rejection(seq1, seq2);

        let comment = format!(
            "R1:{}{}",
            describe(&t1),
            t2.as_ref().map(|t| format!(" R2:{}", describe(t))).unwrap_or_default()
        );

        ProcessedFragment {
            sample_index: m1.sample_index,
            read1: trimmed_record(read1, t1.range),
            read2: read2.zip(t2).map(|(r, t)| trimmed_record(r, t.range)),
            mismatches: located.mismatches(),
            trim_category,
            rejection,
            comment,
        }
    }

    fn trim_read1(&self, seq: &[u8], sample: &Sample, located: &LocatedFragment) -> TrimmedMate {
        let m1 = &located.read1;
        let kept_site = if self.config.keep_cut_sites { 0 } else { m1.enzyme_len };
        let start = (m1.start_offset + m1.barcode_len + kept_site).min(seq.len());
        let padding = self.longest_barcode.saturating_sub(sample.barcode.len());
        let end = seq.len().saturating_sub(padding).max(start);
        let insert = &seq[start..end];

        let (cut, read_through) = match self.read1_read_through(insert, sample, located) {
            Some((cut, evidence)) => (cut, Some(evidence)),
            None => (insert.len(), None),
        };
        TrimmedMate { range: start..start + cut, read_through, scaffold_len: m1.scaffold_len() }
    }

    /// Where read 1 runs past the far end of the fragment, relative to the insert start.
    fn read1_read_through(
        &self,
        insert: &[u8],
        sample: &Sample,
        located: &LocatedFragment,
    ) -> Option<(usize, ReadThrough)> {
        if !self.config.rad {
            let follower = match (&sample.barcode2, located.read2.is_some()) {
                (Some(barcode2), true) => (
                    reverse_complement(barcode2),
                    sample.barcode_mismatches(self.config.barcode_mismatches),
                ),
                _ => (self.config.adaptor.to_vec(), self.config.adaptor_mismatches),
            };

            let found = sample
                .far_enzyme()
                .complement_remnants()
                .filter(|site| !site.is_empty())
                .filter_map(|site| self.find_cut_site(insert, &site, &follower))
                .min_by_key(|(loc, _)| loc.start);
            if let Some((loc, evidence)) = found {
                let cut = if self.config.keep_cut_sites { loc.end() } else { loc.start };
                return Some((cut, evidence));
            }
        }
        self.find_adaptor(insert)
    }

    /// Finds one far cut site, with the follower behind it when a complete check is asked for.
    fn find_cut_site(
        &self,
        insert: &[u8],
        site: &[u8],
        (follower, follower_mismatches): &(Vec<u8>, usize),
    ) -> Option<(Location, ReadThrough)> {
        let enzyme_mm = self.config.enzyme_mismatches;
        if self.config.complete_check && !follower.is_empty() {
            let loc =
                self.distance.index_of2(insert, site, follower, enzyme_mm, *follower_mismatches)?;
            let site_len = self
                .distance
                .equivalent_distance(&insert[loc.start..], site, enzyme_mm)
                .map_or(loc.len, |eq| eq.matched_len);
            let evidence = if loc.len > site_len {
                ReadThrough::CutSiteAndFollower
            } else {
                ReadThrough::CutSite
            };
            Some((Location { start: loc.start, len: site_len }, evidence))
        } else {
            self.distance.index_of(insert, site, enzyme_mm).map(|loc| (loc, ReadThrough::CutSite))
        }
    }

    fn find_adaptor(&self, insert: &[u8]) -> Option<(usize, ReadThrough)> {
        if self.config.adaptor.is_empty() {
            return None;
        }
        self.distance
            .index_of(insert, &self.config.adaptor, self.config.adaptor_mismatches)
            .map(|loc| (loc.start, ReadThrough::Adaptor))
    }

    fn trim_read2(&self, seq: &[u8], sample: &Sample, located: &LocatedFragment) -> TrimmedMate {
        let (start, scaffold_len) = match &located.read2 {
            Some(m2) => {
                let kept_site = if self.config.keep_cut_sites { 0 } else { m2.enzyme_len };
                ((m2.start_offset + m2.barcode_len + kept_site).min(seq.len()), m2.scaffold_len())
            }
            None if self.config.rad => (0, 0),
            None => {
                let site_len = self.leading_remnant(seq, sample);
                let strip = if self.config.keep_cut_sites { 0 } else { site_len };
                (strip, site_len)
            }
        };
        let insert = &seq[start..];

        let m1 = &located.read1;
        let mut scaffold = sample.barcode.to_vec();
        scaffold.extend_from_slice(&m1.enzyme_site);
        let scaffold = reverse_complement(&scaffold);
        let scaffold_mm =
            sample.barcode_mismatches(self.config.barcode_mismatches) + self.config.enzyme_mismatches;

        let found = self
            .distance
            .index_of2(
                insert,
                &scaffold,
                &self.config.adaptor,
                scaffold_mm,
                self.config.adaptor_mismatches,
            )
            .map(|loc| {
                let scaffold_len = self
                    .distance
                    .equivalent_distance(&insert[loc.start..], &scaffold, scaffold_mm)
                    .map_or(loc.len, |eq| eq.matched_len);
                let evidence = if loc.len > scaffold_len && !self.config.adaptor.is_empty() {
                    ReadThrough::CutSiteAndFollower
                } else {
                    ReadThrough::CutSite
                };
                let kept = if self.config.keep_cut_sites {
                    m1.enzyme_len.min(scaffold_len)
                } else {
                    0
                };
                (loc.start + kept, evidence)
            })
            .or_else(|| self.find_adaptor(insert));

        let (cut, read_through) = match found {
            Some((cut, evidence)) => (cut, Some(evidence)),
            None => (insert.len(), None),
        };
        TrimmedMate { range: start..start + cut, read_through, scaffold_len }
    }

    /// The length of the far enzyme's remnant at the very start of read 2, or 0.
    fn leading_remnant(&self, seq: &[u8], sample: &Sample) -> usize {
        sample
            .far_enzyme()
            .cut_site_remnants()
            .iter()
            .filter(|site| !site.is_empty())
            .filter_map(|site| {
                self.distance.equivalent_distance(seq, site, self.config.enzyme_mismatches)
            })
            .min_by_key(|eq| eq.distance)
            .map_or(0, |eq| eq.matched_len)
    }

    /// Brings the two mates to a common length when their ends agree.
    fn reconcile(
        &self,
        seq1: &[u8],
        t1: &mut TrimmedMate,
        seq2: &[u8],
        t2: &mut TrimmedMate,
        m1: &MatchResult,
        sample: &Sample,
    ) -> Reconciliation {
        if t1.len() == t2.len() {
            return Reconciliation::Unneeded;
        }
        let window = m1.barcode_len + m1.enzyme_len;
        let budget =
            sample.barcode_mismatches(self.config.barcode_mismatches) + self.config.enzyme_mismatches;

        let (long_mate, short_mate) = if t1.len() > t2.len() {
            (Mate::R1, Mate::R2)
        } else {
            (Mate::R2, Mate::R1)
        };
        let (short, long) = match long_mate {
            Mate::R1 => ((seq2, &mut *t2), (seq1, &mut *t1)),
            Mate::R2 => ((seq1, &mut *t1), (seq2, &mut *t2)),
        };
        let (short_seq, short_t) = short;
        let (long_seq, long_t) = long;
        let short_bases = &short_seq[short_t.range.clone()];
        let long_bases = &long_seq[long_t.range.clone()];

        if self.tails_agree(short_bases, long_bases, window, budget) {
            long_t.truncate(short_t.len());
            return Reconciliation::Corrected { long: long_mate, corrected: long_mate };
        }

        let strip = long_t.scaffold_len;
        if short_t.read_through != Some(ReadThrough::CutSiteAndFollower)
            && strip > 0
            && strip < short_bases.len()
        {
            let stripped = &short_bases[..short_bases.len() - strip];
            if self.tails_agree(stripped, long_bases, window, budget) {
                let len = stripped.len();
                short_t.truncate(len);
                long_t.truncate(len);
                return Reconciliation::Corrected { long: long_mate, corrected: short_mate };
            }
        }
        Reconciliation::Failed { long: long_mate }
    }

    /// True if the end of `short` is the reverse complement of the start of `long`.
    fn tails_agree(&self, short: &[u8], long: &[u8], window: usize, budget: usize) -> bool {
        let k = window.min(short.len()).min(long.len());
        if k == 0 {
            return false;
        }
        let head = reverse_complement(&long[..k]);
        self.distance.is_equivalent(&short[short.len() - k..], &head, budget)
    }

    fn rejection(&self, seq1: &[u8], seq2: Option<&[u8]>) -> Option<Rejection> {
        if seq1.len() < self.config.min_length {
            return Some(Rejection::TooShort);
        }
        if !self.config.keep_n {
            if bytecount::count(seq1, b'N') > 0 {
                return Some(Rejection::ContainsN { mate: Mate::R1 });
            }
            if seq2.map_or(false, |s| bytecount::count(s, b'N') > 0) {
                return Some(Rejection::ContainsN { mate: Mate::R2 });
            }
        }
        None
    }
}

/// Maps which mates ran through and how their lengths were settled to one [`TrimCategory`].
fn classify(paired: bool, t1: bool, t2: bool, outcome: Reconciliation) -> TrimCategory {
    use Reconciliation::{Corrected, Failed, Unneeded};
    use TrimCategory::*;

    if !paired {
        return if t1 { TrimOk } else { NotR1NotR2 };
    }
    match (t1, t2, outcome) {
        (false, false, _) => NotR1NotR2,
        (true, true, Failed { long: Mate::R1 }) => TrimR1TrimR2LongR1,
        (true, true, Failed { long: Mate::R2 }) => TrimR1TrimR2LongR2,
        (true, true, _) => TrimR1TrimR2Ok,
        (true, false, Unneeded) => TrimOk,
        (true, false, Corrected { corrected: Mate::R1, .. }) => R1Corrected,
        (true, false, Corrected { corrected: Mate::R2, .. }) => R2Corrected,
        (true, false, Failed { long: Mate::R2 }) => TrimR1NotR2Fail,
        (true, false, Failed { long: Mate::R1 }) => R1NotCorrected,
        (false, true, Failed { long: Mate::R1 }) => NotR1TrimR2Fail,
        (false, true, Failed { long: Mate::R2 }) => R2NotCorrected,
        (false, true, _) => NotR1TrimR2Ok,
    }
}

fn describe(mate: &TrimmedMate) -> String {
    let evidence = mate.read_through.map_or_else(|| "none".to_string(), |e| e.to_string());
    format!("{}..{}({})", mate.range.start, mate.range.end, evidence)
}

/// Copies the kept range of a record, substituting a placeholder base for an empty read.
fn trimmed_record<R: BaseRecord>(record: &R, range: Range<usize>) -> OwnedRecord {
    let (seq, qual) = if range.is_empty() {
        (vec![PLACEHOLDER_BASE], vec![PLACEHOLDER_QUAL])
    } else {
        (record.seq()[range.clone()].to_vec(), record.qual()[range].to_vec())
    };
    OwnedRecord { head: record.head().to_vec(), seq, qual }
}
