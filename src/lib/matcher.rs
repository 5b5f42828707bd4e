//! Locates the sample barcode and enzyme cut-site remnant at the start of a read.
//!
//! The locator tries start offsets from zero up to a configured limit.  At each offset every
//! sample's barcode is compared against the read, and for each barcode that fits its budget the
//! bases that follow are compared against the sample enzyme's remnants.  The first offset with any
//! hit decides the outcome: a single hit is the answer, more than one is ambiguous and the read is
//! not assigned.  In double-barcode mode read 2 is then searched the same way, restricted to the
//! samples that read 1 allowed.

use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use bstr::BString;
use cached::SizedCache;
use strum::{Display, EnumIter};

use crate::distance::{DistanceAlgorithm, Equivalence};
use crate::enzyme::Enzyme;
use crate::sample_metadata::{Sample, SampleCatalog};
use crate::sequence::decode_self_correcting;

/// The largest start offset that is ever searched.
pub const MAX_START_OFFSET: usize = 20;

/// The default common adaptor that follows a fragment's far end.
pub const DEFAULT_ADAPTOR: &str = "AGATCGGAAGAGCG";

thread_local! (
    /// Read-1 candidate sets, keyed by the locator that produced them and the leading bases of the
    /// read that the decision depends on.
    static CACHE: RefCell<SizedCache<(usize, Vec<u8>), Result<Vec<MatchResult>, InvalidRead>>> =
    RefCell::new(SizedCache::with_size(100_000))
);

/// Gives each locator its own cache namespace.
static NEXT_LOCATOR_ID: AtomicUsize = AtomicUsize::new(0);

/// One of the two reads of a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter)]
pub enum Mate {
    R1,
    R2,
}

/// Why a fragment could not be assigned to a sample.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidRead {
    #[error("no sample barcode and cut site found in {mate}")]
    NoMatch { mate: Mate },

    #[error("{mate} matches more than one sample")]
    Ambiguous { mate: Mate },

    #[error("{mate} has the adaptor ligated directly after the cut site")]
    AdaptorLigation { mate: Mate },
}

impl InvalidRead {
    /// The mate that caused the failure.
    pub fn mate(&self) -> Mate {
        match self {
            InvalidRead::NoMatch { mate }
            | InvalidRead::Ambiguous { mate }
            | InvalidRead::AdaptorLigation { mate } => *mate,
        }
    }

    /// A short machine-friendly name of the reason.
    pub fn reason(&self) -> &'static str {
        match self {
            InvalidRead::NoMatch { .. } => "no_match",
            InvalidRead::Ambiguous { .. } => "ambiguous",
            InvalidRead::AdaptorLigation { .. } => "adaptor_ligation",
        }
    }
}

/// Where a sample's barcode and cut-site remnant were found in one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    /// The index of the sample in the catalog.
    pub sample_index: usize,
    /// The number of bases before the barcode.
    pub start_offset: usize,
    pub barcode_mismatches: usize,
    pub enzyme_mismatches: usize,
    /// The number of read bases the barcode alignment covered.
    pub barcode_len: usize,
    /// The remnant that matched.
    pub enzyme_site: BString,
    /// The number of read bases the remnant alignment covered.
    pub enzyme_len: usize,
}

impl MatchResult {
    pub fn mismatches(&self) -> usize {
        self.barcode_mismatches + self.enzyme_mismatches
    }

    /// The bases taken up by the barcode and remnant.
    pub fn scaffold_len(&self) -> usize {
        self.barcode_len + self.enzyme_len
    }
}

/// The located barcodes of a fragment.  `read2` is only present in double-barcode mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedFragment {
    pub read1: MatchResult,
    pub read2: Option<MatchResult>,
}

impl LocatedFragment {
    pub fn sample_index(&self) -> usize {
        self.read1.sample_index
    }

    pub fn barcode_mismatches(&self) -> usize {
        self.read1.barcode_mismatches + self.read2.as_ref().map_or(0, |m| m.barcode_mismatches)
    }

    pub fn enzyme_mismatches(&self) -> usize {
        self.read1.enzyme_mismatches + self.read2.as_ref().map_or(0, |m| m.enzyme_mismatches)
    }

    pub fn mismatches(&self) -> usize {
        self.barcode_mismatches() + self.enzyme_mismatches()
    }
}

/// Settings for the [`Locator`].
#[derive(Debug, Clone)]
pub struct LocatorConfig {
    /// The barcode budget for samples without an override.
    pub barcode_mismatches: usize,
    pub enzyme_mismatches: usize,
    /// The last start offset searched, capped at [`MAX_START_OFFSET`].
    pub max_start_offset: usize,
    /// Decode barcodes as Hamming codes instead of comparing them with the distance strategy.
    pub self_correcting: bool,
    pub double_barcodes: bool,
    /// The adaptor bases compared when looking for adaptor-ligation artifacts.
    pub adaptor: BString,
    /// The budget for adaptor-ligation artifacts, `None` to skip the check.
    pub adaptor_ligation_mismatches: Option<usize>,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            barcode_mismatches: 1,
            enzyme_mismatches: 1,
            max_start_offset: 0,
            self_correcting: false,
            double_barcodes: false,
            adaptor: BString::from(&DEFAULT_ADAPTOR[..10]),
            adaptor_ligation_mismatches: None,
        }
    }
}

/// Finds which sample a fragment belongs to.
pub struct Locator<'a, D: DistanceAlgorithm> {
    samples: &'a [Sample],
    all_samples: Vec<usize>,
    config: LocatorConfig,
    distance: D,
    /// The number of leading read bases any decision can depend on.
    window: usize,
    id: usize,
}

impl<'a, D: DistanceAlgorithm> Locator<'a, D> {
    pub fn new(catalog: &'a SampleCatalog, config: LocatorConfig, distance: D) -> Self {
        let samples = catalog.samples();
        let longest_barcode = samples
            .iter()
            .flat_map(|s| {
                std::iter::once(s.barcode.len()).chain(s.barcode2.as_ref().map(|b| b.len()))
            })
            .max()
            .unwrap_or(0);
        let longest_remnant = samples
            .iter()
            .map(|s| s.enzyme.longest_remnant().max(s.far_enzyme().longest_remnant()))
            .max()
            .unwrap_or(0);
        let barcode_slack = samples
            .iter()
            .map(|s| s.barcode_mismatches(config.barcode_mismatches))
            .max()
            .unwrap_or(0);
        let ligation = config.adaptor_ligation_mismatches.map_or(0, |mm| config.adaptor.len() + mm);
        let window = config.max_start_offset.min(MAX_START_OFFSET)
            + longest_barcode
            + barcode_slack
            + longest_remnant
            + config.enzyme_mismatches
            + ligation;

        Self {
            samples,
            all_samples: (0..samples.len()).collect(),
            config,
            distance,
            window,
            id: NEXT_LOCATOR_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Locates the sample of a fragment.
    ///
    /// # Errors
    ///
    /// Returns the [`InvalidRead`] reason, naming the mate responsible, when no single sample
    /// matches.
    pub fn locate(
        &self,
        read1: &[u8],
        read2: Option<&[u8]>,
    ) -> Result<LocatedFragment, InvalidRead> {
        let candidates = self.read1_candidates(read1)?;
        if !self.config.double_barcodes {
            return match candidates.as_slice() {
                [only] => Ok(LocatedFragment { read1: only.clone(), read2: None }),
                _ => Err(InvalidRead::Ambiguous { mate: Mate::R1 }),
            };
        }

        let read2 = read2.ok_or(InvalidRead::NoMatch { mate: Mate::R2 })?;
        let indices: Vec<usize> = candidates.iter().map(|m| m.sample_index).collect();
        let mut read2_matches = self.scan(self.leading_window(read2), Mate::R2, &indices)?;
        if read2_matches.len() > 1 {
            return Err(InvalidRead::Ambiguous { mate: Mate::R2 });
        }
        let read2_match = read2_matches.remove(0);
        let mut read1_matches =
            candidates.into_iter().filter(|m| m.sample_index == read2_match.sample_index);
        match (read1_matches.next(), read1_matches.next()) {
            (Some(read1_match), None) => {
                Ok(LocatedFragment { read1: read1_match, read2: Some(read2_match) })
            }
            _ => Err(InvalidRead::Ambiguous { mate: Mate::R1 }),
        }
    }

    fn leading_window<'s>(&self, seq: &'s [u8]) -> &'s [u8] {
        &seq[..seq.len().min(self.window)]
    }

    /// All read-1 hits at the first start offset that has any, memoised per thread.
    fn read1_candidates(&self, read1: &[u8]) -> Result<Vec<MatchResult>, InvalidRead> {
        let window = self.leading_window(read1);
        CACHE.with(|cache| {
            let c = &mut *cache.borrow_mut();
            let key = (self.id, window.to_vec());
            if let Some(hit) = cached::Cached::cache_get(c, &key) {
                return hit.clone();
            }
            let result = self.scan(window, Mate::R1, &self.all_samples);
            cached::Cached::cache_set(c, key, result.clone());
            result
        })
    }

    /// Searches start offsets in order and returns every hit at the first offset with any.
    fn scan(
        &self,
        seq: &[u8],
        mate: Mate,
        sample_indices: &[usize],
    ) -> Result<Vec<MatchResult>, InvalidRead> {
        let last_offset = self.config.max_start_offset.min(MAX_START_OFFSET).min(seq.len());
        for offset in 0..=last_offset {
            let mut found = vec![];
            for &sample_index in sample_indices {
                if let Some(hit) = self.match_at(seq, offset, sample_index, mate)? {
                    found.push(hit);
                }
            }
            if !found.is_empty() {
                return Ok(found);
            }
        }
        Err(InvalidRead::NoMatch { mate })
    }

    /// Matches one sample's barcode and closest remnant at `offset`.
    fn match_at(
        &self,
        seq: &[u8],
        offset: usize,
        sample_index: usize,
        mate: Mate,
    ) -> Result<Option<MatchResult>, InvalidRead> {
        let sample = &self.samples[sample_index];
        let (barcode, enzyme): (&[u8], &Enzyme) = match (mate, &sample.barcode2) {
            (Mate::R1, _) => (sample.barcode.as_slice(), sample.enzyme.as_ref()),
            (Mate::R2, Some(barcode2)) => (barcode2.as_slice(), sample.far_enzyme()),
            (Mate::R2, None) => return Ok(None),
        };
        let window = &seq[offset..];
        let budget = sample.barcode_mismatches(self.config.barcode_mismatches);
        let bc = match self.match_barcode(window, barcode, budget) {
            Some(bc) => bc,
            None => return Ok(None),
        };

        let rest = &window[bc.matched_len..];
        let best = enzyme
            .cut_site_remnants()
            .iter()
            .filter_map(|site| {
                self.distance
                    .equivalent_distance(rest, site, self.config.enzyme_mismatches)
                    .map(|eq| (site, eq))
            })
            .min_by_key(|(_, eq)| eq.distance);
        let (site, ez) = match best {
            Some(best) => best,
            None => return Ok(None),
        };

        if self.is_adaptor_ligation(&rest[ez.matched_len..]) {
            return Err(InvalidRead::AdaptorLigation { mate });
        }

        Ok(Some(MatchResult {
            sample_index,
            start_offset: offset,
            barcode_mismatches: bc.distance,
            enzyme_mismatches: ez.distance,
            barcode_len: bc.matched_len,
            enzyme_site: site.clone(),
            enzyme_len: ez.matched_len,
        }))
    }

    fn match_barcode(&self, window: &[u8], barcode: &[u8], budget: usize) -> Option<Equivalence> {
        if self.config.self_correcting {
            if window.len() < barcode.len() {
                return None;
            }
            let (decoded, corrected) = decode_self_correcting(&window[..barcode.len()])?;
            (decoded == barcode)
                .then(|| Equivalence { distance: corrected, matched_len: barcode.len() })
        } else {
            self.distance.equivalent_distance(window, barcode, budget)
        }
    }

    /// True if the bases right after the cut site are the adaptor itself.
    fn is_adaptor_ligation(&self, after_site: &[u8]) -> bool {
        match self.config.adaptor_ligation_mismatches {
            Some(budget) if !self.config.adaptor.is_empty() => self
                .distance
                .equivalent_distance(after_site, &self.config.adaptor, budget)
                .is_some(),
            _ => false,
        }
    }
}
