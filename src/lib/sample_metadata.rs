#![forbid(unsafe_code)]
#![allow(clippy::must_use_candidate)]

use std::{collections::HashSet, sync::Arc};

use bstr::BString;
use lazy_static::lazy_static;
use regex::Regex;

use crate::enzyme::Enzyme;
use crate::sample_sheet::{ErrorLine, SampleSheetError};
use crate::sequence::{is_self_correcting_codeword, sanitize_barcode, validate_barcode};

lazy_static! {
    /// Sample identifiers become file names, so they are restricted to a safe character set.
    static ref SAMPLE_ID_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap();
}

/// A sample: its barcode(s), the enzyme(s) used to digest it, and an optional barcode mismatch
/// budget that overrides the global one.
///
/// Enzymes are shared with the [`crate::enzyme::EnzymeTable`] they were looked up in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// The unique identifier for the sample, also used to name its output files.
    pub sample_id: String,

    /// The barcode at the start of read 1.
    pub barcode: BString,

    /// The enzyme whose remnant follows the barcode in read 1.
    pub enzyme: Arc<Enzyme>,

    /// The barcode at the start of read 2, in double-barcode designs.
    pub barcode2: Option<BString>,

    /// The enzyme that cuts the far end of the fragment, when different from `enzyme`.
    pub enzyme2: Option<Arc<Enzyme>>,

    /// Overrides the global barcode mismatch budget for this sample.
    pub barcode_mismatch_override: Option<usize>,

    /// The position of the sample in the input, starts at 0.
    pub ordinal: usize,

    /// The line number in the input in which this sample was defined
    pub line_number: Option<usize>,
}

impl Sample {
    /// Create a new single-barcode [`Sample`], sanitizing and validating the barcode.
    ///
    /// # Errors
    ///
    /// - [`SampleSheetError::InvalidBarcode`] if the barcode is invalid
    pub fn new(
        sample_id: String,
        barcode: &[u8],
        enzyme: Arc<Enzyme>,
        ordinal: usize,
        line_number: Option<usize>,
    ) -> Result<Self, SampleSheetError> {
        let barcode = Self::checked_barcode(barcode, &sample_id, line_number)?;
        Ok(Self {
            sample_id,
            barcode,
            enzyme,
            barcode2: None,
            enzyme2: None,
            barcode_mismatch_override: None,
            ordinal,
            line_number,
        })
    }

    /// Adds the read-2 barcode of a double-barcode design.
    pub fn with_barcode2(mut self, barcode2: &[u8]) -> Result<Self, SampleSheetError> {
        self.barcode2 = Some(Self::checked_barcode(barcode2, &self.sample_id, self.line_number)?);
        Ok(self)
    }

    pub fn with_enzyme2(mut self, enzyme2: Arc<Enzyme>) -> Self {
        self.enzyme2 = Some(enzyme2);
        self
    }

    pub fn with_mismatch_override(mut self, mismatches: usize) -> Self {
        self.barcode_mismatch_override = Some(mismatches);
        self
    }

    fn checked_barcode(
        barcode: &[u8],
        id: &str,
        line_number: Option<usize>,
    ) -> Result<BString, SampleSheetError> {
        let fixed = sanitize_barcode(barcode);
        validate_barcode(&fixed).map_err(|reason| SampleSheetError::InvalidBarcode {
            id: id.to_owned(),
            barcode: String::from_utf8_lossy(barcode).to_string(),
            reason,
            line: ErrorLine(line_number),
        })?;
        Ok(BString::from(fixed))
    }

    /// The barcode mismatch budget for this sample given the global default.
    pub fn barcode_mismatches(&self, default: usize) -> usize {
        self.barcode_mismatch_override.unwrap_or(default)
    }

    pub fn is_double_barcoded(&self) -> bool {
        self.barcode2.is_some()
    }

    /// The enzyme that cuts the end of the fragment read by read 2.
    pub fn far_enzyme(&self) -> &Enzyme {
        self.enzyme2.as_deref().unwrap_or(&self.enzyme)
    }
}

/// The validated, immutable set of samples to demultiplex into.
///
/// Reads that match no sample go to an extra undetermined output, which is indexed after the
/// last sample.
#[derive(Debug, Clone)]
pub struct SampleCatalog {
    samples: Vec<Sample>,
    longest_barcode: usize,
}

impl SampleCatalog {
    /// Validates the samples and builds the catalog.
    ///
    /// # Errors
    ///
    /// See [`validate_samples`].
    pub fn new(samples: Vec<Sample>) -> Result<Self, SampleSheetError> {
        let samples = validate_samples(samples)?;
        let longest_barcode = samples.iter().map(|s| s.barcode.len()).max().unwrap_or(0);
        Ok(Self { samples, longest_barcode })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The output index of the undetermined sink.
    pub fn undetermined_index(&self) -> usize {
        self.samples.len()
    }

    /// The length of the longest read-1 barcode across samples.
    pub fn longest_barcode(&self) -> usize {
        self.longest_barcode
    }

    /// True if the samples carry a barcode on both reads.
    pub fn is_double_barcoded(&self) -> bool {
        self.samples.first().map_or(false, Sample::is_double_barcoded)
    }

    /// Ensures every barcode is a valid self-correcting codeword.
    ///
    /// # Errors
    ///
    /// - [`SampleSheetError::NotSelfCorrecting`] for the first barcode that is not
    pub fn validate_self_correcting(&self) -> Result<(), SampleSheetError> {
        for sample in &self.samples {
            for barcode in std::iter::once(&sample.barcode).chain(sample.barcode2.iter()) {
                if !is_self_correcting_codeword(barcode) {
                    return Err(SampleSheetError::NotSelfCorrecting {
                        id: sample.sample_id.clone(),
                        barcode: barcode.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Validates a set of samples.
///
/// # Errors
///
/// - [`SampleSheetError::ZeroSamples`]
/// - [`SampleSheetError::InvalidSampleId`]
/// - [`SampleSheetError::DuplicateSampleId`]
/// - [`SampleSheetError::MixedBarcodeModes`]
/// - [`SampleSheetError::DuplicateBarcode`]
pub fn validate_samples(samples: Vec<Sample>) -> Result<Vec<Sample>, SampleSheetError> {
    if samples.is_empty() {
        return Err(SampleSheetError::ZeroSamples);
    }

    let mut ids = HashSet::new();
    for sample in &samples {
        if !SAMPLE_ID_REGEX.is_match(&sample.sample_id) {
            return Err(SampleSheetError::InvalidSampleId {
                id: sample.sample_id.clone(),
                line: ErrorLine(sample.line_number),
            });
        }
        if !ids.insert(sample.sample_id.clone()) {
            return Err(SampleSheetError::DuplicateSampleId { id: sample.sample_id.clone() });
        }
    }

    let single = samples.iter().find(|s| !s.is_double_barcoded());
    let double = samples.iter().find(|s| s.is_double_barcoded());
    if let (Some(single), Some(double)) = (single, double) {
        return Err(SampleSheetError::MixedBarcodeModes {
            single: single.sample_id.clone(),
            double: double.sample_id.clone(),
        });
    }

    // Two samples with the same barcodes and enzymes could never be told apart.
    for (i, sample) in samples.iter().enumerate() {
        for other in samples.iter().skip(i + 1) {
            if sample.barcode == other.barcode
                && sample.barcode2 == other.barcode2
                && sample.enzyme == other.enzyme
                && sample.far_enzyme() == other.far_enzyme()
            {
                return Err(SampleSheetError::DuplicateBarcode {
                    sample_a: sample.sample_id.clone(),
                    sample_b: other.sample_id.clone(),
                    barcode: sample.barcode.to_string(),
                });
            }
        }
    }

    Ok(samples)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enzyme::EnzymeTable;
    use crate::sequence::ReasonBarcodeInvalid;
    use matches::assert_matches;
    use rstest::rstest;

    fn sample(id: &str, barcode: &str) -> Sample {
        let table = EnzymeTable::builtin();
        Sample::new(id.to_string(), barcode.as_bytes(), table.lookup("ApeKI").unwrap(), 0, None)
            .unwrap()
    }

    #[test]
    fn test_new_sample_sanitizes_barcode() {
        let s = sample("S1", " acgt ");
        assert_eq!(s.barcode, BString::from("ACGT"));
        assert_eq!(s.barcode_mismatches(1), 1);
        assert_eq!(s.clone().with_mismatch_override(0).barcode_mismatches(1), 0);
        assert_eq!(s.far_enzyme().name(), "ApeKI");
    }

    #[rstest]
    #[case("", ReasonBarcodeInvalid::EmptyString)]
    #[case("ACNT", ReasonBarcodeInvalid::InvalidBase(b'N'))]
    fn test_invalid_barcode(#[case] barcode: &str, #[case] expected: ReasonBarcodeInvalid) {
        let table = EnzymeTable::builtin();
        let neutral = table.lookup("Neutral").unwrap();
        let result = Sample::new("S1".to_string(), barcode.as_bytes(), neutral, 0, Some(3));
        assert_matches!(result, Err(SampleSheetError::InvalidBarcode { reason, line: ErrorLine(Some(3)), .. }) if reason == expected);
    }

    #[test]
    fn test_catalog_longest_barcode_and_undetermined_index() {
        let catalog =
            SampleCatalog::new(vec![sample("S1", "ACGT"), sample("S2", "TTGCAA")]).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.longest_barcode(), 6);
        assert_eq!(catalog.undetermined_index(), 2);
        assert!(!catalog.is_double_barcoded());
    }

    #[test]
    fn test_validate_samples_errors() {
        assert_matches!(SampleCatalog::new(vec![]), Err(SampleSheetError::ZeroSamples));
        assert_matches!(
            SampleCatalog::new(vec![sample("S1", "ACGT"), sample("S1", "TTTT")]),
            Err(SampleSheetError::DuplicateSampleId { .. })
        );
        assert_matches!(
            SampleCatalog::new(vec![sample("S/1", "ACGT")]),
            Err(SampleSheetError::InvalidSampleId { .. })
        );
        assert_matches!(
            SampleCatalog::new(vec![sample("S1", "ACGT"), sample("S2", "ACGT")]),
            Err(SampleSheetError::DuplicateBarcode { .. })
        );
    }

    #[test]
    fn test_mixing_single_and_double_barcodes_is_an_error() {
        let double = sample("S2", "TTTT").with_barcode2(b"GGCC").unwrap();
        assert_matches!(
            SampleCatalog::new(vec![sample("S1", "ACGT"), double.clone()]),
            Err(SampleSheetError::MixedBarcodeModes { .. })
        );
        let catalog = SampleCatalog::new(vec![double]).unwrap();
        assert!(catalog.is_double_barcoded());
    }

    #[test]
    fn test_shared_barcode1_is_fine_in_double_barcode_mode() {
        let a = sample("S1", "ACGT").with_barcode2(b"GGCC").unwrap();
        let b = sample("S2", "ACGT").with_barcode2(b"CCAA").unwrap();
        assert!(SampleCatalog::new(vec![a, b]).is_ok());
    }

    #[test]
    fn test_validate_self_correcting() {
        let ok = SampleCatalog::new(vec![sample("S1", "TGAA"), sample("S2", "AAAA")]).unwrap();
        assert!(ok.validate_self_correcting().is_ok());
        let bad = SampleCatalog::new(vec![sample("S1", "TGAA"), sample("S2", "AAAC")]).unwrap();
        assert_matches!(
            bad.validate_self_correcting(),
            Err(SampleSheetError::NotSelfCorrecting { id, .. }) if id == "S2"
        );
    }
}
