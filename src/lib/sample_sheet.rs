use std::{fmt::Display, path::Path};

use csv::{ReaderBuilder, StringRecord, Trim};
use fgoxide::io::Io;

use crate::enzyme::{EnzymeError, EnzymeTable};
use crate::sample_metadata::{Sample, SampleCatalog};
use crate::sequence::ReasonBarcodeInvalid;

/// The optional line number from an input file where an error ocurred.
#[derive(Debug)]
pub struct ErrorLine(pub Option<usize>);

impl Display for ErrorLine {
    /// Writes the line number if present, nothing if it is not None.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Some(number) => write!(f, "Line {}", number),
            None => Ok(()),
        }
    }
}

/// The error that may occur when reading or validating the sample info file.
#[derive(thiserror::Error, Debug)]
pub enum SampleSheetError {
    #[error("Io error occurred")]
    Io(#[from] std::io::Error),

    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("The sample info file was empty")]
    Empty,

    #[error("Unable to parse the sample info line number {line}: {source}")]
    SampleInvalidLine { source: csv::Error, line: usize },

    #[error("The sample on line {line} had {actual} fields, expected at least {expected}")]
    TooFewColumns { actual: usize, expected: usize, line: usize },

    #[error("Invalid sample id `{id}`, only letters, digits, '_', '.' and '-' are allowed. {line}")]
    InvalidSampleId { id: String, line: ErrorLine },

    #[error("Invalid barcode sequence for {id} `{barcode}` - {reason}. {line}")]
    InvalidBarcode { barcode: String, id: String, reason: ReasonBarcodeInvalid, line: ErrorLine },

    #[error("Unknown enzyme for sample {id}. {line}")]
    UnknownEnzyme { source: EnzymeError, id: String, line: ErrorLine },

    #[error("Invalid barcode mismatch override `{value}` for sample {id}. {line}")]
    InvalidMismatchOverride { value: String, id: String, line: ErrorLine },

    #[error("Duplicate sample id found: {id}")]
    DuplicateSampleId { id: String },

    #[error("{sample_a} and {sample_b} have the same barcode ({barcode}) and enzymes")]
    DuplicateBarcode { sample_a: String, sample_b: String, barcode: String },

    #[error(
        "All samples must use either single or double barcodes: {single} has one barcode but {double} has two"
    )]
    MixedBarcodeModes { single: String, double: String },

    #[error("Sample info must include at least one sample")]
    ZeroSamples,

    #[error("Barcode {barcode} of sample {id} is not a valid self-correcting barcode")]
    NotSelfCorrecting { id: String, barcode: String },
}

/// The minimum number of columns on a sample line: id, barcode, enzyme.
const REQUIRED_COLUMNS: usize = 3;

/// Reader for the tab-delimited sample info file.
///
/// There is no header line.  Each line describes one sample with the columns:
///
/// 1. sample id
/// 2. read-1 barcode
/// 3. enzyme name
/// 4. (optional) enzyme name for the far end of the fragment
/// 5. (optional) read-2 barcode, for double-barcode designs
/// 6. (optional) barcode mismatch budget for this sample
///
/// Empty optional columns are treated as absent.  Lines starting with `#` and blank lines are
/// skipped.  Enzyme names are looked up in the given [`EnzymeTable`].
pub struct SampleSheet;

impl SampleSheet {
    /// Reads and validates the sample info file at `path`.
    pub fn from_path<P: AsRef<Path>>(
        path: P,
        enzymes: &EnzymeTable,
    ) -> Result<SampleCatalog, SampleSheetError> {
        let lines = Io::default().read_lines(&path)?;
        if lines.is_empty() {
            return Err(SampleSheetError::Empty);
        }
        let data = lines.join("\n");
        Self::from_reader(data.as_bytes(), enzymes)
    }

    /// Reads and validates sample info from any reader.
    pub fn from_reader<R: std::io::Read>(
        reader: R,
        enzymes: &EnzymeTable,
    ) -> Result<SampleCatalog, SampleSheetError> {
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .trim(Trim::All)
            .from_reader(reader);

        let mut samples = vec![];
        for (index, record) in reader.records().enumerate() {
            let fallback_line = index + 1;
            let record = record.map_err(|e| {
                let line = e.position().map_or(fallback_line, |p| p.line() as usize);
                SampleSheetError::SampleInvalidLine { source: e, line }
            })?;
            let line = record.position().map_or(fallback_line, |p| p.line() as usize);
            samples.push(Self::parse_sample(&record, samples.len(), line, enzymes)?);
        }
        SampleCatalog::new(samples)
    }

    fn parse_sample(
        record: &StringRecord,
        ordinal: usize,
        line: usize,
        enzymes: &EnzymeTable,
    ) -> Result<Sample, SampleSheetError> {
        if record.len() < REQUIRED_COLUMNS {
            return Err(SampleSheetError::TooFewColumns {
                actual: record.len(),
                expected: REQUIRED_COLUMNS,
                line,
            });
        }
        let optional = |index: usize| record.get(index).filter(|value| !value.is_empty());

        let id = record[0].to_string();
        let lookup = |name: &str| {
            enzymes.lookup(name).map_err(|source| SampleSheetError::UnknownEnzyme {
                source,
                id: id.clone(),
                line: ErrorLine(Some(line)),
            })
        };

        let enzyme = lookup(&record[2])?;
        let mut sample =
            Sample::new(id.clone(), record[1].as_bytes(), enzyme, ordinal, Some(line))?;
        if let Some(name) = optional(3) {
            sample = sample.with_enzyme2(lookup(name)?);
        }
        if let Some(barcode2) = optional(4) {
            sample = sample.with_barcode2(barcode2.as_bytes())?;
        }
        if let Some(value) = optional(5) {
            let mismatches = value.parse::<usize>().map_err(|_| {
                SampleSheetError::InvalidMismatchOverride {
                    value: value.to_string(),
                    id: id.clone(),
                    line: ErrorLine(Some(line)),
                }
            })?;
            sample = sample.with_mismatch_override(mismatches);
        }
        Ok(sample)
    }
}
