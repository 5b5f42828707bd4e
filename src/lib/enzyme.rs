//! Restriction enzymes and the immutable table they are looked up in.
//!
//! An enzyme is described by the bases it leaves at the start of a fragment after cutting (its
//! cut-site remnants).  Remnants may be written with IUPAC ambiguity codes, which are expanded
//! when the enzyme is built.  The table is built once, before any reads are processed, and then
//! shared read-only across threads.

use std::{path::Path, sync::Arc};

use ahash::AHashMap;
use bstr::{BString, ByteSlice};
use fgoxide::io::Io;
use itertools::Itertools;
use thiserror::Error;

use crate::sample_sheet::ErrorLine;
use crate::sequence::{expand_ambiguity, reverse_complement};

/// The name of the enzyme with a single empty remnant, which matches anywhere at no cost.
pub const NEUTRAL_ENZYME_NAME: &str = "neutral";

/// Enzymes known without an enzyme file, with their remnants in IUPAC notation.
const BUILTIN_ENZYMES: &[(&str, &[&str])] = &[
    ("ApeKI", &["CWGC"]),
    ("AvaII", &["GWCC"]),
    ("BamHI", &["GATCC"]),
    ("BglII", &["GATCT"]),
    ("Csp6I", &["TAC"]),
    ("EcoRI", &["AATTC"]),
    ("EcoT22I", &["TGCAT"]),
    ("HindIII", &["AGCTT"]),
    ("HpaII", &["CGG"]),
    ("MseI", &["TAA"]),
    ("MspI", &["CGG"]),
    ("NotI", &["GGCCGC"]),
    ("NsiI", &["TGCAT"]),
    ("PasI", &["CWGGG"]),
    ("PstI", &["TGCAG"]),
    ("SalI", &["TCGAC"]),
    ("SbfI", &["TGCAGG"]),
    ("SphI", &["CATGC"]),
];

/// The errors that may occur when building an enzyme or reading an enzyme file.
#[derive(Error, Debug)]
pub enum EnzymeError {
    #[error("Io error occurred")]
    Io(#[from] std::io::Error),

    #[error("Io error occurred")]
    FgError(#[from] fgoxide::FgError),

    #[error("Expected '<name><TAB><remnant>[,<remnant>...]' but found '{text}'. {line}")]
    MalformedLine { text: String, line: ErrorLine },

    #[error("Enzyme name is empty. {line}")]
    EmptyName { line: ErrorLine },

    #[error("Enzyme {name} has no cut-site remnants. {line}")]
    NoRemnants { name: String, line: ErrorLine },

    #[error("Enzyme {name} has an invalid base '{base}' in remnant '{remnant}'. {line}")]
    InvalidRemnant { name: String, remnant: String, base: char, line: ErrorLine },

    #[error("Unknown enzyme: {name}")]
    Unknown { name: String },

    #[error("The enzyme file did not define any enzymes")]
    Empty,
}

/// A restriction enzyme and the remnants of its recognition site left after cutting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enzyme {
    name: String,
    cut_site_remnants: Vec<BString>,
}

impl Enzyme {
    /// Builds an enzyme, expanding ambiguity codes in `sites` into concrete remnants.
    ///
    /// # Errors
    ///
    /// - [`EnzymeError::EmptyName`] if the name is blank
    /// - [`EnzymeError::NoRemnants`] if no sites were given
    /// - [`EnzymeError::InvalidRemnant`] if a site has a non-IUPAC base
    pub fn new<S: AsRef<[u8]>>(
        name: &str,
        sites: &[S],
        line: Option<usize>,
    ) -> Result<Self, EnzymeError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(EnzymeError::EmptyName { line: ErrorLine(line) });
        }
        if sites.is_empty() {
            return Err(EnzymeError::NoRemnants { name: name.to_string(), line: ErrorLine(line) });
        }

        let mut remnants = vec![];
        for site in sites {
            let site = site.as_ref().trim().to_ascii_uppercase();
            let expanded = expand_ambiguity(&site).map_err(|base| EnzymeError::InvalidRemnant {
                name: name.to_string(),
                remnant: site.to_str_lossy().to_string(),
                base: char::from(base),
                line: ErrorLine(line),
            })?;
            remnants.extend(expanded.into_iter().map(BString::from));
        }
        let cut_site_remnants = remnants.into_iter().sorted().dedup().collect();

        Ok(Self { name: name.to_string(), cut_site_remnants })
    }

    /// The enzyme with a single empty remnant.
    pub fn neutral() -> Self {
        Self {
            name: NEUTRAL_ENZYME_NAME.to_string(),
            cut_site_remnants: vec![BString::from("")],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The remnants as they appear at the start of a fragment, in sorted order.
    pub fn cut_site_remnants(&self) -> &[BString] {
        &self.cut_site_remnants
    }

    /// The reverse complement of each remnant, in the same order as [`Self::cut_site_remnants`].
    /// This is how a remnant reads when a sequencer runs through the far end of a fragment.
    pub fn complement_remnants(&self) -> impl Iterator<Item = BString> + '_ {
        self.cut_site_remnants.iter().map(|r| BString::from(reverse_complement(r)))
    }

    /// The length of the longest remnant.
    pub fn longest_remnant(&self) -> usize {
        self.cut_site_remnants.iter().map(|r| r.len()).max().unwrap_or(0)
    }
}

/// An immutable, case-insensitive lookup table of enzymes.
#[derive(Debug, Clone)]
pub struct EnzymeTable {
    enzymes: AHashMap<String, Arc<Enzyme>>,
}

impl EnzymeTable {
    fn key(name: &str) -> String {
        name.trim().to_ascii_uppercase()
    }

    fn from_enzymes(enzymes: impl IntoIterator<Item = Enzyme>) -> Self {
        let mut table = AHashMap::new();
        table.insert(Self::key(NEUTRAL_ENZYME_NAME), Arc::new(Enzyme::neutral()));
        for enzyme in enzymes {
            table.insert(Self::key(enzyme.name()), Arc::new(enzyme));
        }
        Self { enzymes: table }
    }

    /// The built-in enzymes, plus the neutral enzyme.
    pub fn builtin() -> Self {
        Self::from_enzymes(BUILTIN_ENZYMES.iter().filter_map(|(name, sites)| {
            let sites: Vec<&[u8]> = sites.iter().map(|s| s.as_bytes()).collect();
            Enzyme::new(name, &sites, None).ok()
        }))
    }

    /// Reads enzymes from a tab-delimited file.
    ///
    /// Each line is `name<TAB>remnant[,remnant...]`; blank lines and lines starting with `#` are
    /// skipped.  Enzymes in the file replace built-in enzymes of the same name.  When `replace`
    /// is true the built-in enzymes are dropped entirely (the neutral enzyme is always present).
    pub fn from_path<P: AsRef<Path>>(path: P, replace: bool) -> Result<Self, EnzymeError> {
        let lines = Io::default().read_lines(&path)?;
        let from_file = Self::parse_lines(&lines)?;
        if from_file.is_empty() {
            return Err(EnzymeError::Empty);
        }
        let base: Vec<Enzyme> = if replace {
            vec![]
        } else {
            let neutral_key = Self::key(NEUTRAL_ENZYME_NAME);
            Self::builtin()
                .enzymes
                .into_iter()
                .filter(|(key, _)| *key != neutral_key)
                .map(|(_, enzyme)| enzyme.as_ref().clone())
                .collect()
        };
        Ok(Self::from_enzymes(base.into_iter().chain(from_file)))
    }

    fn parse_lines(lines: &[String]) -> Result<Vec<Enzyme>, EnzymeError> {
        let mut enzymes = vec![];
        for (index, text) in lines.iter().enumerate() {
            let line = index + 1;
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (name, remnants) = match trimmed.split_once('\t') {
                Some(fields) => fields,
                None => {
                    return Err(EnzymeError::MalformedLine {
                        text: text.clone(),
                        line: ErrorLine(Some(line)),
                    })
                }
            };
            let sites: Vec<&str> =
                remnants.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
            enzymes.push(Enzyme::new(name, &sites, Some(line))?);
        }
        Ok(enzymes)
    }

    /// Looks up an enzyme by name, ignoring case.
    pub fn lookup(&self, name: &str) -> Result<Arc<Enzyme>, EnzymeError> {
        self.enzymes
            .get(&Self::key(name))
            .cloned()
            .ok_or_else(|| EnzymeError::Unknown { name: name.to_string() })
    }

    /// The number of enzymes, including the neutral enzyme.
    pub fn len(&self) -> usize {
        self.enzymes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.enzymes.is_empty()
    }
}
