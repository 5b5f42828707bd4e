//! Nucleotide helpers shared by the locator, the trimmer, and the sample catalog.
//!
//! Complementing goes through a single IUPAC table so that ambiguity codes and lower-case bases
//! survive a round trip instead of being dropped.  Barcodes are restricted to `ACGT`.  When
//! self-correcting barcodes are in use each barcode is read as a binary Hamming code with two bits
//! per base, which allows a single flipped bit (and so a single wrong base) to be repaired.

use std::fmt::Display;

use bstr::ByteSlice;
use itertools::Itertools;

/// The bases allowed in a sample barcode.
pub const BARCODE_BASES: &[u8] = b"ACGT";

/// Returns the complement of a single IUPAC nucleotide code, preserving case.
///
/// Bytes outside the table are returned unchanged.
pub fn complement_base(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'T' => b'A',
        b'C' => b'G',
        b'G' => b'C',
        b'R' => b'Y',
        b'Y' => b'R',
        b'K' => b'M',
        b'M' => b'K',
        b'B' => b'V',
        b'V' => b'B',
        b'D' => b'H',
        b'H' => b'D',
        b'S' | b'W' | b'N' => base,
        b'a'..=b'z' => complement_base(base.to_ascii_uppercase()).to_ascii_lowercase(),
        _ => base,
    }
}

/// The complement of `seq`, base by base.
pub fn complement(seq: &[u8]) -> Vec<u8> {
    seq.iter().map(|&b| complement_base(b)).collect()
}

/// The reverse complement of `seq`.
pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    let mut rc = complement(seq);
    rc.reverse();
    rc
}

/// The concrete bases an (upper-case) IUPAC code stands for.
fn iupac_bases(code: u8) -> Option<&'static [u8]> {
    let bases: &'static [u8] = match code {
        b'A' => b"A",
        b'C' => b"C",
        b'G' => b"G",
        b'T' => b"T",
        b'R' => b"AG",
        b'Y' => b"CT",
        b'S' => b"CG",
        b'W' => b"AT",
        b'K' => b"GT",
        b'M' => b"AC",
        b'B' => b"CGT",
        b'D' => b"AGT",
        b'H' => b"ACT",
        b'V' => b"ACG",
        b'N' => b"ACGT",
        _ => return None,
    };
    Some(bases)
}

/// Expands a site written with IUPAC ambiguity codes into every concrete `ACGT` sequence it
/// stands for, e.g. `CWGC` becomes `CAGC` and `CTGC`.
///
/// Returns the first byte that is not an IUPAC code as the error.
pub fn expand_ambiguity(site: &[u8]) -> Result<Vec<Vec<u8>>, u8> {
    if site.is_empty() {
        return Ok(vec![vec![]]);
    }
    let choices = site
        .iter()
        .map(|b| iupac_bases(b.to_ascii_uppercase()).ok_or(*b))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(choices
        .into_iter()
        .map(|bases| bases.iter().copied())
        .multi_cartesian_product()
        .collect())
}

/// The reason a barcode failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonBarcodeInvalid {
    EmptyString,
    InvalidBase(u8),
}

impl Display for ReasonBarcodeInvalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasonBarcodeInvalid::EmptyString => write!(f, "Barcode is empty"),
            ReasonBarcodeInvalid::InvalidBase(base) => write!(
                f,
                "Barcode contains '{}', only {} are allowed",
                char::from(*base),
                String::from_utf8_lossy(BARCODE_BASES)
            ),
        }
    }
}

/// Upper-cases a barcode and strips surrounding whitespace.
pub fn sanitize_barcode(barcode: &[u8]) -> Vec<u8> {
    barcode.trim().to_ascii_uppercase()
}

/// Checks that a barcode is non-empty and made only of [`BARCODE_BASES`].
pub fn validate_barcode(barcode: &[u8]) -> Result<(), ReasonBarcodeInvalid> {
    if barcode.is_empty() {
        return Err(ReasonBarcodeInvalid::EmptyString);
    }
    match barcode.iter().find(|b| !BARCODE_BASES.contains(b)) {
        Some(base) => Err(ReasonBarcodeInvalid::InvalidBase(*base)),
        None => Ok(()),
    }
}

/// Two-bit value of a base in the self-correcting code.
fn base_to_bits(base: u8) -> Option<u8> {
    match base.to_ascii_uppercase() {
        b'A' => Some(0b00),
        b'C' => Some(0b01),
        b'G' => Some(0b10),
        b'T' => Some(0b11),
        _ => None,
    }
}

fn bits_to_base(bits: u8) -> u8 {
    BARCODE_BASES[usize::from(bits & 0b11)]
}

/// The Hamming syndrome of a barcode read as a bit string, two bits per base, with bit positions
/// numbered from 1.  Returns `None` if the barcode holds a non-`ACGT` base.
fn syndrome(barcode: &[u8]) -> Option<usize> {
    let mut syndrome = 0;
    for (i, base) in barcode.iter().enumerate() {
        let bits = base_to_bits(*base)?;
        if bits & 0b10 != 0 {
            syndrome ^= 2 * i + 1;
        }
        if bits & 0b01 != 0 {
            syndrome ^= 2 * i + 2;
        }
    }
    Some(syndrome)
}

/// True if `barcode` is a valid self-correcting codeword, i.e. its syndrome is zero.
pub fn is_self_correcting_codeword(barcode: &[u8]) -> bool {
    syndrome(barcode) == Some(0)
}

/// Decodes an observed self-correcting barcode.
///
/// Returns the corrected barcode and the number of bases that were changed (zero or one), or
/// `None` when the observation holds a non-`ACGT` base or more errors than the code can repair.
pub fn decode_self_correcting(observed: &[u8]) -> Option<(Vec<u8>, usize)> {
    let syndrome = syndrome(observed)?;
    let mut decoded = observed.iter().map(u8::to_ascii_uppercase).collect::<Vec<_>>();
    if syndrome == 0 {
        return Some((decoded, 0));
    }
    if syndrome > 2 * observed.len() {
        return None;
    }
    let base_index = (syndrome - 1) / 2;
    let mask = if syndrome % 2 == 1 { 0b10 } else { 0b01 };
    let bits = base_to_bits(decoded[base_index])?;
    decoded[base_index] = bits_to_base(bits ^ mask);
    Some((decoded, 1))
}
