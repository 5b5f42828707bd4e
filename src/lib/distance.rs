//! Approximate sequence comparison.
//!
//! Every strategy implements [`DistanceAlgorithm`].  Two of them count substitutions only
//! ([`Hamming`] and the faster but less exhaustive [`KmpHamming`]); the other two also allow
//! insertions and deletions ([`Indel`] and [`IndelMismatchFirst`]) and so may report a matched
//! length that differs from the pattern length.  Callers must always advance by the reported
//! matched length rather than the pattern length.

use clap::ArgEnum;

/// The distance between a pattern and the start of a haystack, with the number of haystack bases
/// the alignment consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Equivalence {
    pub distance: usize,
    pub matched_len: usize,
}

/// Where a pattern was found in a haystack and how many haystack bases it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub start: usize,
    pub len: usize,
}

impl Location {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// A strategy for deciding whether two sequences are equivalent within a mismatch budget.
pub trait DistanceAlgorithm: Clone + Send + Sync {
    /// True if `a` and `b` have the same length and are within `max_mismatches` of each other.
    fn is_equivalent(&self, a: &[u8], b: &[u8], max_mismatches: usize) -> bool;

    /// Compares `pattern` against the start of `haystack`.
    fn equivalent_distance(
        &self,
        haystack: &[u8],
        pattern: &[u8],
        max_mismatches: usize,
    ) -> Option<Equivalence>;

    /// The leftmost location of `pattern` in `haystack`.  An empty pattern is found at 0.
    fn index_of(&self, haystack: &[u8], pattern: &[u8], max_mismatches: usize) -> Option<Location> {
        (0..=haystack.len())
            .take_while(|start| haystack.len() - start >= pattern.len())
            .find_map(|start| {
                self.equivalent_distance(&haystack[start..], pattern, max_mismatches)
                    .map(|eq| Location { start, len: eq.matched_len })
            })
    }

    /// The leftmost location of `pattern_a` that is directly followed by `pattern_b`.
    ///
    /// When the haystack has no room left for `pattern_b` after an occurrence of `pattern_a`,
    /// that occurrence alone is reported.  The returned length covers `pattern_a`, plus
    /// `pattern_b` when it was checked.
    fn index_of2(
        &self,
        haystack: &[u8],
        pattern_a: &[u8],
        pattern_b: &[u8],
        max_mismatches_a: usize,
        max_mismatches_b: usize,
    ) -> Option<Location> {
        let mut from = 0;
        while from <= haystack.len() {
            let hit = self.index_of(&haystack[from..], pattern_a, max_mismatches_a)?;
            let start = from + hit.start;
            let end = start + hit.len;
            if haystack.len() - end < pattern_b.len() {
                return Some(Location { start, len: hit.len });
            }
            if let Some(eq) = self.equivalent_distance(&haystack[end..], pattern_b, max_mismatches_b)
            {
                return Some(Location { start, len: hit.len + eq.matched_len });
            }
            from = start + 1;
        }
        None
    }
}

/// Counts mismatches between two equal-length slices, giving up as soon as the budget is blown.
fn mismatches_within(a: &[u8], b: &[u8], max_mismatches: usize) -> Option<usize> {
    let mut mismatches = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        if x != y {
            mismatches += 1;
            if mismatches > max_mismatches {
                return None;
            }
        }
    }
    Some(mismatches)
}

/// Substitution-only comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hamming;

impl DistanceAlgorithm for Hamming {
    fn is_equivalent(&self, a: &[u8], b: &[u8], max_mismatches: usize) -> bool {
        a.len() == b.len() && mismatches_within(a, b, max_mismatches).is_some()
    }

    fn equivalent_distance(
        &self,
        haystack: &[u8],
        pattern: &[u8],
        max_mismatches: usize,
    ) -> Option<Equivalence> {
        if haystack.len() < pattern.len() {
            return None;
        }
        mismatches_within(&haystack[..pattern.len()], pattern, max_mismatches)
            .map(|distance| Equivalence { distance, matched_len: pattern.len() })
    }
}

/// Substitution-only comparison that scans with Knuth-Morris-Pratt shifts.
///
/// After a failed window the scan jumps ahead using the failure table of the exact prefix that
/// preceded the first mismatch.  With a non-zero budget this may jump over a valid approximate
/// match, so results can differ from [`Hamming`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KmpHamming;

/// The classic KMP prefix function: `fail[i]` is the length of the longest proper prefix of
/// `pattern[..=i]` that is also a suffix of it.
fn failure_table(pattern: &[u8]) -> Vec<usize> {
    let mut fail = vec![0; pattern.len()];
    let mut k = 0;
    for i in 1..pattern.len() {
        while k > 0 && pattern[i] != pattern[k] {
            k = fail[k - 1];
        }
        if pattern[i] == pattern[k] {
            k += 1;
        }
        fail[i] = k;
    }
    fail
}

impl DistanceAlgorithm for KmpHamming {
    fn is_equivalent(&self, a: &[u8], b: &[u8], max_mismatches: usize) -> bool {
        Hamming.is_equivalent(a, b, max_mismatches)
    }

    fn equivalent_distance(
        &self,
        haystack: &[u8],
        pattern: &[u8],
        max_mismatches: usize,
    ) -> Option<Equivalence> {
        Hamming.equivalent_distance(haystack, pattern, max_mismatches)
    }

    fn index_of(&self, haystack: &[u8], pattern: &[u8], max_mismatches: usize) -> Option<Location> {
        if pattern.is_empty() {
            return Some(Location { start: 0, len: 0 });
        }
        let fail = failure_table(pattern);
        let mut start = 0;
        while start + pattern.len() <= haystack.len() {
            let window = &haystack[start..start + pattern.len()];
            let mut mismatches = 0;
            let mut first_mismatch = None;
            for (i, (h, p)) in window.iter().zip(pattern.iter()).enumerate() {
                if h != p {
                    first_mismatch.get_or_insert(i);
                    mismatches += 1;
                    if mismatches > max_mismatches {
                        break;
                    }
                }
            }
            if mismatches <= max_mismatches {
                return Some(Location { start, len: pattern.len() });
            }
            start += match first_mismatch {
                Some(k) if k > 0 => k - fail[k - 1],
                _ => 1,
            };
        }
        None
    }
}

/// Which branch an indel alignment tries first, and whether it stops at the first that fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Search {
    Exhaustive,
    MismatchFirst,
}

/// Aligns `pattern` against the start of `haystack`, returning `(cost, haystack bases consumed)`.
///
/// With `global` set the whole haystack must be consumed, each left-over base costing one
/// insertion.  Otherwise trailing haystack bases are free, and no insertion may come before the
/// first pattern base (`leading`), so an alignment never starts on a skipped haystack base.
fn align(
    haystack: &[u8],
    pattern: &[u8],
    budget: usize,
    search: Search,
    global: bool,
    leading: bool,
) -> Option<(usize, usize)> {
    if pattern.is_empty() {
        return if !global {
            Some((0, 0))
        } else if haystack.len() <= budget {
            Some((haystack.len(), haystack.len()))
        } else {
            None
        };
    }
    if haystack.is_empty() {
        return (pattern.len() <= budget).then(|| (pattern.len(), 0));
    }
    if haystack[0] == pattern[0] {
        return align(&haystack[1..], &pattern[1..], budget, search, global, false)
            .map(|(cost, len)| (cost, len + 1));
    }
    if budget == 0 {
        return None;
    }

    let mismatch = align(&haystack[1..], &pattern[1..], budget - 1, search, global, false)
        .map(|(cost, len)| (cost + 1, len + 1));
    if search == Search::MismatchFirst && mismatch.is_some() {
        return mismatch;
    }
    let insertion = if global || !leading {
        align(&haystack[1..], pattern, budget - 1, search, global, leading)
            .map(|(cost, len)| (cost + 1, len + 1))
    } else {
        None
    };
    if search == Search::MismatchFirst && insertion.is_some() {
        return insertion;
    }
    let deletion = align(haystack, &pattern[1..], budget - 1, search, global, false)
        .map(|(cost, len)| (cost + 1, len));

    [mismatch, insertion, deletion].into_iter().flatten().min_by_key(|(cost, _)| *cost)
}

fn indel_equivalent(a: &[u8], b: &[u8], max_mismatches: usize, search: Search) -> bool {
    a.len() == b.len() && align(a, b, max_mismatches, search, true, true).is_some()
}

fn indel_distance(
    haystack: &[u8],
    pattern: &[u8],
    max_mismatches: usize,
    search: Search,
) -> Option<Equivalence> {
    align(haystack, pattern, max_mismatches, search, false, true)
        .map(|(distance, matched_len)| Equivalence { distance, matched_len })
}

/// The leftmost occurrence of `pattern`, started where it aligns most cheaply.
///
/// An occurrence found at `start` with cost `c` can also be aligned from any of the next `c`
/// bases by spending edits on the bases in between, so those starts are compared and the
/// cheapest wins, the earliest on a tie.
fn indel_index_of(
    haystack: &[u8],
    pattern: &[u8],
    max_mismatches: usize,
    search: Search,
) -> Option<Location> {
    let window = pattern.len().saturating_sub(max_mismatches);
    let candidates = |from: usize| {
        (from..=haystack.len()).take_while(move |start| haystack.len() - start >= window)
    };
    let (first, eq) = candidates(0).find_map(|start| {
        indel_distance(&haystack[start..], pattern, max_mismatches, search).map(|eq| (start, eq))
    })?;
    let (start, eq) = candidates(first + 1)
        .take(eq.distance)
        .filter_map(|start| {
            indel_distance(&haystack[start..], pattern, eq.distance, search).map(|eq| (start, eq))
        })
        .fold((first, eq), |best, next| if next.1.distance < best.1.distance { next } else { best });
    Some(Location { start, len: eq.matched_len })
}

/// Edit distance allowing substitutions, insertions and deletions, returning the cheapest
/// alignment.  Ties prefer a substitution, then an insertion, then a deletion.
#[derive(Debug, Clone, Copy, Default)]
pub struct Indel;

impl DistanceAlgorithm for Indel {
    fn is_equivalent(&self, a: &[u8], b: &[u8], max_mismatches: usize) -> bool {
        indel_equivalent(a, b, max_mismatches, Search::Exhaustive)
    }

    fn equivalent_distance(
        &self,
        haystack: &[u8],
        pattern: &[u8],
        max_mismatches: usize,
    ) -> Option<Equivalence> {
        indel_distance(haystack, pattern, max_mismatches, Search::Exhaustive)
    }

    fn index_of(&self, haystack: &[u8], pattern: &[u8], max_mismatches: usize) -> Option<Location> {
        indel_index_of(haystack, pattern, max_mismatches, Search::Exhaustive)
    }
}

/// Like [`Indel`] but accepts the first alignment that fits the budget, trying a substitution
/// before an insertion before a deletion.  Faster, and not always minimal.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndelMismatchFirst;

impl DistanceAlgorithm for IndelMismatchFirst {
    fn is_equivalent(&self, a: &[u8], b: &[u8], max_mismatches: usize) -> bool {
        indel_equivalent(a, b, max_mismatches, Search::MismatchFirst)
    }

    fn equivalent_distance(
        &self,
        haystack: &[u8],
        pattern: &[u8],
        max_mismatches: usize,
    ) -> Option<Equivalence> {
        indel_distance(haystack, pattern, max_mismatches, Search::MismatchFirst)
    }

    fn index_of(&self, haystack: &[u8], pattern: &[u8], max_mismatches: usize) -> Option<Location> {
        indel_index_of(haystack, pattern, max_mismatches, Search::MismatchFirst)
    }
}

/// The distance strategy selectable on the command line.
#[derive(ArgEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceKind {
    /// Substitutions only.
    Hamming,
    /// Substitutions only, scanning with KMP shifts.  Fast but may miss matches.
    Kmp,
    /// Substitutions, insertions and deletions, minimal cost.
    Indel,
    /// Substitutions, insertions and deletions, first fit in substitution-first order.
    IndelMismatch,
}

impl DistanceKind {
    /// Returns the set of possible string values
    pub fn possible_values<'a>() -> impl Iterator<Item = clap::PossibleValue<'a>> {
        DistanceKind::value_variants().iter().filter_map(ArgEnum::to_possible_value)
    }
}

impl std::str::FromStr for DistanceKind {
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
