//! Position verdicts and the raw-verdict normalizer.
//!
//! A [`PositionVerdict`] is one commit position's outcome for one
//! (test, variant, branch). The overwhelmingly common case is a single
//! expected run; that gets a compact "simple" form with no details, which
//! keeps buffers and their encodings small.
//!
//! # Contract
//! - Simple form iff the verdict status is `Expected` with exactly one
//!   result.
//! - Runs group results by invocation; a run is duplicate iff its
//!   invocation is in the caller-supplied duplicate set.
//! - Run ordering is deterministic: non-duplicate before duplicate, then
//!   unexpected count descending, then expected count descending. This
//!   ordering seeds tie-breaking in downstream analysis.

use ahash::{AHashMap, AHashSet};

use super::source::{RawTestVariant, VerdictStatus};

/// Seconds per hour, for partition-time truncation.
pub const SECS_PER_HOUR: u64 = 3600;

/// One run of a test variant: the results of a single invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Run {
    /// Results that matched expectations.
    pub expected_count: u32,
    /// Results that did not.
    pub unexpected_count: u32,
    /// True when the invocation duplicates already-ingested work.
    pub is_duplicate: bool,
}

/// Detail block for verdicts that are not simple-expected.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct VerdictDetails {
    /// True when the verdict was exonerated.
    pub is_exonerated: bool,
    /// Runs in deterministic order (see module docs).
    pub runs: Vec<Run>,
}

/// One commit position's outcome for one (test, variant, branch).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionVerdict {
    /// Position on the source branch; primary ordering key.
    pub commit_position: u64,
    /// Partition time truncated to the hour (hours since the Unix epoch).
    pub hour: u64,
    /// Fast path: exactly one expected run, no exoneration.
    pub is_simple_expected: bool,
    /// Present iff not simple.
    pub details: Option<VerdictDetails>,
}

impl PositionVerdict {
    /// Builds the compact simple-expected form.
    #[must_use]
    pub fn simple(commit_position: u64, hour: u64) -> Self {
        Self {
            commit_position,
            hour,
            is_simple_expected: true,
            details: None,
        }
    }

    /// Ordering key within a history: position, then hour.
    #[inline]
    #[must_use]
    pub fn order_key(&self) -> (u64, u64) {
        (self.commit_position, self.hour)
    }

    /// True when any non-duplicate run carries an unexpected result.
    ///
    /// This is the binary trial fed to the change-point detector.
    #[must_use]
    pub fn has_unexpected(&self) -> bool {
        match &self.details {
            None => false,
            Some(details) => details
                .runs
                .iter()
                .any(|r| !r.is_duplicate && r.unexpected_count > 0),
        }
    }
}

/// Converts a raw verdict into its position-verdict form.
///
/// `commit_position` must already be resolved from the verdict's sources
/// (the filter guarantees it exists for verdicts that reach this point).
/// `partition_secs` is truncated to the hour.
#[must_use]
pub fn normalize_verdict(
    tv: &RawTestVariant,
    commit_position: u64,
    partition_secs: u64,
    duplicates: &AHashSet<String>,
) -> PositionVerdict {
    let hour = partition_secs / SECS_PER_HOUR;

    // An expected verdict carries only expected results, so a single
    // result is sufficient for the simple form; checking the length too
    // guards against sources that misreport status.
    let is_simple_expected = tv.status == VerdictStatus::Expected && tv.results.len() == 1;
    if is_simple_expected {
        return PositionVerdict::simple(commit_position, hour);
    }

    PositionVerdict {
        commit_position,
        hour,
        is_simple_expected: false,
        details: Some(verdict_details(tv, duplicates)),
    }
}

/// Groups results into runs and orders them deterministically.
fn verdict_details(tv: &RawTestVariant, duplicates: &AHashSet<String>) -> VerdictDetails {
    // Preserve first-occurrence order while grouping so the pre-sort run
    // order is independent of map iteration order.
    let mut index: AHashMap<&str, usize> = AHashMap::with_capacity(tv.results.len());
    let mut runs: Vec<Run> = Vec::new();

    for result in &tv.results {
        let idx = *index.entry(result.invocation.as_str()).or_insert_with(|| {
            runs.push(Run {
                is_duplicate: duplicates.contains(&result.invocation),
                ..Run::default()
            });
            runs.len() - 1
        });
        if result.expected {
            runs[idx].expected_count += 1;
        } else {
            runs[idx].unexpected_count += 1;
        }
    }

    runs.sort_by(|a, b| {
        a.is_duplicate
            .cmp(&b.is_duplicate)
            .then_with(|| b.unexpected_count.cmp(&a.unexpected_count))
            .then_with(|| b.expected_count.cmp(&a.expected_count))
    });

    VerdictDetails {
        is_exonerated: tv.status == VerdictStatus::Exonerated,
        runs,
    }
}
