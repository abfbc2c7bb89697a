//! Verdict filtering ahead of buffer insertion.
//!
//! Verdicts that must not influence statistics are discarded here, each
//! under exactly one counted reason. The checks run in a fixed order so a
//! verdict failing several conditions always reports the same reason.
//!
//! # Skip order
//! 1. No resolvable sources descriptor.
//! 2. Sources without a numeric commit position.
//! 3. Dirty sources (uncommitted local changes).
//! 4. Presubmit verdicts whose code never landed.
//! 5. All runs skipped, or all invocations duplicates.

use ahash::{AHashMap, AHashSet};

use super::counters::{reason, VerdictCounters};
use super::source::{RawTestVariant, Sources, TestStatus};
use super::task::PresubmitInfo;

/// Why a verdict was discarded before ingestion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// No sources descriptor resolvable for the verdict.
    NoSource,
    /// Sources carry no numeric commit position.
    NoCommitData,
    /// Sources are marked dirty.
    DirtySource,
    /// Presubmit run whose code was not submitted.
    UnsubmittedCode,
    /// Every run is SKIP, or every invocation is a duplicate.
    AllSkippedOrDuplicate,
}

impl SkipReason {
    /// The counter name this reason increments.
    #[must_use]
    pub fn counter_name(&self) -> &'static str {
        match self {
            Self::NoSource => reason::SKIPPED_NO_SOURCE,
            Self::NoCommitData => reason::SKIPPED_NO_COMMIT_DATA,
            Self::DirtySource => reason::SKIPPED_DIRTY_SOURCE,
            Self::UnsubmittedCode => reason::SKIPPED_UNSUBMITTED_CODE,
            Self::AllSkippedOrDuplicate => reason::SKIPPED_ALL_SKIPPED_OR_DUPLICATE,
        }
    }
}

/// Context a filtering pass runs under.
pub struct FilterContext<'a> {
    /// Project the verdicts belong to (counter dimension).
    pub project: &'a str,
    /// Presubmit context of the ingested build, if any.
    pub presubmit: Option<&'a PresubmitInfo>,
    /// Sources descriptors keyed by `sources_id`.
    pub sources: &'a AHashMap<String, Sources>,
    /// Invocations known to duplicate already-ingested work.
    pub duplicates: &'a AHashSet<String>,
}

/// Determines whether a single verdict must be skipped.
#[must_use]
pub fn skip_reason(tv: &RawTestVariant, ctx: &FilterContext<'_>) -> Option<SkipReason> {
    let Some(sources) = ctx.sources.get(&tv.sources_id) else {
        return Some(SkipReason::NoSource);
    };
    if sources.commit_position().is_none() {
        return Some(SkipReason::NoCommitData);
    }
    if sources.is_dirty {
        return Some(SkipReason::DirtySource);
    }
    if !sources.changelists.is_empty() {
        // Presubmit data: only runs whose code actually landed reflect the
        // branch's behavior at a commit position.
        let submitted = ctx.presubmit.is_some_and(PresubmitInfo::code_submitted);
        if !submitted {
            return Some(SkipReason::UnsubmittedCode);
        }
    }
    if all_skipped_or_duplicate(tv, ctx.duplicates) {
        return Some(SkipReason::AllSkippedOrDuplicate);
    }
    None
}

fn all_skipped_or_duplicate(tv: &RawTestVariant, duplicates: &AHashSet<String>) -> bool {
    if tv.results.is_empty() {
        return true;
    }
    let all_skipped = tv.results.iter().all(|r| r.status == TestStatus::Skip);
    let all_duplicate = tv
        .results
        .iter()
        .all(|r| duplicates.contains(&r.invocation));
    all_skipped || all_duplicate
}

/// Filters a batch of verdicts, counting each discard by reason.
///
/// Returns the verdicts that should proceed to normalization, in input
/// order.
#[must_use]
pub fn filter_verdicts(
    verdicts: Vec<RawTestVariant>,
    ctx: &FilterContext<'_>,
    counters: &VerdictCounters,
) -> Vec<RawTestVariant> {
    let mut kept = Vec::with_capacity(verdicts.len());
    for tv in verdicts {
        match skip_reason(&tv, ctx) {
            Some(skip) => counters.increment(ctx.project, skip.counter_name()),
            None => kept.push(tv),
        }
    }
    kept
}
