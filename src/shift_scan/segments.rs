//! Behavior segments and their finalized counts.
//!
//! A segment models a contiguous range of commit positions during which a
//! key's behavior follows a single Bernoulli parameter. The newest
//! segment is `Finalizing` (its end grows with the buffer); every earlier
//! segment is `Finalized` and its counts change only when evicted buffer
//! history is folded in.

use serde::{Deserialize, Serialize};

use super::verdict::PositionVerdict;

/// Lifecycle state of a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentState {
    /// Open segment covering the buffer's lowest positions.
    Finalizing,
    /// Sealed segment; verdicts no longer reside in the buffer.
    Finalized,
}

/// Aggregate counts over the verdicts absorbed into a segment.
///
/// Duplicate runs contribute to no count. Exonerated verdicts count like
/// any other; exoneration affects triage, not history statistics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Counts {
    /// Individual test results.
    pub total_results: u64,
    /// Results that did not match expectations.
    pub unexpected_results: u64,
    /// Runs (invocations), excluding duplicates.
    pub total_runs: u64,
    /// Runs with only unexpected results.
    pub unexpected_runs: u64,
    /// Runs with both expected and unexpected results.
    pub flaky_runs: u64,
    /// Verdicts.
    pub total_verdicts: u64,
    /// Verdicts whose results were all unexpected.
    pub unexpected_verdicts: u64,
    /// Verdicts with both expected and unexpected results.
    pub flaky_verdicts: u64,
}

impl Counts {
    /// Folds one verdict into the counts.
    pub fn add_verdict(&mut self, v: &PositionVerdict) {
        self.total_verdicts += 1;

        let Some(details) = &v.details else {
            // Simple form: one run of one expected result.
            self.total_results += 1;
            self.total_runs += 1;
            return;
        };

        let mut any_expected = false;
        let mut any_unexpected = false;
        for run in &details.runs {
            if run.is_duplicate {
                continue;
            }
            self.total_runs += 1;
            self.total_results += u64::from(run.expected_count) + u64::from(run.unexpected_count);
            self.unexpected_results += u64::from(run.unexpected_count);
            if run.unexpected_count > 0 && run.expected_count == 0 {
                self.unexpected_runs += 1;
            }
            if run.unexpected_count > 0 && run.expected_count > 0 {
                self.flaky_runs += 1;
            }
            any_expected |= run.expected_count > 0;
            any_unexpected |= run.unexpected_count > 0;
        }

        if any_unexpected && !any_expected {
            self.unexpected_verdicts += 1;
        }
        if any_unexpected && any_expected {
            self.flaky_verdicts += 1;
        }
    }

    /// Folds a batch of verdicts into the counts.
    pub fn add_verdicts<'a>(&mut self, verdicts: impl IntoIterator<Item = &'a PositionVerdict>) {
        for v in verdicts {
            self.add_verdict(v);
        }
    }

    /// Merges another counts block into this one.
    pub fn merge(&mut self, other: &Counts) {
        self.total_results += other.total_results;
        self.unexpected_results += other.unexpected_results;
        self.total_runs += other.total_runs;
        self.unexpected_runs += other.unexpected_runs;
        self.flaky_runs += other.flaky_runs;
        self.total_verdicts += other.total_verdicts;
        self.unexpected_verdicts += other.unexpected_verdicts;
        self.flaky_verdicts += other.flaky_verdicts;
    }
}

/// A contiguous behavioral regime over commit positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Lifecycle state.
    pub state: SegmentState,
    /// True when the segment opens at a detected change point.
    pub has_start_changepoint: bool,
    /// First commit position covered.
    pub start_position: u64,
    /// Last commit position covered; zero while the segment is open.
    pub end_position: u64,
    /// Hour of the first absorbed verdict.
    pub start_hour: u64,
    /// Hour of the last absorbed verdict; zero while the segment is open.
    pub end_hour: u64,
    /// 99% lower bound on the start change point position.
    pub start_position_lower_bound_99: u64,
    /// 99% upper bound on the start change point position.
    pub start_position_upper_bound_99: u64,
    /// Counts of verdicts absorbed out of the buffer.
    pub finalized_counts: Counts,
}

impl Segment {
    /// Opens a finalizing segment without a detected start change point.
    ///
    /// Used for a key's first segment and for eviction folding on keys
    /// where no change point has been detected yet. Both confidence
    /// bounds equal the start position.
    #[must_use]
    pub fn open_without_changepoint(start_position: u64, start_hour: u64) -> Self {
        Self {
            state: SegmentState::Finalizing,
            has_start_changepoint: false,
            start_position,
            end_position: 0,
            start_hour,
            end_hour: 0,
            start_position_lower_bound_99: start_position,
            start_position_upper_bound_99: start_position,
            finalized_counts: Counts::default(),
        }
    }

    /// Opens a finalizing segment at a detected change point.
    #[must_use]
    pub fn open_at_changepoint(
        start_position: u64,
        start_hour: u64,
        lower_bound: u64,
        upper_bound: u64,
    ) -> Self {
        debug_assert!(lower_bound <= start_position);
        debug_assert!(start_position <= upper_bound);
        Self {
            state: SegmentState::Finalizing,
            has_start_changepoint: true,
            start_position,
            end_position: 0,
            start_hour,
            end_hour: 0,
            start_position_lower_bound_99: lower_bound,
            start_position_upper_bound_99: upper_bound,
            finalized_counts: Counts::default(),
        }
    }

    /// Seals the segment at `end_position`/`end_hour`.
    pub fn finalize(&mut self, end_position: u64, end_hour: u64) {
        debug_assert!(self.state == SegmentState::Finalizing);
        debug_assert!(end_position >= self.start_position);
        self.state = SegmentState::Finalized;
        self.end_position = end_position;
        self.end_hour = end_hour;
    }
}
