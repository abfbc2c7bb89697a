//! Per-key analysis state and its mutation rules.
//!
//! A `TestVariantBranch` owns everything persisted for one
//! (test, variant, branch): the bounded input buffer, the open finalizing
//! segment, and the sealed finalized segments. All mutation goes through
//! three entry points, in ingestion order:
//!
//! 1. [`TestVariantBranch::is_out_of_order`] — gate a candidate verdict.
//! 2. [`TestVariantBranch::insert_verdict`] — ordered insert with
//!    eviction folding.
//! 3. [`TestVariantBranch::run_analysis`] — detect change points, seal
//!    the finalized prefix, truncate the buffer.
//!
//! # Invariants
//! - Finalized segments are contiguous, non-overlapping, ascending by
//!   start position.
//! - The finalizing segment, if present, starts at
//!   `last_finalized.end_position + 1` and covers the buffer's lowest
//!   positions; no buffered verdict lies below its start.
//! - Counts are conserved: counts across all segments plus the buffer
//!   equal every verdict ever inserted.

use std::collections::BTreeMap;

use super::changepoint::{detect_changepoints, ChangePoint, DetectorConfig};
use super::input_buffer::InputBuffer;
use super::key::BranchKey;
use super::segments::{Segment, SegmentState};
use super::source::SourceRef;
use super::verdict::PositionVerdict;

/// Persisted analysis state for one (test, variant, branch).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestVariantBranch {
    /// Identity of this state row.
    pub key: BranchKey,
    /// Variant definition key/value pairs.
    pub variant: BTreeMap<String, String>,
    /// Branch the commit positions are ordered on.
    pub source_ref: SourceRef,
    /// Bounded verdict history awaiting analysis.
    pub input_buffer: InputBuffer,
    /// Open segment covering the buffer's lowest positions.
    pub finalizing_segment: Option<Segment>,
    /// Sealed segments, ascending by start position.
    pub finalized_segments: Vec<Segment>,
}

/// Summary of what one analysis pass changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnalysisUpdate {
    /// Segments sealed by this pass.
    pub newly_finalized: usize,
    /// True when the finalizing segment was created or replaced.
    pub finalizing_changed: bool,
}

impl TestVariantBranch {
    /// Creates empty state for a key first seen now.
    #[must_use]
    pub fn new(
        key: BranchKey,
        variant: BTreeMap<String, String>,
        source_ref: SourceRef,
        hot_capacity: usize,
        cold_capacity: usize,
    ) -> Self {
        Self {
            key,
            variant,
            source_ref,
            input_buffer: InputBuffer::new(hot_capacity, cold_capacity),
            finalizing_segment: None,
            finalized_segments: Vec::new(),
        }
    }

    /// True when a verdict at `position` arrived behind the analyzed
    /// frontier and must be discarded.
    ///
    /// Once any segment exists, every position strictly below the lowest
    /// buffered position has already been classified; re-inserting there
    /// would silently corrupt sealed counts. Keys with no segments accept
    /// any order (the buffer sorts).
    #[must_use]
    pub fn is_out_of_order(&self, position: u64) -> bool {
        if self.finalizing_segment.is_none() && self.finalized_segments.is_empty() {
            return false;
        }
        match self.input_buffer.min_position() {
            Some(min) => position < min,
            None => self
                .finalizing_segment
                .as_ref()
                .is_some_and(|s| position < s.start_position),
        }
    }

    /// Inserts a verdict, folding any evicted prefix into segment counts.
    ///
    /// The caller must have rejected out-of-order verdicts first.
    pub fn insert_verdict(&mut self, v: PositionVerdict) {
        debug_assert!(
            !self.is_out_of_order(v.commit_position),
            "out-of-order verdict must be discarded before insertion"
        );
        let evicted = self.input_buffer.insert(v);
        self.fold_evicted(evicted);
    }

    /// Folds evicted verdicts into the finalizing segment's counts.
    ///
    /// The evicted prefix is the oldest buffered history, which by the
    /// buffer invariant belongs to the finalizing segment's range. A key
    /// that overflows before any change point is detected gets a
    /// finalizing segment without a start change point.
    fn fold_evicted(&mut self, evicted: Vec<PositionVerdict>) {
        let Some(first) = evicted.first() else {
            return;
        };
        let finalizing = self.finalizing_segment.get_or_insert_with(|| {
            Segment::open_without_changepoint(first.commit_position, first.hour)
        });
        finalizing.finalized_counts.add_verdicts(evicted.iter());
    }

    /// Runs change-point analysis and applies the finalization rule.
    ///
    /// When change points are detected, every verdict strictly below the
    /// newest one is absorbed into sealed segments: the existing
    /// finalizing segment (or a fresh no-change-point segment for a new
    /// key) seals at each boundary, and the newest change point opens the
    /// next finalizing segment. The buffer is then truncated to the new
    /// finalizing start and compacted, so the retained suffix lives in
    /// cold.
    pub fn run_analysis(&mut self, config: &DetectorConfig) -> AnalysisUpdate {
        let merged = self.input_buffer.merged();
        if merged.len() < config.min_verdicts {
            return AnalysisUpdate::default();
        }

        let outcomes: Vec<bool> = merged.iter().map(PositionVerdict::has_unexpected).collect();
        let mut changepoints = detect_changepoints(&outcomes, config);
        // Segments span whole commit positions; a split inside a run of
        // repeated positions cannot form a segment boundary.
        changepoints.retain(|cp| {
            merged[cp.split_index - 1].commit_position < merged[cp.split_index].commit_position
        });
        if changepoints.is_empty() {
            return AnalysisUpdate::default();
        }

        let update = self.apply_changepoints(&merged, &changepoints);

        let newest_start = self
            .finalizing_segment
            .as_ref()
            .expect("analysis always leaves a finalizing segment")
            .start_position;
        self.input_buffer.truncate_below(newest_start);
        let evicted = self.input_buffer.compact();
        self.fold_evicted(evicted);

        update
    }

    /// Seals segments at each change point and opens the newest.
    fn apply_changepoints(
        &mut self,
        merged: &[PositionVerdict],
        changepoints: &[ChangePoint],
    ) -> AnalysisUpdate {
        debug_assert!(!changepoints.is_empty());

        let mut open = match self.finalizing_segment.take() {
            Some(segment) => segment,
            None => Segment::open_without_changepoint(merged[0].commit_position, merged[0].hour),
        };
        debug_assert!(
            merged[0].commit_position >= open.start_position,
            "buffer extends below the finalizing segment"
        );

        let mut sealed = 0usize;
        let mut range_start = 0usize;
        for cp in changepoints {
            let boundary = &merged[cp.split_index];
            let last_absorbed = &merged[cp.split_index - 1];

            open.finalized_counts
                .add_verdicts(merged[range_start..cp.split_index].iter());
            open.finalize(boundary.commit_position - 1, last_absorbed.hour);
            self.finalized_segments.push(open);
            sealed += 1;

            open = Segment::open_at_changepoint(
                boundary.commit_position,
                boundary.hour,
                merged[cp.lower_index - 1].commit_position,
                merged[cp.upper_index].commit_position,
            );
            range_start = cp.split_index;
        }

        self.finalizing_segment = Some(open);
        AnalysisUpdate {
            newly_finalized: sealed,
            finalizing_changed: true,
        }
    }

    /// Sum of finalized counts across all segments, for conservation
    /// checks and reporting.
    #[must_use]
    pub fn total_finalized_counts(&self) -> super::segments::Counts {
        let mut total = super::segments::Counts::default();
        for segment in &self.finalized_segments {
            total.merge(&segment.finalized_counts);
        }
        if let Some(finalizing) = &self.finalizing_segment {
            total.merge(&finalizing.finalized_counts);
        }
        total
    }

    /// Validates structural invariants; test and debug aid.
    ///
    /// # Panics
    ///
    /// Panics on any violated invariant.
    pub fn assert_invariants(&self) {
        assert!(self.input_buffer.hot.len() <= self.input_buffer.hot_capacity);
        assert!(self.input_buffer.cold.len() <= self.input_buffer.cold_capacity);

        for pair in self.finalized_segments.windows(2) {
            assert_eq!(
                pair[0].end_position + 1,
                pair[1].start_position,
                "finalized segments must be contiguous"
            );
        }
        for segment in &self.finalized_segments {
            assert_eq!(segment.state, SegmentState::Finalized);
            assert!(segment.start_position <= segment.end_position);
            assert!(segment.start_position_lower_bound_99 <= segment.start_position);
            assert!(segment.start_position <= segment.start_position_upper_bound_99);
        }
        if let Some(finalizing) = &self.finalizing_segment {
            assert_eq!(finalizing.state, SegmentState::Finalizing);
            if let Some(last) = self.finalized_segments.last() {
                assert_eq!(last.end_position + 1, finalizing.start_position);
            }
            if let Some(min) = self.input_buffer.min_position() {
                assert!(
                    min >= finalizing.start_position,
                    "buffered verdict below finalizing start"
                );
            }
        } else {
            assert!(
                self.finalized_segments.is_empty(),
                "finalized segments require a finalizing successor"
            );
        }
    }
}
