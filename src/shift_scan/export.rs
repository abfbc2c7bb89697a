//! Export sink adapter: segments out, at least once.
//!
//! After a sub-batch commits, each mutated key is rendered into rows:
//! one per segment sealed by that commit, plus one for the live open
//! segment so downstream always sees the current regime. Rows carry the
//! commit sequence as their version; the sink contract is at-least-once
//! and downstream deduplicates on `(key, segment start, version)`.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::errors::ExportError;
use super::segments::{Counts, SegmentState};
use super::state::TestVariantBranch;

/// One exported segment row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRow {
    /// Project of the exported key.
    pub project: String,
    /// Test identifier.
    pub test_id: String,
    /// Variant hash.
    pub variant_hash: String,
    /// Branch hash, lowercase hex.
    pub ref_hash: String,
    /// Segment lifecycle state.
    pub state: SegmentState,
    /// True when the segment opens at a detected change point.
    pub has_start_changepoint: bool,
    /// First commit position covered.
    pub start_position: u64,
    /// Last commit position covered; for an open segment, the largest
    /// buffered position.
    pub end_position: u64,
    /// Hour of the first covered verdict.
    pub start_hour: u64,
    /// Hour of the last covered verdict.
    pub end_hour: u64,
    /// 99% lower bound on the start change point.
    pub start_position_lower_bound_99: u64,
    /// 99% upper bound on the start change point.
    pub start_position_upper_bound_99: u64,
    /// Counts absorbed out of the buffer.
    pub finalized_counts: Counts,
    /// Commit sequence of the transaction that produced this row.
    pub version: u64,
}

/// Destination for exported segment rows.
pub trait SegmentSink: Send + Sync {
    /// Emits `rows`; at-least-once, so implementations must tolerate
    /// duplicates under retry.
    fn export(&self, rows: &[SegmentRow]) -> Result<(), ExportError>;
}

/// Sink that collects rows in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingSegmentSink {
    rows: Mutex<Vec<SegmentRow>>,
}

impl CollectingSegmentSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all rows exported so far.
    #[must_use]
    pub fn rows(&self) -> Vec<SegmentRow> {
        self.rows.lock().expect("sink lock poisoned").clone()
    }

    /// Number of rows exported so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().expect("sink lock poisoned").len()
    }

    /// True when nothing has been exported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SegmentSink for CollectingSegmentSink {
    fn export(&self, rows: &[SegmentRow]) -> Result<(), ExportError> {
        self.rows
            .lock()
            .expect("sink lock poisoned")
            .extend_from_slice(rows);
        Ok(())
    }
}

/// Renders the export rows for a key mutated by a committed transaction.
///
/// Emits the last `newly_finalized` sealed segments (the ones this
/// commit produced) followed by the live open segment: the finalizing
/// segment with its end materialized from the buffer, or a synthetic
/// open segment spanning the buffer when no change point has been
/// detected yet. A key whose buffer and segments are all empty produces
/// no rows.
#[must_use]
pub fn rows_for_branch(
    tvb: &TestVariantBranch,
    newly_finalized: usize,
    version: u64,
) -> Vec<SegmentRow> {
    let mut rows = Vec::with_capacity(newly_finalized + 1);

    let sealed = &tvb.finalized_segments;
    debug_assert!(newly_finalized <= sealed.len());
    let first_new = sealed.len().saturating_sub(newly_finalized);
    for segment in &sealed[first_new..] {
        rows.push(segment_row(tvb, version, segment));
    }

    if let Some(finalizing) = &tvb.finalizing_segment {
        let mut row = segment_row(tvb, version, finalizing);
        row.end_position = tvb.input_buffer.max_position().unwrap_or(0);
        row.end_hour = tvb.input_buffer.max_hour().unwrap_or(0);
        rows.push(row);
    } else if !tvb.input_buffer.is_empty() {
        // No detected change point yet: synthesize the live regime from
        // the buffer extent so downstream always sees current behavior.
        let start_position = tvb
            .input_buffer
            .min_position()
            .expect("non-empty buffer has a minimum");
        let merged = tvb.input_buffer.merged();
        rows.push(SegmentRow {
            project: tvb.key.project.clone(),
            test_id: tvb.key.test_id.clone(),
            variant_hash: tvb.key.variant_hash.clone(),
            ref_hash: tvb.key.ref_hash.to_hex(),
            state: SegmentState::Finalizing,
            has_start_changepoint: false,
            start_position,
            end_position: tvb.input_buffer.max_position().unwrap_or(start_position),
            start_hour: merged.first().map_or(0, |v| v.hour),
            end_hour: tvb.input_buffer.max_hour().unwrap_or(0),
            start_position_lower_bound_99: start_position,
            start_position_upper_bound_99: start_position,
            finalized_counts: Counts::default(),
            version,
        });
    }

    rows
}

fn segment_row(
    tvb: &TestVariantBranch,
    version: u64,
    segment: &super::segments::Segment,
) -> SegmentRow {
    SegmentRow {
        project: tvb.key.project.clone(),
        test_id: tvb.key.test_id.clone(),
        variant_hash: tvb.key.variant_hash.clone(),
        ref_hash: tvb.key.ref_hash.to_hex(),
        state: segment.state,
        has_start_changepoint: segment.has_start_changepoint,
        start_position: segment.start_position,
        end_position: segment.end_position,
        start_hour: segment.start_hour,
        end_hour: segment.end_hour,
        start_position_lower_bound_99: segment.start_position_lower_bound_99,
        start_position_upper_bound_99: segment.start_position_upper_bound_99,
        finalized_counts: segment.finalized_counts,
        version,
    }
}
