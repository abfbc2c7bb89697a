//! End-to-end change-point scenarios against seeded store state.

use std::collections::BTreeMap;

use shift_scan_rs::shift_scan::{
    decode_state, reason, BranchKey, Counts, PositionVerdict, Run, SegmentState, TaskContext,
    TestVariantBranch, VerdictDetails,
};

use crate::support::{first_task, passing_variant, sample_source_ref, sample_variant_def, Harness};

fn seeded_key() -> BranchKey {
    BranchKey {
        project: "chromium".to_string(),
        test_id: "test_1".to_string(),
        variant_hash: "hash_1".to_string(),
        ref_hash: sample_source_ref().ref_hash(),
    }
}

fn expected_at(position: u64) -> PositionVerdict {
    PositionVerdict::simple(position, position)
}

fn unexpected_at(position: u64) -> PositionVerdict {
    PositionVerdict {
        commit_position: position,
        hour: position,
        is_simple_expected: false,
        details: Some(VerdictDetails {
            is_exonerated: false,
            runs: vec![Run {
                expected_count: 0,
                unexpected_count: 1,
                is_duplicate: false,
            }],
        }),
    }
}

/// Seeds 100 expected then 1900 unexpected verdicts into cold.
fn seeded_branch() -> TestVariantBranch {
    let mut tvb = TestVariantBranch::new(
        seeded_key(),
        sample_variant_def(),
        sample_source_ref(),
        100,
        2000,
    );
    let mut cold: Vec<PositionVerdict> = (1..=100).map(expected_at).collect();
    cold.extend((101..=2000).map(unexpected_at));
    tvb.input_buffer.cold.verdicts = cold;
    tvb
}

#[test]
fn midstream_changepoint_is_detected_and_exported() {
    let mut harness = Harness::new();
    harness.seed_branch(&seeded_branch());
    harness.install_build("1234", vec![passing_variant("test_1", "hash_1")], 10);

    let outcome = harness
        .driver()
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect("task succeeds");
    assert_eq!(outcome.batches_applied, 1);
    assert_eq!(harness.store.rows_with_prefix(b"ck"), 1);
    assert_eq!(harness.counters.get("chromium", reason::INGESTED), 1);

    let key = seeded_key();
    let row = harness.store.get(&key.encode()).expect("state row");
    let tvb = decode_state(key, &row).expect("state decodes");

    // The prefix up to the change point sealed, including the extra
    // verdict that landed back at position 10.
    assert_eq!(tvb.finalized_segments.len(), 1);
    let sealed = &tvb.finalized_segments[0];
    assert_eq!(sealed.state, SegmentState::Finalized);
    assert!(!sealed.has_start_changepoint);
    assert_eq!(sealed.start_position, 1);
    assert_eq!(sealed.end_position, 100);
    assert_eq!(sealed.start_hour, 1);
    assert_eq!(sealed.end_hour, 100);
    assert_eq!(
        sealed.finalized_counts,
        Counts {
            total_results: 101,
            total_runs: 101,
            total_verdicts: 101,
            ..Counts::default()
        }
    );

    let finalizing = tvb.finalizing_segment.as_ref().expect("finalizing opened");
    assert_eq!(finalizing.state, SegmentState::Finalizing);
    assert!(finalizing.has_start_changepoint);
    assert_eq!(finalizing.start_position, 101);
    assert_eq!(finalizing.start_position_lower_bound_99, 100);
    assert_eq!(finalizing.start_position_upper_bound_99, 101);
    assert_eq!(finalizing.finalized_counts, Counts::default());

    // The buffer keeps exactly the finalizing suffix, compacted to cold.
    assert!(tvb.input_buffer.hot.is_empty());
    assert_eq!(tvb.input_buffer.cold.len(), 1900);
    assert_eq!(tvb.input_buffer.min_position(), Some(101));

    // Export: one sealed row plus the live finalizing row.
    let rows = harness.sink.rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].state, SegmentState::Finalized);
    assert_eq!(rows[0].start_position, 1);
    assert_eq!(rows[0].end_position, 100);
    assert_eq!(rows[0].finalized_counts.total_verdicts, 101);
    assert_eq!(rows[1].state, SegmentState::Finalizing);
    assert_eq!(rows[1].start_position, 101);
    assert_eq!(rows[1].end_position, 2000, "live end from the buffer");
    assert!(rows.iter().all(|r| r.version > 0));
}

#[test]
fn out_of_order_verdict_is_discarded() {
    let mut harness = Harness::new();

    // A branch whose finalizing segment starts at 11, buffer at 11..30.
    let mut tvb = TestVariantBranch::new(
        seeded_key(),
        sample_variant_def(),
        sample_source_ref(),
        100,
        2000,
    );
    tvb.input_buffer.cold.verdicts = (11..=30).map(expected_at).collect();
    tvb.finalizing_segment = Some(
        shift_scan_rs::shift_scan::Segment::open_without_changepoint(11, 11),
    );
    harness.seed_branch(&tvb);

    // The incoming verdict lands at position 10, below the frontier.
    harness.install_build("1234", vec![passing_variant("test_1", "hash_1")], 10);

    let outcome = harness
        .driver()
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect("task succeeds");
    assert_eq!(outcome.verdicts_kept, 1);

    assert_eq!(
        harness
            .counters
            .get("chromium", reason::OUT_OF_ORDER_DISCARDED),
        1
    );
    assert_eq!(harness.counters.get("chromium", reason::INGESTED), 0);

    let key = seeded_key();
    let row = harness.store.get(&key.encode()).expect("state row");
    let after = decode_state(key, &row).expect("state decodes");
    assert_eq!(after.input_buffer.len(), 20, "buffer unchanged");
    assert_eq!(after.input_buffer.min_position(), Some(11));
    assert!(after.finalized_segments.is_empty());
}

#[test]
fn in_order_growth_extends_the_finalizing_segment() {
    let mut harness = Harness::new();
    harness.seed_branch(&seeded_branch());

    // New verdict above the buffer: plain growth, no new change point.
    harness.install_build("1234", vec![passing_variant("test_1", "hash_1")], 2001);

    harness
        .driver()
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect("task succeeds");

    let key = seeded_key();
    let row = harness.store.get(&key.encode()).expect("state row");
    let tvb = decode_state(key, &row).expect("state decodes");

    assert_eq!(tvb.finalized_segments.len(), 1);
    let finalizing = tvb.finalizing_segment.as_ref().unwrap();
    assert_eq!(finalizing.start_position, 101);
    assert_eq!(tvb.input_buffer.max_position(), Some(2001));

    // The exported live row's end tracks the new maximum.
    let rows = harness.sink.rows();
    let live = rows.last().unwrap();
    assert_eq!(live.state, SegmentState::Finalizing);
    assert_eq!(live.end_position, 2001);
}

#[test]
fn confidence_bounds_bracket_the_start_position() {
    let mut harness = Harness::new();
    harness.seed_branch(&seeded_branch());
    harness.install_build("1234", vec![passing_variant("test_1", "hash_1")], 10);
    harness
        .driver()
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect("task succeeds");

    let key = seeded_key();
    let row = harness.store.get(&key.encode()).expect("state row");
    let tvb = decode_state(key, &row).expect("state decodes");

    let finalizing = tvb.finalizing_segment.as_ref().unwrap();
    assert!(finalizing.start_position_lower_bound_99 <= finalizing.start_position);
    assert!(finalizing.start_position <= finalizing.start_position_upper_bound_99);

    let mut variant = BTreeMap::new();
    variant.insert("k".to_string(), "v".to_string());
    assert_eq!(tvb.variant, variant, "seeded variant definition survives");
}
