//! Eviction behavior under restrictive buffer capacities.

use shift_scan_rs::shift_scan::{
    decode_state, BranchKey, IngestLimits, RawTestVariant, TaskContext,
};

use crate::support::{first_task, passing_variant, sample_source_ref, sources_at, Harness};

use ahash::{AHashMap, AHashSet};

fn key_for(test_id: &str) -> BranchKey {
    BranchKey {
        project: "chromium".to_string(),
        test_id: test_id.to_string(),
        variant_hash: "hash".to_string(),
        ref_hash: sample_source_ref().ref_hash(),
    }
}

/// Installs one build whose verdicts for a single key span positions
/// `1..=count`, each under its own sources id.
fn install_positions(harness: &mut Harness, build_id: &str, count: u64) {
    let mut sources = AHashMap::new();
    let mut verdicts = Vec::with_capacity(count as usize);
    for position in 1..=count {
        let sources_id = format!("sources_{position}");
        sources.insert(sources_id.clone(), sources_at(position));
        verdicts.push(RawTestVariant {
            sources_id,
            ..passing_variant("test_1", "hash")
        });
    }
    harness.source.insert_invocation(
        format!("invocations/build-{build_id}"),
        verdicts,
        sources,
        AHashSet::new(),
    );
}

#[test]
fn overflow_evicts_oldest_and_conserves_counts() {
    let limits = IngestLimits {
        hot_buffer_capacity: 10,
        cold_buffer_capacity: 20,
        page_size: 100,
        ..IngestLimits::DEFAULT
    };
    let mut harness = Harness::with_limits(limits);
    install_positions(&mut harness, "1234", 50);

    harness
        .driver()
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect("task succeeds");

    let key = key_for("test_1");
    let row = harness.store.get(&key.encode()).expect("state row");
    let tvb = decode_state(key, &row).expect("state decodes");

    // Capacities hold.
    assert!(tvb.input_buffer.hot.len() <= 10);
    assert!(tvb.input_buffer.cold.len() <= 20);

    // The oldest prefix was evicted into the finalizing segment.
    let finalizing = tvb.finalizing_segment.as_ref().expect("eviction opens one");
    assert!(!finalizing.has_start_changepoint);
    assert_eq!(finalizing.start_position, 1);
    assert_eq!(
        finalizing.start_position_lower_bound_99,
        finalizing.start_position
    );
    assert_eq!(
        finalizing.start_position_upper_bound_99,
        finalizing.start_position
    );

    // Conservation: folded counts plus buffered verdicts cover all 50.
    let folded = finalizing.finalized_counts.total_verdicts;
    assert!(folded > 0);
    assert_eq!(folded + tvb.input_buffer.len() as u64, 50);

    // The retained suffix is the newest contiguous run.
    let min = tvb.input_buffer.min_position().unwrap();
    assert_eq!(min, 50 - tvb.input_buffer.len() as u64 + 1);
    assert_eq!(tvb.input_buffer.max_position(), Some(50));
}

#[test]
fn eviction_keeps_working_across_tasks() {
    let limits = IngestLimits {
        hot_buffer_capacity: 10,
        cold_buffer_capacity: 20,
        page_size: 100,
        ..IngestLimits::DEFAULT
    };
    let mut harness = Harness::with_limits(limits);

    // Two builds extend the same key's history back to back.
    install_positions(&mut harness, "b1", 40);
    harness
        .driver()
        .run_task(&first_task("chromium", "b1"), &TaskContext::unbounded())
        .expect("first build");

    let mut sources = AHashMap::new();
    let mut verdicts = Vec::new();
    for position in 41..=80u64 {
        let sources_id = format!("sources_{position}");
        sources.insert(sources_id.clone(), sources_at(position));
        verdicts.push(RawTestVariant {
            sources_id,
            ..passing_variant("test_1", "hash")
        });
    }
    harness.source.insert_invocation(
        "invocations/build-b2".to_string(),
        verdicts,
        sources,
        AHashSet::new(),
    );
    harness
        .driver()
        .run_task(&first_task("chromium", "b2"), &TaskContext::unbounded())
        .expect("second build");

    let key = key_for("test_1");
    let row = harness.store.get(&key.encode()).expect("state row");
    let tvb = decode_state(key, &row).expect("state decodes");

    assert!(tvb.input_buffer.hot.len() <= 10);
    assert!(tvb.input_buffer.cold.len() <= 20);

    let folded = tvb.total_finalized_counts().total_verdicts;
    assert_eq!(folded + tvb.input_buffer.len() as u64, 80);
    assert_eq!(tvb.input_buffer.max_position(), Some(80));
    tvb.assert_invariants();
}
