//! End-to-end driver scenarios: batching, checkpoints, idempotent
//! retries, filtering, and continuation scheduling.

use ahash::{AHashMap, AHashSet};

use shift_scan_rs::shift_scan::{
    reason, CancellationToken, IngestError, IngestLimits, RawResult, RawTestVariant, TestStatus,
    VerdictStatus,
};

use crate::support::{
    first_task, passing_variant, sample_sources_map, sources_at, Harness, NOW_SECS,
};

#[test]
fn fresh_keys_create_batched_checkpoints() {
    let limits = IngestLimits {
        page_size: 5000,
        batch_key_limit: 1000,
        ..IngestLimits::DEFAULT
    };
    let mut harness = Harness::with_limits(limits);

    let verdicts: Vec<RawTestVariant> = (0..4500)
        .map(|i| passing_variant(&format!("test_{i}"), &format!("hash_{i}")))
        .collect();
    harness.install_build("1234", verdicts, 10);

    let task = first_task("chromium", "1234");
    let outcome = harness
        .driver()
        .run_task(&task, &shift_scan_rs::shift_scan::TaskContext::unbounded())
        .expect("task succeeds");

    assert_eq!(outcome.verdicts_seen, 4500);
    assert_eq!(outcome.verdicts_kept, 4500);
    assert_eq!(outcome.batches_applied, 5);
    assert_eq!(outcome.batches_skipped, 0);
    assert!(outcome.collect_scheduled);
    assert!(!outcome.continuation_scheduled);

    // 5 checkpoint rows, 4500 state rows, one live-regime row per key.
    assert_eq!(harness.store.rows_with_prefix(b"ck"), 5);
    assert_eq!(harness.store.rows_with_prefix(b"tb"), 4500);
    assert_eq!(harness.sink.len(), 4500);
    assert_eq!(harness.counters.get("chromium", reason::INGESTED), 4500);

    // Spot-check one key: a single hot verdict, no segments.
    let key = branch_key_for("chromium", "test_7", "hash_7");
    let row = harness.store.get(&key.encode()).expect("state row exists");
    let tvb = shift_scan_rs::shift_scan::decode_state(key, &row).expect("state decodes");
    assert_eq!(tvb.input_buffer.hot.len(), 1);
    assert_eq!(tvb.input_buffer.hot.verdicts[0].commit_position, 10);
    assert!(tvb.input_buffer.hot.verdicts[0].is_simple_expected);
    assert!(tvb.input_buffer.cold.is_empty());
    assert!(tvb.finalizing_segment.is_none());
    assert!(tvb.finalized_segments.is_empty());
}

#[test]
fn rerunning_a_task_is_idempotent() {
    let mut harness = Harness::new();
    let verdicts: Vec<RawTestVariant> = (0..100)
        .map(|i| passing_variant(&format!("test_{i}"), &format!("hash_{i}")))
        .collect();
    harness.install_build("1234", verdicts, 10);
    let task = first_task("chromium", "1234");

    let ctx = shift_scan_rs::shift_scan::TaskContext::unbounded();
    let first = harness.driver().run_task(&task, &ctx).expect("first run");
    assert_eq!(first.batches_applied, 1);

    let key = branch_key_for("chromium", "test_3", "hash_3");
    let state_after_first = harness.store.get(&key.encode()).expect("row exists");
    let rows_after_first = harness.sink.len();
    assert_eq!(rows_after_first, 100);

    let second = harness.driver().run_task(&task, &ctx).expect("second run");
    assert_eq!(second.batches_applied, 0);
    assert_eq!(second.batches_skipped, 1);

    // No new checkpoints, no new rows, byte-identical state.
    assert_eq!(harness.store.rows_with_prefix(b"ck"), 1);
    assert_eq!(harness.sink.len(), rows_after_first);
    assert_eq!(
        harness.store.get(&key.encode()).expect("row exists"),
        state_after_first
    );
    assert_eq!(harness.counters.get("chromium", reason::INGESTED), 100);
}

#[test]
fn filter_fan_out_counts_every_reason() {
    let mut harness = Harness::new();

    let mut sources = sample_sources_map(10);
    let mut dirty = sources_at(10);
    dirty.is_dirty = true;
    sources.insert("sources_id_dirty".to_string(), dirty);

    let mut duplicates = AHashSet::new();
    duplicates.insert("inv-2".to_string());

    let all_skip = RawTestVariant {
        results: vec![RawResult {
            invocation: "inv-1".to_string(),
            expected: true,
            status: TestStatus::Skip,
        }],
        ..passing_variant("1", "hash_1")
    };
    let duplicate = RawTestVariant {
        status: VerdictStatus::Flaky,
        results: vec![
            RawResult {
                invocation: "inv-2".to_string(),
                expected: true,
                status: TestStatus::Pass,
            },
            RawResult {
                invocation: "inv-2".to_string(),
                expected: false,
                status: TestStatus::Fail,
            },
        ],
        ..passing_variant("2", "hash_2")
    };
    let valid = passing_variant("3", "hash_3");
    let no_source = RawTestVariant {
        sources_id: "sources_id_missing".to_string(),
        ..passing_variant("4", "hash_4")
    };
    let dirty_source = RawTestVariant {
        sources_id: "sources_id_dirty".to_string(),
        ..passing_variant("5", "hash_5")
    };

    harness.source.insert_invocation(
        "invocations/build-1234",
        vec![all_skip, duplicate, valid, no_source, dirty_source],
        sources,
        duplicates,
    );

    let outcome = harness
        .driver()
        .run_task(
            &first_task("chromium", "1234"),
            &shift_scan_rs::shift_scan::TaskContext::unbounded(),
        )
        .expect("task succeeds");

    assert_eq!(outcome.verdicts_seen, 5);
    assert_eq!(outcome.verdicts_kept, 1);
    assert_eq!(harness.store.rows_with_prefix(b"tb"), 1);

    let get = |r| harness.counters.get("chromium", r);
    assert_eq!(get(reason::SKIPPED_ALL_SKIPPED_OR_DUPLICATE), 2);
    assert_eq!(get(reason::SKIPPED_NO_SOURCE), 1);
    assert_eq!(get(reason::SKIPPED_DIRTY_SOURCE), 1);
    assert_eq!(get(reason::INGESTED), 1);
}

#[test]
fn stale_partition_time_fails_permanently() {
    let mut harness = Harness::new();
    harness.install_build("1234", vec![passing_variant("t", "h")], 10);

    let mut task = first_task("chromium", "1234");
    task.partition_time_secs = NOW_SECS - 91 * 24 * 3600;

    let err = harness
        .driver()
        .run_task(&task, &shift_scan_rs::shift_scan::TaskContext::unbounded())
        .expect_err("stale partition time");
    assert!(matches!(err, IngestError::BadPartitionTime { .. }));
    assert!(err.is_permanent());
    assert_eq!(harness.store.rows_with_prefix(b"ck"), 0);
}

#[test]
fn future_partition_time_fails_permanently() {
    let mut harness = Harness::new();
    harness.install_build("1234", vec![passing_variant("t", "h")], 10);

    let mut task = first_task("chromium", "1234");
    task.partition_time_secs = NOW_SECS + 25 * 3600;

    let err = harness
        .driver()
        .run_task(&task, &shift_scan_rs::shift_scan::TaskContext::unbounded())
        .expect_err("future partition time");
    assert!(matches!(err, IngestError::BadPartitionTime { .. }));
}

#[test]
fn partition_time_inside_the_window_passes() {
    let mut harness = Harness::new();
    harness.install_build("1234", vec![passing_variant("t", "h")], 10);

    let mut task = first_task("chromium", "1234");
    task.partition_time_secs = NOW_SECS - 3600;
    harness
        .driver()
        .run_task(&task, &shift_scan_rs::shift_scan::TaskContext::unbounded())
        .expect("recent partition time is accepted");
}

#[test]
fn unknown_project_fails_permanently() {
    let mut harness = Harness::new();
    harness.install_build("1234", vec![passing_variant("t", "h")], 10);

    let mut known = AHashSet::new();
    known.insert("chromium".to_string());
    let mut driver = harness.driver();
    driver.known_projects = Some(known);

    let err = driver
        .run_task(
            &first_task("fuchsia", "1234"),
            &shift_scan_rs::shift_scan::TaskContext::unbounded(),
        )
        .expect_err("unknown project");
    assert!(matches!(err, IngestError::UnknownProject { .. }));
    assert!(err.is_permanent());
}

#[test]
fn paged_build_schedules_each_continuation_once() {
    let limits = IngestLimits {
        page_size: 10,
        ..IngestLimits::DEFAULT
    };
    let mut harness = Harness::with_limits(limits);
    let verdicts: Vec<RawTestVariant> = (0..25)
        .map(|i| passing_variant(&format!("test_{i}"), &format!("hash_{i}")))
        .collect();
    harness.install_build("1234", verdicts, 10);

    let ctx = shift_scan_rs::shift_scan::TaskContext::unbounded();
    let task0 = first_task("chromium", "1234");
    let outcome0 = harness.driver().run_task(&task0, &ctx).expect("page 1");
    assert!(outcome0.continuation_scheduled);
    assert!(!outcome0.collect_scheduled);

    let scheduled = harness.scheduler.ingest_tasks();
    assert_eq!(scheduled.len(), 1);
    let task1 = scheduled[0].clone();
    assert_eq!(task1.task_index, 1);
    assert_eq!(task1.page_token.as_deref(), Some("10"));

    // Retrying the first task applies nothing new and does not schedule
    // a second copy of the continuation.
    let retry = harness.driver().run_task(&task0, &ctx).expect("retry");
    assert_eq!(retry.batches_applied, 0);
    assert!(!retry.continuation_scheduled);
    assert_eq!(harness.scheduler.ingest_tasks().len(), 1);

    let outcome1 = harness.driver().run_task(&task1, &ctx).expect("page 2");
    assert!(outcome1.continuation_scheduled);
    let task2 = harness.scheduler.ingest_tasks()[1].clone();
    assert_eq!(task2.task_index, 2);

    let outcome2 = harness.driver().run_task(&task2, &ctx).expect("page 3");
    assert!(!outcome2.continuation_scheduled);
    assert!(outcome2.collect_scheduled);
    assert_eq!(outcome2.verdicts_seen, 5);

    assert_eq!(
        harness.scheduler.collect_tasks(),
        vec![("chromium".to_string(), "1234".to_string())]
    );
    assert_eq!(harness.store.rows_with_prefix(b"tb"), 25);
    assert_eq!(harness.counters.get("chromium", reason::INGESTED), 25);
}

#[test]
fn worker_pool_processes_independent_builds() {
    let mut harness = Harness::new();
    let mut tasks = Vec::new();
    for build in ["b1", "b2", "b3", "b4"] {
        let verdicts: Vec<RawTestVariant> = (0..20)
            .map(|i| passing_variant(&format!("{build}_test_{i}"), &format!("hash_{i}")))
            .collect();
        harness.install_build(build, verdicts, 10);
        tasks.push(first_task("chromium", build));
    }

    let driver = harness.driver();
    let cancel = CancellationToken::new();
    let results = shift_scan_rs::shift_scan::run_ingest_tasks(&driver, tasks, &cancel);

    assert_eq!(results.len(), 4);
    for result in &results {
        let outcome = result.as_ref().expect("task succeeds");
        assert_eq!(outcome.verdicts_kept, 20);
        assert_eq!(outcome.batches_applied, 1);
    }
    assert_eq!(harness.store.rows_with_prefix(b"tb"), 80);
    assert_eq!(harness.counters.get("chromium", reason::INGESTED), 80);
}

#[test]
fn cancelled_pool_reports_cancellation() {
    let mut harness = Harness::new();
    harness.install_build("b1", vec![passing_variant("t", "h")], 10);
    let tasks = vec![first_task("chromium", "b1")];

    let driver = harness.driver();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let results = shift_scan_rs::shift_scan::run_ingest_tasks(&driver, tasks, &cancel);

    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(IngestError::Cancelled)));
    // A cancelled task commits nothing.
    assert_eq!(harness.store.rows_with_prefix(b"ck"), 0);
}

fn branch_key_for(
    project: &str,
    test_id: &str,
    variant_hash: &str,
) -> shift_scan_rs::shift_scan::BranchKey {
    shift_scan_rs::shift_scan::BranchKey {
        project: project.to_string(),
        test_id: test_id.to_string(),
        variant_hash: variant_hash.to_string(),
        ref_hash: crate::support::sample_source_ref().ref_hash(),
    }
}
