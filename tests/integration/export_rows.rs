//! Export adapter behavior: row content, versioning, and at-least-once
//! emission under transient sink failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use shift_scan_rs::shift_scan::{
    ExportError, IngestError, IngestLimits, SegmentRow, SegmentSink, SegmentState, StateStore,
    TaskContext,
};

use crate::support::{first_task, passing_variant, Harness};

/// Sink that fails transiently a fixed number of times before accepting.
#[derive(Default)]
struct FlakySink {
    failures_remaining: AtomicUsize,
    rows: Mutex<Vec<SegmentRow>>,
    attempts: AtomicUsize,
}

impl FlakySink {
    fn failing(times: usize) -> Self {
        Self {
            failures_remaining: AtomicUsize::new(times),
            ..Self::default()
        }
    }
}

impl SegmentSink for FlakySink {
    fn export(&self, rows: &[SegmentRow]) -> Result<(), ExportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ExportError::SinkUnavailable {
                detail: "transient outage".to_string(),
            });
        }
        self.rows
            .lock()
            .expect("sink lock poisoned")
            .extend_from_slice(rows);
        Ok(())
    }
}

#[test]
fn rows_carry_identity_and_commit_version() {
    let mut harness = Harness::new();
    harness.install_build("1234", vec![passing_variant("test_1", "hash_1")], 10);

    harness
        .driver()
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect("task succeeds");

    let rows = harness.sink.rows();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.project, "chromium");
    assert_eq!(row.test_id, "test_1");
    assert_eq!(row.variant_hash, "hash_1");
    assert_eq!(row.ref_hash.len(), 16, "branch hash renders as hex");
    assert_eq!(row.state, SegmentState::Finalizing);
    assert_eq!(row.start_position, 10);
    assert_eq!(row.end_position, 10);
    assert!(row.version > 0, "rows are versioned by the commit sequence");
}

#[test]
fn transient_sink_failure_is_retried() {
    let mut harness = Harness::new();
    harness.install_build("1234", vec![passing_variant("test_1", "hash_1")], 10);

    let sink = FlakySink::failing(1);
    let mut driver = harness.driver();
    driver.sink = &sink;

    driver
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect("task succeeds after sink retry");

    assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(sink.rows.lock().unwrap().len(), 1);
}

#[test]
fn persistent_sink_failure_surfaces_after_attempts() {
    let limits = IngestLimits {
        sink_attempts: 2,
        backoff_base_ms: 1,
        backoff_cap_ms: 2,
        ..IngestLimits::DEFAULT
    };
    let mut harness = Harness::with_limits(limits);
    harness.install_build("1234", vec![passing_variant("test_1", "hash_1")], 10);

    let sink = FlakySink::failing(usize::MAX);
    let mut driver = harness.driver();
    driver.sink = &sink;

    let err = driver
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect_err("sink never recovers");
    assert!(matches!(err, IngestError::Export(_)));
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 2);

    // The state committed before export; a retried task skips the batch
    // but the rows are re-exported by the at-least-once contract only
    // for batches it applies. The checkpoint makes state effects final.
    assert_eq!(harness.store.rows_with_prefix(b"ck"), 1);
}

#[test]
fn export_happens_after_commit() {
    // The exported row's version equals the committed row's version,
    // which can only be known post-commit.
    let mut harness = Harness::new();
    harness.install_build("1234", vec![passing_variant("test_1", "hash_1")], 10);
    harness
        .driver()
        .run_task(&first_task("chromium", "1234"), &TaskContext::unbounded())
        .expect("task succeeds");

    let key = crate::support::sample_source_ref();
    let branch_key = shift_scan_rs::shift_scan::BranchKey {
        project: "chromium".to_string(),
        test_id: "test_1".to_string(),
        variant_hash: "hash_1".to_string(),
        ref_hash: key.ref_hash(),
    };
    let snapshot = harness
        .store
        .snapshot(&[branch_key.encode()])
        .expect("snapshot");
    let stored_version = snapshot[0].as_ref().expect("row exists").version;

    let rows = harness.sink.rows();
    assert_eq!(rows[0].version, stored_version);
}
