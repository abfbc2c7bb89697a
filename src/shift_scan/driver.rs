//! Batch ingestion driver.
//!
//! One task ingests one page of one build's verdicts:
//!
//! 1. Validate the project and partition-time window.
//! 2. Fetch the page from the verdict source.
//! 3. Filter, normalize, and group verdicts by branch key.
//! 4. Shard the key set into sub-batches.
//! 5. Apply each sub-batch in one store transaction that also writes its
//!    checkpoint row; a pre-existing checkpoint skips the batch, making
//!    at-least-once task delivery produce exactly-once state effects.
//! 6. Export rows for committed batches (at-least-once).
//! 7. Schedule the continuation task for the next page, deduplicated by
//!    the task-count control record, or the collect task on the final
//!    page.
//!
//! The driver owns orchestration only; all state mutation lives in
//! [`TestVariantBranch`] and all statistics in the analyzer.

use std::collections::BTreeMap;

use ahash::AHashMap;

use super::changepoint::DetectorConfig;
use super::checkpoint::{
    checkpoint_key, decode_task_count, encode_checkpoint_value, encode_task_count, task_count_key,
};
use super::counters::{reason, VerdictCounters};
use super::errors::{IngestError, StoreError};
use super::export::{rows_for_branch, SegmentRow, SegmentSink};
use super::filter::{filter_verdicts, FilterContext};
use super::key::BranchKey;
use super::limits::IngestLimits;
use super::source::{SourceRef, VerdictPage, VerdictSource};
use super::state::TestVariantBranch;
use super::state_codec::{decode_state, encode_state};
use super::store::{read_modify_write, StateStore, WriteOp};
use super::task::{IngestTask, TaskScheduler};
use super::verdict::{normalize_verdict, PositionVerdict};
use super::worker::TaskContext;

/// Wall-clock source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_secs())
    }
}

/// Fixed clock for deterministic tests.
#[derive(Debug)]
pub struct FixedClock {
    secs: std::sync::atomic::AtomicU64,
}

impl FixedClock {
    /// Creates a clock pinned at `secs`.
    #[must_use]
    pub fn at(secs: u64) -> Self {
        Self {
            secs: std::sync::atomic::AtomicU64::new(secs),
        }
    }

    /// Advances the clock.
    pub fn advance(&self, secs: u64) {
        self.secs
            .fetch_add(secs, std::sync::atomic::Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// What one task run accomplished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Verdicts returned by the source page.
    pub verdicts_seen: usize,
    /// Verdicts that survived filtering.
    pub verdicts_kept: usize,
    /// Sub-batches applied by this run.
    pub batches_applied: usize,
    /// Sub-batches skipped because their checkpoint already existed.
    pub batches_skipped: usize,
    /// True when a continuation task was newly scheduled.
    pub continuation_scheduled: bool,
    /// True when the final-page collect task was scheduled.
    pub collect_scheduled: bool,
}

/// One key's share of a page: identity plus its normalized verdicts.
struct KeyGroup {
    key: BranchKey,
    encoded_key: Vec<u8>,
    variant: BTreeMap<String, String>,
    source_ref: SourceRef,
    verdicts: Vec<PositionVerdict>,
}

/// Side effects accumulated inside one sub-batch transaction attempt.
///
/// Rebuilt from scratch on every attempt so conflict retries never
/// double-count.
#[derive(Default)]
struct BatchEffects {
    ingested: u64,
    out_of_order: u64,
    rows: Vec<SegmentRow>,
}

/// Batch ingestion driver wiring the pipeline to its collaborators.
pub struct IngestDriver<'a> {
    /// Verdict source (test-result database).
    pub source: &'a dyn VerdictSource,
    /// Key state store.
    pub store: &'a dyn StateStore,
    /// Export sink for segment rows.
    pub sink: &'a dyn SegmentSink,
    /// Scheduler for continuation and collect tasks.
    pub scheduler: &'a dyn TaskScheduler,
    /// Ingestion counters.
    pub counters: &'a VerdictCounters,
    /// Wall clock.
    pub clock: &'a dyn Clock,
    /// Tunables.
    pub limits: IngestLimits,
    /// Projects this deployment serves; `None` accepts all.
    pub known_projects: Option<ahash::AHashSet<String>>,
}

impl IngestDriver<'_> {
    /// Runs one ingest task to completion.
    pub fn run_task(
        &self,
        task: &IngestTask,
        ctx: &TaskContext,
    ) -> Result<TaskOutcome, IngestError> {
        if let Some(projects) = &self.known_projects {
            if !projects.contains(&task.project) {
                return Err(IngestError::UnknownProject {
                    project: task.project.clone(),
                });
            }
        }
        self.validate_partition_time(task)?;

        ctx.check()?;
        let page = self.source.list_verdicts(
            &task.invocation_name(),
            self.limits.page_size,
            task.page_token.as_deref(),
        )?;
        let verdicts_seen = page.verdicts.len();

        let groups = self.group_page(task, &page);
        let verdicts_kept: usize = groups.iter().map(|g| g.verdicts.len()).sum();

        let mut outcome = TaskOutcome {
            verdicts_seen,
            verdicts_kept,
            ..TaskOutcome::default()
        };

        for (batch_index, batch) in groups.chunks(self.limits.batch_key_limit).enumerate() {
            ctx.check()?;
            let applied = self.apply_batch(task, batch_index as u32, batch, ctx)?;
            if applied {
                outcome.batches_applied += 1;
            } else {
                outcome.batches_skipped += 1;
            }
        }

        ctx.check()?;
        match &page.next_page_token {
            Some(token) => {
                outcome.continuation_scheduled = self.schedule_continuation(task, token)?;
            }
            None => {
                self.scheduler
                    .schedule_collect(&task.project, &task.build_id)?;
                outcome.collect_scheduled = true;
            }
        }

        Ok(outcome)
    }

    /// Rejects partition times outside the ingestion window.
    fn validate_partition_time(&self, task: &IngestTask) -> Result<(), IngestError> {
        let now = self.clock.now_secs();
        let oldest = now.saturating_sub(self.limits.max_partition_age_secs);
        let newest = now.saturating_add(self.limits.max_partition_future_secs);
        if task.partition_time_secs < oldest || task.partition_time_secs > newest {
            return Err(IngestError::BadPartitionTime {
                partition_secs: task.partition_time_secs,
                now_secs: now,
            });
        }
        Ok(())
    }

    /// Filters, normalizes, and groups a page by branch key.
    ///
    /// Groups come back sorted by encoded key so sharding is
    /// deterministic across retries.
    fn group_page(&self, task: &IngestTask, page: &VerdictPage) -> Vec<KeyGroup> {
        let filter_ctx = FilterContext {
            project: &task.project,
            presubmit: task.presubmit.as_ref(),
            sources: &page.sources,
            duplicates: &page.duplicate_invocations,
        };
        let kept = filter_verdicts(page.verdicts.clone(), &filter_ctx, self.counters);

        let mut groups: AHashMap<super::key::BranchKeyHash, KeyGroup> = AHashMap::new();
        for tv in kept {
            if tv.test_id.is_empty() || tv.variant_hash.is_empty() {
                self.counters.increment(&task.project, reason::MALFORMED);
                continue;
            }
            // The filter only passes verdicts with resolvable, positioned
            // sources.
            let sources = page
                .sources
                .get(&tv.sources_id)
                .expect("filtered verdict has sources");
            let position = sources
                .commit_position()
                .expect("filtered verdict has a commit position");
            let source_ref = sources
                .source_ref()
                .expect("positioned sources have a ref");

            let key = BranchKey {
                project: task.project.clone(),
                test_id: tv.test_id.clone(),
                variant_hash: tv.variant_hash.clone(),
                ref_hash: source_ref.ref_hash(),
            };
            let verdict = normalize_verdict(
                &tv,
                position,
                task.partition_time_secs,
                &page.duplicate_invocations,
            );

            groups
                .entry(key.composite_hash())
                .or_insert_with(|| KeyGroup {
                    encoded_key: key.encode(),
                    key,
                    variant: tv.variant.clone(),
                    source_ref,
                    verdicts: Vec::new(),
                })
                .verdicts
                .push(verdict);
        }

        let mut out: Vec<KeyGroup> = groups.into_values().collect();
        out.sort_by(|a, b| a.encoded_key.cmp(&b.encoded_key));
        out
    }

    /// Applies one sub-batch transactionally; returns false when its
    /// checkpoint already existed.
    fn apply_batch(
        &self,
        task: &IngestTask,
        batch_index: u32,
        batch: &[KeyGroup],
        ctx: &TaskContext,
    ) -> Result<bool, IngestError> {
        let ck_key = checkpoint_key(&task.project, &task.build_id, task.task_index, batch_index);
        let mut keys = Vec::with_capacity(batch.len() + 1);
        keys.push(ck_key.clone());
        keys.extend(batch.iter().map(|g| g.encoded_key.clone()));

        let detector = DetectorConfig {
            min_verdicts: self.limits.min_detection_verdicts,
        };
        let now = self.clock.now_secs();
        let mut effects = BatchEffects::default();

        let outcome = read_modify_write(
            self.store,
            &keys,
            self.limits.max_txn_attempts,
            |snapshot| {
                // Conflict retries re-enter here with a fresh snapshot;
                // start the effect ledger over.
                effects = BatchEffects::default();

                if snapshot[0].is_some() {
                    // Checkpoint row present: this sub-batch already
                    // applied in a previous delivery.
                    return Ok(None);
                }

                let mut writes = Vec::with_capacity(keys.len());
                for (group, entry) in batch.iter().zip(&snapshot[1..]) {
                    let mut tvb = match entry {
                        Some(row) => decode_state(group.key.clone(), &row.value)
                            .map_err(|err| StoreError::corrupt(err.to_string()))?,
                        None => TestVariantBranch::new(
                            group.key.clone(),
                            group.variant.clone(),
                            group.source_ref.clone(),
                            self.limits.hot_buffer_capacity,
                            self.limits.cold_buffer_capacity,
                        ),
                    };

                    for verdict in &group.verdicts {
                        if tvb.is_out_of_order(verdict.commit_position) {
                            effects.out_of_order += 1;
                            continue;
                        }
                        tvb.insert_verdict(verdict.clone());
                        effects.ingested += 1;
                    }

                    let update = tvb.run_analysis(&detector);
                    effects
                        .rows
                        .extend(rows_for_branch(&tvb, update.newly_finalized, 0));

                    tvb.input_buffer.mark_clean();
                    writes.push(WriteOp {
                        key: group.encoded_key.clone(),
                        value: encode_state(&tvb),
                    });
                }

                writes.push(WriteOp {
                    key: ck_key.clone(),
                    value: encode_checkpoint_value(now),
                });
                Ok(Some(writes))
            },
        )
        .map_err(|err| match err {
            StoreError::Conflict => IngestError::TxnAttemptsExhausted {
                attempts: self.limits.max_txn_attempts,
            },
            other => IngestError::Store(other),
        })?;

        if !outcome.committed {
            return Ok(false);
        }

        self.counters
            .add(&task.project, reason::INGESTED, effects.ingested);
        self.counters.add(
            &task.project,
            reason::OUT_OF_ORDER_DISCARDED,
            effects.out_of_order,
        );

        if !effects.rows.is_empty() {
            let mut rows = std::mem::take(&mut effects.rows);
            for row in &mut rows {
                row.version = outcome.commit_version;
            }
            self.export_with_retry(&rows, ctx)?;
        }
        Ok(true)
    }

    /// Emits rows with bounded retries on transient sink failures.
    fn export_with_retry(&self, rows: &[SegmentRow], ctx: &TaskContext) -> Result<(), IngestError> {
        let mut backoff = std::time::Duration::from_millis(self.limits.backoff_base_ms);
        let backoff_cap = std::time::Duration::from_millis(self.limits.backoff_cap_ms);

        let mut attempt = 0;
        loop {
            attempt += 1;
            ctx.check()?;
            match self.sink.export(rows) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt < self.limits.sink_attempts => {
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(backoff_cap);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Schedules the continuation task once per index.
    ///
    /// The task-count control record remembers the highest continuation
    /// index already scheduled; a retried task observes it and skips
    /// re-scheduling. Scheduling happens before the record commits, so a
    /// crash between the two yields a duplicate task, which checkpoints
    /// render harmless.
    fn schedule_continuation(&self, task: &IngestTask, token: &str) -> Result<bool, IngestError> {
        let next_index = task.task_index + 1;
        let tc_key = task_count_key(&task.project, &task.build_id);

        let snapshot = self.store.snapshot(&[tc_key.clone()])?;
        let scheduled_up_to = match &snapshot[0] {
            Some(row) => decode_task_count(&row.value)
                .map_err(|err| IngestError::Store(StoreError::corrupt(err.to_string())))?,
            None => 0,
        };
        if scheduled_up_to >= next_index {
            return Ok(false);
        }

        self.scheduler
            .schedule_ingest(&task.continuation(token.to_string()))?;

        read_modify_write(self.store, &[tc_key.clone()], self.limits.max_txn_attempts, {
            let tc_key = tc_key.clone();
            move |snapshot| {
                let current = match &snapshot[0] {
                    Some(row) => decode_task_count(&row.value)
                        .map_err(|err| StoreError::corrupt(err.to_string()))?,
                    None => 0,
                };
                if current >= next_index {
                    return Ok(None);
                }
                Ok(Some(vec![WriteOp {
                    key: tc_key.clone(),
                    value: encode_task_count(next_index),
                }]))
            }
        })
        .map_err(IngestError::Store)?;

        Ok(true)
    }
}
