//! Hard caps and tunables for verdict ingestion.
//!
//! All limits are explicit and enforced; exceeding one surfaces as an
//! error or eviction, never silent truncation. Invalid configurations
//! are programmer errors (panic in `validate`), not runtime errors.

use super::changepoint::DEFAULT_MIN_VERDICTS;
use super::input_buffer::{DEFAULT_COLD_CAPACITY, DEFAULT_HOT_CAPACITY};

/// Tunables for the ingest pipeline.
#[derive(Clone, Copy, Debug)]
pub struct IngestLimits {
    /// Hot buffer capacity per key.
    pub hot_buffer_capacity: usize,
    /// Cold buffer capacity per key.
    pub cold_buffer_capacity: usize,
    /// Verdicts fetched per source page.
    pub page_size: usize,
    /// Maximum keys mutated per sub-batch transaction.
    pub batch_key_limit: usize,
    /// Minimum buffered verdicts before change-point detection runs.
    pub min_detection_verdicts: usize,
    /// Oldest accepted partition time, as an age in seconds.
    pub max_partition_age_secs: u64,
    /// Furthest-future accepted partition time, in seconds.
    pub max_partition_future_secs: u64,
    /// Snapshot/commit attempts per sub-batch before giving up.
    pub max_txn_attempts: usize,
    /// Emit attempts per export batch before surfacing the failure.
    pub sink_attempts: usize,
    /// Worker threads draining the task queue.
    pub worker_count: usize,
    /// Task-scoped deadline in seconds.
    pub task_deadline_secs: u64,
    /// First retry backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub backoff_cap_ms: u64,
}

impl IngestLimits {
    /// Production defaults.
    pub const DEFAULT: Self = Self {
        hot_buffer_capacity: DEFAULT_HOT_CAPACITY,
        cold_buffer_capacity: DEFAULT_COLD_CAPACITY,
        page_size: 1000,
        batch_key_limit: 1000,
        min_detection_verdicts: DEFAULT_MIN_VERDICTS,
        max_partition_age_secs: 90 * 24 * 3600,
        max_partition_future_secs: 24 * 3600,
        max_txn_attempts: 10,
        sink_attempts: 3,
        worker_count: 64,
        task_deadline_secs: 9 * 60,
        backoff_base_ms: 100,
        backoff_cap_ms: 10_000,
    };

    /// Small limits for tests and constrained environments.
    pub const RESTRICTIVE: Self = Self {
        hot_buffer_capacity: 10,
        cold_buffer_capacity: 20,
        page_size: 10,
        batch_key_limit: 5,
        min_detection_verdicts: DEFAULT_MIN_VERDICTS,
        max_partition_age_secs: 90 * 24 * 3600,
        max_partition_future_secs: 24 * 3600,
        max_txn_attempts: 3,
        sink_attempts: 2,
        worker_count: 2,
        task_deadline_secs: 30,
        backoff_base_ms: 1,
        backoff_cap_ms: 10,
    };

    /// Validates the configuration.
    ///
    /// # Panics
    ///
    /// Panics on zero-sized capacities, page sizes, batch limits, or
    /// attempt budgets; these are configuration bugs, not runtime
    /// conditions.
    pub fn validate(&self) {
        assert!(self.hot_buffer_capacity > 0, "hot buffer capacity is zero");
        assert!(
            self.cold_buffer_capacity > 0,
            "cold buffer capacity is zero"
        );
        assert!(self.page_size > 0, "page size is zero");
        assert!(self.batch_key_limit > 0, "batch key limit is zero");
        assert!(
            self.min_detection_verdicts >= 2,
            "detection requires at least two verdicts"
        );
        assert!(self.max_txn_attempts > 0, "transaction attempts are zero");
        assert!(self.sink_attempts > 0, "sink attempts are zero");
        assert!(self.worker_count > 0, "worker count is zero");
        assert!(self.task_deadline_secs > 0, "task deadline is zero");
        assert!(
            self.backoff_base_ms <= self.backoff_cap_ms,
            "backoff base exceeds cap"
        );
    }
}

impl Default for IngestLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}
