//! Ingestion counters keyed by (project, reason).
//!
//! Counters are the pipeline's observability surface: every verdict that
//! is filtered, discarded, or ingested increments exactly one reason.
//! Updates are cheap map increments under a mutex; reads snapshot the map
//! so reporting never blocks the ingest path for long.

use std::sync::Mutex;

use ahash::AHashMap;

/// Counter reason names.
///
/// These strings are the stable external vocabulary (monitoring queries
/// group on them); add new reasons, never rename existing ones.
pub mod reason {
    /// No sources descriptor resolvable for the verdict.
    pub const SKIPPED_NO_SOURCE: &str = "skipped_no_source";
    /// Sources have no numeric commit position.
    pub const SKIPPED_NO_COMMIT_DATA: &str = "skipped_no_commit_data";
    /// Sources are marked dirty (uncommitted local changes).
    pub const SKIPPED_DIRTY_SOURCE: &str = "skipped_dirty_source";
    /// Presubmit verdict whose code was never submitted.
    pub const SKIPPED_UNSUBMITTED_CODE: &str = "skipped_unsubmitted_code";
    /// Every run skipped, or every invocation a duplicate.
    pub const SKIPPED_ALL_SKIPPED_OR_DUPLICATE: &str = "skipped_all_skipped_or_duplicate";
    /// Verdict arrived below the analyzed frontier and was dropped.
    pub const OUT_OF_ORDER_DISCARDED: &str = "out_of_order_discarded";
    /// Verdict was malformed and dropped without failing the task.
    pub const MALFORMED: &str = "malformed";
    /// Verdict accepted into a key's input buffer.
    pub const INGESTED: &str = "ingested";
}

/// Per-(project, reason) verdict counters.
#[derive(Debug, Default)]
pub struct VerdictCounters {
    counts: Mutex<AHashMap<(String, &'static str), u64>>,
}

impl VerdictCounters {
    /// Creates an empty counter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to `(project, reason)`.
    pub fn add(&self, project: &str, reason: &'static str, n: u64) {
        if n == 0 {
            return;
        }
        let mut counts = self.counts.lock().expect("counter lock poisoned");
        *counts
            .entry((project.to_string(), reason))
            .or_insert(0) += n;
    }

    /// Increments `(project, reason)` by one.
    #[inline]
    pub fn increment(&self, project: &str, reason: &'static str) {
        self.add(project, reason, 1);
    }

    /// Returns the current value for `(project, reason)`.
    #[must_use]
    pub fn get(&self, project: &str, reason: &str) -> u64 {
        let counts = self.counts.lock().expect("counter lock poisoned");
        counts
            .iter()
            .find(|((p, r), _)| p == project && *r == reason)
            .map(|(_, v)| *v)
            .unwrap_or(0)
    }

    /// Snapshots all counters, sorted for stable reporting.
    #[must_use]
    pub fn snapshot(&self) -> Vec<((String, &'static str), u64)> {
        let counts = self.counts.lock().expect("counter lock poisoned");
        let mut out: Vec<_> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        out.sort();
        out
    }
}
