//! Streaming change-point analysis over test-verdict histories.
//!
//! This crate ingests streams of test-execution verdicts keyed by
//! (test, variant, source branch) and maintains, per key, a bounded
//! statistical history from which it detects change points: commit
//! positions where a test variant's pass/fail behavior shifted. Each key
//! yields a sequence of behavior segments with counts, time range, and
//! change-point confidence bounds.
//!
//! High-level flow (one ingest task):
//! 1. Fetch a page of verdicts from the result database.
//! 2. Filter and normalize them into position verdicts.
//! 3. Group by key, shard into sub-batches, and for each sub-batch run
//!    one store transaction: insert into buffers, analyze, persist, and
//!    checkpoint.
//! 4. Export new segment rows, then schedule the next page's task.
//!
//! See [`shift_scan`] for the pipeline modules.

pub mod shift_scan;
