//! Verdict ingestion and change-point analysis pipeline.
//!
//! The pipeline maintains, per (test, variant, source branch), a compact
//! statistical history of pass/fail verdicts ordered by commit position,
//! detects positions where behavior shifted, and exports the resulting
//! behavior segments.
//!
//! Pipeline overview:
//! 1. `task` carries one page of one build's verdicts into `driver`.
//! 2. `filter` discards verdicts that must not influence statistics.
//! 3. `verdict` normalizes raw verdicts into position verdicts.
//! 4. `input_buffer` holds each key's bounded hot/cold history.
//! 5. `changepoint` locates behavior shifts; `state` applies them,
//!    sealing finalized segments and truncating the buffer.
//! 6. `store` persists key state transactionally with `checkpoint` rows
//!    for exactly-once batch effects; `state_codec` keeps rows bit-exact.
//! 7. `export` emits segment rows at least once.
//!
//! # Invariants
//! - Per key, mutations serialize through store transactions.
//! - Buffers are bounded; overflow folds evicted counts into segments,
//!   never drops them.
//! - Identical state encodes to identical bytes.

pub mod changepoint;
pub mod checkpoint;
pub mod codec;
pub mod counters;
pub mod driver;
pub mod errors;
pub mod export;
pub mod filter;
pub mod input_buffer;
pub mod key;
pub mod limits;
pub mod segments;
pub mod source;
pub mod state;
pub mod state_codec;
pub mod store;
pub mod store_rocksdb;
pub mod task;
pub mod verdict;
pub mod worker;

pub use changepoint::{detect_changepoints, ChangePoint, DetectorConfig, GLR_CRITICAL_VALUES};
pub use checkpoint::{checkpoint_key, task_count_key};
pub use counters::{reason, VerdictCounters};
pub use driver::{Clock, FixedClock, IngestDriver, SystemClock, TaskOutcome};
pub use errors::{CodecError, ExportError, IngestError, SourceError, StoreError, TaskError};
pub use export::{rows_for_branch, CollectingSegmentSink, SegmentRow, SegmentSink};
pub use filter::{filter_verdicts, FilterContext, SkipReason};
pub use input_buffer::{History, InputBuffer, DEFAULT_COLD_CAPACITY, DEFAULT_HOT_CAPACITY};
pub use key::{BranchKey, BranchKeyHash, RefHash};
pub use limits::IngestLimits;
pub use segments::{Counts, Segment, SegmentState};
pub use source::{
    Changelist, GitilesCommit, InMemoryVerdictSource, RawResult, RawTestVariant, SourceRef,
    Sources, TestStatus, VerdictPage, VerdictSource, VerdictStatus,
};
pub use state::{AnalysisUpdate, TestVariantBranch};
pub use state_codec::{decode_state, encode_state};
pub use store::{
    read_modify_write, CommitRequest, InMemoryStateStore, Precondition, RmwOutcome, StateStore,
    VersionedValue, WriteOp,
};
pub use store_rocksdb::RocksDbStateStore;
pub use task::{
    IngestTask, InMemoryTaskScheduler, PresubmitInfo, PresubmitMode, PresubmitStatus,
    TaskScheduler,
};
pub use verdict::{normalize_verdict, PositionVerdict, Run, VerdictDetails};
pub use worker::{run_ingest_tasks, CancellationToken, TaskContext};
