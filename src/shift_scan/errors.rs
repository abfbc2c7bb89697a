//! Error types for verdict ingestion stages.
//!
//! Errors are stage-specific to keep diagnostics precise and avoid a
//! single monolithic error enum that grows unbounded. All enums are
//! `#[non_exhaustive]` to allow adding variants without breaking callers;
//! consumers should include a fallback match arm.
//!
//! # Design Notes
//! - Variants with `detail` carry human-readable context and are not stable
//!   for machine parsing.
//! - I/O errors preserve their source to keep diagnostics actionable.
//! - Retryability is a property of the variant, not of the message text:
//!   `StoreError::Conflict` re-runs the transaction closure, while
//!   `IngestError::is_permanent` decides whether the outer task retries.

use std::fmt;
use std::io;

/// Errors from the verdict source (test-result database).
///
/// These occur while fetching a page of verdicts, before any per-key
/// state is touched.
#[derive(Debug)]
#[non_exhaustive]
pub enum SourceError {
    /// Requested page size exceeds the source's limit.
    PageTooLarge { requested: usize, max: usize },
    /// The named invocation does not exist.
    UnknownInvocation { name: String },
    /// The supplied page token was not produced by this source.
    InvalidPageToken { token: String },
    /// Transient backend unavailability; the task should retry.
    Unavailable { detail: String },
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PageTooLarge { requested, max } => {
                write!(f, "page too large: {requested} (max: {max})")
            }
            Self::UnknownInvocation { name } => write!(f, "unknown invocation: {name}"),
            Self::InvalidPageToken { token } => write!(f, "invalid page token: {token:?}"),
            Self::Unavailable { detail } => write!(f, "verdict source unavailable: {detail}"),
        }
    }
}

impl std::error::Error for SourceError {}

impl SourceError {
    /// Returns true when the error may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Errors from the key state store.
///
/// `Conflict` is the optimistic-concurrency signal: the snapshot a
/// transaction was built from is stale and the closure must re-run against
/// a fresh snapshot. All other variants surface to the task.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// A commit precondition failed; re-run the transaction closure.
    Conflict,
    /// I/O error from the backing store.
    Io(io::Error),
    /// Backend-specific error string.
    Backend { detail: String },
    /// A stored row failed to decode.
    Corrupt { detail: String },
}

impl StoreError {
    /// Creates a backend error variant.
    #[inline]
    pub fn backend(detail: impl Into<String>) -> Self {
        Self::Backend {
            detail: detail.into(),
        }
    }

    /// Creates a corrupt-row error variant.
    #[inline]
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => write!(f, "transaction conflict"),
            Self::Io(err) => write!(f, "store I/O error: {err}"),
            Self::Backend { detail } => write!(f, "store backend error: {detail}"),
            Self::Corrupt { detail } => write!(f, "corrupt store row: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors from binary encode/decode of stored rows and task payloads.
///
/// Decode errors are strict: truncation, bad magic, and trailing garbage
/// are all rejected rather than papered over, because checkpoint semantics
/// depend on byte-exact row contents.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Input ended before the value was complete.
    Truncated,
    /// Leading magic bytes did not match.
    BadMagic,
    /// Encoded format version is not supported.
    UnsupportedVersion { got: u16 },
    /// A varint ran past its maximum width.
    VarintOverflow,
    /// A length prefix exceeded the configured field cap.
    FieldTooLong { len: usize, max: usize },
    /// A decoded value violated a format invariant.
    InvalidValue { detail: &'static str },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated input"),
            Self::BadMagic => write!(f, "bad magic bytes"),
            Self::UnsupportedVersion { got } => write!(f, "unsupported format version: {got}"),
            Self::VarintOverflow => write!(f, "varint overflow"),
            Self::FieldTooLong { len, max } => {
                write!(f, "field too long: {len} bytes (max: {max})")
            }
            Self::InvalidValue { detail } => write!(f, "invalid value: {detail}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors from the export sink.
#[derive(Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// Transient sink unavailability; the emitting task retries.
    SinkUnavailable { detail: String },
    /// A row could not be serialized.
    Serialization { detail: String },
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SinkUnavailable { detail } => write!(f, "export sink unavailable: {detail}"),
            Self::Serialization { detail } => write!(f, "row serialization failed: {detail}"),
        }
    }
}

impl std::error::Error for ExportError {}

impl ExportError {
    /// Returns true when the error may succeed on a later attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SinkUnavailable { .. })
    }
}

/// Errors from task scheduling.
#[derive(Debug)]
#[non_exhaustive]
pub enum TaskError {
    /// The scheduling queue rejected the task.
    QueueFull { capacity: usize },
    /// Backend-specific scheduling failure.
    Backend { detail: String },
    /// The task payload failed to decode.
    Payload(CodecError),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { capacity } => {
                write!(f, "task queue full (capacity: {capacity})")
            }
            Self::Backend { detail } => write!(f, "task scheduling failed: {detail}"),
            Self::Payload(err) => write!(f, "task payload error: {err}"),
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Payload(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for TaskError {
    fn from(err: CodecError) -> Self {
        Self::Payload(err)
    }
}

/// Top-level ingest task error.
///
/// Wraps stage errors and adds the task-level failure modes. The worker
/// pool consults [`IngestError::is_permanent`] to decide between retrying
/// with backoff and failing the task for good.
#[derive(Debug)]
#[non_exhaustive]
pub enum IngestError {
    /// Partition time outside the accepted ingestion window.
    BadPartitionTime { partition_secs: u64, now_secs: u64 },
    /// Task names a project this deployment does not serve.
    UnknownProject { project: String },
    /// Verdict source failure.
    Source(SourceError),
    /// State store failure.
    Store(StoreError),
    /// Row or payload codec failure.
    Codec(CodecError),
    /// Export sink failure after exhausting emit attempts.
    Export(ExportError),
    /// Continuation scheduling failure.
    Task(TaskError),
    /// The task-scoped deadline elapsed.
    DeadlineExceeded { limit_secs: u64 },
    /// The task was cancelled cooperatively.
    Cancelled,
    /// Transaction conflicts persisted past the attempt budget.
    TxnAttemptsExhausted { attempts: usize },
}

impl IngestError {
    /// Returns true when retrying the task cannot help.
    ///
    /// Permanent failures are reported and the task is not re-enqueued.
    /// Everything else is retried with backoff; checkpoints make the retry
    /// safe to resume from the first unapplied sub-batch.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::BadPartitionTime { .. } | Self::UnknownProject { .. } | Self::Codec(_) => true,
            Self::Source(err) => !err.is_retryable(),
            Self::Store(err) => matches!(err, StoreError::Corrupt { .. }),
            Self::Export(err) => !err.is_retryable(),
            Self::Task(_) => false,
            Self::DeadlineExceeded { .. } | Self::Cancelled => false,
            Self::TxnAttemptsExhausted { .. } => false,
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPartitionTime {
                partition_secs,
                now_secs,
            } => write!(
                f,
                "partition time {partition_secs} outside ingestion window (now: {now_secs})"
            ),
            Self::UnknownProject { project } => write!(f, "unknown project: {project}"),
            Self::Source(err) => write!(f, "verdict source: {err}"),
            Self::Store(err) => write!(f, "state store: {err}"),
            Self::Codec(err) => write!(f, "codec: {err}"),
            Self::Export(err) => write!(f, "export: {err}"),
            Self::Task(err) => write!(f, "scheduling: {err}"),
            Self::DeadlineExceeded { limit_secs } => {
                write!(f, "task deadline exceeded ({limit_secs}s)")
            }
            Self::Cancelled => write!(f, "task cancelled"),
            Self::TxnAttemptsExhausted { attempts } => {
                write!(f, "transaction attempts exhausted after {attempts} tries")
            }
        }
    }
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Source(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Codec(err) => Some(err),
            Self::Export(err) => Some(err),
            Self::Task(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SourceError> for IngestError {
    fn from(err: SourceError) -> Self {
        Self::Source(err)
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<CodecError> for IngestError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<ExportError> for IngestError {
    fn from(err: ExportError) -> Self {
        Self::Export(err)
    }
}

impl From<TaskError> for IngestError {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}
