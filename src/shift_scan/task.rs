//! Ingest task payloads and the scheduling interface.
//!
//! Tasks are serialized as a tag/length/value message so fields can be
//! added without breaking older readers: unknown tags are skipped, never
//! rejected. The payload identifies the build being ingested, the page to
//! resume at, and this task's index in the continuation chain.
//!
//! # Payload layout
//!
//! ```text
//! "ITSK" (4B) || version u16 BE || fields...
//! field: tag u8 || varint len || len value bytes
//! ```
//!
//! Tags: 1 project, 2 build_id, 3 partition_time (varint secs),
//! 4 page_token, 5 task_index (varint), 6 presubmit (mode u8 || status u8),
//! 7 gardener rotation (repeated, one field each).

use std::sync::Mutex;

use super::codec::{put_uvarint, read_bytes, read_u8, read_uvarint};
use super::errors::{CodecError, TaskError};

/// Task payload magic bytes.
const TASK_MAGIC: [u8; 4] = *b"ITSK";
/// Task payload format version.
const TASK_VERSION: u16 = 1;

const TAG_PROJECT: u8 = 1;
const TAG_BUILD_ID: u8 = 2;
const TAG_PARTITION_TIME: u8 = 3;
const TAG_PAGE_TOKEN: u8 = 4;
const TAG_TASK_INDEX: u8 = 5;
const TAG_PRESUBMIT: u8 = 6;
const TAG_GARDENER_ROTATION: u8 = 7;

/// Mode of the presubmit run a verdict came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresubmitMode {
    /// Dry run; the code was not going to be submitted.
    DryRun,
    /// Full run; success submits the code.
    FullRun,
}

/// Final status of a presubmit run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresubmitStatus {
    Succeeded,
    Failed,
    Canceled,
}

/// Presubmit context attached to an ingest task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresubmitInfo {
    pub mode: PresubmitMode,
    pub status: PresubmitStatus,
}

impl PresubmitInfo {
    /// True when the run's code landed: a full run that succeeded.
    #[must_use]
    pub fn code_submitted(&self) -> bool {
        self.mode == PresubmitMode::FullRun && self.status == PresubmitStatus::Succeeded
    }
}

/// One unit of ingestion work: a page of one build's verdicts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestTask {
    /// Project the build belongs to.
    pub project: String,
    /// Build identifier; names the root invocation to query.
    pub build_id: String,
    /// Partition time in seconds since the Unix epoch.
    pub partition_time_secs: u64,
    /// Resume token from the previous task; `None` for the first page.
    pub page_token: Option<String>,
    /// Zero-based index in this build's continuation chain.
    pub task_index: u32,
    /// Presubmit context, when the build was a presubmit run.
    pub presubmit: Option<PresubmitInfo>,
    /// Gardener rotations interested in this build's results.
    pub gardener_rotations: Vec<String>,
}

impl IngestTask {
    /// Names the root invocation this task queries.
    #[must_use]
    pub fn invocation_name(&self) -> String {
        format!("invocations/build-{}", self.build_id)
    }

    /// Builds the continuation task resuming at `page_token`.
    #[must_use]
    pub fn continuation(&self, page_token: String) -> Self {
        Self {
            page_token: Some(page_token),
            task_index: self.task_index + 1,
            ..self.clone()
        }
    }

    /// Encodes the payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&TASK_MAGIC);
        out.extend_from_slice(&TASK_VERSION.to_be_bytes());

        put_field_str(&mut out, TAG_PROJECT, &self.project);
        put_field_str(&mut out, TAG_BUILD_ID, &self.build_id);
        put_field_varint(&mut out, TAG_PARTITION_TIME, self.partition_time_secs);
        if let Some(token) = &self.page_token {
            put_field_str(&mut out, TAG_PAGE_TOKEN, token);
        }
        put_field_varint(&mut out, TAG_TASK_INDEX, u64::from(self.task_index));
        if let Some(presubmit) = &self.presubmit {
            let mode = match presubmit.mode {
                PresubmitMode::DryRun => 1u8,
                PresubmitMode::FullRun => 2,
            };
            let status = match presubmit.status {
                PresubmitStatus::Succeeded => 1u8,
                PresubmitStatus::Failed => 2,
                PresubmitStatus::Canceled => 3,
            };
            put_field_bytes(&mut out, TAG_PRESUBMIT, &[mode, status]);
        }
        for rotation in &self.gardener_rotations {
            put_field_str(&mut out, TAG_GARDENER_ROTATION, rotation);
        }
        out
    }

    /// Decodes a payload, skipping unknown tags.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 6 || bytes[..4] != TASK_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != TASK_VERSION {
            return Err(CodecError::UnsupportedVersion { got: version });
        }

        let mut pos = 6;
        let mut project = None;
        let mut build_id = None;
        let mut partition_time_secs = None;
        let mut page_token = None;
        let mut task_index = 0u32;
        let mut presubmit = None;
        let mut gardener_rotations = Vec::new();

        while pos < bytes.len() {
            let tag = read_u8(bytes, &mut pos)?;
            let value = read_bytes(bytes, &mut pos)?;
            match tag {
                TAG_PROJECT => project = Some(value_str(value)?),
                TAG_BUILD_ID => build_id = Some(value_str(value)?),
                TAG_PARTITION_TIME => partition_time_secs = Some(value_varint(value)?),
                TAG_PAGE_TOKEN => page_token = Some(value_str(value)?),
                TAG_TASK_INDEX => {
                    let raw = value_varint(value)?;
                    task_index =
                        u32::try_from(raw).map_err(|_| CodecError::InvalidValue {
                            detail: "task_index exceeds u32",
                        })?;
                }
                TAG_PRESUBMIT => {
                    if value.len() != 2 {
                        return Err(CodecError::InvalidValue {
                            detail: "presubmit field must be exactly 2 bytes",
                        });
                    }
                    let mode = match value[0] {
                        1 => PresubmitMode::DryRun,
                        2 => PresubmitMode::FullRun,
                        _ => {
                            return Err(CodecError::InvalidValue {
                                detail: "unknown presubmit mode",
                            })
                        }
                    };
                    let status = match value[1] {
                        1 => PresubmitStatus::Succeeded,
                        2 => PresubmitStatus::Failed,
                        3 => PresubmitStatus::Canceled,
                        _ => {
                            return Err(CodecError::InvalidValue {
                                detail: "unknown presubmit status",
                            })
                        }
                    };
                    presubmit = Some(PresubmitInfo { mode, status });
                }
                TAG_GARDENER_ROTATION => gardener_rotations.push(value_str(value)?),
                // Unknown tag: skip for forward compatibility.
                _ => {}
            }
        }

        Ok(Self {
            project: project.ok_or(CodecError::InvalidValue {
                detail: "missing project field",
            })?,
            build_id: build_id.ok_or(CodecError::InvalidValue {
                detail: "missing build_id field",
            })?,
            partition_time_secs: partition_time_secs.ok_or(CodecError::InvalidValue {
                detail: "missing partition_time field",
            })?,
            page_token,
            task_index,
            presubmit,
            gardener_rotations,
        })
    }
}

fn put_field_bytes(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    put_uvarint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn put_field_str(out: &mut Vec<u8>, tag: u8, value: &str) {
    put_field_bytes(out, tag, value.as_bytes());
}

fn put_field_varint(out: &mut Vec<u8>, tag: u8, value: u64) {
    let mut scratch = Vec::with_capacity(10);
    put_uvarint(&mut scratch, value);
    put_field_bytes(out, tag, &scratch);
}

fn value_str(value: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(value)
        .map(str::to_string)
        .map_err(|_| CodecError::InvalidValue {
            detail: "invalid UTF-8 in task field",
        })
}

fn value_varint(value: &[u8]) -> Result<u64, CodecError> {
    let mut pos = 0;
    let v = read_uvarint(value, &mut pos)?;
    if pos != value.len() {
        return Err(CodecError::InvalidValue {
            detail: "trailing bytes after varint field",
        });
    }
    Ok(v)
}

/// Interface for enqueueing follow-up work.
pub trait TaskScheduler: Send + Sync {
    /// Enqueues a continuation ingest task.
    fn schedule_ingest(&self, task: &IngestTask) -> Result<(), TaskError>;

    /// Enqueues the downstream collect task for a finished build.
    fn schedule_collect(&self, project: &str, build_id: &str) -> Result<(), TaskError>;
}

/// In-memory scheduler recording everything enqueued, for tests.
#[derive(Debug, Default)]
pub struct InMemoryTaskScheduler {
    ingest: Mutex<Vec<IngestTask>>,
    collect: Mutex<Vec<(String, String)>>,
}

impl InMemoryTaskScheduler {
    /// Creates an empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all ingest tasks scheduled so far.
    #[must_use]
    pub fn ingest_tasks(&self) -> Vec<IngestTask> {
        self.ingest.lock().expect("scheduler lock poisoned").clone()
    }

    /// Returns all collect tasks scheduled so far.
    #[must_use]
    pub fn collect_tasks(&self) -> Vec<(String, String)> {
        self.collect
            .lock()
            .expect("scheduler lock poisoned")
            .clone()
    }
}

impl TaskScheduler for InMemoryTaskScheduler {
    fn schedule_ingest(&self, task: &IngestTask) -> Result<(), TaskError> {
        self.ingest
            .lock()
            .expect("scheduler lock poisoned")
            .push(task.clone());
        Ok(())
    }

    fn schedule_collect(&self, project: &str, build_id: &str) -> Result<(), TaskError> {
        self.collect
            .lock()
            .expect("scheduler lock poisoned")
            .push((project.to_string(), build_id.to_string()));
        Ok(())
    }
}
