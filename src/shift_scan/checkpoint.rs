//! Checkpoint and task-count control record codecs.
//!
//! A checkpoint row's existence means "this sub-batch has already been
//! applied"; it is written inside the same transaction as the state rows
//! it covers, which is what turns at-least-once task delivery into
//! exactly-once state effects. The task-count record deduplicates
//! continuation scheduling across task retries.
//!
//! # Key Format
//!
//! ```text
//! checkpoint key:
//!   "ck" (2B) || project || build_id (varint-len-prefixed)
//!            || task_index u32 BE || batch_index u32 BE
//! task-count key:
//!   "tc" (2B) || project || build_id (varint-len-prefixed)
//! ```

use super::codec::{put_str, read_str};
use super::errors::CodecError;
use super::key::{NS_CHECKPOINT, NS_TASK_COUNT};

/// Builds a checkpoint row key.
#[must_use]
pub fn checkpoint_key(project: &str, build_id: &str, task_index: u32, batch_index: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + project.len() + build_id.len() + 12);
    out.extend_from_slice(&NS_CHECKPOINT);
    put_str(&mut out, project);
    put_str(&mut out, build_id);
    out.extend_from_slice(&task_index.to_be_bytes());
    out.extend_from_slice(&batch_index.to_be_bytes());
    out
}

/// Encodes a checkpoint value: the insertion time in epoch seconds.
#[must_use]
pub fn encode_checkpoint_value(inserted_at_secs: u64) -> Vec<u8> {
    inserted_at_secs.to_be_bytes().to_vec()
}

/// Decodes a checkpoint value.
pub fn decode_checkpoint_value(bytes: &[u8]) -> Result<u64, CodecError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| CodecError::InvalidValue {
        detail: "checkpoint value must be exactly 8 bytes",
    })?;
    Ok(u64::from_be_bytes(arr))
}

/// Builds a task-count control record key.
#[must_use]
pub fn task_count_key(project: &str, build_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + project.len() + build_id.len() + 4);
    out.extend_from_slice(&NS_TASK_COUNT);
    put_str(&mut out, project);
    put_str(&mut out, build_id);
    out
}

/// Encodes a task-count value: the number of tasks scheduled so far.
#[must_use]
pub fn encode_task_count(count: u32) -> Vec<u8> {
    count.to_be_bytes().to_vec()
}

/// Decodes a task-count value.
pub fn decode_task_count(bytes: &[u8]) -> Result<u32, CodecError> {
    let arr: [u8; 4] = bytes.try_into().map_err(|_| CodecError::InvalidValue {
        detail: "task-count value must be exactly 4 bytes",
    })?;
    Ok(u32::from_be_bytes(arr))
}

/// Decodes the components of a checkpoint key, for diagnostics.
pub fn decode_checkpoint_key(bytes: &[u8]) -> Result<(String, String, u32, u32), CodecError> {
    if bytes.len() < 2 || bytes[..2] != NS_CHECKPOINT {
        return Err(CodecError::BadMagic);
    }
    let mut pos = 2;
    let project = read_str(bytes, &mut pos)?;
    let build_id = read_str(bytes, &mut pos)?;
    if bytes.len() != pos + 8 {
        return Err(CodecError::InvalidValue {
            detail: "checkpoint key must end with two u32 indices",
        });
    }
    let task_index = u32::from_be_bytes(bytes[pos..pos + 4].try_into().expect("4 bytes"));
    let batch_index = u32::from_be_bytes(bytes[pos + 4..pos + 8].try_into().expect("4 bytes"));
    Ok((project, build_id, task_index, batch_index))
}
