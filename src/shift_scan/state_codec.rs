//! Binary row codec for persisted branch state.
//!
//! Rows must encode bit-exactly: checkpoint semantics treat a re-applied
//! sub-batch as a no-op only because identical state encodes to identical
//! bytes. The codec therefore avoids anything iteration-order dependent
//! and validates strictly on decode (bad magic, truncation, and trailing
//! bytes are all errors).
//!
//! # Row layout
//!
//! ```text
//! "TVBS" (4B) || version u16 BE
//! hot_capacity varint || cold_capacity varint
//! variant: varint pair count || (key || value) strings
//! source_ref: host || project || ref_name strings
//! hot history || cold history
//! finalizing: u8 presence || segment
//! finalized: varint count || segments
//! ```
//!
//! Histories store a simple-verdict bitmap, then per verdict a commit
//! position delta (first absolute) and a zigzag hour delta, with detail
//! blocks inline for non-simple verdicts. Sorted positions make deltas
//! non-negative and short.

use std::collections::BTreeMap;

use super::codec::{
    put_ivarint, put_str, put_uvarint, read_ivarint, read_str, read_u8, read_uvarint,
};
use super::errors::CodecError;
use super::input_buffer::{History, InputBuffer};
use super::key::BranchKey;
use super::segments::{Counts, Segment, SegmentState};
use super::source::SourceRef;
use super::state::TestVariantBranch;
use super::verdict::{PositionVerdict, Run, VerdictDetails};

/// Row magic bytes.
const STATE_MAGIC: [u8; 4] = *b"TVBS";
/// Row format version.
const STATE_VERSION: u16 = 1;

/// Hard cap on decoded history length, well above any real capacity.
const MAX_HISTORY_LEN: usize = 1 << 20;
/// Hard cap on decoded collection sizes (variant pairs, runs, segments).
const MAX_COLLECTION_LEN: usize = 1 << 16;

/// Encodes a branch state row.
#[must_use]
pub fn encode_state(tvb: &TestVariantBranch) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&STATE_MAGIC);
    out.extend_from_slice(&STATE_VERSION.to_be_bytes());

    put_uvarint(&mut out, tvb.input_buffer.hot_capacity as u64);
    put_uvarint(&mut out, tvb.input_buffer.cold_capacity as u64);

    put_uvarint(&mut out, tvb.variant.len() as u64);
    for (k, v) in &tvb.variant {
        put_str(&mut out, k);
        put_str(&mut out, v);
    }

    put_str(&mut out, &tvb.source_ref.host);
    put_str(&mut out, &tvb.source_ref.project);
    put_str(&mut out, &tvb.source_ref.ref_name);

    encode_history(&mut out, &tvb.input_buffer.hot);
    encode_history(&mut out, &tvb.input_buffer.cold);

    match &tvb.finalizing_segment {
        Some(segment) => {
            out.push(1);
            encode_segment(&mut out, segment);
        }
        None => out.push(0),
    }

    put_uvarint(&mut out, tvb.finalized_segments.len() as u64);
    for segment in &tvb.finalized_segments {
        encode_segment(&mut out, segment);
    }

    out
}

/// Decodes a branch state row for `key`.
///
/// The input must be exactly one encoded row; trailing bytes are
/// rejected. Dirty flags come back cleared: a decoded row is by
/// definition in sync with the store.
pub fn decode_state(key: BranchKey, bytes: &[u8]) -> Result<TestVariantBranch, CodecError> {
    if bytes.len() < 6 || bytes[..4] != STATE_MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = u16::from_be_bytes([bytes[4], bytes[5]]);
    if version != STATE_VERSION {
        return Err(CodecError::UnsupportedVersion { got: version });
    }
    let mut pos = 6;

    let hot_capacity = read_uvarint(bytes, &mut pos)? as usize;
    let cold_capacity = read_uvarint(bytes, &mut pos)? as usize;
    if hot_capacity == 0 || cold_capacity == 0 {
        return Err(CodecError::InvalidValue {
            detail: "buffer capacities must be non-zero",
        });
    }

    let pair_count = read_uvarint(bytes, &mut pos)? as usize;
    if pair_count > MAX_COLLECTION_LEN {
        return Err(CodecError::InvalidValue {
            detail: "variant pair count exceeds cap",
        });
    }
    let mut variant = BTreeMap::new();
    for _ in 0..pair_count {
        let k = read_str(bytes, &mut pos)?;
        let v = read_str(bytes, &mut pos)?;
        variant.insert(k, v);
    }

    let source_ref = SourceRef {
        host: read_str(bytes, &mut pos)?,
        project: read_str(bytes, &mut pos)?,
        ref_name: read_str(bytes, &mut pos)?,
    };

    let hot = decode_history(bytes, &mut pos)?;
    let cold = decode_history(bytes, &mut pos)?;
    if hot.len() > hot_capacity || cold.len() > cold_capacity {
        return Err(CodecError::InvalidValue {
            detail: "history exceeds its declared capacity",
        });
    }

    let finalizing_segment = match read_u8(bytes, &mut pos)? {
        0 => None,
        1 => Some(decode_segment(bytes, &mut pos)?),
        _ => {
            return Err(CodecError::InvalidValue {
                detail: "finalizing segment presence flag must be 0 or 1",
            })
        }
    };

    let segment_count = read_uvarint(bytes, &mut pos)? as usize;
    if segment_count > MAX_COLLECTION_LEN {
        return Err(CodecError::InvalidValue {
            detail: "segment count exceeds cap",
        });
    }
    let mut finalized_segments = Vec::with_capacity(segment_count);
    for _ in 0..segment_count {
        finalized_segments.push(decode_segment(bytes, &mut pos)?);
    }

    if pos != bytes.len() {
        return Err(CodecError::InvalidValue {
            detail: "trailing bytes after state row",
        });
    }

    Ok(TestVariantBranch {
        key,
        variant,
        source_ref,
        input_buffer: InputBuffer {
            hot,
            cold,
            hot_capacity,
            cold_capacity,
            hot_dirty: false,
            cold_dirty: false,
        },
        finalizing_segment,
        finalized_segments,
    })
}

fn encode_history(out: &mut Vec<u8>, history: &History) {
    let n = history.verdicts.len();
    put_uvarint(out, n as u64);

    // Simple-verdict bitmap, low bit first.
    let mut bitmap = vec![0u8; n.div_ceil(8)];
    for (i, v) in history.verdicts.iter().enumerate() {
        if v.is_simple_expected {
            bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    out.extend_from_slice(&bitmap);

    let mut prev_position = 0u64;
    let mut prev_hour = 0i64;
    for (i, v) in history.verdicts.iter().enumerate() {
        if i == 0 {
            put_uvarint(out, v.commit_position);
            put_uvarint(out, v.hour);
        } else {
            put_uvarint(out, v.commit_position - prev_position);
            put_ivarint(out, v.hour as i64 - prev_hour);
        }
        prev_position = v.commit_position;
        prev_hour = v.hour as i64;

        if !v.is_simple_expected {
            let details = v.details.as_ref().expect("non-simple verdict has details");
            out.push(u8::from(details.is_exonerated));
            put_uvarint(out, details.runs.len() as u64);
            for run in &details.runs {
                put_uvarint(out, u64::from(run.expected_count));
                put_uvarint(out, u64::from(run.unexpected_count));
                out.push(u8::from(run.is_duplicate));
            }
        }
    }
}

fn decode_history(bytes: &[u8], pos: &mut usize) -> Result<History, CodecError> {
    let n = read_uvarint(bytes, pos)? as usize;
    if n > MAX_HISTORY_LEN {
        return Err(CodecError::InvalidValue {
            detail: "history length exceeds cap",
        });
    }

    let bitmap_len = n.div_ceil(8);
    if *pos + bitmap_len > bytes.len() {
        return Err(CodecError::Truncated);
    }
    let bitmap = &bytes[*pos..*pos + bitmap_len];
    *pos += bitmap_len;

    let mut verdicts = Vec::with_capacity(n);
    let mut prev_position = 0u64;
    let mut prev_hour = 0i64;
    for i in 0..n {
        let is_simple = bitmap[i / 8] & (1 << (i % 8)) != 0;

        let (position, hour) = if i == 0 {
            let p = read_uvarint(bytes, pos)?;
            let h = read_uvarint(bytes, pos)?;
            (p, h as i64)
        } else {
            let dp = read_uvarint(bytes, pos)?;
            let dh = read_ivarint(bytes, pos)?;
            let p = prev_position
                .checked_add(dp)
                .ok_or(CodecError::InvalidValue {
                    detail: "commit position delta overflows",
                })?;
            let h = prev_hour.checked_add(dh).ok_or(CodecError::InvalidValue {
                detail: "hour delta overflows",
            })?;
            (p, h)
        };
        if hour < 0 {
            return Err(CodecError::InvalidValue {
                detail: "hour must be non-negative",
            });
        }
        if i > 0 && (position, hour) < (prev_position, prev_hour) {
            return Err(CodecError::InvalidValue {
                detail: "history must be sorted by (position, hour)",
            });
        }
        prev_position = position;
        prev_hour = hour;

        let details = if is_simple {
            None
        } else {
            let is_exonerated = match read_u8(bytes, pos)? {
                0 => false,
                1 => true,
                _ => {
                    return Err(CodecError::InvalidValue {
                        detail: "exoneration flag must be 0 or 1",
                    })
                }
            };
            let run_count = read_uvarint(bytes, pos)? as usize;
            if run_count > MAX_COLLECTION_LEN {
                return Err(CodecError::InvalidValue {
                    detail: "run count exceeds cap",
                });
            }
            let mut runs = Vec::with_capacity(run_count);
            for _ in 0..run_count {
                let expected = read_uvarint(bytes, pos)?;
                let unexpected = read_uvarint(bytes, pos)?;
                let is_duplicate = match read_u8(bytes, pos)? {
                    0 => false,
                    1 => true,
                    _ => {
                        return Err(CodecError::InvalidValue {
                            detail: "duplicate flag must be 0 or 1",
                        })
                    }
                };
                runs.push(Run {
                    expected_count: u32::try_from(expected).map_err(|_| {
                        CodecError::InvalidValue {
                            detail: "expected count exceeds u32",
                        }
                    })?,
                    unexpected_count: u32::try_from(unexpected).map_err(|_| {
                        CodecError::InvalidValue {
                            detail: "unexpected count exceeds u32",
                        }
                    })?,
                    is_duplicate,
                });
            }
            Some(VerdictDetails {
                is_exonerated,
                runs,
            })
        };

        verdicts.push(PositionVerdict {
            commit_position: position,
            hour: hour as u64,
            is_simple_expected: is_simple,
            details,
        });
    }

    Ok(History { verdicts })
}

fn encode_segment(out: &mut Vec<u8>, segment: &Segment) {
    out.push(match segment.state {
        SegmentState::Finalizing => 1,
        SegmentState::Finalized => 2,
    });
    out.push(u8::from(segment.has_start_changepoint));
    put_uvarint(out, segment.start_position);
    put_uvarint(out, segment.end_position);
    put_uvarint(out, segment.start_hour);
    put_uvarint(out, segment.end_hour);
    put_uvarint(out, segment.start_position_lower_bound_99);
    put_uvarint(out, segment.start_position_upper_bound_99);
    encode_counts(out, &segment.finalized_counts);
}

fn decode_segment(bytes: &[u8], pos: &mut usize) -> Result<Segment, CodecError> {
    let state = match read_u8(bytes, pos)? {
        1 => SegmentState::Finalizing,
        2 => SegmentState::Finalized,
        _ => {
            return Err(CodecError::InvalidValue {
                detail: "unknown segment state",
            })
        }
    };
    let has_start_changepoint = match read_u8(bytes, pos)? {
        0 => false,
        1 => true,
        _ => {
            return Err(CodecError::InvalidValue {
                detail: "change point flag must be 0 or 1",
            })
        }
    };
    Ok(Segment {
        state,
        has_start_changepoint,
        start_position: read_uvarint(bytes, pos)?,
        end_position: read_uvarint(bytes, pos)?,
        start_hour: read_uvarint(bytes, pos)?,
        end_hour: read_uvarint(bytes, pos)?,
        start_position_lower_bound_99: read_uvarint(bytes, pos)?,
        start_position_upper_bound_99: read_uvarint(bytes, pos)?,
        finalized_counts: decode_counts(bytes, pos)?,
    })
}

fn encode_counts(out: &mut Vec<u8>, counts: &Counts) {
    put_uvarint(out, counts.total_results);
    put_uvarint(out, counts.unexpected_results);
    put_uvarint(out, counts.total_runs);
    put_uvarint(out, counts.unexpected_runs);
    put_uvarint(out, counts.flaky_runs);
    put_uvarint(out, counts.total_verdicts);
    put_uvarint(out, counts.unexpected_verdicts);
    put_uvarint(out, counts.flaky_verdicts);
}

fn decode_counts(bytes: &[u8], pos: &mut usize) -> Result<Counts, CodecError> {
    Ok(Counts {
        total_results: read_uvarint(bytes, pos)?,
        unexpected_results: read_uvarint(bytes, pos)?,
        total_runs: read_uvarint(bytes, pos)?,
        unexpected_runs: read_uvarint(bytes, pos)?,
        flaky_runs: read_uvarint(bytes, pos)?,
        total_verdicts: read_uvarint(bytes, pos)?,
        unexpected_verdicts: read_uvarint(bytes, pos)?,
        flaky_verdicts: read_uvarint(bytes, pos)?,
    })
}
