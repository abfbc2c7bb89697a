//! Branch key types and store key encoding.
//!
//! Every piece of per-key state is addressed by a `BranchKey`:
//! `(project, test_id, variant_hash, ref_hash)`. Store keys are
//! namespaced, length-prefixed byte strings so distinct keys can never
//! collide and related rows sort together by project.
//!
//! # Key Format
//!
//! ```text
//! branch state key:
//!   "tb" (2B) || project || test_id || variant_hash (each varint-len-prefixed)
//!            || ref_hash (8B)
//! ```
//!
//! Grouping in memory avoids hashing the string components per lookup:
//! [`BranchKey::composite_hash`] derives a 32-byte blake3 digest once and
//! the ingest maps key on that.

use std::fmt;

use super::codec::{put_bytes, put_str, read_str};
use super::errors::CodecError;

/// Key namespace prefix for branch state rows (2 bytes).
pub const NS_BRANCH_STATE: [u8; 2] = *b"tb";
/// Key namespace prefix for checkpoint rows (2 bytes).
pub const NS_CHECKPOINT: [u8; 2] = *b"ck";
/// Key namespace prefix for task-count control records (2 bytes).
pub const NS_TASK_COUNT: [u8; 2] = *b"tc";

/// Compact hash of a source ref (branch) identity.
///
/// Eight bytes of the blake3 digest over the ref's host, project, and ref
/// name. Collisions across refs of one test variant are the only concern,
/// so 64 bits is comfortably wide.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefHash(pub [u8; 8]);

impl RefHash {
    /// Returns the raw hash bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Renders the hash as lowercase hex (export row form).
    #[must_use]
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(16);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

impl fmt::Debug for RefHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefHash({})", self.to_hex())
    }
}

/// 32-byte composite digest of a full branch key.
///
/// Used as the in-memory grouping key so hot maps hash 32 fixed bytes
/// instead of four variable-length strings.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BranchKeyHash([u8; 32]);

impl fmt::Debug for BranchKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchKeyHash(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Identity of one (test, variant, source branch) under a project.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchKey {
    /// Project the test results belong to.
    pub project: String,
    /// Test identifier.
    pub test_id: String,
    /// Hash of the variant definition, as supplied by the verdict source.
    pub variant_hash: String,
    /// Hash of the source ref the commit positions are ordered on.
    pub ref_hash: RefHash,
}

impl BranchKey {
    /// Derives the 32-byte composite digest for in-memory grouping.
    ///
    /// Fields are length-prefixed before hashing so `("a", "bc")` and
    /// `("ab", "c")` cannot collide.
    #[must_use]
    pub fn composite_hash(&self) -> BranchKeyHash {
        let mut hasher = blake3::Hasher::new();
        let mut scratch = Vec::with_capacity(
            self.project.len() + self.test_id.len() + self.variant_hash.len() + 32,
        );
        put_str(&mut scratch, &self.project);
        put_str(&mut scratch, &self.test_id);
        put_str(&mut scratch, &self.variant_hash);
        scratch.extend_from_slice(&self.ref_hash.0);
        hasher.update(&scratch);
        BranchKeyHash(*hasher.finalize().as_bytes())
    }

    /// Encodes the branch state store key.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            2 + self.project.len() + self.test_id.len() + self.variant_hash.len() + 8 + 6,
        );
        out.extend_from_slice(&NS_BRANCH_STATE);
        put_str(&mut out, &self.project);
        put_str(&mut out, &self.test_id);
        put_str(&mut out, &self.variant_hash);
        out.extend_from_slice(&self.ref_hash.0);
        out
    }

    /// Decodes a branch state store key.
    ///
    /// The input must be exactly one encoded key; trailing bytes are
    /// rejected to match point-lookup semantics.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < 2 || bytes[..2] != NS_BRANCH_STATE {
            return Err(CodecError::BadMagic);
        }
        let mut pos = 2;
        let project = read_str(bytes, &mut pos)?;
        let test_id = read_str(bytes, &mut pos)?;
        let variant_hash = read_str(bytes, &mut pos)?;
        let rest = bytes.len().saturating_sub(pos);
        if rest != 8 {
            return Err(CodecError::InvalidValue {
                detail: "branch key ref_hash must be exactly 8 bytes",
            });
        }
        let mut ref_hash = [0u8; 8];
        ref_hash.copy_from_slice(&bytes[pos..pos + 8]);
        Ok(Self {
            project,
            test_id,
            variant_hash,
            ref_hash: RefHash(ref_hash),
        })
    }
}

/// Hashes arbitrary length-prefixed fields into a [`RefHash`].
///
/// Shared by the source-ref derivation so key hashing stays in one place.
#[must_use]
pub fn ref_hash_of_fields(fields: &[&str]) -> RefHash {
    let mut scratch = Vec::new();
    for f in fields {
        put_bytes(&mut scratch, f.as_bytes());
    }
    let digest = blake3::hash(&scratch);
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest.as_bytes()[..8]);
    RefHash(out)
}
