//! Verdict source shapes and the paging query interface.
//!
//! The test-result database is an external collaborator; only its query
//! shape matters here. A page carries raw test-variant verdicts, the
//! sources descriptors they reference, and the set of invocations known
//! to be duplicates of already-ingested work.
//!
//! # Contract
//! - `list_verdicts` returns at most `page_size` verdicts.
//! - A non-empty `next_page_token` means more data; passing it back
//!   resumes exactly after the returned page.
//! - Page contents for a given `(invocation, token)` pair are stable so
//!   task retries observe identical data.

use std::collections::BTreeMap;

use ahash::{AHashMap, AHashSet};

use super::errors::SourceError;
use super::key::{ref_hash_of_fields, RefHash};

/// Largest page a source is required to serve.
pub const MAX_PAGE_SIZE: usize = 10_000;

/// A commit on a gitiles-style branch, with its position when known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitilesCommit {
    /// Gitiles host, e.g. `chromium.googlesource.com`.
    pub host: String,
    /// Repository name on the host.
    pub project: String,
    /// Fully-qualified ref, e.g. `refs/heads/main`.
    pub ref_name: String,
    /// Commit hash.
    pub commit_hash: String,
    /// Monotone position on the ref; `None` when the mirror has not
    /// assigned one (such commits cannot feed position-ordered analysis).
    pub position: Option<u64>,
}

/// A gerrit changelist applied on top of the base commit (presubmit only).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Changelist {
    /// Gerrit host.
    pub host: String,
    /// Change number.
    pub change: u64,
    /// Patchset number.
    pub patchset: u32,
}

/// Source descriptor attached to a verdict.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Sources {
    /// Base commit, when resolvable.
    pub gitiles: Option<GitilesCommit>,
    /// True when the checkout had uncommitted local changes.
    pub is_dirty: bool,
    /// Applied changelists; empty for postsubmit.
    pub changelists: Vec<Changelist>,
}

impl Sources {
    /// Returns the commit position, when the source has one.
    ///
    /// Position zero is treated as unset, matching mirrors that report
    /// zero for unpositioned commits.
    #[must_use]
    pub fn commit_position(&self) -> Option<u64> {
        match &self.gitiles {
            Some(commit) => commit.position.filter(|&p| p > 0),
            None => None,
        }
    }

    /// Returns the branch identity these sources are ordered on.
    #[must_use]
    pub fn source_ref(&self) -> Option<SourceRef> {
        self.gitiles.as_ref().map(|c| SourceRef {
            host: c.host.clone(),
            project: c.project.clone(),
            ref_name: c.ref_name.clone(),
        })
    }
}

/// Identity of the branch commit positions are ordered on.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SourceRef {
    /// Gitiles host.
    pub host: String,
    /// Repository name.
    pub project: String,
    /// Fully-qualified ref.
    pub ref_name: String,
}

impl SourceRef {
    /// Derives the compact branch hash used in keys and export rows.
    #[must_use]
    pub fn ref_hash(&self) -> RefHash {
        ref_hash_of_fields(&[&self.host, &self.project, &self.ref_name])
    }
}

/// Status of a single test result within a verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestStatus {
    Pass,
    Fail,
    Crash,
    Abort,
    Skip,
}

/// Aggregate status of a test variant's verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerdictStatus {
    Expected,
    Unexpected,
    Flaky,
    Exonerated,
}

/// One test result inside a raw verdict.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawResult {
    /// Invocation the result ran under (groups results into runs).
    pub invocation: String,
    /// True when the result matched expectations.
    pub expected: bool,
    /// Result status.
    pub status: TestStatus,
}

/// Raw verdict for one test variant, as served by the source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawTestVariant {
    /// Test identifier.
    pub test_id: String,
    /// Variant definition hash.
    pub variant_hash: String,
    /// Variant definition key/value pairs.
    pub variant: BTreeMap<String, String>,
    /// Aggregate verdict status.
    pub status: VerdictStatus,
    /// Individual results, across one or more invocations.
    pub results: Vec<RawResult>,
    /// Id of the sources descriptor in the page's sources map.
    pub sources_id: String,
}

/// One page of verdicts plus the context needed to interpret them.
#[derive(Clone, Debug, Default)]
pub struct VerdictPage {
    /// Verdicts in source order.
    pub verdicts: Vec<RawTestVariant>,
    /// Sources descriptors referenced by `sources_id`.
    pub sources: AHashMap<String, Sources>,
    /// Invocations whose results duplicate already-ingested work.
    pub duplicate_invocations: AHashSet<String>,
    /// Token for the next page; `None` on the final page.
    pub next_page_token: Option<String>,
}

/// Paging query interface over the test-result database.
pub trait VerdictSource: Send + Sync {
    /// Fetches up to `page_size` verdicts for `invocation`, resuming at
    /// `page_token` when given.
    fn list_verdicts(
        &self,
        invocation: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<VerdictPage, SourceError>;
}

/// In-memory verdict source for tests and small runs.
///
/// Holds one flat verdict list per invocation and serves it in stable
/// pages. Page tokens are decimal offsets, so identical `(invocation,
/// token)` queries always return identical pages.
#[derive(Debug, Default)]
pub struct InMemoryVerdictSource {
    invocations: AHashMap<String, InvocationData>,
}

#[derive(Debug, Default)]
struct InvocationData {
    verdicts: Vec<RawTestVariant>,
    sources: AHashMap<String, Sources>,
    duplicate_invocations: AHashSet<String>,
}

impl InMemoryVerdictSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the verdict list and context for an invocation.
    pub fn insert_invocation(
        &mut self,
        invocation: impl Into<String>,
        verdicts: Vec<RawTestVariant>,
        sources: AHashMap<String, Sources>,
        duplicate_invocations: AHashSet<String>,
    ) {
        self.invocations.insert(
            invocation.into(),
            InvocationData {
                verdicts,
                sources,
                duplicate_invocations,
            },
        );
    }
}

impl VerdictSource for InMemoryVerdictSource {
    fn list_verdicts(
        &self,
        invocation: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<VerdictPage, SourceError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(SourceError::PageTooLarge {
                requested: page_size,
                max: MAX_PAGE_SIZE,
            });
        }
        let data = self
            .invocations
            .get(invocation)
            .ok_or_else(|| SourceError::UnknownInvocation {
                name: invocation.to_string(),
            })?;

        let offset = match page_token {
            None => 0usize,
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| SourceError::InvalidPageToken {
                    token: token.to_string(),
                })?,
        };
        if offset > data.verdicts.len() {
            return Err(SourceError::InvalidPageToken {
                token: offset.to_string(),
            });
        }

        let end = offset.saturating_add(page_size).min(data.verdicts.len());
        let next_page_token = if end < data.verdicts.len() {
            Some(end.to_string())
        } else {
            None
        };

        Ok(VerdictPage {
            verdicts: data.verdicts[offset..end].to_vec(),
            sources: data.sources.clone(),
            duplicate_invocations: data.duplicate_invocations.clone(),
            next_page_token,
        })
    }
}
