//! Three-way merge engine.
//!
//! - [`ThreeWayMerge`]: the merge primitive (bundled: [`diff3::Diff3Merger`]).
//! - [`resolution`]: content-addressed cache of previously resolved conflicts.
//! - [`stage`]: three-way records of unresolved conflicts awaiting a human.
//! - [`FileMerger`]: the per-file pipeline orchestrators use: merge, consult
//!   the cache on conflict, stage whatever is still unresolved.
//!
//! The merge is deterministic: the same `(base, ours, theirs)` triple always
//! produces the same output and the same fingerprint.

pub mod diff3;
pub mod resolution;
pub mod stage;

use std::fmt;

use tracing::{debug, info};

use crate::error::EngineError;
use resolution::{ResolutionCache, fingerprint};
use stage::ConflictStage;

// ---------------------------------------------------------------------------
// Primitive
// ---------------------------------------------------------------------------

/// Labels written after the conflict markers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeLabels {
    /// Working-tree side (`<<<<<<< ours`).
    pub ours: String,
    /// Incoming side (`>>>>>>> theirs`).
    pub theirs: String,
}

impl MergeLabels {
    #[must_use]
    pub fn new(ours: impl Into<String>, theirs: impl Into<String>) -> Self {
        Self {
            ours: ours.into(),
            theirs: theirs.into(),
        }
    }
}

/// Result of one three-way merge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Both sides' intent reconciled.
    Clean(Vec<u8>),
    /// Content with conflict markers, plus the number of conflict blocks.
    Conflicted { content: Vec<u8>, conflicts: usize },
}

/// Hard merge failure (distinct from a conflict), e.g. non-text input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeError {
    detail: String,
}

impl MergeError {
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl std::error::Error for MergeError {}

/// A three-way merge primitive.
pub trait ThreeWayMerge {
    /// Merge `ours` and `theirs` against their common ancestor `base`.
    ///
    /// # Errors
    /// Returns [`MergeError`] when the inputs cannot be merged at all.
    fn merge(
        &self,
        base: &[u8],
        ours: &[u8],
        theirs: &[u8],
        labels: &MergeLabels,
    ) -> Result<MergeOutcome, MergeError>;
}

// ---------------------------------------------------------------------------
// Per-file pipeline
// ---------------------------------------------------------------------------

/// Result of merging one project file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileMergeResult {
    /// Merged without conflicts.
    Clean(Vec<u8>),
    /// Conflicted, but a cached resolution for the exact triple was reused.
    Resolved {
        content: Vec<u8>,
        fingerprint: String,
    },
    /// Unresolved; markers are in `content` and a record was staged.
    Conflicted {
        content: Vec<u8>,
        conflicts: usize,
        fingerprint: String,
    },
}

impl FileMergeResult {
    /// Content to write into the working tree.
    #[must_use]
    pub fn content(&self) -> &[u8] {
        match self {
            Self::Clean(c) | Self::Resolved { content: c, .. } | Self::Conflicted { content: c, .. } => c,
        }
    }

    /// Conflict blocks left in the content.
    #[must_use]
    pub const fn conflicts(&self) -> usize {
        match self {
            Self::Conflicted { conflicts, .. } => *conflicts,
            _ => 0,
        }
    }
}

/// Merge + resolution cache + conflict staging for one operation.
pub struct FileMerger<'a> {
    merger: &'a dyn ThreeWayMerge,
    cache: &'a ResolutionCache,
    stage: &'a ConflictStage,
    labels: MergeLabels,
}

impl<'a> FileMerger<'a> {
    #[must_use]
    pub fn new(
        merger: &'a dyn ThreeWayMerge,
        cache: &'a ResolutionCache,
        stage: &'a ConflictStage,
        labels: MergeLabels,
    ) -> Self {
        Self {
            merger,
            cache,
            stage,
            labels,
        }
    }

    /// Merge one file.
    ///
    /// # Errors
    /// Returns [`EngineError::MergeFailed`] on a hard primitive failure, or
    /// [`EngineError::Io`] if the cache or stage cannot be accessed.
    pub fn merge_file(
        &self,
        rel: &str,
        base: &[u8],
        ours: &[u8],
        theirs: &[u8],
    ) -> Result<FileMergeResult, EngineError> {
        let outcome = self
            .merger
            .merge(base, ours, theirs, &self.labels)
            .map_err(|e| EngineError::MergeFailed {
                path: rel.into(),
                detail: e.to_string(),
            })?;

        let (content, conflicts) = match outcome {
            MergeOutcome::Clean(content) => {
                debug!(path = rel, "merged cleanly");
                return Ok(FileMergeResult::Clean(content));
            }
            MergeOutcome::Conflicted { content, conflicts } => (content, conflicts),
        };

        let fp = fingerprint(base, ours, theirs);
        if let Some(hit) = self.cache.lookup(&fp)? {
            info!(path = rel, fingerprint = %fp, source = hit.source.as_str(), "reused recorded resolution");
            return Ok(FileMergeResult::Resolved {
                content: hit.content,
                fingerprint: fp,
            });
        }

        self.stage.stage(rel, &fp, base, ours, theirs, &content, conflicts)?;
        info!(path = rel, fingerprint = %fp, conflicts, "conflict staged");
        Ok(FileMergeResult::Conflicted {
            content,
            conflicts,
            fingerprint: fp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;

    #[test]
    fn conflict_is_staged_then_resolution_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let cache = ResolutionCache::new(&layout);
        let stage = ConflictStage::new(&layout);
        let merger = diff3::Diff3Merger::default();
        let files = FileMerger::new(&merger, &cache, &stage, MergeLabels::new("current", "skill"));

        let (base, ours, theirs) = (b"a\nx\n".as_slice(), b"a\nours\n".as_slice(), b"a\ntheirs\n".as_slice());
        let first = files.merge_file("src/app.ts", base, ours, theirs).unwrap();
        let FileMergeResult::Conflicted { fingerprint: fp, conflicts, .. } = first else {
            panic!("expected conflict");
        };
        assert_eq!(conflicts, 1);
        assert_eq!(stage.list().unwrap().len(), 1);

        std::fs::write(stage.merged_path(&fp), b"a\nours and theirs\n").unwrap();
        stage::record_resolution(&stage, &cache, &fp).unwrap();
        assert!(stage.list().unwrap().is_empty());

        let second = files.merge_file("src/app.ts", base, ours, theirs).unwrap();
        assert_eq!(
            second,
            FileMergeResult::Resolved {
                content: b"a\nours and theirs\n".to_vec(),
                fingerprint: fp,
            }
        );
    }

    #[test]
    fn clean_merge_stages_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let cache = ResolutionCache::new(&layout);
        let stage = ConflictStage::new(&layout);
        let merger = diff3::Diff3Merger::default();
        let files = FileMerger::new(&merger, &cache, &stage, MergeLabels::new("current", "skill"));

        let result = files
            .merge_file("a.txt", b"1\n2\n3\n", b"one\n2\n3\n", b"1\n2\nthree\n")
            .unwrap();
        assert_eq!(result.content(), b"one\n2\nthree\n");
        assert_eq!(result.conflicts(), 0);
        assert!(stage.list().unwrap().is_empty());
    }

    #[test]
    fn hard_failure_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let cache = ResolutionCache::new(&layout);
        let stage = ConflictStage::new(&layout);
        let merger = diff3::Diff3Merger::default();
        let files = FileMerger::new(&merger, &cache, &stage, MergeLabels::new("current", "skill"));

        let err = files
            .merge_file("bin.dat", b"a\n", &[0xff, 0x00], b"b\n")
            .unwrap_err();
        assert!(matches!(err, EngineError::MergeFailed { .. }));
        assert!(err.to_string().contains("bin.dat"));
    }
}
