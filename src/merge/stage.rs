//! Staged conflicts awaiting manual resolution.
//!
//! Every unresolved conflict leaves a three-way record under
//! `.skillweave/conflicts/<fingerprint>/`: `base`, `ours`, `theirs`, the
//! marker-laden `merged` file, and `meta.json`. The user edits `merged` and
//! runs `skillweave resolve`, which moves the result into the user resolution
//! cache so the next attempt with the same inputs replays it.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::resolution::{META_FILE, ResolutionCache, is_fingerprint, read_records};
use crate::error::EngineError;
use crate::fs_util;
use crate::layout::Layout;
use crate::ledger::unix_now;

/// `meta.json` of a staged conflict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedConflict {
    pub fingerprint: String,
    /// Project-relative path of the conflicted file.
    pub path: String,
    /// Conflict blocks in `merged` when staged.
    pub conflicts: usize,
    /// Unix timestamp (seconds).
    pub staged_at: u64,
}

/// The staging area of one project.
#[derive(Clone, Debug)]
pub struct ConflictStage {
    dir: PathBuf,
}

impl ConflictStage {
    #[must_use]
    pub fn new(layout: &Layout) -> Self {
        Self {
            dir: layout.conflicts_dir(),
        }
    }

    /// File the user edits to resolve `fp`.
    #[must_use]
    pub fn merged_path(&self, fp: &str) -> PathBuf {
        self.dir.join(fp).join("merged")
    }

    /// Stage a conflict, replacing any older record for the same path.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] on write failure.
    #[allow(clippy::too_many_arguments)]
    pub fn stage(
        &self,
        rel: &str,
        fp: &str,
        base: &[u8],
        ours: &[u8],
        theirs: &[u8],
        merged: &[u8],
        conflicts: usize,
    ) -> Result<(), EngineError> {
        for stale in self.list()? {
            if stale.path == rel && stale.fingerprint != fp {
                debug!(path = rel, fingerprint = %stale.fingerprint, "dropping stale staged conflict");
                self.remove(&stale.fingerprint)?;
            }
        }

        let record = self.dir.join(fp);
        for (name, bytes) in [("base", base), ("ours", ours), ("theirs", theirs), ("merged", merged)] {
            let path = record.join(name);
            fs_util::write_file(&path, bytes).map_err(|e| EngineError::io_at(e, &path))?;
        }
        let meta = StagedConflict {
            fingerprint: fp.to_owned(),
            path: rel.to_owned(),
            conflicts,
            staged_at: unix_now(),
        };
        let json = serde_json::to_string_pretty(&meta).map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        let meta_path = record.join(META_FILE);
        fs_util::write_atomic(&meta_path, json.as_bytes()).map_err(|e| EngineError::io_at(e, &meta_path))
    }

    /// Every staged conflict, sorted by fingerprint.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<StagedConflict>, EngineError> {
        read_records(&self.dir)
    }

    /// The staged record for `fp`.
    ///
    /// # Errors
    /// Returns [`EngineError::ResolutionNotFound`] if nothing is staged.
    pub fn get(&self, fp: &str) -> Result<StagedConflict, EngineError> {
        if is_fingerprint(fp) {
            let meta_path = self.dir.join(fp).join(META_FILE);
            if let Ok(contents) = fs::read_to_string(&meta_path)
                && let Ok(meta) = serde_json::from_str::<StagedConflict>(&contents)
            {
                return Ok(meta);
            }
        }
        Err(EngineError::ResolutionNotFound {
            fingerprint: fp.to_owned(),
        })
    }

    /// Remove a staged record.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] on failure.
    pub fn remove(&self, fp: &str) -> Result<(), EngineError> {
        if !is_fingerprint(fp) {
            return Ok(());
        }
        let record = self.dir.join(fp);
        fs_util::remove_dir_if_exists(&record).map_err(|e| EngineError::io_at(e, &record))
    }
}

/// Does `content` still contain a conflict marker line?
#[must_use]
pub fn has_conflict_markers(content: &str) -> bool {
    content.lines().any(|line| {
        line.starts_with("<<<<<<<") || line.starts_with(">>>>>>>") || line.trim_end() == "======="
    })
}

/// Move the user's edit of a staged conflict into the resolution cache.
///
/// # Errors
/// Returns [`EngineError::ResolutionNotFound`] if `fp` is not staged, or
/// [`EngineError::UnresolvedMarkers`] if `merged` still has markers.
pub fn record_resolution(
    stage: &ConflictStage,
    cache: &ResolutionCache,
    fp: &str,
) -> Result<StagedConflict, EngineError> {
    let meta = stage.get(fp)?;
    let merged_path = stage.merged_path(fp);
    let content = fs::read(&merged_path).map_err(|e| EngineError::io_at(e, &merged_path))?;
    if has_conflict_markers(&String::from_utf8_lossy(&content)) {
        return Err(EngineError::UnresolvedMarkers {
            fingerprint: fp.to_owned(),
            path: merged_path,
        });
    }
    cache.save(fp, &meta.path, &content)?;
    stage.remove(fp)?;
    info!(fingerprint = fp, path = %meta.path, "resolution recorded");
    Ok(meta)
}
