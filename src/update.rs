//! Core updates: re-merge the project onto a new core baseline.
//!
//! The base snapshot is the common ancestor. Every file that changed between
//! the snapshot and the candidate core is merged with the working tree
//! (`ours`) against the candidate (`theirs`). On success the snapshot is
//! swapped for the candidate and the ledger's core version bumped; any
//! unresolved conflict rolls the whole update back.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::apply::rollback;
use crate::error::EngineError;
use crate::fs_util;
use crate::layout::{CORE_MANIFEST_FILE, Layout, RESOLUTIONS_DIR};
use crate::ledger::Ledger;
use crate::merge::FileMergeResult;
use crate::path_remap::resolve_path_remap;
use crate::project::{Project, list_tracked};

// ---------------------------------------------------------------------------
// Core metadata
// ---------------------------------------------------------------------------

/// `core.toml` at the root of a core tree. Other keys are ignored.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
struct CoreManifest {
    version: String,
}

/// Core version declared by `<core_dir>/core.toml`, `None` without one.
///
/// # Errors
/// Returns [`EngineError::Manifest`] if the file exists but is invalid.
pub fn read_core_version(core_dir: &Path) -> Result<Option<String>, EngineError> {
    let path = core_dir.join(CORE_MANIFEST_FILE);
    let Some(bytes) = fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))? else {
        return Ok(None);
    };
    let text = String::from_utf8(bytes).map_err(|e| EngineError::Manifest {
        path: path.clone(),
        detail: format!("not UTF-8: {e}"),
    })?;
    let manifest: CoreManifest = toml::from_str(&text).map_err(|e| EngineError::Manifest {
        path: path.clone(),
        detail: e.to_string(),
    })?;
    if manifest.version.trim().is_empty() {
        return Err(EngineError::Manifest {
            path,
            detail: "`version` must not be empty".to_owned(),
        });
    }
    Ok(Some(manifest.version))
}

fn require_core_version(core_dir: &Path) -> Result<String, EngineError> {
    read_core_version(core_dir)?.ok_or_else(|| EngineError::Manifest {
        path: core_dir.join(CORE_MANIFEST_FILE),
        detail: "candidate core has no core.toml; add one with `version = \"x.y.z\"`".to_owned(),
    })
}

/// Whether `rel` is core content rather than metadata (`core.toml` and the
/// shipped `resolutions/` tree are metadata).
fn is_core_content(rel: &str) -> bool {
    rel != CORE_MANIFEST_FILE && !Path::new(rel).starts_with(RESOLUTIONS_DIR)
}

/// Files of a core tree that belong in the base snapshot.
pub(crate) fn core_files(core_dir: &Path, exclude: &[String]) -> Result<Vec<String>, EngineError> {
    let mut files = list_tracked(core_dir, exclude)?;
    files.retain(|f| is_core_content(f));
    Ok(files)
}

/// Paths whose content differs between two trees (added, modified or deleted).
pub(crate) fn changed_between(
    old_dir: &Path,
    old_files: &[String],
    new_dir: &Path,
    new_files: &[String],
) -> Result<Vec<String>, EngineError> {
    let all: BTreeSet<&String> = old_files
        .iter()
        .chain(new_files)
        .filter(|f| is_core_content(f))
        .collect();
    let mut changed = Vec::new();
    for rel in all {
        let old = old_dir.join(rel);
        let new = new_dir.join(rel);
        let a = fs_util::hash_file(&old).map_err(|e| EngineError::io_at(e, &old))?;
        let b = fs_util::hash_file(&new).map_err(|e| EngineError::io_at(e, &new))?;
        if a != b {
            changed.push(rel.clone());
        }
    }
    Ok(changed)
}

// ---------------------------------------------------------------------------
// Base swap
// ---------------------------------------------------------------------------

/// Two-step replacement of the base snapshot.
///
/// `begin` stages the new snapshot and moves it into place, keeping the old
/// one aside; `commit` discards the old one, `revert` puts it back.
pub(crate) struct BaseSwap {
    base: PathBuf,
    old: PathBuf,
}

impl BaseSwap {
    pub fn begin(layout: &Layout, source: &Path, files: &[String]) -> Result<Self, EngineError> {
        let base = layout.base_dir();
        let state = layout.state_dir();
        let next = state.join("base.next");
        let old = state.join("base.old");
        for dir in [&next, &old] {
            fs_util::remove_dir_if_exists(dir).map_err(|e| EngineError::io_at(e, dir))?;
        }

        for rel in files {
            let from = source.join(rel);
            let to = next.join(rel);
            let bytes = fs::read(&from).map_err(|e| EngineError::io_at(e, &from))?;
            fs_util::write_file(&to, &bytes).map_err(|e| EngineError::io_at(e, &to))?;
        }
        fs::create_dir_all(&next).map_err(|e| EngineError::io_at(e, &next))?;

        if base.exists() {
            fs::rename(&base, &old).map_err(|e| EngineError::io_at(e, &base))?;
        }
        if let Err(e) = fs::rename(&next, &base) {
            if old.exists() {
                if let Err(restore) = fs::rename(&old, &base) {
                    warn!(dir = %old.display(), error = %restore, "could not restore previous base snapshot");
                }
            }
            return Err(EngineError::io_at(e, &next));
        }
        Ok(Self { base, old })
    }

    pub fn commit(self) {
        if let Err(e) = fs_util::remove_dir_if_exists(&self.old) {
            warn!(dir = %self.old.display(), error = %e, "could not remove previous base snapshot");
        }
    }

    pub fn revert(self) {
        let restored = fs_util::remove_dir_if_exists(&self.base).and_then(|()| {
            if self.old.exists() {
                fs::rename(&self.old, &self.base)
            } else {
                Ok(())
            }
        });
        if let Err(e) = restored {
            warn!(error = %e, "could not restore previous base snapshot");
        }
    }
}

// ---------------------------------------------------------------------------
// Preview
// ---------------------------------------------------------------------------

/// What an update would change. Read-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UpdatePreview {
    pub current_version: String,
    pub new_version: String,
    /// Files added, modified or deleted between the base snapshot and the
    /// candidate core.
    pub files_changed: Vec<String>,
    /// Changed files the user has customized.
    pub conflict_risk: Vec<String>,
    /// Ids of custom patches touching a changed file.
    pub custom_patches_at_risk: Vec<String>,
}

fn preview(
    project: &Project,
    ledger: &Ledger,
    new_core: &Path,
    new_version: String,
) -> Result<(UpdatePreview, Vec<String>), EngineError> {
    let base_dir = project.layout().base_dir();
    let base_files = fs_util::list_files(&base_dir).map_err(|e| EngineError::io_at(e, &base_dir))?;
    let new_files = core_files(new_core, &project.config().tracking.exclude)?;
    let files_changed = changed_between(&base_dir, &base_files, new_core, &new_files)?;

    let conflict_risk = files_changed
        .iter()
        .filter(|rel| {
            ledger
                .custom_modifications
                .contains_key(&resolve_path_remap(rel, &ledger.path_remap))
        })
        .cloned()
        .collect();
    let custom_patches_at_risk = ledger
        .custom_patches()
        .iter()
        .filter(|p| {
            p.files.iter().any(|f| {
                files_changed
                    .iter()
                    .any(|c| c == f || resolve_path_remap(c, &ledger.path_remap) == *f)
            })
        })
        .map(|p| p.id.clone())
        .collect();

    Ok((
        UpdatePreview {
            current_version: ledger.core_version.clone(),
            new_version,
            files_changed,
            conflict_risk,
            custom_patches_at_risk,
        },
        new_files,
    ))
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Outcome of [`Project::apply_update`].
#[derive(Debug, Serialize)]
pub struct UpdateResult {
    pub success: bool,
    pub previous_version: String,
    pub new_version: String,
    /// Files merged (or taken) from the candidate core.
    pub merged: Vec<String>,
    /// Files deleted because the core deleted them and they were untouched.
    pub deleted: Vec<String>,
    /// Files the core deleted but the project changed; left in place.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kept: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub merge_conflicts: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolved_from_cache: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    pub rolled_back: bool,
}

impl UpdateResult {
    fn new(previous_version: String, new_version: String) -> Self {
        Self {
            success: false,
            previous_version,
            new_version,
            merged: Vec::new(),
            deleted: Vec::new(),
            kept: Vec::new(),
            merge_conflicts: Vec::new(),
            resolved_from_cache: Vec::new(),
            warnings: Vec::new(),
            error: None,
            rolled_back: false,
        }
    }

    fn fail(mut self, err: EngineError) -> Self {
        warn!(error = %err, "update failed");
        self.error = Some(err);
        self
    }
}

impl Project {
    /// Report what updating to the core at `new_core` would change.
    ///
    /// # Errors
    /// Returns [`EngineError::Manifest`] if the candidate has no valid
    /// `core.toml`, or [`EngineError::Ledger`]/[`EngineError::Io`] on read
    /// failure.
    #[instrument(skip_all, fields(core = %new_core.display()))]
    pub fn preview_update(&self, new_core: &Path) -> Result<UpdatePreview, EngineError> {
        let new_version = require_core_version(new_core)?;
        let ledger = self.read_ledger()?;
        preview(self, &ledger, new_core, new_version).map(|(p, _)| p)
    }

    /// Update the project onto the core at `new_core`.
    #[instrument(skip_all, fields(core = %new_core.display()))]
    pub fn apply_update(&self, new_core: &Path) -> UpdateResult {
        let new_version = match require_core_version(new_core) {
            Ok(v) => v,
            Err(e) => return UpdateResult::new(String::new(), String::new()).fail(e),
        };
        if let Err(e) = self.ensure_idle() {
            return UpdateResult::new(String::new(), new_version).fail(e);
        }
        let lock = match self.lock() {
            Ok(guard) => guard,
            Err(e) => return UpdateResult::new(String::new(), new_version).fail(e),
        };
        let mut ledger = match self.read_ledger() {
            Ok(l) => l,
            Err(e) => return UpdateResult::new(String::new(), new_version).fail(e),
        };
        let mut result = UpdateResult::new(ledger.core_version.clone(), new_version);

        let (plan, new_files) = match preview(self, &ledger, new_core, result.new_version.clone()) {
            Ok(p) => p,
            Err(e) => return result.fail(e),
        };
        for rel in &plan.conflict_risk {
            warn!(path = %rel, "customized file changed in the new core");
        }

        let backup = self.backup();
        let targets: Vec<String> = plan
            .files_changed
            .iter()
            .map(|rel| resolve_path_remap(rel, &ledger.path_remap))
            .collect();
        if let Err(e) = backup.create(&targets) {
            if let Err(clear) = backup.clear() {
                warn!(error = %clear, "could not remove partial backup");
            }
            return result.fail(e);
        }
        info!(
            from = %result.previous_version,
            to = %result.new_version,
            files = plan.files_changed.len(),
            "updating core"
        );

        let outcome = self
            .merge_core_changes(&ledger, &plan.files_changed, new_core, &mut result)
            .and_then(|()| {
                let swap = BaseSwap::begin(self.layout(), new_core, &new_files)?;
                ledger.core_version.clone_from(&result.new_version);
                match self.write_ledger(&ledger) {
                    Ok(()) => {
                        swap.commit();
                        Ok(())
                    }
                    Err(e) => {
                        swap.revert();
                        Err(e)
                    }
                }
            });

        match outcome {
            Ok(()) => {
                if let Err(e) = backup.clear() {
                    result.warnings.push(format!("could not remove backup: {e}"));
                }
                if let Err(e) = lock.release() {
                    result.warnings.push(format!("could not release lock: {e}"));
                }
                result.success = true;
                info!(version = %result.new_version, "core updated");
                result
            }
            Err(e) => {
                result.rolled_back = rollback(&backup, &mut result.warnings);
                drop(lock);
                result.fail(e)
            }
        }
    }

    fn merge_core_changes(
        &self,
        ledger: &Ledger,
        changed: &[String],
        new_core: &Path,
        result: &mut UpdateResult,
    ) -> Result<(), EngineError> {
        let cache = self
            .resolution_cache()
            .with_package(new_core.join(RESOLUTIONS_DIR));
        let stage = self.conflict_stage();
        let label = format!("core {}", result.new_version);
        let files = self.file_merger(&cache, &stage, &label);
        let base_dir = self.layout().base_dir();
        let mut conflict_count = 0;

        for rel in changed {
            let current_rel = resolve_path_remap(rel, &ledger.path_remap);
            let path = fs_util::contained_path(self.root(), &current_rel).ok_or_else(|| {
                EngineError::UnsafeFileOp {
                    op: "update".to_owned(),
                    detail: format!("path '{current_rel}' escapes the project root"),
                }
            })?;
            let read = |p: &Path| fs_util::read_optional(p).map_err(|e| EngineError::io_at(e, p));
            let base = read(&base_dir.join(rel))?;
            let theirs = read(&new_core.join(rel))?;
            let ours = read(&path)?;

            match (theirs, ours) {
                (None, None) => {}
                (None, Some(ours)) => {
                    if base.as_deref() == Some(ours.as_slice()) {
                        fs_util::remove_file_if_exists(&path).map_err(|e| EngineError::io_at(e, &path))?;
                        fs_util::prune_empty_parents(&path, self.root());
                        result.deleted.push(current_rel);
                    } else {
                        warn!(path = %current_rel, "deleted in core but changed locally; kept");
                        result.kept.push(current_rel);
                    }
                }
                (Some(theirs), None) => {
                    if base.is_some() {
                        let note = format!("{current_rel}: changed in core but deleted locally; left deleted");
                        warn!("{note}");
                        result.warnings.push(note);
                    } else {
                        fs_util::write_file(&path, &theirs).map_err(|e| EngineError::io_at(e, &path))?;
                        result.merged.push(current_rel);
                    }
                }
                (Some(theirs), Some(ours)) => {
                    if ours == theirs {
                        continue;
                    }
                    let base = base.unwrap_or_default();
                    match files.merge_file(&current_rel, &base, &ours, &theirs)? {
                        FileMergeResult::Conflicted { conflicts, .. } => {
                            conflict_count += conflicts;
                            result.merge_conflicts.push(current_rel);
                        }
                        merged => {
                            if matches!(merged, FileMergeResult::Resolved { .. }) {
                                result.resolved_from_cache.push(current_rel.clone());
                            }
                            fs_util::write_file(&path, merged.content())
                                .map_err(|e| EngineError::io_at(e, &path))?;
                            result.merged.push(current_rel);
                        }
                    }
                }
            }
        }

        if result.merge_conflicts.is_empty() {
            Ok(())
        } else {
            Err(EngineError::MergeConflict {
                files: result.merge_conflicts.iter().map(PathBuf::from).collect(),
                count: conflict_count,
            })
        }
    }
}
