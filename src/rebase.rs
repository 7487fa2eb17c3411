//! Rebase: rebuild the project tree from its base by replaying history.
//!
//! Every path the engine manages (base files, files touched by applied
//! skills, customized files) is reset to the base snapshot, or to a new base
//! when one is given. Applied skills are then replayed in ledger order and
//! custom patches merged on top. Skill modifies always merge against the
//! current snapshot, the tree the skills were applied to, so a new base's
//! own changes survive the replay. Files the engine never touched are left
//! alone, and the state-dir `.gitignore` entries are restored if the reset
//! dropped them. On success with a new base the snapshot is swapped and the
//! core version updated; the ledger's history is never rewritten.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::apply::{backup_paths, rollback};
use crate::error::EngineError;
use crate::fs_util;
use crate::layout;
use crate::ledger::{Ledger, unix_now};
use crate::manifest::SkillPackage;
use crate::project::Project;
use crate::replay::{ReplayReport, replay_custom_patches, replay_skills};
use crate::structured;
use crate::update::{BaseSwap, core_files, read_core_version};

/// Outcome of [`Project::rebase`].
#[derive(Debug, Serialize)]
pub struct RebaseResult {
    pub success: bool,
    /// Core version after the rebase.
    pub core_version: String,
    /// Skills replayed, in order.
    pub replayed_skills: Vec<String>,
    /// Custom patch ids replayed, in order.
    pub replayed_patches: Vec<String>,
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

impl RebaseResult {
    fn new(core_version: String) -> Self {
        Self {
            success: false,
            core_version,
            replayed_skills: Vec::new(),
            replayed_patches: Vec::new(),
            merge_conflicts: Vec::new(),
            resolved_from_cache: Vec::new(),
            warnings: Vec::new(),
            error: None,
            rolled_back: false,
        }
    }

    fn fail(mut self, err: EngineError) -> Self {
        warn!(error = %err, "rebase failed");
        self.error = Some(err);
        self
    }

    fn absorb(&mut self, report: ReplayReport) {
        self.replayed_skills = report.skills;
        self.replayed_patches = report.patches;
        self.merge_conflicts = report.conflicts;
        self.resolved_from_cache = report.resolved_from_cache;
        self.warnings.extend(report.warnings);
    }
}

/// Every path a rebase may rewrite.
pub(crate) fn managed_paths(
    ledger: &Ledger,
    packages: &[SkillPackage],
    base_files: &[String],
    new_base_files: &[String],
) -> Vec<String> {
    let mut paths: BTreeSet<String> = base_files.iter().chain(new_base_files).cloned().collect();
    for skill in ledger.applied_skills() {
        for rel in &skill.touched_files {
            paths.insert(rel.clone());
            paths.insert(ledger.resolve_path(rel));
        }
    }
    for package in packages {
        paths.extend(backup_paths(package, &BTreeMap::new()));
    }
    for patch in ledger.custom_patches() {
        for rel in &patch.files {
            paths.insert(rel.clone());
            paths.insert(ledger.resolve_path(rel));
        }
    }
    paths.extend(ledger.custom_modifications.keys().cloned());
    paths.into_iter().collect()
}

impl Project {
    /// Rebuild the tree from the base snapshot, or from `new_base` (a core
    /// tree with a `core.toml`) when given.
    pub fn rebase(&self, new_base: Option<&Path>) -> RebaseResult {
        self.rebase_with_overrides(new_base, &BTreeMap::new())
    }

    /// [`Project::rebase`] with explicit package directories for some skills,
    /// checked before the configured search paths.
    #[instrument(skip_all, fields(new_base = ?new_base.map(Path::display)))]
    pub fn rebase_with_overrides(
        &self,
        new_base: Option<&Path>,
        overrides: &BTreeMap<String, PathBuf>,
    ) -> RebaseResult {
        if let Err(e) = self.ensure_idle() {
            return RebaseResult::new(String::new()).fail(e);
        }
        let lock = match self.lock() {
            Ok(guard) => guard,
            Err(e) => return RebaseResult::new(String::new()).fail(e),
        };
        let mut ledger = match self.read_ledger() {
            Ok(l) => l,
            Err(e) => return RebaseResult::new(String::new()).fail(e),
        };
        let mut result = RebaseResult::new(ledger.core_version.clone());

        let packages = match self.locate_packages(&ledger, overrides) {
            Ok(p) => p,
            Err(e) => return result.fail(e),
        };

        let base_dir = self.layout().base_dir();
        let base_files = match fs_util::list_files(&base_dir) {
            Ok(f) => f,
            Err(e) => return result.fail(EngineError::io_at(e, &base_dir)),
        };
        let (source, source_files) = match new_base {
            Some(dir) => match core_files(dir, &self.config().tracking.exclude) {
                Ok(files) => (dir.to_path_buf(), files),
                Err(e) => return result.fail(e),
            },
            None => (base_dir.clone(), base_files.clone()),
        };
        if let Some(dir) = new_base {
            match read_core_version(dir) {
                Ok(Some(version)) => result.core_version = version,
                Ok(None) => warn!(dir = %dir.display(), "new base has no core.toml; keeping core version"),
                Err(e) => return result.fail(e),
            }
        }

        let managed = managed_paths(&ledger, &packages, &base_files, &source_files);
        let backup = self.backup();
        if let Err(e) = backup.create(&managed) {
            if let Err(clear) = backup.clear() {
                warn!(error = %clear, "could not remove partial backup");
            }
            return result.fail(e);
        }
        info!(
            skills = packages.len(),
            patches = ledger.custom_patches().len(),
            paths = managed.len(),
            "rebasing"
        );

        let mut report = ReplayReport::default();
        let outcome = self
            .reset_to(&source, &source_files, &managed)
            .and_then(|()| replay_skills(self, &packages, &base_dir, &mut report))
            .and_then(|()| {
                let cache = self.resolution_cache();
                let stage = self.conflict_stage();
                let files = self.file_merger(&cache, &stage, "customization");
                replay_custom_patches(
                    self.layout(),
                    &files,
                    ledger.custom_patches(),
                    &ledger.path_remap,
                    &mut report,
                )
            })
            .and_then(|()| {
                let root = self.root();
                layout::update_gitignore(root).map_err(|e| EngineError::io_at(e, &root.join(".gitignore")))
            })
            .and_then(|()| {
                if report.dependencies_changed
                    && let Some(install) = self.config().commands.install_command()
                {
                    structured::run_install(self.runner(), install, self.root())?;
                }
                Ok(())
            })
            .and_then(|()| {
                let swap = match new_base {
                    Some(dir) => Some(BaseSwap::begin(self.layout(), dir, &source_files)?),
                    None => None,
                };
                ledger.core_version.clone_from(&result.core_version);
                ledger.last_rebased_at = Some(unix_now());
                let written = self.write_ledger(&ledger);
                if let Some(swap) = swap {
                    if written.is_ok() {
                        swap.commit();
                    } else {
                        swap.revert();
                    }
                }
                written
            });
        result.absorb(report);

        match outcome {
            Ok(()) => {
                if let Err(e) = backup.clear() {
                    result.warnings.push(format!("could not remove backup: {e}"));
                }
                if let Err(e) = lock.release() {
                    result.warnings.push(format!("could not release lock: {e}"));
                }
                result.success = true;
                info!(version = %result.core_version, "rebase complete");
                result
            }
            Err(e) => {
                result.rolled_back = rollback(&backup, &mut result.warnings);
                drop(lock);
                result.fail(e)
            }
        }
    }

    /// Put every managed path back to its content in `source`, deleting
    /// those `source` does not have.
    pub(crate) fn reset_to(&self, source: &Path, source_files: &[String], managed: &[String]) -> Result<(), EngineError> {
        let in_source: BTreeSet<&str> = source_files.iter().map(String::as_str).collect();
        for rel in managed {
            let Some(path) = fs_util::contained_path(self.root(), rel) else {
                return Err(EngineError::UnsafeFileOp {
                    op: "rebase".to_owned(),
                    detail: format!("path '{rel}' escapes the project root"),
                });
            };
            if in_source.contains(rel.as_str()) {
                let from = source.join(rel);
                let bytes = std::fs::read(&from).map_err(|e| EngineError::io_at(e, &from))?;
                fs_util::write_file(&path, &bytes).map_err(|e| EngineError::io_at(e, &path))?;
            } else if fs_util::remove_file_if_exists(&path).map_err(|e| EngineError::io_at(e, &path))? {
                fs_util::prune_empty_parents(&path, self.root());
            }
        }
        Ok(())
    }
}
