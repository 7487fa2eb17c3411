//! Uninstall: rebuild the tree as if one skill had never been applied.
//!
//! Every managed path is reset to the base snapshot and the remaining skills
//! and custom patches are replayed on top, under the project lock and a
//! backup of everything that may change. The skill's ledger entry is dropped
//! and the path remap rebuilt from the skills that remain.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::apply::rollback;
use crate::error::EngineError;
use crate::fs_util;
use crate::layout;
use crate::manifest::SkillPackage;
use crate::project::Project;
use crate::rebase::managed_paths;
use crate::replay::{ReplayReport, replay_custom_patches, replay_skills};
use crate::structured;

const PACKAGE_JSON: &str = "package.json";

/// Outcome of [`Project::uninstall_skill`].
#[derive(Debug, Serialize)]
pub struct UninstallResult {
    pub success: bool,
    pub skill: String,
    /// Version that was recorded in the ledger (empty if it was not applied).
    pub version: String,
    /// Paths whose content changed and that still exist.
    pub restored: Vec<String>,
    /// Paths that existed before and are gone.
    pub removed: Vec<String>,
    /// Remaining skills replayed, in order.
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

impl UninstallResult {
    fn new(skill: &str) -> Self {
        Self {
            success: false,
            skill: skill.to_owned(),
            version: String::new(),
            restored: Vec::new(),
            removed: Vec::new(),
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
        warn!(skill = %self.skill, error = %err, "uninstall failed");
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

/// Applied skills other than `name` that declare it in `depends`.
fn dependents_of(name: &str, packages: &[SkillPackage]) -> Vec<String> {
    packages
        .iter()
        .filter(|p| p.manifest.name != name && p.manifest.depends.iter().any(|d| d == name))
        .map(|p| p.manifest.name.clone())
        .collect()
}

/// Content hash of every path in `paths` (`None`: absent).
fn hash_paths(root: &Path, paths: &[String]) -> Result<BTreeMap<String, Option<String>>, EngineError> {
    paths
        .iter()
        .map(|rel| {
            let path = root.join(rel);
            let hash = fs_util::hash_file(&path).map_err(|e| EngineError::io_at(e, &path))?;
            Ok((rel.clone(), hash))
        })
        .collect()
}

impl Project {
    /// Remove skill `name`, replaying everything else from the base snapshot.
    pub fn uninstall_skill(&self, name: &str) -> UninstallResult {
        self.uninstall_skill_with_overrides(name, &BTreeMap::new())
    }

    /// [`Project::uninstall_skill`] with explicit package directories for
    /// some skills, checked before the configured search paths.
    #[instrument(skip_all, fields(skill = name))]
    pub fn uninstall_skill_with_overrides(
        &self,
        name: &str,
        overrides: &BTreeMap<String, PathBuf>,
    ) -> UninstallResult {
        let mut result = UninstallResult::new(name);
        if let Err(e) = self.ensure_idle() {
            return result.fail(e);
        }
        let lock = match self.lock() {
            Ok(guard) => guard,
            Err(e) => return result.fail(e),
        };
        let mut ledger = match self.read_ledger() {
            Ok(l) => l,
            Err(e) => return result.fail(e),
        };
        match ledger.find_applied(name) {
            Some(entry) => result.version.clone_from(&entry.version),
            None => {
                return result.fail(EngineError::SkillNotApplied { name: name.to_owned() });
            }
        }

        let packages = match self.locate_packages(&ledger, overrides) {
            Ok(p) => p,
            Err(e) => return result.fail(e),
        };
        let dependents = dependents_of(name, &packages);
        if !dependents.is_empty() {
            return result.fail(EngineError::SkillRequired {
                name: name.to_owned(),
                dependents,
            });
        }

        let base_dir = self.layout().base_dir();
        let base_files = match fs_util::list_files(&base_dir) {
            Ok(f) => f,
            Err(e) => return result.fail(EngineError::io_at(e, &base_dir)),
        };
        let managed = managed_paths(&ledger, &packages, &base_files, &base_files);
        let mut tracked = managed.clone();
        if !tracked.iter().any(|p| p == PACKAGE_JSON) {
            tracked.push(PACKAGE_JSON.to_owned());
        }
        let before = match hash_paths(self.root(), &tracked) {
            Ok(h) => h,
            Err(e) => return result.fail(e),
        };

        let backup = self.backup();
        if let Err(e) = backup.create(&managed) {
            if let Err(clear) = backup.clear() {
                warn!(error = %clear, "could not remove partial backup");
            }
            return result.fail(e);
        }
        let remaining: Vec<SkillPackage> = packages.into_iter().filter(|p| p.manifest.name != name).collect();
        ledger.remove_applied_skill(name);
        info!(remaining = remaining.len(), paths = managed.len(), "uninstalling skill");

        let mut report = ReplayReport::default();
        let outcome = self
            .reset_to(&base_dir, &base_files, &managed)
            .and_then(|()| replay_skills(self, &remaining, &base_dir, &mut report))
            .and_then(|()| {
                ledger.path_remap = std::mem::take(&mut report.remap);
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
                let path = self.root().join(PACKAGE_JSON);
                let now = fs_util::hash_file(&path).map_err(|e| EngineError::io_at(e, &path))?;
                let changed = before.get(PACKAGE_JSON).is_some_and(|was| *was != now);
                if changed && let Some(install) = self.config().commands.install_command() {
                    structured::run_install(self.runner(), install, self.root())?;
                }
                Ok(())
            })
            .and_then(|()| self.write_ledger(&ledger));
        result.absorb(report);

        let outcome = outcome.and_then(|()| hash_paths(self.root(), &managed));
        match outcome {
            Ok(after) => {
                for (rel, was) in before.iter().filter(|(rel, _)| after.contains_key(*rel)) {
                    match (was, after.get(rel).cloned().flatten()) {
                        (Some(_), None) => result.removed.push(rel.clone()),
                        (was, Some(now)) if was.as_deref() != Some(now.as_str()) => {
                            result.restored.push(rel.clone());
                        }
                        _ => {}
                    }
                }
                if let Err(e) = backup.clear() {
                    result.warnings.push(format!("could not remove backup: {e}"));
                }
                if let Err(e) = lock.release() {
                    result.warnings.push(format!("could not release lock: {e}"));
                }
                result.success = true;
                info!(
                    skill = %result.skill,
                    restored = result.restored.len(),
                    removed = result.removed.len(),
                    "skill uninstalled"
                );
                result
            }
            Err(e) => {
                result.rolled_back = rollback(&backup, &mut result.warnings);
                drop(lock);
                result.fail(e)
            }
        }
    }
}
