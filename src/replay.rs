//! Replay of recorded history onto a freshly reset tree.
//!
//! Skills are located by name and version, then re-applied in ledger order
//! with the same add/merge/file-op/structured steps as a normal apply
//! (post-apply commands are not re-run). Custom patches follow, each file
//! merged as `before → after` onto whatever the skills produced.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::apply::SkillSteps;
use crate::customize::{PATCH_AFTER_DIR, PATCH_BEFORE_DIR, patch_content};
use crate::error::EngineError;
use crate::fs_util;
use crate::layout::{Layout, MANIFEST_FILE};
use crate::ledger::{CustomPatch, Ledger};
use crate::manifest::{SkillPackage, read_manifest};
use crate::merge::{FileMergeResult, FileMerger};
use crate::path_remap::resolve_path_remap;
use crate::project::Project;

// ---------------------------------------------------------------------------
// Locating packages
// ---------------------------------------------------------------------------

/// Find the package directory for skill `name` at `version`.
///
/// An override for `name` is checked first; then every direct child of each
/// search path holding a `manifest.toml`. Only an exact name and version
/// match counts. Unreadable manifests are skipped with a warning.
#[must_use]
pub fn find_skill_dir(
    name: &str,
    version: &str,
    search_paths: &[PathBuf],
    overrides: &BTreeMap<String, PathBuf>,
) -> Option<PathBuf> {
    let matches = |dir: &Path| match read_manifest(dir) {
        Ok(m) => m.name == name && m.version == version,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "skipping unreadable package");
            false
        }
    };

    if let Some(dir) = overrides.get(name) {
        if matches(dir) {
            return Some(dir.clone());
        }
        warn!(skill = name, dir = %dir.display(), "override does not hold the recorded version");
    }

    for search in search_paths {
        let Ok(entries) = std::fs::read_dir(search) else {
            continue;
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.join(MANIFEST_FILE).is_file())
            .collect();
        dirs.sort();
        if let Some(found) = dirs.into_iter().find(|d| matches(d)) {
            return Some(found);
        }
    }
    None
}

impl Project {
    /// Configured search paths, resolved against the project root.
    #[must_use]
    pub fn replay_search_paths(&self) -> Vec<PathBuf> {
        self.config()
            .replay
            .search_paths
            .iter()
            .map(|p| if p.is_absolute() { p.clone() } else { self.root().join(p) })
            .collect()
    }

    /// Load the package of every applied skill, in ledger order.
    ///
    /// # Errors
    /// Returns [`EngineError::PackageNotFound`] for the first skill whose
    /// package cannot be found.
    pub fn locate_packages(
        &self,
        ledger: &Ledger,
        overrides: &BTreeMap<String, PathBuf>,
    ) -> Result<Vec<SkillPackage>, EngineError> {
        let search = self.replay_search_paths();
        let mut packages = Vec::with_capacity(ledger.applied_skills().len());
        for index in 0..ledger.applied_skills().len() {
            let Some(skill) = ledger.applied_skill(index) else {
                break;
            };
            let dir = find_skill_dir(&skill.name, &skill.version, &search, overrides).ok_or_else(|| {
                EngineError::PackageNotFound {
                    name: skill.name.clone(),
                    version: skill.version.clone(),
                }
            })?;
            debug!(skill = %skill.name, dir = %dir.display(), "package located");
            packages.push(SkillPackage::load(&dir)?);
        }
        Ok(packages)
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// What replay produced.
#[derive(Debug, Default)]
pub(crate) struct ReplayReport {
    pub skills: Vec<String>,
    pub patches: Vec<String>,
    pub conflicts: Vec<String>,
    pub conflict_count: usize,
    pub resolved_from_cache: Vec<String>,
    pub warnings: Vec<String>,
    pub dependencies_changed: bool,
    /// Remap rebuilt from the replayed skills' file operations.
    pub remap: BTreeMap<String, String>,
}

impl ReplayReport {
    fn conflict_error(&self) -> EngineError {
        EngineError::MergeConflict {
            files: self.conflicts.iter().map(PathBuf::from).collect(),
            count: self.conflict_count,
        }
    }
}

/// Re-apply `packages` in order onto the tree at `project.root()`, merging
/// against `base_dir`. Renames are tracked as they replay, so each skill sees
/// the paths that existed at its original application.
pub(crate) fn replay_skills(
    project: &Project,
    packages: &[SkillPackage],
    base_dir: &Path,
    report: &mut ReplayReport,
) -> Result<(), EngineError> {
    let stage = project.conflict_stage();
    let mut remap = BTreeMap::new();

    for package in packages {
        let name = &package.manifest.name;
        let cache = project.resolution_cache().with_package(package.resolutions_dir());
        let steps = SkillSteps {
            root: project.root(),
            base_dir,
            remap: &remap,
            files: project.file_merger(&cache, &stage, name),
        };

        steps.write_adds(package)?;
        let modify = steps.merge_modifies(package)?;
        report.resolved_from_cache.extend(modify.resolved_from_cache);
        if !modify.conflicted.is_empty() {
            report.conflict_count += modify.conflict_count;
            report.conflicts.extend(modify.conflicted);
            return Err(report.conflict_error());
        }
        report.dependencies_changed |= modify.structured.dependencies_changed;

        let ops = steps.run_file_ops(&package.manifest.file_ops)?;
        report.warnings.extend(ops.warnings.iter().cloned());
        remap.extend(ops.remaps());

        info!(skill = %name, version = %package.manifest.version, "skill replayed");
        report.skills.push(name.clone());
    }
    report.remap = remap;
    Ok(())
}

/// Merge every custom patch onto the current tree, in commit order.
pub(crate) fn replay_custom_patches(
    layout: &Layout,
    files: &FileMerger<'_>,
    patches: &[CustomPatch],
    remap: &BTreeMap<String, String>,
    report: &mut ReplayReport,
) -> Result<(), EngineError> {
    for patch in patches {
        for recorded in &patch.files {
            let rel = resolve_path_remap(recorded, remap);
            let path = fs_util::contained_path(layout.root(), &rel).ok_or_else(|| EngineError::UnsafeFileOp {
                op: "replay".to_owned(),
                detail: format!("path '{rel}' escapes the project root"),
            })?;
            let before = patch_content(layout, &patch.id, PATCH_BEFORE_DIR, recorded)?;
            let after = patch_content(layout, &patch.id, PATCH_AFTER_DIR, recorded)?;
            let current = fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))?;

            match (after, current) {
                (None, None) => {}
                (None, Some(current)) => {
                    if before.as_deref() == Some(current.as_slice()) {
                        fs_util::remove_file_if_exists(&path).map_err(|e| EngineError::io_at(e, &path))?;
                        fs_util::prune_empty_parents(&path, layout.root());
                    } else {
                        let note = format!("{rel}: deleted by custom patch {} but changed since; kept", patch.id);
                        warn!("{note}");
                        report.warnings.push(note);
                    }
                }
                (Some(after), None) => {
                    fs_util::write_file(&path, &after).map_err(|e| EngineError::io_at(e, &path))?;
                }
                (Some(after), Some(current)) => {
                    if after == current {
                        continue;
                    }
                    let before = before.unwrap_or_default();
                    match files.merge_file(&rel, &before, &current, &after)? {
                        FileMergeResult::Conflicted { conflicts, .. } => {
                            report.conflict_count += conflicts;
                            report.conflicts.push(rel);
                        }
                        merged => {
                            if matches!(merged, FileMergeResult::Resolved { .. }) {
                                report.resolved_from_cache.push(rel.clone());
                            }
                            fs_util::write_file(&path, merged.content())
                                .map_err(|e| EngineError::io_at(e, &path))?;
                        }
                    }
                }
            }
        }
        if !report.conflicts.is_empty() {
            return Err(report.conflict_error());
        }
        debug!(patch = %patch.id, "custom patch replayed");
        report.patches.push(patch.id.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_package(dir: &Path, name: &str, version: &str) {
        fs_util::write_file(
            &dir.join(MANIFEST_FILE),
            format!("name = \"{name}\"\nversion = \"{version}\"\ncore_version = \"1.0.0\"\n").as_bytes(),
        )
        .unwrap();
    }

    #[test]
    fn finds_by_name_and_version() {
        let dir = tempfile::tempdir().unwrap();
        write_package(&dir.path().join("telegram-1"), "telegram", "1.0.0");
        write_package(&dir.path().join("telegram-2"), "telegram", "2.0.0");
        let search = vec![dir.path().to_owned()];
        let none = BTreeMap::new();

        assert_eq!(
            find_skill_dir("telegram", "2.0.0", &search, &none),
            Some(dir.path().join("telegram-2"))
        );
        assert_eq!(find_skill_dir("telegram", "3.0.0", &search, &none), None);
        assert_eq!(find_skill_dir("discord", "1.0.0", &search, &none), None);
    }

    #[test]
    fn override_wins_only_on_exact_match() {
        let search_dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        write_package(&search_dir.path().join("t"), "telegram", "1.0.0");
        write_package(other.path(), "telegram", "1.0.0");
        let search = vec![search_dir.path().to_owned()];

        let mut overrides = BTreeMap::new();
        overrides.insert("telegram".to_owned(), other.path().to_owned());
        assert_eq!(
            find_skill_dir("telegram", "1.0.0", &search, &overrides),
            Some(other.path().to_owned())
        );

        write_package(other.path(), "telegram", "9.9.9");
        assert_eq!(
            find_skill_dir("telegram", "1.0.0", &search, &overrides),
            Some(search_dir.path().join("t"))
        );
    }

    #[test]
    fn missing_search_path_is_skipped() {
        let search = vec![PathBuf::from("/nonexistent/skillweave/packages")];
        assert_eq!(find_skill_dir("x", "1.0.0", &search, &BTreeMap::new()), None);
    }
}
