//! Skill application: the apply state machine.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Locked → Validated → BeginMutation → AddsWritten → ModifiesMerged
//!          │          │            │               → FileOpsApplied → PostApplyRun
//!          │          │            │               → Recorded → Unlocked
//!          └──────────┴→ Unlocked  └→ Failing → Unlocked
//! ```
//!
//! Validation failures release the lock without touching the tree. Once the
//! backup exists every failure goes through `Failing`, which restores the
//! backup before the lock is released. No partial success is ever reported.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::error::EngineError;
use crate::exec;
use crate::file_ops::{FileOpsResult, execute_file_ops};
use crate::fs_util;
use crate::ledger::{AppliedSkill, Ledger, unix_now};
use crate::manifest::{self, FileOperation, SkillPackage};
use crate::merge::{FileMergeResult, FileMerger};
use crate::path_remap::resolve_path_remap;
use crate::project::Project;
use crate::structured::{self, StructuredOutcome};

// ---------------------------------------------------------------------------
// ApplyPhase
// ---------------------------------------------------------------------------

/// Phase of one skill application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyPhase {
    /// Nothing held yet.
    Idle,
    /// Project lock acquired.
    Locked,
    /// Manifest gates passed.
    Validated,
    /// Backup written; the tree may now change.
    BeginMutation,
    /// Added files in place.
    AddsWritten,
    /// Modified files and structured targets merged.
    ModifiesMerged,
    /// Renames, moves and deletes done.
    FileOpsApplied,
    /// Install and post-apply commands succeeded.
    PostApplyRun,
    /// Ledger updated.
    Recorded,
    /// Lock released (terminal).
    Unlocked,
    /// Rolling back.
    Failing,
}

impl ApplyPhase {
    /// Returns the set of valid next phases from this phase.
    #[must_use]
    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Idle => &[Self::Locked],
            Self::Locked => &[Self::Validated, Self::Unlocked],
            Self::Validated => &[Self::BeginMutation, Self::Unlocked],
            Self::BeginMutation => &[Self::AddsWritten, Self::Failing],
            Self::AddsWritten => &[Self::ModifiesMerged, Self::Failing],
            Self::ModifiesMerged => &[Self::FileOpsApplied, Self::Failing],
            Self::FileOpsApplied => &[Self::PostApplyRun, Self::Failing],
            Self::PostApplyRun => &[Self::Recorded, Self::Failing],
            Self::Recorded | Self::Failing => &[Self::Unlocked],
            Self::Unlocked => &[],
        }
    }

    /// Check whether transitioning to `next` is valid.
    #[must_use]
    pub fn can_transition_to(&self, next: &Self) -> bool {
        self.valid_transitions().contains(next)
    }

    /// Phase that follows a successful step, `None` after `Recorded`.
    const fn next_step(self) -> Option<Self> {
        match self {
            Self::BeginMutation => Some(Self::AddsWritten),
            Self::AddsWritten => Some(Self::ModifiesMerged),
            Self::ModifiesMerged => Some(Self::FileOpsApplied),
            Self::FileOpsApplied => Some(Self::PostApplyRun),
            Self::PostApplyRun => Some(Self::Recorded),
            _ => None,
        }
    }
}

impl fmt::Display for ApplyPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locked => "locked",
            Self::Validated => "validated",
            Self::BeginMutation => "begin_mutation",
            Self::AddsWritten => "adds_written",
            Self::ModifiesMerged => "modifies_merged",
            Self::FileOpsApplied => "file_ops_applied",
            Self::PostApplyRun => "post_apply_run",
            Self::Recorded => "recorded",
            Self::Unlocked => "unlocked",
            Self::Failing => "failing",
        };
        f.write_str(name)
    }
}

/// Tracks the current phase and refuses illegal transitions.
#[derive(Debug)]
struct PhaseTracker {
    phase: ApplyPhase,
}

impl PhaseTracker {
    const fn new() -> Self {
        Self {
            phase: ApplyPhase::Idle,
        }
    }

    fn advance(&mut self, next: ApplyPhase) {
        debug_assert!(
            self.phase.can_transition_to(&next),
            "illegal apply transition {} -> {next}",
            self.phase
        );
        if !self.phase.can_transition_to(&next) {
            error!(from = %self.phase, to = %next, "illegal apply transition");
        }
        self.phase = next;
    }
}

// ---------------------------------------------------------------------------
// ApplyResult
// ---------------------------------------------------------------------------

/// Outcome of [`Project::apply_skill`].
#[derive(Debug, Serialize)]
pub struct ApplyResult {
    pub success: bool,
    pub skill: String,
    pub version: String,
    /// Files left with unresolved conflicts (each has a staged record).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub merge_conflicts: Vec<String>,
    /// Files whose conflicts were settled from the resolution cache.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolved_from_cache: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
    /// Step that failed (the phase being entered when the error occurred).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<ApplyPhase>,
    /// Whether the tree was restored from the backup.
    pub rolled_back: bool,
}

impl ApplyResult {
    fn new(skill: &str, version: &str) -> Self {
        Self {
            success: false,
            skill: skill.to_owned(),
            version: version.to_owned(),
            merge_conflicts: Vec::new(),
            resolved_from_cache: Vec::new(),
            warnings: Vec::new(),
            error: None,
            failed_phase: None,
            rolled_back: false,
        }
    }

    fn fail(mut self, phase: ApplyPhase, err: EngineError) -> Self {
        warn!(skill = %self.skill, phase = %phase, error = %err, "apply failed");
        self.failed_phase = Some(phase);
        self.error = Some(err);
        self
    }
}

// ---------------------------------------------------------------------------
// Shared skill steps (also used by rebase replay)
// ---------------------------------------------------------------------------

/// Paths and merge pipeline shared by the steps of one skill application.
pub(crate) struct SkillSteps<'a> {
    pub root: &'a Path,
    /// Directory holding the common ancestor of every modify.
    pub base_dir: &'a Path,
    pub remap: &'a BTreeMap<String, String>,
    pub files: FileMerger<'a>,
}

/// What the modify step produced.
#[derive(Debug, Default)]
pub(crate) struct ModifyReport {
    pub written: Vec<String>,
    pub conflicted: Vec<String>,
    pub conflict_count: usize,
    pub resolved_from_cache: Vec<String>,
    pub structured: StructuredOutcome,
}

impl SkillSteps<'_> {
    fn resolve(&self, rel: &str) -> String {
        resolve_path_remap(rel, self.remap)
    }

    fn target(&self, rel: &str) -> Result<(String, PathBuf), EngineError> {
        let rel = self.resolve(rel);
        let path = fs_util::contained_path(self.root, &rel).ok_or_else(|| EngineError::UnsafeFileOp {
            op: "write".to_owned(),
            detail: format!("path '{rel}' escapes the project root"),
        })?;
        Ok((rel, path))
    }

    /// Write every added file. Identical existing content is a no-op;
    /// different existing content is an [`EngineError::AddConflict`].
    pub fn write_adds(&self, package: &SkillPackage) -> Result<Vec<String>, EngineError> {
        let mut written = Vec::new();
        for rel in &package.manifest.adds {
            let source = package.add_source(rel);
            let content = std::fs::read(&source).map_err(|e| EngineError::Manifest {
                path: source.clone(),
                detail: format!("added file '{rel}' is missing from the package: {e}"),
            })?;
            let (rel, path) = self.target(rel)?;
            match fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))? {
                Some(existing) if existing == content => continue,
                Some(_) => return Err(EngineError::AddConflict { path: rel.into() }),
                None => {}
            }
            fs_util::write_file(&path, &content).map_err(|e| EngineError::io_at(e, &path))?;
            written.push(rel);
        }
        Ok(written)
    }

    /// Three-way merge every modified file, then apply the structured section.
    ///
    /// Conflicted files are reported, not written.
    pub fn merge_modifies(&self, package: &SkillPackage) -> Result<ModifyReport, EngineError> {
        let mut report = ModifyReport::default();
        for rel in &package.manifest.modifies {
            let source = package.modify_source(rel);
            let theirs = std::fs::read(&source).map_err(|e| EngineError::Manifest {
                path: source.clone(),
                detail: format!("modified file '{rel}' is missing from the package: {e}"),
            })?;
            let original = rel;
            let (rel, path) = self.target(rel)?;

            let Some(current) = fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))? else {
                fs_util::write_file(&path, &theirs).map_err(|e| EngineError::io_at(e, &path))?;
                report.written.push(rel);
                continue;
            };
            // The snapshot keeps pre-rename paths.
            let base_path = self.base_dir.join(original);
            let base = fs_util::read_optional(&base_path)
                .map_err(|e| EngineError::io_at(e, &base_path))?
                .unwrap_or_else(|| current.clone());

            let merged = self.files.merge_file(&rel, &base, &current, &theirs)?;
            match merged {
                FileMergeResult::Conflicted { conflicts, .. } => {
                    report.conflict_count += conflicts;
                    report.conflicted.push(rel);
                }
                other => {
                    if matches!(other, FileMergeResult::Resolved { .. }) {
                        report.resolved_from_cache.push(rel.clone());
                    }
                    fs_util::write_file(&path, other.content()).map_err(|e| EngineError::io_at(e, &path))?;
                    report.written.push(rel);
                }
            }
        }
        if !report.conflicted.is_empty() {
            return Ok(report);
        }
        report.structured = structured::apply_structured(self.root, &package.manifest.structured, self.remap)?;
        Ok(report)
    }

    /// Run the manifest's file operations with remapped sources.
    pub fn run_file_ops(&self, ops: &[FileOperation]) -> Result<FileOpsResult, EngineError> {
        let ops: Vec<FileOperation> = ops
            .iter()
            .map(|op| match op {
                FileOperation::Rename { from, to } => FileOperation::Rename {
                    from: self.resolve(from),
                    to: to.clone(),
                },
                FileOperation::Move { from, to } => FileOperation::Move {
                    from: self.resolve(from),
                    to: to.clone(),
                },
                FileOperation::Delete { path } => FileOperation::Delete {
                    path: self.resolve(path),
                },
            })
            .collect();
        execute_file_ops(&ops, self.root)
    }
}

/// Every project path an application of `package` may mutate, remapped.
pub(crate) fn backup_paths(package: &SkillPackage, remap: &BTreeMap<String, String>) -> Vec<String> {
    let mut paths: Vec<String> = package
        .manifest
        .touched_paths()
        .iter()
        .map(|p| resolve_path_remap(p, remap))
        .collect();
    // Rename/move targets are written verbatim, not remapped.
    for op in &package.manifest.file_ops {
        if let FileOperation::Rename { to, .. } | FileOperation::Move { to, .. } = op {
            paths.push(to.clone());
        }
    }
    paths.sort();
    paths.dedup();
    paths
}

/// Ledger entry for a finished application.
pub(crate) fn applied_entry(
    root: &Path,
    package: &SkillPackage,
    touched: Vec<String>,
) -> Result<AppliedSkill, EngineError> {
    let mut touched = touched;
    touched.sort();
    touched.dedup();
    let mut file_hashes = BTreeMap::new();
    for rel in &touched {
        let path = root.join(rel);
        if let Some(hash) = fs_util::hash_file(&path).map_err(|e| EngineError::io_at(e, &path))? {
            file_hashes.insert(rel.clone(), hash);
        }
    }
    Ok(AppliedSkill {
        name: package.manifest.name.clone(),
        version: package.manifest.version.clone(),
        applied_at: unix_now(),
        touched_files: touched,
        file_hashes,
    })
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Everything the mutating steps produced, for recording.
struct Mutation {
    touched: Vec<String>,
    remaps: Vec<(String, String)>,
}

impl Project {
    /// Apply the skill package at `package_dir`.
    ///
    /// Never panics and never returns `Err`: every failure is folded into the
    /// result, with the tree restored if mutation had begun.
    #[instrument(skip_all, fields(package = %package_dir.display()))]
    pub fn apply_skill(&self, package_dir: &Path) -> ApplyResult {
        let package = match SkillPackage::load(package_dir) {
            Ok(p) => p,
            Err(e) => {
                let name = package_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return ApplyResult::new(&name, "").fail(ApplyPhase::Idle, e);
            }
        };
        let manifest = &package.manifest;
        let result = ApplyResult::new(&manifest.name, &manifest.version);
        let mut tracker = PhaseTracker::new();

        if let Err(e) = self.ensure_idle() {
            return result.fail(ApplyPhase::Idle, e);
        }
        let lock = match self.lock() {
            Ok(guard) => guard,
            Err(e) => return result.fail(ApplyPhase::Locked, e),
        };
        tracker.advance(ApplyPhase::Locked);

        let mut ledger = match self.read_ledger() {
            Ok(l) => l,
            Err(e) => {
                tracker.advance(ApplyPhase::Unlocked);
                return result.fail(ApplyPhase::Validated, e);
            }
        };
        if let Err(e) = manifest::validate(manifest, &ledger) {
            tracker.advance(ApplyPhase::Unlocked);
            return result.fail(ApplyPhase::Validated, e);
        }
        tracker.advance(ApplyPhase::Validated);

        let backup = self.backup();
        if let Err(e) = backup.create(&backup_paths(&package, &ledger.path_remap)) {
            if let Err(clear) = backup.clear() {
                warn!(error = %clear, "could not remove partial backup");
            }
            tracker.advance(ApplyPhase::Unlocked);
            return result.fail(ApplyPhase::BeginMutation, e);
        }
        tracker.advance(ApplyPhase::BeginMutation);
        info!(skill = %manifest.name, version = %manifest.version, "applying skill");

        let mut result = result;
        match self.mutate(&package, &mut ledger, &mut tracker, &mut result) {
            Ok(()) => {
                tracker.advance(ApplyPhase::Unlocked);
                if let Err(e) = backup.clear() {
                    result.warnings.push(format!("could not remove backup: {e}"));
                }
                if let Err(e) = lock.release() {
                    result.warnings.push(format!("could not release lock: {e}"));
                }
                result.success = true;
                info!(skill = %result.skill, "skill applied");
                result
            }
            Err(e) => {
                let failed = tracker.phase.next_step().unwrap_or(tracker.phase);
                tracker.advance(ApplyPhase::Failing);
                result.rolled_back = rollback(&backup, &mut result.warnings);
                tracker.advance(ApplyPhase::Unlocked);
                drop(lock);
                result.fail(failed, e)
            }
        }
    }

    fn mutate(
        &self,
        package: &SkillPackage,
        ledger: &mut Ledger,
        tracker: &mut PhaseTracker,
        result: &mut ApplyResult,
    ) -> Result<(), EngineError> {
        let manifest = &package.manifest;
        let cache = self.resolution_cache().with_package(package.resolutions_dir());
        let stage = self.conflict_stage();
        let base_dir = self.layout().base_dir();
        let steps = SkillSteps {
            root: self.root(),
            base_dir: &base_dir,
            remap: &ledger.path_remap,
            files: self.file_merger(&cache, &stage, &manifest.name),
        };

        let mut mutation = Mutation {
            touched: steps.write_adds(package)?,
            remaps: Vec::new(),
        };
        tracker.advance(ApplyPhase::AddsWritten);

        let report = steps.merge_modifies(package)?;
        result.resolved_from_cache.clone_from(&report.resolved_from_cache);
        if !report.conflicted.is_empty() {
            result.merge_conflicts.clone_from(&report.conflicted);
            return Err(EngineError::MergeConflict {
                files: report.conflicted.iter().map(PathBuf::from).collect(),
                count: report.conflict_count,
            });
        }
        mutation.touched.extend(report.written);
        mutation.touched.extend(report.structured.written.iter().cloned());
        tracker.advance(ApplyPhase::ModifiesMerged);

        let ops = steps.run_file_ops(&manifest.file_ops)?;
        result.warnings.extend(ops.warnings.iter().cloned());
        for op in &ops.executed {
            match op {
                FileOperation::Rename { to, .. } | FileOperation::Move { to, .. } => {
                    mutation.touched.push(to.clone());
                }
                FileOperation::Delete { path } => mutation.touched.push(path.clone()),
            }
        }
        mutation.remaps = ops.remaps();
        tracker.advance(ApplyPhase::FileOpsApplied);

        if report.structured.dependencies_changed
            && let Some(install) = self.config().commands.install_command()
        {
            structured::run_install(self.runner(), install, self.root())?;
        }
        exec::run_all(self.runner(), &manifest.post_apply, self.root())?;
        tracker.advance(ApplyPhase::PostApplyRun);

        let entry = applied_entry(self.root(), package, mutation.touched)?;
        ledger.record_skill_application(entry);
        ledger.record_path_remap(mutation.remaps);
        self.write_ledger(ledger)?;
        tracker.advance(ApplyPhase::Recorded);
        Ok(())
    }
}

/// Restore and clear the backup; returns whether the restore succeeded.
pub(crate) fn rollback(backup: &crate::backup::BackupStore, warnings: &mut Vec<String>) -> bool {
    let restored = match backup.restore() {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "rollback failed; backup kept for manual recovery");
            warnings.push(format!("rollback failed: {e}; backup kept under .skillweave/backup/"));
            return false;
        }
    };
    if let Err(e) = backup.clear() {
        warnings.push(format!("could not remove backup: {e}"));
    }
    restored
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
