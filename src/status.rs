//! Read-only project summary.

use serde::Serialize;

use crate::customize::read_session;
use crate::error::EngineError;
use crate::lock::{LockInfo, read_lock_info};
use crate::merge::stage::StagedConflict;
use crate::project::Project;

/// One applied skill as shown by status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkillSummary {
    pub name: String,
    pub version: String,
    pub applied_at: u64,
    pub touched_files: usize,
}

/// Snapshot of a project's engine state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProjectStatus {
    pub core_version: String,
    pub applied_skills: Vec<SkillSummary>,
    /// Paths recorded as local customizations.
    pub custom_paths: Vec<String>,
    /// Committed custom patch ids, in order.
    pub custom_patches: Vec<String>,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<LockInfo>,
    pub customize_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customize_description: Option<String>,
    pub staged_conflicts: Vec<StagedConflict>,
    /// A backup set outlived its operation (a crash mid-mutation).
    pub stale_backup: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rebased_at: Option<u64>,
}

impl Project {
    /// Summarize the project.
    ///
    /// # Errors
    /// Returns [`EngineError::Ledger`] if the ledger cannot be read.
    pub fn status(&self) -> Result<ProjectStatus, EngineError> {
        let ledger = self.read_ledger()?;
        let locked = self.is_locked();
        let session = read_session(self.layout())?;

        Ok(ProjectStatus {
            core_version: ledger.core_version.clone(),
            applied_skills: ledger
                .applied_skills()
                .iter()
                .map(|s| SkillSummary {
                    name: s.name.clone(),
                    version: s.version.clone(),
                    applied_at: s.applied_at,
                    touched_files: s.touched_files.len(),
                })
                .collect(),
            custom_paths: ledger.custom_modifications.keys().cloned().collect(),
            custom_patches: ledger.custom_patches().iter().map(|p| p.id.clone()).collect(),
            locked,
            lock_holder: if locked { read_lock_info(&self.layout().lock_file()) } else { None },
            customize_active: session.is_some(),
            customize_description: session.map(|s| s.description),
            staged_conflicts: self.staged_conflicts()?,
            stale_backup: !locked && self.backup().exists(),
            last_rebased_at: ledger.last_rebased_at,
        })
    }
}
