//! The ledger: persisted version and history state for one project.
//!
//! Persisted to `.skillweave/state.json` as human-readable JSON. Every write
//! is atomic (write-to-temp + fsync + rename) so a crash never corrupts the
//! file.
//!
//! `applied_skills` and `custom_patches` are append-only arenas: entries are
//! addressed by index and never modified once written, which is what keeps
//! rebase/replay deterministic. Uninstall is the one operation that drops an
//! applied skill, after the tree has been rebuilt without it.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Ledger document schema version.
pub const LEDGER_SCHEMA_VERSION: &str = "1.0";

/// Version of this engine, compared against `min_engine_version` in manifests.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current Unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// One successful skill application.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSkill {
    /// Skill name.
    pub name: String,
    /// Skill version.
    pub version: String,
    /// Unix timestamp (seconds) of the application.
    pub applied_at: u64,
    /// Project-relative paths the application touched.
    #[serde(default)]
    pub touched_files: Vec<String>,
    /// Content hash of each touched file that existed after the apply.
    #[serde(default)]
    pub file_hashes: BTreeMap<String, String>,
}

/// A file the user changed outside the engine, captured by customize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomModification {
    /// Content hash at the time of recording (`None` if the file was deleted).
    pub hash: Option<String>,
    /// Unix timestamp (seconds) of the recording.
    pub recorded_at: u64,
    /// Id of the custom patch that carries the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

/// A committed customize session.
///
/// Content lives under `.skillweave/custom/<id>/{before,after}/`; a file
/// missing from `after/` was deleted during the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomPatch {
    /// Stable id (`<sequence>-<slug>`).
    pub id: String,
    /// Free-text description given when the session started.
    pub description: String,
    /// Unix timestamp (seconds) of the commit.
    pub recorded_at: u64,
    /// Files changed by the session.
    pub files: Vec<String>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The persisted ledger document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// Ledger schema version.
    pub schema_version: String,

    /// Core version the base snapshot reflects.
    pub core_version: String,

    #[serde(default)]
    applied_skills: Vec<AppliedSkill>,

    /// Locally customized files.
    #[serde(default)]
    pub custom_modifications: BTreeMap<String, CustomModification>,

    #[serde(default)]
    custom_patches: Vec<CustomPatch>,

    /// Historical path → current path.
    #[serde(default)]
    pub path_remap: BTreeMap<String, String>,

    /// Unix timestamp of the last successful rebase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rebased_at: Option<u64>,
}

impl Ledger {
    /// A fresh ledger at `core_version` with no history.
    #[must_use]
    pub fn new(core_version: impl Into<String>) -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION.to_owned(),
            core_version: core_version.into(),
            applied_skills: Vec::new(),
            custom_modifications: BTreeMap::new(),
            custom_patches: Vec::new(),
            path_remap: BTreeMap::new(),
            last_rebased_at: None,
        }
    }

    // -- history arena --

    /// Applied skills in application order.
    #[must_use]
    pub fn applied_skills(&self) -> &[AppliedSkill] {
        &self.applied_skills
    }

    /// Applied skill at `index` in application order.
    #[must_use]
    pub fn applied_skill(&self, index: usize) -> Option<&AppliedSkill> {
        self.applied_skills.get(index)
    }

    /// Append an applied skill. History is never rewritten.
    pub fn record_skill_application(&mut self, entry: AppliedSkill) {
        self.applied_skills.push(entry);
    }

    /// Drop the applied entry for `name`, keeping the order of the rest.
    pub fn remove_applied_skill(&mut self, name: &str) -> Option<AppliedSkill> {
        let index = self.applied_skills.iter().position(|s| s.name == name)?;
        Some(self.applied_skills.remove(index))
    }

    /// Returns the applied entry for `name`, if any.
    #[must_use]
    pub fn find_applied(&self, name: &str) -> Option<&AppliedSkill> {
        self.applied_skills.iter().find(|s| s.name == name)
    }

    /// Committed customization patches in commit order.
    #[must_use]
    pub fn custom_patches(&self) -> &[CustomPatch] {
        &self.custom_patches
    }

    /// Append a customization patch and mark each of its files customized.
    pub fn record_custom_patch(
        &mut self,
        patch: CustomPatch,
        hashes: &BTreeMap<String, Option<String>>,
    ) {
        for file in &patch.files {
            let hash = hashes.get(file).cloned().flatten();
            self.record_custom_modification(file, hash, patch.recorded_at, Some(patch.id.clone()));
        }
        self.custom_patches.push(patch);
    }

    /// Record (or refresh) a customized file.
    pub fn record_custom_modification(
        &mut self,
        path: &str,
        hash: Option<String>,
        now: u64,
        patch: Option<String>,
    ) {
        self.custom_modifications.insert(
            path.to_owned(),
            CustomModification {
                hash,
                recorded_at: now,
                patch,
            },
        );
    }

    // -- path remap --

    /// Resolve a historical path through the remap table.
    #[must_use]
    pub fn resolve_path(&self, rel: &str) -> String {
        crate::path_remap::resolve_path_remap(rel, &self.path_remap)
    }

    /// Merge `remaps` into the table; an existing key is overwritten.
    pub fn record_path_remap<I>(&mut self, remaps: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.path_remap.extend(remaps);
    }

    // -- persistence --

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    /// Returns [`EngineError::Ledger`] on serialization failure.
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self).map_err(|e| EngineError::Ledger {
            path: std::path::PathBuf::new(),
            detail: format!("serialize: {e}"),
        })
    }

    /// Deserialize from a JSON string.
    ///
    /// # Errors
    /// Returns [`EngineError::Ledger`] on parse failure.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Ledger {
            path: std::path::PathBuf::new(),
            detail: format!("parse: {e}"),
        })
    }

    /// Read the ledger from disk.
    ///
    /// # Errors
    /// Returns [`EngineError::Ledger`] if the file is missing or malformed.
    pub fn read(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path).map_err(|e| EngineError::Ledger {
            path: path.to_owned(),
            detail: if e.kind() == std::io::ErrorKind::NotFound {
                "ledger not found; run `skillweave init`".to_owned()
            } else {
                format!("read: {e}")
            },
        })?;
        Self::from_json(&contents).map_err(|e| match e {
            EngineError::Ledger { detail, .. } => EngineError::Ledger {
                path: path.to_owned(),
                detail,
            },
            other => other,
        })
    }

    /// Write the ledger atomically with fsync.
    ///
    /// # Errors
    /// Returns [`EngineError`] on I/O or serialization failure.
    pub fn write_atomic(&self, path: &Path) -> Result<(), EngineError> {
        let json = self.to_json()?;
        crate::fs_util::write_atomic(path, json.as_bytes())
            .map_err(|e| EngineError::io_at(e, path))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
