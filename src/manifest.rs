//! Skill package manifests and the pre-mutation version gates.
//!
//! A skill package is a directory with a `manifest.toml`, an `add/` tree for
//! new files and a `modify/` tree holding the skill's version of each file it
//! changes. Every check in this module is a pure function of the manifest and
//! the ledger, and runs before anything on disk is touched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};
use serde::Deserialize;
use tracing::warn;

use crate::error::EngineError;
use crate::layout::{MANIFEST_FILE, PACKAGE_ADD_DIR, PACKAGE_MODIFY_DIR};
use crate::ledger::{ENGINE_VERSION, Ledger};
use crate::structured::{COMPOSE_FILE, ENV_EXAMPLE_FILE, PACKAGE_JSON_FILE};

// ---------------------------------------------------------------------------
// Manifest types
// ---------------------------------------------------------------------------

/// Parsed `manifest.toml` of a skill package.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillManifest {
    /// Skill name (unique within a project).
    pub name: String,

    /// Skill version.
    pub version: String,

    /// Core version the skill was written against: a bare version
    /// (`1.2.0`) or a semver range (`>=1.2, <2`).
    pub core_version: String,

    /// Oldest engine able to apply this package.
    #[serde(default = "default_min_engine_version")]
    pub min_engine_version: String,

    /// Files the skill adds (shipped under `add/`).
    #[serde(default)]
    pub adds: Vec<String>,

    /// Files the skill modifies (shipped under `modify/`).
    #[serde(default)]
    pub modifies: Vec<String>,

    /// Skills that must already be applied.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Skills that cannot coexist with this one.
    #[serde(default)]
    pub conflicts: Vec<String>,

    /// Shell commands run after the files are in place.
    #[serde(default)]
    pub post_apply: Vec<String>,

    /// Rename/move/delete operations.
    #[serde(default)]
    pub file_ops: Vec<FileOperation>,

    /// Field-level additions to machine-readable config files.
    #[serde(default)]
    pub structured: StructuredSection,
}

fn default_min_engine_version() -> String {
    "0.0.0".to_owned()
}

/// One rename, move or delete.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileOperation {
    Rename { from: String, to: String },
    Move { from: String, to: String },
    Delete { path: String },
}

impl FileOperation {
    /// Operation name as written in the manifest.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Rename { .. } => "rename",
            Self::Move { .. } => "move",
            Self::Delete { .. } => "delete",
        }
    }

    /// Every project path the operation reads or writes.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::Rename { from, to } | Self::Move { from, to } => vec![from, to],
            Self::Delete { path } => vec![path],
        }
    }
}

/// `[structured]` section of a manifest.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StructuredSection {
    /// npm dependencies to add: package name → version range.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,

    /// Keys to append to `.env.example`.
    #[serde(default)]
    pub env_additions: Vec<String>,

    /// Compose services to add, keyed by service name.
    #[serde(default)]
    pub compose_services: BTreeMap<String, toml::Value>,
}

impl StructuredSection {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty() && self.env_additions.is_empty() && self.compose_services.is_empty()
    }

    /// Project files the section will touch.
    #[must_use]
    pub fn targets(&self) -> Vec<&'static str> {
        let mut targets = Vec::new();
        if !self.dependencies.is_empty() {
            targets.push(PACKAGE_JSON_FILE);
        }
        if !self.env_additions.is_empty() {
            targets.push(ENV_EXAMPLE_FILE);
        }
        if !self.compose_services.is_empty() {
            targets.push(COMPOSE_FILE);
        }
        targets
    }
}

impl SkillManifest {
    /// Every project path an application of this skill may mutate, deduplicated
    /// in first-seen order.
    #[must_use]
    pub fn touched_paths(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |p: &str| {
            if !out.iter().any(|e| e == p) {
                out.push(p.to_owned());
            }
        };
        self.adds.iter().for_each(|p| push(p));
        self.modifies.iter().for_each(|p| push(p));
        for op in &self.file_ops {
            op.paths().into_iter().for_each(&mut push);
        }
        self.structured.targets().into_iter().for_each(&mut push);
        out
    }
}

// ---------------------------------------------------------------------------
// Package handle
// ---------------------------------------------------------------------------

/// A skill package on disk.
#[derive(Clone, Debug)]
pub struct SkillPackage {
    /// Package directory.
    pub dir: PathBuf,
    /// Parsed manifest.
    pub manifest: SkillManifest,
}

impl SkillPackage {
    /// Load the package at `dir`.
    ///
    /// # Errors
    /// Returns [`EngineError::Manifest`] if the manifest is missing or invalid.
    pub fn load(dir: &Path) -> Result<Self, EngineError> {
        Ok(Self {
            dir: dir.to_owned(),
            manifest: read_manifest(dir)?,
        })
    }

    /// Shipped content of an added path.
    #[must_use]
    pub fn add_source(&self, rel: &str) -> PathBuf {
        self.dir.join(PACKAGE_ADD_DIR).join(rel)
    }

    /// Shipped content of a modified path.
    #[must_use]
    pub fn modify_source(&self, rel: &str) -> PathBuf {
        self.dir.join(PACKAGE_MODIFY_DIR).join(rel)
    }

    /// Shipped resolution cache directory.
    #[must_use]
    pub fn resolutions_dir(&self) -> PathBuf {
        self.dir.join(crate::layout::RESOLUTIONS_DIR)
    }
}

/// Read and sanity-check `<package_dir>/manifest.toml`.
///
/// # Errors
/// Returns [`EngineError::Manifest`] on I/O, parse or validation failure.
pub fn read_manifest(package_dir: &Path) -> Result<SkillManifest, EngineError> {
    let path = package_dir.join(MANIFEST_FILE);
    let contents = std::fs::read_to_string(&path).map_err(|e| EngineError::Manifest {
        path: path.clone(),
        detail: format!("could not read file: {e}"),
    })?;
    let manifest: SkillManifest = toml::from_str(&contents).map_err(|e| EngineError::Manifest {
        path: path.clone(),
        detail: e.message().to_owned(),
    })?;

    let invalid = |detail: String| EngineError::Manifest {
        path: path.clone(),
        detail,
    };
    if manifest.name.trim().is_empty() {
        return Err(invalid("`name` must not be empty".to_owned()));
    }
    if manifest.version.trim().is_empty() {
        return Err(invalid("`version` must not be empty".to_owned()));
    }
    for rel in manifest.adds.iter().chain(&manifest.modifies) {
        if crate::fs_util::contained_path(Path::new("/"), rel).is_none() {
            return Err(invalid(format!("path '{rel}' escapes the project root")));
        }
    }
    if let Some(dup) = manifest.adds.iter().find(|a| manifest.modifies.contains(a)) {
        return Err(invalid(format!("'{dup}' is listed in both adds and modifies")));
    }
    Ok(manifest)
}

// ---------------------------------------------------------------------------
// Version helpers
// ---------------------------------------------------------------------------

/// Parse a version, padding missing minor/patch components (`1.2` → `1.2.0`).
#[must_use]
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.parse::<u64>().is_err()) {
        return None;
    }
    let mut padded = parts.join(".");
    for _ in parts.len()..3 {
        padded.push_str(".0");
    }
    Version::parse(&padded).ok()
}

/// Compare two version strings with semver ordering.
///
/// Unparseable versions fall back to string comparison.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    match (parse_version(a), parse_version(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Does `current` satisfy the core requirement `required`?
///
/// A bare version is met by an exact match or any newer core; a range is met
/// by containment.
#[must_use]
pub fn core_version_satisfied(required: &str, current: &str) -> bool {
    if let Some(req) = parse_version(required) {
        return parse_version(current).is_some_and(|cur| cur >= req);
    }
    match (VersionReq::parse(required), parse_version(current)) {
        (Ok(req), Some(cur)) => req.matches(&cur),
        _ => required.trim() == current.trim(),
    }
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// The package must not need a newer engine than this build.
///
/// # Errors
/// Returns [`EngineError::SystemVersion`] naming the required version.
pub fn check_engine_version(manifest: &SkillManifest) -> Result<(), EngineError> {
    if compare_versions(&manifest.min_engine_version, ENGINE_VERSION).is_gt() {
        return Err(EngineError::SystemVersion {
            required: manifest.min_engine_version.clone(),
            current: ENGINE_VERSION.to_owned(),
        });
    }
    Ok(())
}

/// The project core must satisfy the package's core requirement.
///
/// # Errors
/// Returns [`EngineError::CoreVersion`] when it does not.
pub fn check_core_version(manifest: &SkillManifest, ledger: &Ledger) -> Result<(), EngineError> {
    if !core_version_satisfied(&manifest.core_version, &ledger.core_version) {
        return Err(EngineError::CoreVersion {
            required: manifest.core_version.clone(),
            current: ledger.core_version.clone(),
        });
    }
    if parse_version(&manifest.core_version)
        .zip(parse_version(&ledger.core_version))
        .is_some_and(|(req, cur)| req != cur)
    {
        warn!(
            skill = %manifest.name,
            required = %manifest.core_version,
            current = %ledger.core_version,
            "skill was written for an older core; applying anyway"
        );
    }
    Ok(())
}

/// Every `depends` entry must already be applied.
///
/// # Errors
/// Returns [`EngineError::UnmetDependencies`] listing the missing skills.
pub fn check_dependencies(manifest: &SkillManifest, ledger: &Ledger) -> Result<(), EngineError> {
    let missing: Vec<String> = manifest
        .depends
        .iter()
        .filter(|dep| ledger.find_applied(dep).is_none())
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(EngineError::UnmetDependencies {
            skill: manifest.name.clone(),
            missing,
        })
    }
}

/// No declared conflict may be applied.
///
/// # Errors
/// Returns [`EngineError::SkillConflict`] listing the clashing skills.
pub fn check_conflicts(manifest: &SkillManifest, ledger: &Ledger) -> Result<(), EngineError> {
    let conflicting: Vec<String> = manifest
        .conflicts
        .iter()
        .filter(|c| ledger.find_applied(c).is_some())
        .cloned()
        .collect();
    if conflicting.is_empty() {
        Ok(())
    } else {
        Err(EngineError::SkillConflict {
            skill: manifest.name.clone(),
            conflicting,
        })
    }
}

/// The skill must not already be in the ledger.
///
/// # Errors
/// Returns [`EngineError::AlreadyApplied`].
pub fn check_not_applied(manifest: &SkillManifest, ledger: &Ledger) -> Result<(), EngineError> {
    match ledger.find_applied(&manifest.name) {
        Some(existing) => Err(EngineError::AlreadyApplied {
            name: existing.name.clone(),
            version: existing.version.clone(),
        }),
        None => Ok(()),
    }
}

/// Run every gate in order; the first failure wins.
///
/// # Errors
/// Returns the first failing gate's error.
pub fn validate(manifest: &SkillManifest, ledger: &Ledger) -> Result<(), EngineError> {
    check_engine_version(manifest)?;
    check_not_applied(manifest, ledger)?;
    check_core_version(manifest, ledger)?;
    check_dependencies(manifest, ledger)?;
    check_conflicts(manifest, ledger)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
