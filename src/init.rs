//! Project initialization and migration.
//!
//! `init_project` creates `.skillweave/`, snapshots the base and writes a
//! fresh ledger. With a pristine core the base comes from that tree, and any
//! difference between it and the project as found is recorded as an initial
//! custom patch, so existing hand edits survive later rebases.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::EngineConfig;
use crate::customize::{FileChange, write_patch};
use crate::error::EngineError;
use crate::fs_util;
use crate::layout::{self, Layout};
use crate::ledger::{CustomPatch, Ledger};
use crate::lock;
use crate::update::{core_files, read_core_version};

/// Core version used when none is given and no `core.toml` exists.
pub const DEFAULT_CORE_VERSION: &str = "0.0.0";

const MIGRATION_DESCRIPTION: &str = "migrate pre-existing changes";

/// Options for [`init_project`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitOptions {
    /// Core version to record. Defaults to the `core.toml` version of the
    /// pristine core (or the project), else [`DEFAULT_CORE_VERSION`].
    pub core_version: Option<String>,
    /// Unmodified core tree to snapshot as the base. Without one the
    /// project's current tree becomes the base.
    pub pristine_core: Option<PathBuf>,
}

/// What [`init_project`] did.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub core_version: String,
    /// Number of files in the base snapshot.
    pub base_files: usize,
    /// Patch recording differences from the pristine core, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migrated: Option<CustomPatch>,
}

/// Initialize the project at `root`.
///
/// # Errors
/// Returns [`EngineError::AlreadyInitialized`] if a ledger exists,
/// [`EngineError::Config`] for an invalid existing config, or
/// [`EngineError::Io`] on filesystem failure.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn init_project(root: &Path, options: &InitOptions) -> Result<InitReport, EngineError> {
    if !root.is_dir() {
        return Err(EngineError::io_at(
            std::io::Error::new(std::io::ErrorKind::NotFound, "project root is not a directory"),
            root,
        ));
    }
    let layout = Layout::new(root);
    if layout.state_file().exists() {
        return Err(EngineError::AlreadyInitialized { root: root.to_owned() });
    }
    let config = EngineConfig::load(&layout.config_file())?;
    let exclude = &config.tracking.exclude;

    // Snapshot before the state dir exists: init edits `.gitignore`.
    let source = options.pristine_core.as_deref().unwrap_or(root);
    let base_files = core_files(source, exclude)?;
    let mut snapshot = Vec::with_capacity(base_files.len());
    for rel in &base_files {
        let from = source.join(rel);
        let bytes = std::fs::read(&from).map_err(|e| EngineError::io_at(e, &from))?;
        snapshot.push((rel, bytes));
    }

    layout::init_state_dir(&layout).map_err(|e| EngineError::io_at(e, &layout.state_dir()))?;
    let guard = lock::acquire(&layout.lock_file(), config.lock.reclaim_stale)?;

    let core_version = match &options.core_version {
        Some(v) => v.clone(),
        None => read_core_version(source)?.unwrap_or_else(|| {
            warn!("no core version given and no core.toml found; using {DEFAULT_CORE_VERSION}");
            DEFAULT_CORE_VERSION.to_owned()
        }),
    };

    let base_dir = layout.base_dir();
    fs_util::remove_dir_if_exists(&base_dir).map_err(|e| EngineError::io_at(e, &base_dir))?;
    std::fs::create_dir_all(&base_dir).map_err(|e| EngineError::io_at(e, &base_dir))?;
    for (rel, bytes) in &snapshot {
        let to = layout.base_path(rel);
        fs_util::write_file(&to, bytes).map_err(|e| EngineError::io_at(e, &to))?;
    }

    let mut ledger = Ledger::new(core_version.clone());
    let mut migrated = None;
    if let Some(pristine) = &options.pristine_core {
        let changes = local_changes(pristine, root, &base_files, &core_files(root, exclude)?)?;
        if !changes.is_empty() {
            let patch = write_patch(&layout, &ledger, MIGRATION_DESCRIPTION, &changes)?;
            let hashes: BTreeMap<String, Option<String>> = changes
                .iter()
                .map(|c| (c.path.clone(), c.after.as_deref().map(fs_util::hash_bytes)))
                .collect();
            ledger.record_custom_patch(patch.clone(), &hashes);
            info!(files = patch.files.len(), "recorded pre-existing changes");
            migrated = Some(patch);
        }
    }
    ledger.write_atomic(&layout.state_file())?;
    guard.release()?;

    info!(version = %core_version, files = base_files.len(), "project initialized");
    Ok(InitReport {
        core_version,
        base_files: base_files.len(),
        migrated,
    })
}

/// Files whose content in `project` differs from `pristine`.
fn local_changes(
    pristine: &Path,
    project: &Path,
    pristine_files: &[String],
    project_files: &[String],
) -> Result<Vec<FileChange>, EngineError> {
    let all: BTreeSet<&String> = pristine_files.iter().chain(project_files).collect();
    let mut changes = Vec::new();
    for rel in all {
        let read = |dir: &Path| {
            let path = dir.join(rel);
            fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))
        };
        let before = read(pristine)?;
        let after = read(project)?;
        if before != after {
            changes.push(FileChange {
                path: rel.clone(),
                before,
                after,
            });
        }
    }
    Ok(changes)
}
