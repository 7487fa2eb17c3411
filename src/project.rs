//! The project handle.
//!
//! A [`Project`] owns everything rooted at one project directory: the
//! `.skillweave/` layout, the loaded configuration, and the two external
//! capabilities (merge primitive, command runner). Every engine operation is
//! a method on it; nothing depends on the process's current directory.

use std::path::Path;

use glob::{MatchOptions, Pattern};
use tracing::warn;
use walkdir::WalkDir;

use crate::backup::BackupStore;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::exec::{CommandRunner, ShellRunner};
use crate::fs_util;
use crate::layout::{Layout, STATE_DIR};
use crate::ledger::Ledger;
use crate::lock::{self, LockGuard};
use crate::merge::diff3::Diff3Merger;
use crate::merge::resolution::{ResolutionCache, ResolutionMeta};
use crate::merge::stage::{self, ConflictStage, StagedConflict};
use crate::merge::{FileMerger, MergeLabels, ThreeWayMerge};

/// An initialized skillweave project.
pub struct Project {
    layout: Layout,
    config: EngineConfig,
    merger: Box<dyn ThreeWayMerge>,
    runner: Box<dyn CommandRunner>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("root", &self.layout.root())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Project {
    /// Open the project at `root`.
    ///
    /// # Errors
    /// Returns [`EngineError::NotInitialized`] without a state directory, or
    /// [`EngineError::Config`] if `config.toml` is invalid.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, EngineError> {
        let layout = Layout::new(root.as_ref());
        if !layout.is_initialized() {
            return Err(EngineError::NotInitialized {
                root: root.as_ref().to_owned(),
            });
        }
        let config = EngineConfig::load(&layout.config_file())?;
        let merger = Box::new(Diff3Merger::new(config.merge.marker_size));
        let runner = Box::new(ShellRunner::new(config.commands.shell.clone()));
        Ok(Self {
            layout,
            config,
            merger,
            runner,
        })
    }

    /// Replace the merge primitive.
    #[must_use]
    pub fn with_merger(mut self, merger: Box<dyn ThreeWayMerge>) -> Self {
        self.merger = merger;
        self
    }

    /// Replace the command runner.
    #[must_use]
    pub fn with_runner(mut self, runner: Box<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    #[must_use]
    pub const fn layout(&self) -> &Layout {
        &self.layout
    }

    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    // -- state --

    /// Read the ledger.
    ///
    /// # Errors
    /// Returns [`EngineError::Ledger`] if it is missing or malformed.
    pub fn read_ledger(&self) -> Result<Ledger, EngineError> {
        Ledger::read(&self.layout.state_file())
    }

    pub(crate) fn write_ledger(&self, ledger: &Ledger) -> Result<(), EngineError> {
        ledger.write_atomic(&self.layout.state_file())
    }

    pub(crate) fn lock(&self) -> Result<LockGuard, EngineError> {
        lock::acquire(&self.layout.lock_file(), self.config.lock.reclaim_stale)
    }

    /// Is a mutating operation in progress?
    #[must_use]
    pub fn is_locked(&self) -> bool {
        lock::is_locked(&self.layout.lock_file())
    }

    pub(crate) fn backup(&self) -> BackupStore {
        BackupStore::new(&self.layout)
    }

    /// The project's resolution cache (shipped + user areas).
    #[must_use]
    pub fn resolution_cache(&self) -> ResolutionCache {
        ResolutionCache::new(&self.layout)
    }

    /// The project's conflict staging area.
    #[must_use]
    pub fn conflict_stage(&self) -> ConflictStage {
        ConflictStage::new(&self.layout)
    }

    pub(crate) fn file_merger<'a>(
        &'a self,
        cache: &'a ResolutionCache,
        stage: &'a ConflictStage,
        theirs_label: &str,
    ) -> FileMerger<'a> {
        FileMerger::new(
            self.merger.as_ref(),
            cache,
            stage,
            MergeLabels::new(self.config.merge.ours_label.clone(), theirs_label),
        )
    }

    /// Mutating operations wait while a customize session is open.
    pub(crate) fn ensure_idle(&self) -> Result<(), EngineError> {
        if crate::customize::session_active(&self.layout) {
            return Err(EngineError::CustomizeActive);
        }
        Ok(())
    }

    // -- tree --

    /// Every file of the working tree that belongs to the project, as sorted
    /// relative paths. `.skillweave/` and `[tracking] exclude` matches are
    /// skipped.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if the tree cannot be walked.
    pub fn tracked_files(&self) -> Result<Vec<String>, EngineError> {
        list_tracked(self.layout.root(), &self.config.tracking.exclude)
    }

    // -- resolutions --

    /// Conflicts waiting for a manual resolution.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if the staging area cannot be read.
    pub fn staged_conflicts(&self) -> Result<Vec<StagedConflict>, EngineError> {
        self.conflict_stage().list()
    }

    /// Record the edited `merged` file of staged conflict `fingerprint`.
    ///
    /// # Errors
    /// See [`stage::record_resolution`].
    pub fn record_resolution(&self, fingerprint: &str) -> Result<StagedConflict, EngineError> {
        stage::record_resolution(&self.conflict_stage(), &self.resolution_cache(), fingerprint)
    }

    /// Record every staged conflict whose `merged` file is free of markers.
    /// Conflicts that still have markers are skipped.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] on filesystem failure.
    pub fn record_all_resolutions(&self) -> Result<Vec<StagedConflict>, EngineError> {
        let mut recorded = Vec::new();
        for staged in self.staged_conflicts()? {
            match self.record_resolution(&staged.fingerprint) {
                Ok(meta) => recorded.push(meta),
                Err(EngineError::UnresolvedMarkers { .. }) => {
                    warn!(path = %staged.path, fingerprint = %staged.fingerprint, "still has conflict markers; skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recorded)
    }

    /// User-recorded resolutions.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if the cache cannot be read.
    pub fn user_resolutions(&self) -> Result<Vec<ResolutionMeta>, EngineError> {
        self.resolution_cache().list_user()
    }

    /// Forget every user-recorded resolution.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] on failure.
    pub fn clear_user_resolutions(&self) -> Result<(), EngineError> {
        self.resolution_cache().clear_user()
    }
}

/// Walk `root` for project files, skipping the state dir and `exclude` globs.
pub(crate) fn list_tracked(root: &Path, exclude: &[String]) -> Result<Vec<String>, EngineError> {
    let patterns: Vec<Pattern> = exclude
        .iter()
        .filter_map(|p| match Pattern::new(p) {
            Ok(pattern) => Some(pattern),
            Err(e) => {
                warn!(pattern = %p, error = %e, "ignoring invalid exclude pattern");
                None
            }
        })
        .collect();
    let opts = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };
    let excluded = |rel: &str, is_dir: bool| {
        let candidate = if is_dir { format!("{rel}/_") } else { rel.to_owned() };
        patterns.iter().any(|p| p.matches_with(&candidate, opts) || p.matches_with(rel, opts))
    };

    let mut files = Vec::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
        let Ok(rel) = entry.path().strip_prefix(root) else {
            return false;
        };
        let rel = fs_util::rel_key(rel);
        rel.is_empty() || (rel != STATE_DIR && !excluded(&rel, entry.file_type().is_dir()))
    });
    for entry in walker {
        let entry = entry.map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        if entry.file_type().is_file()
            && let Ok(rel) = entry.path().strip_prefix(root)
        {
            files.push(fs_util::rel_key(rel));
        }
    }
    files.sort();
    Ok(files)
}
