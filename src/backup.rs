//! Backup store: pre-mutation snapshot used for rollback.
//!
//! Before the first mutation every path an operation may touch is mirrored
//! into `.skillweave/backup/`, either as a byte copy or, for a path that did
//! not exist, as a `<path>.tombstone` marker. Restoring rewrites copies and
//! deletes tombstoned paths, so files the operation created disappear again.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::fs_util::{self, contained_path};
use crate::layout::Layout;

/// Suffix of tombstone markers.
pub const TOMBSTONE_SUFFIX: &str = ".tombstone";

/// Tombstone marker content. A backed-up project file that happens to end
/// in `.tombstone` is only treated as a marker if it holds exactly this.
const TOMBSTONE_CONTENT: &[u8] = b"skillweave: path did not exist before this operation\n";

/// Backup set of one project.
#[derive(Clone, Debug)]
pub struct BackupStore {
    root: PathBuf,
    dir: PathBuf,
}

impl BackupStore {
    #[must_use]
    pub fn new(layout: &Layout) -> Self {
        Self {
            root: layout.root().to_owned(),
            dir: layout.backup_dir(),
        }
    }

    /// Does a backup set exist?
    #[must_use]
    pub fn exists(&self) -> bool {
        self.dir.exists()
    }

    /// Snapshot `paths` (project-relative). A leftover set is cleared first.
    ///
    /// # Errors
    /// Returns [`EngineError::UnsafeFileOp`] for a path outside the project,
    /// or [`EngineError::Io`] on copy failure.
    pub fn create<S: AsRef<str>>(&self, paths: &[S]) -> Result<(), EngineError> {
        if self.exists() {
            warn!(dir = %self.dir.display(), "clearing stale backup set");
            self.clear()?;
        }
        fs::create_dir_all(&self.dir).map_err(|e| EngineError::io_at(e, &self.dir))?;

        let mut seen = std::collections::BTreeSet::new();
        for rel in paths {
            let rel = rel.as_ref();
            if !seen.insert(rel.to_owned()) {
                continue;
            }
            let src = contained_path(&self.root, rel).ok_or_else(|| EngineError::UnsafeFileOp {
                op: "backup".to_owned(),
                detail: format!("path '{rel}' escapes the project root"),
            })?;
            let backup = self.dir.join(rel);
            if src.is_file() {
                if let Some(parent) = backup.parent() {
                    fs::create_dir_all(parent).map_err(|e| EngineError::io_at(e, parent))?;
                }
                fs::copy(&src, &backup).map_err(|e| EngineError::io_at(e, &src))?;
            } else if !src.exists() {
                let marker = tombstone_path(&backup);
                fs_util::write_file(&marker, TOMBSTONE_CONTENT)
                    .map_err(|e| EngineError::io_at(e, &marker))?;
            }
        }
        debug!(count = seen.len(), "backup created");
        Ok(())
    }

    /// Put every backed-up path back to its pre-operation state.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] on failure.
    pub fn restore(&self) -> Result<(), EngineError> {
        let entries = fs_util::list_files(&self.dir).map_err(|e| EngineError::io_at(e, &self.dir))?;
        for rel in entries {
            let stored = self.dir.join(&rel);
            if let Some(original) = rel.strip_suffix(TOMBSTONE_SUFFIX)
                && fs::read(&stored).is_ok_and(|b| b == TOMBSTONE_CONTENT)
            {
                let target = self.root.join(original);
                let removed = if target.is_dir() {
                    fs_util::remove_dir_if_exists(&target)
                } else {
                    fs_util::remove_file_if_exists(&target).map(|_| ())
                };
                removed.map_err(|e| EngineError::io_at(e, &target))?;
                fs_util::prune_empty_parents(&target, &self.root);
                continue;
            }
            let target = self.root.join(&rel);
            let bytes = fs::read(&stored).map_err(|e| EngineError::io_at(e, &stored))?;
            fs_util::write_file(&target, &bytes).map_err(|e| EngineError::io_at(e, &target))?;
        }
        debug!("backup restored");
        Ok(())
    }

    /// Delete the backup set.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] on failure.
    pub fn clear(&self) -> Result<(), EngineError> {
        fs_util::remove_dir_if_exists(&self.dir).map_err(|e| EngineError::io_at(e, &self.dir))
    }
}

fn tombstone_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TOMBSTONE_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, BackupStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(&Layout::new(dir.path()));
        (dir, store)
    }

    #[test]
    fn restore_rewrites_modified_files() {
        let (dir, store) = setup();
        let file = dir.path().join("src/index.ts");
        fs_util::write_file(&file, b"original").unwrap();

        store.create(&["src/index.ts"]).unwrap();
        fs::write(&file, b"changed").unwrap();
        store.restore().unwrap();

        assert_eq!(fs::read(&file).unwrap(), b"original");
    }

    #[test]
    fn restore_removes_files_that_did_not_exist() {
        let (dir, store) = setup();
        store.create(&["src/new/added.ts"]).unwrap();
        fs_util::write_file(&dir.path().join("src/new/added.ts"), b"new").unwrap();

        store.restore().unwrap();

        assert!(!dir.path().join("src/new/added.ts").exists());
        assert!(!dir.path().join("src/new").exists());
    }

    #[test]
    fn nonexistent_path_stays_nonexistent() {
        let (dir, store) = setup();
        store.create(&["ghost.ts"]).unwrap();
        store.restore().unwrap();
        assert!(!dir.path().join("ghost.ts").exists());
    }

    #[test]
    fn restore_recreates_deleted_files() {
        let (dir, store) = setup();
        let file = dir.path().join("a/b.ts");
        fs_util::write_file(&file, b"keep").unwrap();
        store.create(&["a/b.ts"]).unwrap();
        fs::remove_file(&file).unwrap();

        store.restore().unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"keep");
    }

    #[test]
    fn clear_removes_set_and_create_clears_stale() {
        let (dir, store) = setup();
        fs_util::write_file(&dir.path().join("x.ts"), b"x").unwrap();
        store.create(&["x.ts"]).unwrap();
        assert!(store.exists());

        // A second create drops the previous set's entries.
        store.create(&["y.ts"]).unwrap();
        let entries = fs_util::list_files(&dir.path().join(".skillweave/backup")).unwrap();
        assert_eq!(entries, vec!["y.ts.tombstone"]);

        store.clear().unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn escaping_path_rejected() {
        let (_dir, store) = setup();
        let err = store.create(&["../outside"]).unwrap_err();
        assert!(matches!(err, EngineError::UnsafeFileOp { .. }));
    }

    #[test]
    fn real_tombstone_named_file_is_restored_as_file() {
        let (dir, store) = setup();
        let file = dir.path().join("notes.tombstone");
        fs_util::write_file(&file, b"user data").unwrap();
        store.create(&["notes.tombstone"]).unwrap();
        fs::write(&file, b"clobbered").unwrap();

        store.restore().unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"user data");
    }
}
