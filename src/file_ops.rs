//! Rename, move and delete operations declared by skill manifests.
//!
//! Operations run in order. The first invalid one aborts the batch with
//! [`EngineError::UnsafeFileOp`]; earlier operations are left applied (the
//! caller's backup covers them). Every path is resolved lexically against the
//! project root and anything that escapes it is rejected.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::EngineError;
use crate::fs_util::contained_path;
use crate::manifest::FileOperation;

/// Outcome of a batch of file operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileOpsResult {
    /// Operations that ran (including deletes of already-missing files).
    pub executed: Vec<FileOperation>,
    /// Non-fatal notes, e.g. a delete whose target was already gone.
    pub warnings: Vec<String>,
}

impl FileOpsResult {
    /// `from → to` pairs of executed renames and moves.
    #[must_use]
    pub fn remaps(&self) -> Vec<(String, String)> {
        self.executed
            .iter()
            .filter_map(|op| match op {
                FileOperation::Rename { from, to } | FileOperation::Move { from, to } => {
                    Some((from.clone(), to.clone()))
                }
                FileOperation::Delete { .. } => None,
            })
            .collect()
    }
}

fn unsafe_op(op: &FileOperation, detail: String) -> EngineError {
    EngineError::UnsafeFileOp {
        op: op.kind().to_owned(),
        detail,
    }
}

fn resolve(root: &Path, op: &FileOperation, rel: &str) -> Result<PathBuf, EngineError> {
    contained_path(root, rel).ok_or_else(|| unsafe_op(op, format!("path escapes project root: {rel}")))
}

/// Execute `ops` against the project at `root`.
///
/// # Errors
/// Returns [`EngineError::UnsafeFileOp`] for the first invalid operation, or
/// [`EngineError::Io`] if the filesystem refuses a valid one.
pub fn execute_file_ops(ops: &[FileOperation], root: &Path) -> Result<FileOpsResult, EngineError> {
    let mut result = FileOpsResult::default();

    for op in ops {
        match op {
            FileOperation::Rename { from, to } | FileOperation::Move { from, to } => {
                let src = resolve(root, op, from)?;
                let dst = resolve(root, op, to)?;
                if !src.exists() {
                    return Err(unsafe_op(op, format!("source does not exist: {from}")));
                }
                if dst.exists() {
                    return Err(unsafe_op(op, format!("target already exists: {to}")));
                }
                if let Some(parent) = dst.parent()
                    && !parent.exists()
                {
                    if matches!(op, FileOperation::Rename { .. }) {
                        return Err(unsafe_op(
                            op,
                            format!("target directory does not exist: {to} (use `move`)"),
                        ));
                    }
                    fs::create_dir_all(parent).map_err(|e| EngineError::io_at(e, parent))?;
                }
                fs::rename(&src, &dst).map_err(|e| EngineError::io_at(e, &src))?;
                debug!(op = op.kind(), from = %from, to = %to, "file op executed");
            }
            FileOperation::Delete { path } => {
                let target = resolve(root, op, path)?;
                if target.exists() {
                    fs::remove_file(&target).map_err(|e| EngineError::io_at(e, &target))?;
                    debug!(path = %path, "file deleted");
                } else {
                    let note = format!("delete: file does not exist (skipped): {path}");
                    warn!("{note}");
                    result.warnings.push(note);
                }
            }
        }
        result.executed.push(op.clone());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_util::write_file;

    fn rename(from: &str, to: &str) -> FileOperation {
        FileOperation::Rename {
            from: from.to_owned(),
            to: to.to_owned(),
        }
    }

    fn mv(from: &str, to: &str) -> FileOperation {
        FileOperation::Move {
            from: from.to_owned(),
            to: to.to_owned(),
        }
    }

    fn delete(path: &str) -> FileOperation {
        FileOperation::Delete {
            path: path.to_owned(),
        }
    }

    #[test]
    fn rename_and_move() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("src/a.ts"), b"a").unwrap();
        write_file(&dir.path().join("src/b.ts"), b"b").unwrap();

        let result = execute_file_ops(
            &[rename("src/a.ts", "src/a2.ts"), mv("src/b.ts", "lib/deep/b.ts")],
            dir.path(),
        )
        .unwrap();

        assert_eq!(fs::read(dir.path().join("src/a2.ts")).unwrap(), b"a");
        assert_eq!(fs::read(dir.path().join("lib/deep/b.ts")).unwrap(), b"b");
        assert_eq!(
            result.remaps(),
            vec![
                ("src/a.ts".to_owned(), "src/a2.ts".to_owned()),
                ("src/b.ts".to_owned(), "lib/deep/b.ts".to_owned()),
            ]
        );
    }

    #[test]
    fn delete_missing_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute_file_ops(&[delete("ghost.ts")], dir.path()).unwrap();
        assert_eq!(result.executed.len(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("ghost.ts"));
    }

    #[test]
    fn escaping_path_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = execute_file_ops(&[delete("../etc/passwd")], dir.path()).unwrap_err();
        assert!(matches!(err, EngineError::UnsafeFileOp { .. }));
        assert!(err.to_string().contains("escapes"));
    }

    #[test]
    fn first_invalid_op_aborts() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("x.ts"), b"x").unwrap();
        write_file(&dir.path().join("y.ts"), b"y").unwrap();

        let err = execute_file_ops(
            &[rename("missing.ts", "z.ts"), delete("x.ts")],
            dir.path(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("source does not exist"));
        assert!(dir.path().join("x.ts").exists());

        let err = execute_file_ops(&[rename("x.ts", "y.ts")], dir.path()).unwrap_err();
        assert!(err.to_string().contains("target already exists"));
    }
}
