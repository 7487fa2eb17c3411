//! Project lock: at most one mutating operation per project.
//!
//! The marker file `.skillweave/lock` is created with `create_new` and then
//! held under an OS advisory lock (`fs2`). Its existence means "mutation in
//! progress". The advisory lock tells a live holder apart from a marker left
//! behind by a crashed process.
//!
//! Acquisition never blocks and never retries.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::ledger::unix_now;

/// Contents of the lock marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Process id of the holder.
    pub pid: u32,
    /// Unix timestamp (seconds) of acquisition.
    pub acquired_at: u64,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: unix_now(),
        }
    }

    fn describe(&self) -> String {
        format!("pid {} since {}", self.pid, self.acquired_at)
    }
}

/// A held project lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<File>,
}

impl LockGuard {
    /// Path of the marker this guard owns.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing I/O errors that `Drop` would swallow.
    ///
    /// # Errors
    /// Returns [`EngineError::Io`] if the marker cannot be removed.
    pub fn release(mut self) -> Result<(), EngineError> {
        self.release_inner()
            .map_err(|e| EngineError::io_at(e, &self.path))
    }

    fn release_inner(&mut self) -> io::Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Remove while still holding the advisory lock, then close.
        let removed = crate::fs_util::remove_file_if_exists(&self.path);
        drop(file);
        debug!(path = %self.path.display(), "lock released");
        removed.map(|_| ())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!(path = %self.path.display(), error = %e, "failed to remove lock marker");
        }
    }
}

/// Is a mutating operation in progress? Pure existence check.
#[must_use]
pub fn is_locked(path: &Path) -> bool {
    path.exists()
}

/// Read the marker contents, if parseable.
#[must_use]
pub fn read_lock_info(path: &Path) -> Option<LockInfo> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Acquire the lock at `path`.
///
/// A marker whose advisory lock nobody holds belongs to a crashed process; it
/// is reclaimed when `reclaim_stale` is set and reported as held otherwise.
///
/// # Errors
/// Returns [`EngineError::LockHeld`] when another holder exists, or
/// [`EngineError::Io`] on filesystem failure.
pub fn acquire(path: &Path, reclaim_stale: bool) -> Result<LockGuard, EngineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::io_at(e, parent))?;
    }

    // Two rounds: a holder may release between our open and our flock.
    for _ in 0..2 {
        match OpenOptions::new().read(true).write(true).create_new(true).open(path) {
            Ok(file) => {
                if FileExt::try_lock_exclusive(&file).is_err() {
                    return Err(held(path, None));
                }
                return finish(path, file);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(EngineError::io_at(e, path)),
        }

        let mut file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(EngineError::io_at(e, path)),
        };
        let mut contents = String::new();
        if let Err(e) = file.read_to_string(&mut contents) {
            warn!(path = %path.display(), error = %e, "could not read lock marker");
        }
        let holder = serde_json::from_str::<LockInfo>(&contents)
            .ok()
            .map(|info| info.describe());

        if FileExt::try_lock_exclusive(&file).is_err() {
            return Err(held(path, holder));
        }
        if !path.exists() {
            // The previous holder removed it after we opened; start over.
            continue;
        }
        if !reclaim_stale {
            return Err(held(path, Some(format!("stale marker ({})", holder.unwrap_or_default()))));
        }
        warn!(
            path = %path.display(),
            previous = holder.as_deref().unwrap_or("unknown"),
            "reclaiming stale lock left by a crashed process"
        );
        file.set_len(0).map_err(|e| EngineError::io_at(e, path))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| EngineError::io_at(e, path))?;
        return finish(path, file);
    }
    Err(held(path, read_lock_info(path).map(|i| i.describe())))
}

fn finish(path: &Path, mut file: File) -> Result<LockGuard, EngineError> {
    let info = LockInfo::current();
    let json = serde_json::to_string(&info).map_err(|e| EngineError::Io(io::Error::other(e)))?;
    file.write_all(json.as_bytes())
        .and_then(|()| file.sync_all())
        .map_err(|e| EngineError::io_at(e, path))?;
    debug!(path = %path.display(), pid = info.pid, "lock acquired");
    Ok(LockGuard {
        path: path.to_owned(),
        file: Some(file),
    })
}

fn held(path: &Path, holder: Option<String>) -> EngineError {
    EngineError::LockHeld {
        path: path.to_owned(),
        holder,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".skillweave/lock");
        (dir, path)
    }

    #[test]
    fn acquire_tracks_state() {
        let (_dir, path) = lock_path();
        assert!(!is_locked(&path));

        let guard = acquire(&path, true).unwrap();
        assert!(is_locked(&path));
        let info = read_lock_info(&path).unwrap();
        assert_eq!(info.pid, std::process::id());

        guard.release().unwrap();
        assert!(!is_locked(&path));
    }

    #[test]
    fn second_acquire_is_rejected_without_touching_marker() {
        let (_dir, path) = lock_path();
        let _guard = acquire(&path, true).unwrap();
        let before = fs::read(&path).unwrap();

        let err = acquire(&path, true).unwrap_err();
        assert!(matches!(err, EngineError::LockHeld { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(is_locked(&path));
    }

    #[test]
    fn reacquire_after_release() {
        let (_dir, path) = lock_path();
        acquire(&path, true).unwrap().release().unwrap();
        let guard = acquire(&path, true).unwrap();
        assert!(is_locked(&path));
        drop(guard);
    }

    #[test]
    fn drop_releases() {
        let (_dir, path) = lock_path();
        {
            let _guard = acquire(&path, true).unwrap();
            assert!(is_locked(&path));
        }
        assert!(!is_locked(&path));
    }

    #[test]
    fn unreadable_marker_is_still_reclaimed() {
        let (_dir, path) = lock_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, [0xff, 0xfe, 0x00, 0x9f]).unwrap();

        let guard = acquire(&path, true).unwrap();
        assert_eq!(read_lock_info(&path).unwrap().pid, std::process::id());
        guard.release().unwrap();
        assert!(!is_locked(&path));
    }

    #[test]
    fn stale_marker_is_reclaimed() {
        let (_dir, path) = lock_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"pid":1,"acquired_at":5}"#).unwrap();

        let guard = acquire(&path, true).unwrap();
        assert_eq!(read_lock_info(&path).unwrap().pid, std::process::id());
        drop(guard);
        assert!(!is_locked(&path));
    }

    #[test]
    fn stale_marker_kept_when_reclaim_disabled() {
        let (_dir, path) = lock_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"pid":1,"acquired_at":5}"#).unwrap();

        let err = acquire(&path, false).unwrap_err();
        match err {
            EngineError::LockHeld { holder, .. } => {
                assert!(holder.unwrap().contains("stale"));
            }
            other => panic!("unexpected: {other}"),
        }
        assert!(is_locked(&path));
        assert_eq!(read_lock_info(&path).unwrap().pid, 1);
    }
}
