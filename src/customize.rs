//! Customize sessions: turning direct edits into ledger entries.
//!
//! `start` checkpoints the hash and content of every tracked file into
//! `.skillweave/custom/pending/`. The user edits freely. `commit` diffs the
//! tree against the checkpoint and stores the changed files as a
//! [`CustomPatch`] under `.skillweave/custom/<id>/`:
//!
//! ```text
//! custom/<id>/
//!   before/<path>   content at session start (absent: file was created)
//!   after/<path>    content at commit (absent: file was deleted)
//!   changes.diff    unified diff of the whole patch
//! ```
//!
//! While a session is open every other mutating operation refuses to run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use tracing::{info, instrument, warn};

use crate::error::EngineError;
use crate::fs_util;
use crate::layout::Layout;
use crate::ledger::{CustomPatch, Ledger, unix_now};
use crate::project::Project;

const SESSION_FILE: &str = "session.json";
const CHECKPOINT_DIR: &str = "before";

/// Directory of a committed patch's pre-session content.
pub const PATCH_BEFORE_DIR: &str = "before";
/// Directory of a committed patch's post-session content.
pub const PATCH_AFTER_DIR: &str = "after";
/// Unified diff of a committed patch.
pub const PATCH_DIFF_FILE: &str = "changes.diff";

/// An open customize session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomizeSession {
    pub description: String,
    pub started_at: u64,
    /// Checkpointed path → content hash (`None`: did not exist).
    pub files: BTreeMap<String, Option<String>>,
}

/// Whether a customize session is open in `layout`'s project.
#[must_use]
pub fn session_active(layout: &Layout) -> bool {
    layout.pending_customize_dir().join(SESSION_FILE).is_file()
}

/// Read the open session, if any.
///
/// # Errors
/// Returns [`EngineError::Ledger`] if the session file is corrupt.
pub fn read_session(layout: &Layout) -> Result<Option<CustomizeSession>, EngineError> {
    let path = layout.pending_customize_dir().join(SESSION_FILE);
    let Some(bytes) = fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| EngineError::Ledger {
            path,
            detail: format!("corrupt customize session: {e}"),
        })
}

/// Lowercase, dash-separated form of `description`, at most 40 characters.
fn slugify(description: &str) -> String {
    let mut slug = String::new();
    for c in description.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() { "patch".to_owned() } else { slug.to_owned() }
}

/// Unified diff of one file, `a/` → `b/`.
fn file_diff(out: &mut String, rel: &str, before: Option<&[u8]>, after: Option<&[u8]>) {
    let old_name = if before.is_some() { format!("a/{rel}") } else { "/dev/null".to_owned() };
    let new_name = if after.is_some() { format!("b/{rel}") } else { "/dev/null".to_owned() };
    let old = std::str::from_utf8(before.unwrap_or_default());
    let new = std::str::from_utf8(after.unwrap_or_default());
    match (old, new) {
        (Ok(old), Ok(new)) => {
            let diff = TextDiff::from_lines(old, new);
            let _ = write!(out, "{}", diff.unified_diff().context_radius(3).header(&old_name, &new_name));
        }
        _ => {
            let _ = writeln!(out, "Binary files {old_name} and {new_name} differ");
        }
    }
}

/// One file of a custom patch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FileChange {
    pub path: String,
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
}

/// Store `changes` as the ledger's next custom patch directory and return
/// the patch entry (not yet recorded in the ledger).
pub(crate) fn write_patch(
    layout: &Layout,
    ledger: &Ledger,
    description: &str,
    changes: &[FileChange],
) -> Result<CustomPatch, EngineError> {
    let id = format!("{:03}-{}", ledger.custom_patches().len() + 1, slugify(description));
    let patch_dir = layout.custom_dir().join(&id);
    fs_util::remove_dir_if_exists(&patch_dir).map_err(|e| EngineError::io_at(e, &patch_dir))?;

    let mut diff = String::new();
    for change in changes {
        for (sub, content) in [(PATCH_BEFORE_DIR, &change.before), (PATCH_AFTER_DIR, &change.after)] {
            if let Some(bytes) = content {
                let dest = patch_dir.join(sub).join(&change.path);
                fs_util::write_file(&dest, bytes).map_err(|e| EngineError::io_at(e, &dest))?;
            }
        }
        file_diff(&mut diff, &change.path, change.before.as_deref(), change.after.as_deref());
    }
    let diff_path = patch_dir.join(PATCH_DIFF_FILE);
    fs_util::write_file(&diff_path, diff.as_bytes()).map_err(|e| EngineError::io_at(e, &diff_path))?;

    Ok(CustomPatch {
        id,
        description: description.to_owned(),
        recorded_at: unix_now(),
        files: changes.iter().map(|c| c.path.clone()).collect(),
    })
}

/// Write the patch content, record it in `ledger` and persist with `save`.
/// The patch directory is removed again if `save` fails, so no content is
/// left behind without a ledger entry.
pub(crate) fn record_patch(
    layout: &Layout,
    ledger: &mut Ledger,
    description: &str,
    changes: &[FileChange],
    hashes: &BTreeMap<String, Option<String>>,
    save: impl FnOnce(&Ledger) -> Result<(), EngineError>,
) -> Result<CustomPatch, EngineError> {
    let patch = write_patch(layout, ledger, description, changes)?;
    ledger.record_custom_patch(patch.clone(), hashes);
    if let Err(e) = save(ledger) {
        let dir = layout.custom_dir().join(&patch.id);
        if let Err(clean) = fs_util::remove_dir_if_exists(&dir) {
            warn!(dir = %dir.display(), error = %clean, "could not remove unrecorded patch");
        }
        return Err(e);
    }
    Ok(patch)
}

/// Content of `rel` as stored in a committed patch (`None`: absent on that side).
pub(crate) fn patch_content(
    layout: &Layout,
    patch_id: &str,
    side: &str,
    rel: &str,
) -> Result<Option<Vec<u8>>, EngineError> {
    let path = layout.custom_dir().join(patch_id).join(side).join(rel);
    fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))
}

impl Project {
    /// Is a customize session open?
    #[must_use]
    pub fn is_customize_active(&self) -> bool {
        session_active(self.layout())
    }

    /// Paths a customize checkpoint covers: every tracked file plus base
    /// files, files touched by applied skills and customized files.
    fn checkpoint_paths(&self, ledger: &Ledger) -> Result<BTreeSet<String>, EngineError> {
        let mut paths: BTreeSet<String> = self.tracked_files()?.into_iter().collect();
        let base = self.layout().base_dir();
        paths.extend(fs_util::list_files(&base).map_err(|e| EngineError::io_at(e, &base))?);
        for skill in ledger.applied_skills() {
            paths.extend(skill.touched_files.iter().map(|p| ledger.resolve_path(p)));
        }
        paths.extend(ledger.custom_modifications.keys().cloned());
        Ok(paths)
    }

    /// Open a customize session described by `description`.
    ///
    /// # Errors
    /// Returns [`EngineError::CustomizeActive`] if a session is already open,
    /// or [`EngineError::LockHeld`] if another operation is running.
    #[instrument(skip_all, fields(description = %description))]
    pub fn start_customize(&self, description: &str) -> Result<CustomizeSession, EngineError> {
        self.ensure_idle()?;
        let lock = self.lock()?;
        let ledger = self.read_ledger()?;

        let pending = self.layout().pending_customize_dir();
        fs_util::remove_dir_if_exists(&pending).map_err(|e| EngineError::io_at(e, &pending))?;
        let checkpoint = pending.join(CHECKPOINT_DIR);

        let mut files = BTreeMap::new();
        for rel in self.checkpoint_paths(&ledger)? {
            let path = self.root().join(&rel);
            let content = fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))?;
            let hash = content.as_deref().map(fs_util::hash_bytes);
            if let Some(bytes) = content {
                let copy = checkpoint.join(&rel);
                fs_util::write_file(&copy, &bytes).map_err(|e| EngineError::io_at(e, &copy))?;
            }
            files.insert(rel, hash);
        }

        let session = CustomizeSession {
            description: description.to_owned(),
            started_at: unix_now(),
            files,
        };
        let json = serde_json::to_vec_pretty(&session).map_err(|e| EngineError::Io(std::io::Error::other(e)))?;
        let session_path = pending.join(SESSION_FILE);
        fs_util::write_atomic(&session_path, &json).map_err(|e| EngineError::io_at(e, &session_path))?;
        lock.release()?;

        info!(files = session.files.len(), "customize session started");
        Ok(session)
    }

    /// Close the open session, recording every changed file.
    ///
    /// Returns `None` (and closes the session) when nothing changed.
    ///
    /// # Errors
    /// Returns [`EngineError::NoCustomizeSession`] without an open session,
    /// or [`EngineError::LockHeld`] if another operation is running.
    #[instrument(skip_all)]
    pub fn commit_customize(&self) -> Result<Option<CustomPatch>, EngineError> {
        let session = read_session(self.layout())?.ok_or(EngineError::NoCustomizeSession)?;
        let lock = self.lock()?;
        let mut ledger = self.read_ledger()?;
        let pending = self.layout().pending_customize_dir();
        let checkpoint = pending.join(CHECKPOINT_DIR);

        let mut candidates: BTreeSet<String> = session.files.keys().cloned().collect();
        candidates.extend(self.tracked_files()?);

        let mut changed = Vec::new();
        let mut hashes = BTreeMap::new();
        for rel in candidates {
            let path = self.root().join(&rel);
            let now = fs_util::hash_file(&path).map_err(|e| EngineError::io_at(e, &path))?;
            let before = session.files.get(&rel).cloned().flatten();
            if now != before {
                hashes.insert(rel.clone(), now);
                changed.push(rel);
            }
        }

        if changed.is_empty() {
            fs_util::remove_dir_if_exists(&pending).map_err(|e| EngineError::io_at(e, &pending))?;
            lock.release()?;
            info!("customize session closed with no changes");
            return Ok(None);
        }

        let mut changes = Vec::with_capacity(changed.len());
        for rel in changed {
            let copy = checkpoint.join(&rel);
            let before = fs_util::read_optional(&copy).map_err(|e| EngineError::io_at(e, &copy))?;
            let path = self.root().join(&rel);
            let after = fs_util::read_optional(&path).map_err(|e| EngineError::io_at(e, &path))?;
            changes.push(FileChange { path: rel, before, after });
        }
        let patch = record_patch(self.layout(), &mut ledger, &session.description, &changes, &hashes, |l| {
            self.write_ledger(l)
        })?;
        fs_util::remove_dir_if_exists(&pending).map_err(|e| EngineError::io_at(e, &pending))?;
        lock.release()?;

        info!(patch = %patch.id, files = patch.files.len(), "customize session committed");
        Ok(Some(patch))
    }

    /// Discard the open session. With `restore`, every file changed since the
    /// checkpoint is put back; returns the restored paths.
    ///
    /// # Errors
    /// Returns [`EngineError::NoCustomizeSession`] without an open session.
    #[instrument(skip_all, fields(restore = restore))]
    pub fn abort_customize(&self, restore: bool) -> Result<Vec<String>, EngineError> {
        let session = read_session(self.layout())?.ok_or(EngineError::NoCustomizeSession)?;
        let lock = self.lock()?;
        let pending = self.layout().pending_customize_dir();
        let checkpoint = pending.join(CHECKPOINT_DIR);

        let mut restored = Vec::new();
        if restore {
            let mut candidates: BTreeSet<String> = session.files.keys().cloned().collect();
            candidates.extend(self.tracked_files()?);
            for rel in candidates {
                let path = self.root().join(&rel);
                let now = fs_util::hash_file(&path).map_err(|e| EngineError::io_at(e, &path))?;
                let before = session.files.get(&rel).cloned().flatten();
                if now == before {
                    continue;
                }
                if before.is_some() {
                    let copy = checkpoint.join(&rel);
                    let bytes = std::fs::read(&copy).map_err(|e| EngineError::io_at(e, &copy))?;
                    fs_util::write_file(&path, &bytes).map_err(|e| EngineError::io_at(e, &path))?;
                } else {
                    fs_util::remove_file_if_exists(&path).map_err(|e| EngineError::io_at(e, &path))?;
                    fs_util::prune_empty_parents(&path, self.root());
                }
                restored.push(rel);
            }
        }

        fs_util::remove_dir_if_exists(&pending).map_err(|e| EngineError::io_at(e, &pending))?;
        lock.release()?;
        info!(restored = restored.len(), "customize session aborted");
        Ok(restored)
    }
}
