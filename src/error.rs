//! Engine error types.
//!
//! Defines [`EngineError`], the unified error type for every skill-engine
//! operation. Messages are written for whoever has to act on them: each
//! variant says what went wrong and how to get unstuck.
//!
//! Orchestrators ([`crate::apply`], [`crate::update`], [`crate::rebase`])
//! never let these escape as panics; they are folded into structured results.

use std::fmt;
use std::path::PathBuf;

use serde::ser::{Serialize, SerializeStruct, Serializer};

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Unified error type for skill-engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// The package needs a newer engine than this build.
    SystemVersion {
        /// Minimum engine version declared by the package.
        required: String,
        /// Version of the running engine.
        current: String,
    },

    /// The package targets a core version the project is not on.
    CoreVersion {
        /// Core version (or range) the package requires.
        required: String,
        /// Core version recorded in the ledger.
        current: String,
    },

    /// The skill is already recorded in the ledger.
    AlreadyApplied {
        /// Skill name.
        name: String,
        /// Version already applied.
        version: String,
    },

    /// The skill depends on skills that are not applied.
    UnmetDependencies {
        /// Skill being applied.
        skill: String,
        /// Dependency names that are missing.
        missing: Vec<String>,
    },

    /// The skill declares a conflict with an applied skill.
    SkillConflict {
        /// Skill being applied.
        skill: String,
        /// Applied skills it conflicts with.
        conflicting: Vec<String>,
    },

    /// Uninstall named a skill that is not in the ledger.
    SkillNotApplied {
        /// Skill name.
        name: String,
    },

    /// Uninstall named a skill that other applied skills depend on.
    SkillRequired {
        /// Skill being uninstalled.
        name: String,
        /// Applied skills that declare it as a dependency.
        dependents: Vec<String>,
    },

    /// An added file already exists with different content.
    AddConflict {
        /// Project-relative path.
        path: PathBuf,
    },

    /// Three-way merges left unresolved conflicts.
    MergeConflict {
        /// Files that still contain conflict markers.
        files: Vec<PathBuf>,
        /// Total number of conflict blocks across all files.
        count: usize,
    },

    /// A structured (field-level) merge found incompatible values.
    StructuredConflict {
        /// Project-relative path of the structured file.
        file: PathBuf,
        /// Human-readable description of the clash.
        detail: String,
    },

    /// A rename/move/delete operation was rejected.
    UnsafeFileOp {
        /// Operation kind (`rename`, `move`, `delete`).
        op: String,
        /// Why it was rejected.
        detail: String,
    },

    /// A post-apply (or dependency install) command exited non-zero.
    PostApplyFailed {
        /// The command string that was run.
        command: String,
        /// Exit code (`None` if killed by a signal).
        exit_code: Option<i32>,
        /// Captured stderr (trimmed).
        stderr: String,
    },

    /// Another operation holds the project lock.
    LockHeld {
        /// Path of the lock marker.
        path: PathBuf,
        /// Description of the current holder, if readable.
        holder: Option<String>,
    },

    /// A customize session is active; mutating operations must wait.
    CustomizeActive,

    /// A customize commit/abort was requested without an active session.
    NoCustomizeSession,

    /// Rebase/replay could not locate a recorded skill package.
    PackageNotFound {
        /// Skill name from the ledger.
        name: String,
        /// Skill version from the ledger.
        version: String,
    },

    /// The merge primitive failed outright (distinct from a conflict).
    MergeFailed {
        /// Project-relative path being merged.
        path: PathBuf,
        /// Failure description.
        detail: String,
    },

    /// A skill manifest could not be read or is malformed.
    Manifest {
        /// Manifest path.
        path: PathBuf,
        /// Problem description.
        detail: String,
    },

    /// The ledger could not be read or written.
    Ledger {
        /// Ledger path.
        path: PathBuf,
        /// Problem description.
        detail: String,
    },

    /// A configuration file could not be loaded or parsed.
    Config {
        /// Path to the configuration file.
        path: PathBuf,
        /// Problem description.
        detail: String,
    },

    /// The project has no `.skillweave/` state directory.
    NotInitialized {
        /// Project root.
        root: PathBuf,
    },

    /// `init` was run on a project that already has a ledger.
    AlreadyInitialized {
        /// Project root.
        root: PathBuf,
    },

    /// No staged conflict or resolution exists for a fingerprint.
    ResolutionNotFound {
        /// Conflict fingerprint.
        fingerprint: String,
    },

    /// A staged resolution still contains conflict markers.
    UnresolvedMarkers {
        /// Conflict fingerprint.
        fingerprint: String,
        /// Path of the staged file that needs editing.
        path: PathBuf,
    },

    /// An I/O error occurred.
    Io(std::io::Error),
}

impl EngineError {
    /// Short machine-readable name of the variant, used in JSON results.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SystemVersion { .. } => "system_version",
            Self::CoreVersion { .. } => "core_version",
            Self::AlreadyApplied { .. } => "already_applied",
            Self::UnmetDependencies { .. } => "unmet_dependencies",
            Self::SkillConflict { .. } => "skill_conflict",
            Self::SkillNotApplied { .. } => "skill_not_applied",
            Self::SkillRequired { .. } => "skill_required",
            Self::AddConflict { .. } => "add_conflict",
            Self::MergeConflict { .. } => "merge_conflict",
            Self::StructuredConflict { .. } => "structured_conflict",
            Self::UnsafeFileOp { .. } => "unsafe_file_op",
            Self::PostApplyFailed { .. } => "post_apply_failed",
            Self::LockHeld { .. } => "lock_held",
            Self::CustomizeActive => "customize_active",
            Self::NoCustomizeSession => "no_customize_session",
            Self::PackageNotFound { .. } => "package_not_found",
            Self::MergeFailed { .. } => "merge_failed",
            Self::Manifest { .. } => "manifest",
            Self::Ledger { .. } => "ledger",
            Self::Config { .. } => "config",
            Self::NotInitialized { .. } => "not_initialized",
            Self::AlreadyInitialized { .. } => "already_initialized",
            Self::ResolutionNotFound { .. } => "resolution_not_found",
            Self::UnresolvedMarkers { .. } => "unresolved_markers",
            Self::Io(_) => "io",
        }
    }

    /// Attach a path to an I/O error so the message says which file failed.
    #[must_use]
    pub fn io_at(err: std::io::Error, path: &std::path::Path) -> Self {
        Self::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {err}", path.display()),
        ))
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SystemVersion { required, current } => {
                write!(
                    f,
                    "skill requires engine version {required} (running {current}).\n  To fix: upgrade skillweave to {required} or newer."
                )
            }
            Self::CoreVersion { required, current } => {
                write!(
                    f,
                    "skill requires core version {required}, project is on {current}.\n  To fix: update the core first, or use a skill release built for {current}."
                )
            }
            Self::AlreadyApplied { name, version } => {
                write!(
                    f,
                    "skill '{name}' is already applied (version {version}).\n  To fix: nothing to do; run `skillweave status` to inspect the ledger."
                )
            }
            Self::UnmetDependencies { skill, missing } => {
                write!(
                    f,
                    "skill '{skill}' depends on skills that are not applied: {}\n  To fix: apply the missing skills first.",
                    missing.join(", ")
                )
            }
            Self::SkillConflict { skill, conflicting } => {
                write!(
                    f,
                    "skill '{skill}' conflicts with applied skills: {}\n  To fix: the skills cannot be layered together.",
                    conflicting.join(", ")
                )
            }
            Self::SkillNotApplied { name } => {
                write!(
                    f,
                    "skill '{name}' is not applied.\n  To fix: run `skillweave status` to list the applied skills."
                )
            }
            Self::SkillRequired { name, dependents } => {
                write!(
                    f,
                    "skill '{name}' is required by applied skills: {}\n  To fix: uninstall those skills first.",
                    dependents.join(", ")
                )
            }
            Self::AddConflict { path } => {
                write!(
                    f,
                    "cannot add '{}': file already exists with different content.\n  To fix: move the existing file aside, or record it as a customization.",
                    path.display()
                )
            }
            Self::MergeConflict { files, count } => {
                write!(
                    f,
                    "merge conflict ({count} conflict(s)) in {} file(s): {}\n  To fix: edit the staged `merged` files under .skillweave/conflicts/, then run `skillweave resolve --all` and retry.",
                    files.len(),
                    join_paths(files)
                )
            }
            Self::StructuredConflict { file, detail } => {
                write!(
                    f,
                    "structured merge conflict in '{}': {detail}\n  To fix: choose one value explicitly in the file and retry.",
                    file.display()
                )
            }
            Self::UnsafeFileOp { op, detail } => {
                write!(f, "{op}: {detail}\n  To fix: correct the file_ops entry in the skill manifest.")
            }
            Self::PostApplyFailed {
                command,
                exit_code,
                stderr,
            } => {
                match exit_code {
                    Some(code) => write!(f, "post_apply command failed (exit code {code}): {command}")?,
                    None => write!(f, "post_apply command killed by signal: {command}")?,
                }
                if !stderr.is_empty() {
                    write!(f, "\n  stderr: {stderr}")?;
                }
                write!(f, "\n  To fix: all changes were rolled back; fix the command and retry.")
            }
            Self::LockHeld { path, holder } => {
                write!(f, "another operation is in progress (lock: {})", path.display())?;
                if let Some(holder) = holder {
                    write!(f, "\n  holder: {holder}")?;
                }
                write!(f, "\n  To fix: wait for it to finish, then retry.")
            }
            Self::CustomizeActive => {
                write!(
                    f,
                    "a customize session is active.\n  To fix: run `skillweave customize commit` or `skillweave customize abort` first."
                )
            }
            Self::NoCustomizeSession => {
                write!(
                    f,
                    "no customize session is active.\n  To fix: start one with `skillweave customize start`."
                )
            }
            Self::PackageNotFound { name, version } => {
                write!(
                    f,
                    "skill package '{name}' version {version} not found.\n  To fix: place the package in a directory listed under [replay] search_paths."
                )
            }
            Self::MergeFailed { path, detail } => {
                write!(
                    f,
                    "merge failed for '{}': {detail}\n  To fix: the file cannot be merged as text; resolve it by hand.",
                    path.display()
                )
            }
            Self::Manifest { path, detail } => {
                write!(f, "invalid skill manifest '{}': {detail}", path.display())
            }
            Self::Ledger { path, detail } => {
                write!(
                    f,
                    "ledger error in '{}': {detail}\n  To fix: restore the file from version control.",
                    path.display()
                )
            }
            Self::Config { path, detail } => {
                write!(
                    f,
                    "configuration error in '{}': {detail}\n  To fix: edit the config file and correct the issue.",
                    path.display()
                )
            }
            Self::NotInitialized { root } => {
                write!(
                    f,
                    "'{}' is not a skillweave project.\n  To fix: run `skillweave init`.",
                    root.display()
                )
            }
            Self::AlreadyInitialized { root } => {
                write!(
                    f,
                    "'{}' is already a skillweave project.\n  To fix: nothing to do; run `skillweave status` to inspect it.",
                    root.display()
                )
            }
            Self::ResolutionNotFound { fingerprint } => {
                write!(f, "no staged conflict with fingerprint {fingerprint}")
            }
            Self::UnresolvedMarkers { fingerprint, path } => {
                write!(
                    f,
                    "conflict {fingerprint} still contains conflict markers.\n  To fix: edit {} and remove every <<<<<<< / ======= / >>>>>>> block.",
                    path.display()
                )
            }
            Self::Io(err) => {
                write!(f, "I/O error: {err}\n  To fix: check file permissions and disk space.")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// std::error::Error
// ---------------------------------------------------------------------------

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Serialize: `{ "kind": ..., "message": ... }` in JSON results
// ---------------------------------------------------------------------------

impl Serialize for EngineError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EngineError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

// ---------------------------------------------------------------------------
// From impls
// ---------------------------------------------------------------------------

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<crate::config::ConfigError> for EngineError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config {
            path: err.path.unwrap_or_default(),
            detail: err.message,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_system_version_names_required() {
        let err = EngineError::SystemVersion {
            required: "99.0.0".to_owned(),
            current: "0.4.0".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("99.0.0"));
        assert!(msg.contains("0.4.0"));
    }

    #[test]
    fn display_merge_conflict_lists_files() {
        let err = EngineError::MergeConflict {
            files: vec![PathBuf::from("src/a.ts"), PathBuf::from("src/b.ts")],
            count: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("3 conflict"));
        assert!(msg.contains("2 file(s)"));
        assert!(msg.contains("src/a.ts, src/b.ts"));
        assert!(msg.contains("skillweave resolve"));
    }

    #[test]
    fn display_post_apply_includes_command_and_stderr() {
        let err = EngineError::PostApplyFailed {
            command: "false".to_owned(),
            exit_code: Some(1),
            stderr: "boom".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("post_apply"));
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("stderr: boom"));
    }

    #[test]
    fn display_post_apply_signal() {
        let err = EngineError::PostApplyFailed {
            command: "sleep 100".to_owned(),
            exit_code: None,
            stderr: String::new(),
        };
        let msg = err.to_string();
        assert!(msg.contains("killed by signal"));
        assert!(!msg.contains("stderr:"));
    }

    #[test]
    fn display_lock_held_with_holder() {
        let err = EngineError::LockHeld {
            path: PathBuf::from(".skillweave/lock"),
            holder: Some("pid 42".to_owned()),
        };
        let msg = err.to_string();
        assert!(msg.contains("in progress"));
        assert!(msg.contains("pid 42"));
    }

    #[test]
    fn display_skill_required_lists_dependents() {
        let err = EngineError::SkillRequired {
            name: "telegram".to_owned(),
            dependents: vec!["telegram-voice".to_owned(), "telegram-media".to_owned()],
        };
        let msg = err.to_string();
        assert!(msg.contains("'telegram'"));
        assert!(msg.contains("telegram-voice, telegram-media"));
        assert_eq!(err.kind(), "skill_required");
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(EngineError::CustomizeActive.kind(), "customize_active");
        let io = EngineError::from(std::io::Error::other("x"));
        assert_eq!(io.kind(), "io");
    }

    #[test]
    fn io_at_prefixes_path() {
        let err = EngineError::io_at(
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            std::path::Path::new("src/x.ts"),
        );
        assert!(err.to_string().contains("src/x.ts: missing"));
    }

    #[test]
    fn serializes_kind_and_message() {
        let json = serde_json::to_value(EngineError::NoCustomizeSession).unwrap();
        assert_eq!(json["kind"], "no_customize_session");
        assert!(json["message"].as_str().unwrap().contains("customize start"));
    }

    #[test]
    fn source_only_for_io() {
        use std::error::Error as _;
        let io = EngineError::from(std::io::Error::other("disk"));
        assert!(io.source().is_some());
        assert!(EngineError::NoCustomizeSession.source().is_none());
    }
}
