//! Project state-directory layout and initialization.
//!
//! Everything the engine persists lives under `<root>/.skillweave/`:
//!
//! ```text
//! .skillweave/
//!   config.toml          engine configuration
//!   state.json           the ledger
//!   lock                 lock marker (present only while an operation runs)
//!   base/                base snapshot (pristine core at the ledger version)
//!   backup/              backup set (present only while an operation runs)
//!   resolutions/shipped/ read-only shipped conflict resolutions
//!   resolutions/user/    user-recorded conflict resolutions
//!   conflicts/           staged three-way records awaiting resolution
//!   custom/              committed customization patches
//!   custom/pending/      checkpoint of an active customize session
//!   packages/            default search path for replayed skill packages
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// State directory name.
pub const STATE_DIR: &str = ".skillweave";

/// Ledger file name.
pub const STATE_FILE: &str = "state.json";

/// Config file name.
pub const CONFIG_FILE: &str = "config.toml";

/// Lock marker file name.
pub const LOCK_FILE: &str = "lock";

/// Base snapshot directory.
pub const BASE_DIR: &str = "base";

/// Backup set directory.
pub const BACKUP_DIR: &str = "backup";

/// Resolution cache root.
pub const RESOLUTIONS_DIR: &str = "resolutions";

/// Staged conflict records.
pub const CONFLICTS_DIR: &str = "conflicts";

/// Customization patches.
pub const CUSTOM_DIR: &str = "custom";

/// Default local package store.
pub const PACKAGES_DIR: &str = "packages";

/// Skill package manifest file name.
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Package subdirectory holding files listed in `adds`.
pub const PACKAGE_ADD_DIR: &str = "add";

/// Package subdirectory holding files listed in `modifies`.
pub const PACKAGE_MODIFY_DIR: &str = "modify";

/// Core metadata file inside a candidate core tree.
pub const CORE_MANIFEST_FILE: &str = "core.toml";

/// Patterns to add to .gitignore.
pub const GITIGNORE_PATTERNS: &[&str] = &[
    ".skillweave/lock",
    ".skillweave/backup/",
    ".skillweave/conflicts/",
    ".skillweave/custom/pending/",
];

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

/// Resolved paths for one project root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Create a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The project root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a project-relative path.
    #[must_use]
    pub fn project_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join(STATE_FILE)
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.state_dir().join(CONFIG_FILE)
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.state_dir().join(LOCK_FILE)
    }

    #[must_use]
    pub fn base_dir(&self) -> PathBuf {
        self.state_dir().join(BASE_DIR)
    }

    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir().join(BACKUP_DIR)
    }

    #[must_use]
    pub fn shipped_resolutions_dir(&self) -> PathBuf {
        self.state_dir().join(RESOLUTIONS_DIR).join("shipped")
    }

    #[must_use]
    pub fn user_resolutions_dir(&self) -> PathBuf {
        self.state_dir().join(RESOLUTIONS_DIR).join("user")
    }

    #[must_use]
    pub fn conflicts_dir(&self) -> PathBuf {
        self.state_dir().join(CONFLICTS_DIR)
    }

    #[must_use]
    pub fn custom_dir(&self) -> PathBuf {
        self.state_dir().join(CUSTOM_DIR)
    }

    /// Checkpoint directory of the active customize session.
    #[must_use]
    pub fn pending_customize_dir(&self) -> PathBuf {
        self.custom_dir().join("pending")
    }

    #[must_use]
    pub fn packages_dir(&self) -> PathBuf {
        self.state_dir().join(PACKAGES_DIR)
    }

    /// Base snapshot copy of a project-relative path.
    #[must_use]
    pub fn base_path(&self, rel: &str) -> PathBuf {
        self.base_dir().join(rel)
    }

    /// Returns `true` if the state directory exists.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state_dir().is_dir()
    }
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Initialize the `.skillweave` directory structure and update .gitignore.
///
/// This function is idempotent:
/// - Missing directories are created.
/// - Existing directories are left alone.
/// - `config.toml` is created with defaults if missing.
/// - `.gitignore` is updated with necessary patterns if missing.
pub fn init_state_dir(layout: &Layout) -> io::Result<()> {
    fs::create_dir_all(layout.state_dir())?;
    fs::create_dir_all(layout.base_dir())?;
    fs::create_dir_all(layout.shipped_resolutions_dir())?;
    fs::create_dir_all(layout.user_resolutions_dir())?;
    fs::create_dir_all(layout.custom_dir())?;

    init_config_if_missing(&layout.config_file())?;
    update_gitignore(layout.root())?;

    Ok(())
}

fn init_config_if_missing(path: &Path) -> io::Result<()> {
    if !path.exists() {
        let mut file = fs::File::create(path)?;
        writeln!(file, "# skillweave project configuration")?;
        writeln!(file)?;
        writeln!(file, "[merge]")?;
        writeln!(file, "ours_label = \"current\"")?;
        writeln!(file)?;
        writeln!(file, "[commands]")?;
        writeln!(file, "shell = \"sh\"")?;
        writeln!(file, "install = \"npm install\"")?;
    }
    Ok(())
}

/// Append any missing state-dir patterns to the project `.gitignore`.
pub(crate) fn update_gitignore(root: &Path) -> io::Result<()> {
    let gitignore_path = root.join(".gitignore");
    let mut content = if gitignore_path.exists() {
        fs::read_to_string(&gitignore_path)?
    } else {
        String::new()
    };

    let existing: std::collections::HashSet<_> = content.lines().map(str::trim).collect();
    let to_add: Vec<&str> = GITIGNORE_PATTERNS
        .iter()
        .copied()
        .filter(|p| !existing.contains(p))
        .collect();

    if !to_add.is_empty() {
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str("\n# skillweave\n");
        for p in to_add {
            content.push_str(p);
            content.push('\n');
        }
        fs::write(gitignore_path, content)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn paths_are_under_state_dir() {
        let layout = Layout::new("/proj");
        assert_eq!(layout.state_file(), PathBuf::from("/proj/.skillweave/state.json"));
        assert_eq!(layout.lock_file(), PathBuf::from("/proj/.skillweave/lock"));
        assert_eq!(
            layout.base_path("src/index.ts"),
            PathBuf::from("/proj/.skillweave/base/src/index.ts")
        );
        assert_eq!(
            layout.user_resolutions_dir(),
            PathBuf::from("/proj/.skillweave/resolutions/user")
        );
    }

    #[test]
    fn init_creates_structure() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        assert!(!layout.is_initialized());

        init_state_dir(&layout).unwrap();

        assert!(layout.is_initialized());
        assert!(layout.base_dir().is_dir());
        assert!(layout.user_resolutions_dir().is_dir());
        assert!(layout.config_file().exists());
        let gitignore = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".skillweave/backup/"));
        assert!(gitignore.contains(".skillweave/lock"));
    }

    #[test]
    fn init_is_idempotent() {
        let dir = tempdir().unwrap();
        let layout = Layout::new(dir.path());
        fs::write(dir.path().join(".gitignore"), "node_modules/\n").unwrap();

        init_state_dir(&layout).unwrap();
        fs::write(layout.config_file(), "[merge]\nours_label = \"mine\"\n").unwrap();
        init_state_dir(&layout).unwrap();

        let gitignore = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.starts_with("node_modules/\n"));
        assert_eq!(gitignore.matches(".skillweave/backup/").count(), 1);
        let config = fs::read_to_string(layout.config_file()).unwrap();
        assert!(config.contains("mine"), "existing config must not be overwritten");
    }
}
