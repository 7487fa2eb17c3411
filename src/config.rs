//! Project configuration (`.skillweave/config.toml`).
//!
//! Defines the typed configuration for merge labels, external commands,
//! replay search paths, tracked-file exclusions, and lock policy.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level project configuration.
///
/// Parsed from `.skillweave/config.toml`. Missing fields use defaults.
/// Missing file → all defaults (no error).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Three-way merge settings.
    #[serde(default)]
    pub merge: MergeConfig,

    /// External command settings.
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Where rebase looks for recorded skill packages.
    #[serde(default)]
    pub replay: ReplayConfig,

    /// Which files count as part of the project tree.
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Lock behaviour.
    #[serde(default)]
    pub lock: LockConfig,
}

// ---------------------------------------------------------------------------
// MergeConfig
// ---------------------------------------------------------------------------

/// Conflict-marker settings for the text merge.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MergeConfig {
    /// Label written after `<<<<<<<` for the working-tree side.
    #[serde(default = "default_ours_label")]
    pub ours_label: String,

    /// Width of conflict markers (git uses 7).
    #[serde(default = "default_marker_size")]
    pub marker_size: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            ours_label: default_ours_label(),
            marker_size: default_marker_size(),
        }
    }
}

fn default_ours_label() -> String {
    "current".to_owned()
}

const fn default_marker_size() -> usize {
    7
}

// ---------------------------------------------------------------------------
// CommandsConfig
// ---------------------------------------------------------------------------

/// External command settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandsConfig {
    /// Shell used to run post-apply and install commands (`<shell> -c <cmd>`).
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Command run after a dependency-manifest merge changed dependencies.
    /// `None` (or an empty string) disables the install step.
    #[serde(default = "default_install")]
    pub install: Option<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            install: default_install(),
        }
    }
}

impl CommandsConfig {
    /// The install command, if one is configured and non-empty.
    #[must_use]
    pub fn install_command(&self) -> Option<&str> {
        self.install.as_deref().filter(|c| !c.trim().is_empty())
    }
}

fn default_shell() -> String {
    "sh".to_owned()
}

#[allow(clippy::unnecessary_wraps)]
fn default_install() -> Option<String> {
    Some("npm install".to_owned())
}

// ---------------------------------------------------------------------------
// ReplayConfig
// ---------------------------------------------------------------------------

/// Package search settings for rebase/replay.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayConfig {
    /// Directories (relative to the project root, or absolute) scanned for
    /// skill packages. Each direct child holding a `manifest.toml` is a
    /// candidate.
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
        }
    }
}

fn default_search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from(".skillweave/packages"), PathBuf::from("skills")]
}

// ---------------------------------------------------------------------------
// TrackingConfig
// ---------------------------------------------------------------------------

/// Tracked-tree settings.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingConfig {
    /// Glob patterns (matched against project-relative paths) excluded when
    /// snapshotting the core tree. `.skillweave/` is always excluded.
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            exclude: default_exclude(),
        }
    }
}

fn default_exclude() -> Vec<String> {
    vec![
        ".git/**".to_owned(),
        "node_modules/**".to_owned(),
        "target/**".to_owned(),
        "skills/**".to_owned(),
    ]
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

/// Lock behaviour.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Reclaim a lock marker left behind by a crashed process (no live
    /// holder of the advisory lock).
    #[serde(default = "default_reclaim_stale")]
    pub reclaim_stale: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            reclaim_stale: default_reclaim_stale(),
        }
    }
}

const fn default_reclaim_stale() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Error loading a configuration file.
#[derive(Debug)]
pub struct ConfigError {
    /// The path that was being loaded (if available).
    pub path: Option<PathBuf>,
    /// Human-readable message with line-level detail when possible.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(p) = &self.path {
            write!(f, "{}: {}", p.display(), self.message)
        } else {
            write!(f, "config error: {}", self.message)
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// - If the file does not exist, returns all defaults (not an error).
    /// - If the file exists but contains invalid TOML or unknown fields,
    ///   returns a [`ConfigError`] with line-level detail.
    ///
    /// # Errors
    /// Returns `ConfigError` on I/O errors (other than not-found) or parse errors.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError {
                    path: Some(path.to_owned()),
                    message: format!("could not read file: {e}"),
                });
            }
        };
        Self::parse(&contents).map_err(|mut e| {
            e.path = Some(path.to_owned());
            e
        })
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `ConfigError` on invalid TOML or unknown fields.
    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| {
            let mut message = e.message().to_owned();
            if let Some(span) = e.span() {
                let line = toml_str[..span.start]
                    .chars()
                    .filter(|&c| c == '\n')
                    .count()
                    + 1;
                message = format!("line {line}: {message}");
            }
            ConfigError {
                path: None,
                message,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
